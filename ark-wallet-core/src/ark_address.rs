use crate::Error;
use crate::ErrorContext;
use bech32::Bech32m;
use bech32::Hrp;
use bitcoin::key::TweakedPublicKey;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;
use std::fmt;
use std::str::FromStr;

/// The character limit of an encoded address. Addresses are much longer than regular bech32m
/// strings because they carry two public keys.
const MAX_ADDRESS_LENGTH: usize = 1023;

/// The only address version currently in use.
const ADDRESS_VERSION: u8 = 0;

/// An off-chain address.
///
/// The payload commits to the server responsible for the output and to the Taproot output key of
/// the VTXO itself: `version(1) || server_pk(32) || vtxo_taproot_key(32)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArkAddress {
    network: Network,
    version: u8,
    server: XOnlyPublicKey,
    vtxo_tap_key: TweakedPublicKey,
}

impl ArkAddress {
    pub fn new(network: Network, server: XOnlyPublicKey, vtxo_tap_key: TweakedPublicKey) -> Self {
        Self {
            network,
            version: ADDRESS_VERSION,
            server,
            vtxo_tap_key,
        }
    }

    pub fn encode(&self) -> String {
        let hrp = hrp_for_network(self.network);

        let mut bytes = [0u8; 65];
        bytes[0] = self.version;
        bytes[1..33].copy_from_slice(&self.server.serialize());
        bytes[33..].copy_from_slice(&self.vtxo_tap_key.serialize());

        bech32::encode::<Bech32m>(hrp, bytes.as_slice()).expect("valid payload")
    }

    pub fn decode(value: &str) -> Result<Self, Error> {
        if value.len() > MAX_ADDRESS_LENGTH {
            return Err(Error::address(format!(
                "address longer than {MAX_ADDRESS_LENGTH} characters"
            )));
        }

        let (hrp, bytes) = bech32::decode(value)
            .map_err(Error::address)
            .context("failed to decode address")?;

        let network = network_for_hrp(&hrp)?;

        if bytes.len() != 65 {
            return Err(Error::address(format!(
                "invalid payload length: expected 65, got {}",
                bytes.len()
            )));
        }

        let version = bytes[0];
        if version != ADDRESS_VERSION {
            return Err(Error::address(format!("unsupported version: {version}")));
        }

        let server = XOnlyPublicKey::from_slice(&bytes[1..33])
            .map_err(Error::address)
            .context("invalid server key")?;

        let vtxo_tap_key = XOnlyPublicKey::from_slice(&bytes[33..65])
            .map_err(Error::address)
            .context("invalid VTXO key")?;
        let vtxo_tap_key = TweakedPublicKey::dangerous_assume_tweaked(vtxo_tap_key);

        Ok(Self {
            network,
            version,
            server,
            vtxo_tap_key,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn server_pk(&self) -> XOnlyPublicKey {
        self.server
    }

    pub fn vtxo_tap_key(&self) -> TweakedPublicKey {
        self.vtxo_tap_key
    }

    /// The on-chain script this address would pay to, if its VTXO were unrolled.
    pub fn to_p2tr_script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2tr_tweaked(self.vtxo_tap_key)
    }

    /// Outputs below the dust limit cannot be unrolled. They commit to the owner in an
    /// unspendable output instead.
    pub fn to_sub_dust_script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_op_return(self.vtxo_tap_key.serialize())
    }
}

impl fmt::Display for ArkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for ArkAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

fn hrp_for_network(network: Network) -> Hrp {
    let hrp = match network {
        Network::Bitcoin => "ark",
        Network::Testnet | Network::Testnet4 | Network::Signet | Network::Regtest => "tark",
        other => unreachable!("unsupported network: {other}"),
    };

    Hrp::parse_unchecked(hrp)
}

fn network_for_hrp(hrp: &Hrp) -> Result<Network, Error> {
    match hrp.to_lowercase().as_str() {
        "ark" => Ok(Network::Bitcoin),
        "tark" => Ok(Network::Testnet),
        other => Err(Error::address(format!("unknown HRP: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::key::Keypair;
    use bitcoin::key::Secp256k1;
    use bitcoin::secp256k1::SecretKey;

    fn xonly(byte: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(&secp, &sk).x_only_public_key().0
    }

    #[test]
    fn roundtrip() {
        let server = xonly(1);
        let vtxo = TweakedPublicKey::dangerous_assume_tweaked(xonly(2));

        for network in [Network::Bitcoin, Network::Testnet] {
            let address = ArkAddress::new(network, server, vtxo);

            let encoded = address.encode();
            let decoded = ArkAddress::decode(&encoded).unwrap();

            assert_eq!(decoded.server_pk(), server);
            assert_eq!(decoded.vtxo_tap_key(), vtxo);
            assert_eq!(decoded.network(), network);
            assert_eq!(decoded.encode(), encoded);
        }
    }

    #[test]
    fn roundtrip_many_random_keys() {
        let secp = Secp256k1::new();

        for i in 1..=100u8 {
            let server = xonly(i);
            let vtxo_kp = Keypair::from_secret_key(
                &secp,
                &SecretKey::from_slice(&[i.wrapping_add(100).max(1); 32]).unwrap(),
            );
            let vtxo =
                TweakedPublicKey::dangerous_assume_tweaked(vtxo_kp.x_only_public_key().0);

            let address = ArkAddress::new(Network::Testnet, server, vtxo);
            let decoded = ArkAddress::decode(&address.encode()).unwrap();

            assert_eq!(decoded, address);
        }
    }

    #[test]
    fn hrp_matches_network() {
        let server = xonly(1);
        let vtxo = TweakedPublicKey::dangerous_assume_tweaked(xonly(2));

        let mainnet = ArkAddress::new(Network::Bitcoin, server, vtxo).encode();
        let testnet = ArkAddress::new(Network::Testnet, server, vtxo).encode();

        assert!(mainnet.starts_with("ark1"));
        assert!(testnet.starts_with("tark1"));
    }

    #[test]
    fn vtxo_key_sits_at_payload_tail() {
        let server = xonly(1);
        let vtxo = TweakedPublicKey::dangerous_assume_tweaked(xonly(2));

        let address = ArkAddress::new(Network::Testnet, server, vtxo);
        let (_, payload) = bech32::decode(&address.encode()).unwrap();

        assert_eq!(payload[0], 0);
        assert_eq!(&payload[1..33], server.serialize().as_slice());
        assert_eq!(&payload[33..65], vtxo.serialize().as_slice());
    }

    #[test]
    fn rejects_wrong_version() {
        let server = xonly(1);
        let vtxo = xonly(2);

        let mut bytes = [0u8; 65];
        bytes[0] = 1;
        bytes[1..33].copy_from_slice(&server.serialize());
        bytes[33..].copy_from_slice(&vtxo.serialize());

        let encoded =
            bech32::encode::<Bech32m>(Hrp::parse_unchecked("tark"), bytes.as_slice()).unwrap();

        assert!(ArkAddress::decode(&encoded).is_err());
    }
}
