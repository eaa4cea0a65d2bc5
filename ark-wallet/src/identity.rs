//! The signer interface the wallet requires of an identity.
//!
//! Concrete signers (an in-memory key, an external hardware device) hide behind this small
//! capability set; the wallet core never touches secret key material directly.

use crate::Error;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::Psbt;
use bitcoin::TapSighashType;
use bitcoin::XOnlyPublicKey;

pub trait Identity: Send + Sync {
    fn x_only_public_key(&self) -> XOnlyPublicKey;

    /// Sign the indicated inputs (or all of them) of a key-spend PSBT, preserving custom
    /// fields.
    fn sign(&self, psbt: &mut Psbt, input_indexes: Option<&[usize]>) -> Result<(), Error>;

    /// Schnorr-sign an arbitrary 32-byte digest with the identity key.
    fn sign_message(&self, msg: &secp256k1::Message) -> Result<schnorr::Signature, Error>;
}

/// An identity backed by a single in-memory keypair.
#[derive(Debug, Clone)]
pub struct KeypairIdentity {
    keypair: Keypair,
}

impl KeypairIdentity {
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl Identity for KeypairIdentity {
    fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    fn sign(&self, psbt: &mut Psbt, input_indexes: Option<&[usize]>) -> Result<(), Error> {
        let secp = Secp256k1::new();

        // The key-path of an untweaked P2TR output owned by the identity key.
        let tweaked_keypair = self.keypair.tap_tweak(&secp, None);

        let prevouts = psbt
            .inputs
            .iter()
            .map(|input| {
                input
                    .witness_utxo
                    .clone()
                    .ok_or_else(|| Error::ad_hoc("missing witness UTXO"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let indexes: Vec<usize> = match input_indexes {
            Some(indexes) => indexes.to_vec(),
            None => (0..psbt.inputs.len()).collect(),
        };

        let mut sighash_cache = SighashCache::new(&psbt.unsigned_tx);

        let mut signatures = Vec::with_capacity(indexes.len());
        for index in &indexes {
            let tap_sighash = sighash_cache
                .taproot_key_spend_signature_hash(
                    *index,
                    &Prevouts::All(&prevouts),
                    TapSighashType::Default,
                )
                .map_err(Error::ad_hoc)?;

            let msg = secp256k1::Message::from_digest(tap_sighash.to_raw_hash().to_byte_array());
            let signature = secp.sign_schnorr_no_aux_rand(&msg, &tweaked_keypair.to_inner());

            signatures.push(bitcoin::taproot::Signature {
                signature,
                sighash_type: TapSighashType::Default,
            });
        }

        for (index, signature) in indexes.into_iter().zip(signatures) {
            psbt.inputs[index].tap_key_sig = Some(signature);
        }

        Ok(())
    }

    fn sign_message(&self, msg: &secp256k1::Message) -> Result<schnorr::Signature, Error> {
        let secp = Secp256k1::new();

        Ok(secp.sign_schnorr_no_aux_rand(msg, &self.keypair))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    #[test]
    fn sign_message_verifies_under_identity_key() {
        let secp = Secp256k1::new();
        let keypair =
            Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[7; 32]).unwrap());
        let identity = KeypairIdentity::new(keypair);

        let msg = secp256k1::Message::from_digest([0x42; 32]);
        let sig = identity.sign_message(&msg).unwrap();

        secp.verify_schnorr(&sig, &msg, &identity.x_only_public_key())
            .unwrap();
    }
}
