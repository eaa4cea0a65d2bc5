use crate::ark_address::ArkAddress;
use crate::script::csv_multisig_script;
use crate::script::extract_sequence_from_csv_multisig_script;
use crate::script::multisig_script;
use crate::script::tr_script_pubkey;
use crate::Error;
use crate::ErrorContext;
use crate::UNSPENDABLE_KEY;
use bitcoin::key::PublicKey;
use bitcoin::key::Secp256k1;
use bitcoin::key::Verification;
use bitcoin::relative;
use bitcoin::taproot;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Address;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;
use std::time::Duration;

/// All the information needed to _spend_ a VTXO.
///
/// The VTXO is a Taproot output over the unspendable internal key, so every spend path is one of
/// the leaf scripts provided at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VtxoScript {
    server: XOnlyPublicKey,
    owner: XOnlyPublicKey,
    spend_info: TaprootSpendInfo,
    /// All the scripts in this VTXO's Taproot tree.
    tapscripts: Vec<ScriptBuf>,
    address: Address,
    exit_delay: bitcoin::Sequence,
    network: Network,
}

impl VtxoScript {
    /// 64 bytes per pubkey.
    pub const FORFEIT_WITNESS_SIZE: usize = 64 * 2;

    /// Build a VTXO script, by providing all the scripts to be included in the Taproot tree.
    ///
    /// The provided `scripts` must follow the following rules:
    ///
    /// - All unilateral spend paths MUST be timelocked.
    /// - All other spend paths MUST involve the server's signature.
    pub fn new_with_custom_scripts<C>(
        secp: &Secp256k1<C>,
        server: XOnlyPublicKey,
        owner: XOnlyPublicKey,
        scripts: Vec<ScriptBuf>,
        exit_delay: bitcoin::Sequence,
        network: Network,
    ) -> Result<Self, Error>
    where
        C: Verification,
    {
        if scripts.is_empty() {
            return Err(Error::script("cannot build VTXO without scripts"));
        }

        let spend_info = build_taproot_tree(secp, &scripts)?;

        let script_pubkey = tr_script_pubkey(&spend_info);
        let address = Address::from_script(&script_pubkey, network)
            .map_err(|e| Error::script(format!("invalid script: {e}")))?;

        Ok(Self {
            server,
            owner,
            spend_info,
            tapscripts: scripts,
            address,
            exit_delay,
            network,
        })
    }

    /// Build a default VTXO script: a forfeit path shared with the server and a timelocked
    /// unilateral exit path for the owner.
    pub fn new_default<C>(
        secp: &Secp256k1<C>,
        server: XOnlyPublicKey,
        owner: XOnlyPublicKey,
        exit_delay: bitcoin::Sequence,
        network: Network,
    ) -> Result<Self, Error>
    where
        C: Verification,
    {
        let forfeit_script = multisig_script(&[server, owner])?;
        let exit_script = csv_multisig_script(exit_delay, &[owner])?;

        Self::new_with_custom_scripts(
            secp,
            server,
            owner,
            vec![forfeit_script, exit_script],
            exit_delay,
            network,
        )
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    /// The on-chain address of the VTXO, if it were to be unrolled.
    pub fn onchain_address(&self) -> &Address {
        &self.address
    }

    pub fn owner_pk(&self) -> XOnlyPublicKey {
        self.owner
    }

    pub fn server_pk(&self) -> XOnlyPublicKey {
        self.server
    }

    pub fn exit_delay(&self) -> bitcoin::Sequence {
        self.exit_delay
    }

    pub fn exit_delay_duration(&self) -> Duration {
        let exit_delay_seconds = match self.exit_delay.to_relative_lock_time() {
            Some(relative::LockTime::Time(time)) => time.value() as u64 * 512,
            // Not exact, but good enough to decide whether an exit path is active.
            Some(relative::LockTime::Blocks(blocks)) => blocks.value() as u64 * 10 * 60,
            None => 0,
        };

        Duration::from_secs(exit_delay_seconds)
    }

    pub fn to_ark_address(&self) -> ArkAddress {
        let vtxo_tap_key = self.spend_info.output_key();
        ArkAddress::new(self.network, self.server, vtxo_tap_key)
    }

    /// The spend info of an arbitrary leaf of the VTXO.
    pub fn spend_info_for_script(
        &self,
        script: ScriptBuf,
    ) -> Result<(ScriptBuf, taproot::ControlBlock), Error> {
        let control_block = self
            .spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| Error::script("unknown leaf"))?;

        Ok((script, control_block))
    }

    /// The spend info for the forfeit (cooperative) path of a _default_ VTXO.
    ///
    /// This method can fail because VTXOs constructed with
    /// [`VtxoScript::new_with_custom_scripts`] may not contain this script exactly.
    pub fn forfeit_spend_info(&self) -> Result<(ScriptBuf, taproot::ControlBlock), Error> {
        let forfeit_script = multisig_script(&[self.server, self.owner])?;

        self.spend_info_for_script(forfeit_script)
            .context("missing default forfeit script")
    }

    /// The spend info for the unilateral exit path of a _default_ VTXO.
    pub fn exit_spend_info(&self) -> Result<(ScriptBuf, taproot::ControlBlock), Error> {
        let exit_script = csv_multisig_script(self.exit_delay, &[self.owner])?;

        self.spend_info_for_script(exit_script)
            .context("missing default exit script")
    }

    pub fn tapscripts(&self) -> Vec<ScriptBuf> {
        self.tapscripts.clone()
    }

    /// Rebuild a [`VtxoScript`] from a persisted list of tapscripts.
    ///
    /// The exit delay is recovered from the first CSV-multisig leaf.
    pub fn from_tapscripts<C>(
        secp: &Secp256k1<C>,
        server: XOnlyPublicKey,
        owner: XOnlyPublicKey,
        scripts: Vec<ScriptBuf>,
        network: Network,
    ) -> Result<Self, Error>
    where
        C: Verification,
    {
        let exit_delay = scripts
            .iter()
            .find_map(|script| extract_sequence_from_csv_multisig_script(script).ok())
            .ok_or_else(|| Error::script("no timelocked leaf among tapscripts"))?;

        Self::new_with_custom_scripts(secp, server, owner, scripts, exit_delay, network)
    }

    /// Whether the VTXO can be claimed unilaterally by the owner or not, given the
    /// `confirmation_blocktime` of the transaction that included this VTXO as an output.
    pub fn can_be_claimed_unilaterally_by_owner(
        &self,
        now: Duration,
        confirmation_blocktime: Duration,
    ) -> bool {
        let exit_path_time = confirmation_blocktime + self.exit_delay_duration();

        now > exit_path_time
    }
}

/// Assemble leaf scripts into a Taproot tree over the unspendable internal key.
pub fn build_taproot_tree<C>(
    secp: &Secp256k1<C>,
    scripts: &[ScriptBuf],
) -> Result<TaprootSpendInfo, Error>
where
    C: Verification,
{
    let unspendable_key: PublicKey = UNSPENDABLE_KEY
        .parse()
        .map_err(|e| Error::script(format!("invalid unspendable key: {e}")))?;
    let (unspendable_key, _) = unspendable_key.inner.x_only_public_key();

    let mut builder = TaprootBuilder::new();
    for (script, depth) in scripts.iter().zip(balanced_leaf_depths(scripts.len())) {
        builder = builder
            .add_leaf(depth as u8, script.clone())
            .map_err(Error::script)?;
    }

    builder
        .finalize(secp, unspendable_key)
        .map_err(|_| Error::script("failed to finalize Taproot tree"))
}

/// The depth of each leaf in a balanced binary tree with `n` leaves, in left-to-right order.
///
/// Splitting the leaf count in half at every level keeps the longest control block as short
/// as possible without weighting any particular spend path.
fn balanced_leaf_depths(n: usize) -> Vec<usize> {
    fn split(depths: &mut Vec<usize>, leaves: usize, depth: usize) {
        match leaves {
            0 => {}
            1 => depths.push(depth),
            _ => {
                let left = leaves.div_ceil(2);
                split(depths, left, depth + 1);
                split(depths, leaves - left, depth + 1);
            }
        }
    }

    let mut depths = Vec::with_capacity(n);
    split(&mut depths, n, 0);

    depths
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::key::Keypair;
    use bitcoin::secp256k1::SecretKey;

    fn xonly(byte: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(&secp, &sk).x_only_public_key().0
    }

    #[test]
    fn default_vtxo_has_forfeit_and_exit_leaves() {
        let secp = Secp256k1::new();
        let exit_delay = bitcoin::Sequence::from_seconds_ceil(512).unwrap();

        let vtxo = VtxoScript::new_default(&secp, xonly(1), xonly(2), exit_delay, Network::Regtest)
            .unwrap();

        assert_eq!(vtxo.tapscripts().len(), 2);
        vtxo.forfeit_spend_info().unwrap();
        vtxo.exit_spend_info().unwrap();
    }

    #[test]
    fn unknown_leaf_is_rejected() {
        let secp = Secp256k1::new();
        let exit_delay = bitcoin::Sequence::from_seconds_ceil(512).unwrap();

        let vtxo = VtxoScript::new_default(&secp, xonly(1), xonly(2), exit_delay, Network::Regtest)
            .unwrap();

        let foreign = multisig_script(&[xonly(3), xonly(4)]).unwrap();
        assert!(vtxo.spend_info_for_script(foreign).is_err());
    }

    #[test]
    fn from_tapscripts_recovers_exit_delay() {
        let secp = Secp256k1::new();
        let exit_delay = bitcoin::Sequence::from_seconds_ceil(1024).unwrap();

        let vtxo = VtxoScript::new_default(&secp, xonly(1), xonly(2), exit_delay, Network::Regtest)
            .unwrap();

        let restored = VtxoScript::from_tapscripts(
            &secp,
            xonly(1),
            xonly(2),
            vtxo.tapscripts(),
            Network::Regtest,
        )
        .unwrap();

        assert_eq!(restored.exit_delay(), exit_delay);
        assert_eq!(restored.to_ark_address(), vtxo.to_ark_address());
    }

    #[test]
    fn address_commits_to_taproot_output_key() {
        let secp = Secp256k1::new();
        let exit_delay = bitcoin::Sequence::from_seconds_ceil(512).unwrap();

        let vtxo = VtxoScript::new_default(&secp, xonly(1), xonly(2), exit_delay, Network::Regtest)
            .unwrap();

        let address = vtxo.to_ark_address();
        assert_eq!(address.to_p2tr_script_pubkey(), vtxo.script_pubkey());
        assert_eq!(address.server_pk(), xonly(1));
    }

    #[test]
    fn leaf_depths_form_a_complete_tree() {
        assert_eq!(balanced_leaf_depths(1), vec![0]);
        assert_eq!(balanced_leaf_depths(2), vec![1, 1]);
        assert_eq!(balanced_leaf_depths(3), vec![2, 2, 1]);
        assert_eq!(balanced_leaf_depths(5), vec![3, 3, 2, 2, 2]);

        // Kraft equality: the depths describe a full binary tree for any leaf count.
        for n in 1..=32 {
            let weight: f64 = balanced_leaf_depths(n)
                .into_iter()
                .map(|depth| 0.5_f64.powi(depth as i32))
                .sum();
            assert!((weight - 1.0).abs() < 1e-9, "n = {n}");
        }
    }
}
