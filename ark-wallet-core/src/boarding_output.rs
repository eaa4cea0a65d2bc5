use crate::script::csv_multisig_script;
use crate::script::multisig_script;
use crate::script::tr_script_pubkey;
use crate::vtxo::build_taproot_tree;
use crate::Error;
use bitcoin::key::Secp256k1;
use bitcoin::key::Verification;
use bitcoin::relative;
use bitcoin::taproot;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Address;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;
use std::time::Duration;

/// An on-chain output that is primed to become a VTXO through a settlement round.
///
/// The owner can always fall back to the unilateral exit path after the (long) boarding exit
/// delay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoardingOutput {
    server: XOnlyPublicKey,
    owner: XOnlyPublicKey,
    spend_info: TaprootSpendInfo,
    address: Address,
    exit_delay: bitcoin::Sequence,
    network: Network,
}

impl BoardingOutput {
    pub fn new<C>(
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

        let spend_info = build_taproot_tree(secp, &[forfeit_script, exit_script])?;

        let script_pubkey = tr_script_pubkey(&spend_info);
        let address = Address::from_script(&script_pubkey, network)
            .map_err(|e| Error::script(format!("invalid script: {e}")))?;

        Ok(Self {
            server,
            owner,
            spend_info,
            address,
            exit_delay,
            network,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn owner_pk(&self) -> XOnlyPublicKey {
        self.owner
    }

    pub fn exit_delay(&self) -> bitcoin::Sequence {
        self.exit_delay
    }

    pub fn forfeit_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        let forfeit_script = self.forfeit_script();

        let control_block = self
            .spend_info
            .control_block(&(forfeit_script.clone(), LeafVersion::TapScript))
            .expect("forfeit script is in the tree");

        (forfeit_script, control_block)
    }

    pub fn exit_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        let exit_script = self.exit_script();

        let control_block = self
            .spend_info
            .control_block(&(exit_script.clone(), LeafVersion::TapScript))
            .expect("exit script is in the tree");

        (exit_script, control_block)
    }

    pub fn tapscripts(&self) -> Vec<ScriptBuf> {
        vec![self.forfeit_script(), self.exit_script()]
    }

    /// Whether the boarding output can be claimed unilaterally by the owner or not, given the
    /// `confirmation_blocktime` of the transaction that included it as an output.
    pub fn can_be_claimed_unilaterally_by_owner(
        &self,
        now: Duration,
        confirmation_blocktime: Duration,
    ) -> bool {
        let exit_delay_seconds = match self.exit_delay.to_relative_lock_time() {
            Some(relative::LockTime::Time(time)) => time.value() as u64 * 512,
            Some(relative::LockTime::Blocks(blocks)) => blocks.value() as u64 * 10 * 60,
            None => 0,
        };

        let exit_path_time = confirmation_blocktime + Duration::from_secs(exit_delay_seconds);

        now > exit_path_time
    }

    fn forfeit_script(&self) -> ScriptBuf {
        multisig_script(&[self.server, self.owner]).expect("two keys")
    }

    fn exit_script(&self) -> ScriptBuf {
        csv_multisig_script(self.exit_delay, &[self.owner]).expect("valid timelock")
    }
}
