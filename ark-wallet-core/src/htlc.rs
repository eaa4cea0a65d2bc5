//! Hash Time Lock Contract scripts for atomic swaps and conditional payments.
//!
//! The HTLC is a VTXO whose Taproot tree carries five spending paths: two cooperative paths
//! involving the server and three unilateral paths gated by relative timelocks.

use crate::ark_address::ArkAddress;
use crate::script::cltv_multisig_script;
use crate::script::csv_multisig_script;
use crate::script::tr_script_pubkey;
use crate::vtxo::build_taproot_tree;
use bitcoin::absolute;
use bitcoin::hashes::hash160;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::*;
use bitcoin::taproot::ControlBlock;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::XOnlyPublicKey;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HtlcError {
    #[error("invalid locktime: {0}")]
    InvalidLocktime(String),
    #[error("invalid delay: {0}")]
    InvalidDelay(String),
    #[error("taproot construction failed: {0}")]
    Taproot(String),
}

/// All the parameters needed to construct an HTLC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcOptions {
    pub sender: XOnlyPublicKey,
    pub receiver: XOnlyPublicKey,
    pub server: XOnlyPublicKey,
    pub preimage_hash: hash160::Hash,
    pub refund_locktime: absolute::LockTime,
    pub unilateral_claim_delay: Sequence,
    pub unilateral_refund_delay: Sequence,
    pub unilateral_refund_without_receiver_delay: Sequence,
}

impl HtlcOptions {
    pub fn validate(&self) -> Result<(), HtlcError> {
        if self.refund_locktime == absolute::LockTime::ZERO {
            return Err(HtlcError::InvalidLocktime(
                "refund locktime must be greater than 0".to_string(),
            ));
        }

        for (name, delay) in [
            ("unilateral claim", self.unilateral_claim_delay),
            ("unilateral refund", self.unilateral_refund_delay),
            (
                "unilateral refund without receiver",
                self.unilateral_refund_without_receiver_delay,
            ),
        ] {
            if !delay.is_relative_lock_time() || delay.to_consensus_u32() == 0 {
                return Err(HtlcError::InvalidDelay(format!(
                    "{name} delay must be a valid non-zero CSV relative lock time"
                )));
            }
        }

        Ok(())
    }

    /// The cooperative claim path: the receiver reveals the preimage and the server co-signs.
    pub fn claim_script(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_opcode(OP_HASH160)
            .push_slice(self.preimage_hash.as_byte_array())
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_VERIFY)
            .push_x_only_key(&self.receiver)
            .push_opcode(OP_CHECKSIGVERIFY)
            .push_x_only_key(&self.server)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// The cooperative refund path: the sender takes the coins back with the server after the
    /// refund locktime.
    pub fn refund_script(&self) -> ScriptBuf {
        cltv_multisig_script(self.refund_locktime, &[self.sender, self.server])
            .expect("valid refund script")
    }

    /// The unilateral claim path: the receiver reveals the preimage after the claim delay, with
    /// no server involved.
    pub fn unilateral_claim_script(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_opcode(OP_HASH160)
            .push_slice(self.preimage_hash.as_byte_array())
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_VERIFY)
            .push_int(self.unilateral_claim_delay.to_consensus_u32() as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP)
            .push_x_only_key(&self.receiver)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    /// The unilateral refund path: sender and receiver cooperate after the refund delay.
    pub fn unilateral_refund_script(&self) -> ScriptBuf {
        csv_multisig_script(self.unilateral_refund_delay, &[self.sender, self.receiver])
            .expect("valid unilateral refund script")
    }

    /// The unilateral refund path for an unresponsive receiver, behind the longest delay.
    pub fn unilateral_refund_without_receiver_script(&self) -> ScriptBuf {
        csv_multisig_script(
            self.unilateral_refund_without_receiver_delay,
            &[self.sender],
        )
        .expect("valid unilateral refund script")
    }
}

/// An HTLC rendered as a Taproot tree, ready to be spent through one of its five paths.
#[derive(Debug, Clone)]
pub struct HtlcScript {
    options: HtlcOptions,
    spend_info: TaprootSpendInfo,
    network: Network,
}

impl HtlcScript {
    pub fn new(options: HtlcOptions, network: Network) -> Result<Self, HtlcError> {
        options.validate()?;

        let scripts = [
            options.claim_script(),
            options.refund_script(),
            options.unilateral_claim_script(),
            options.unilateral_refund_script(),
            options.unilateral_refund_without_receiver_script(),
        ];

        let secp = bitcoin::key::Secp256k1::new();
        let spend_info = build_taproot_tree(&secp, &scripts)
            .map_err(|e| HtlcError::Taproot(e.to_string()))?;

        Ok(Self {
            options,
            spend_info,
            network,
        })
    }

    pub fn options(&self) -> &HtlcOptions {
        &self.options
    }

    pub fn taproot_spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        tr_script_pubkey(&self.spend_info)
    }

    pub fn address(&self) -> ArkAddress {
        ArkAddress::new(
            self.network,
            self.options.server,
            self.spend_info.output_key(),
        )
    }

    /// Spend info for the cooperative claim path.
    pub fn claim(&self) -> (ScriptBuf, ControlBlock) {
        self.spend_info_for(self.options.claim_script())
    }

    /// Spend info for the cooperative refund path.
    pub fn refund(&self) -> (ScriptBuf, ControlBlock) {
        self.spend_info_for(self.options.refund_script())
    }

    pub fn unilateral_claim(&self) -> (ScriptBuf, ControlBlock) {
        self.spend_info_for(self.options.unilateral_claim_script())
    }

    pub fn unilateral_refund(&self) -> (ScriptBuf, ControlBlock) {
        self.spend_info_for(self.options.unilateral_refund_script())
    }

    pub fn unilateral_refund_without_receiver(&self) -> (ScriptBuf, ControlBlock) {
        self.spend_info_for(self.options.unilateral_refund_without_receiver_script())
    }

    pub fn tapscripts(&self) -> Vec<ScriptBuf> {
        vec![
            self.options.claim_script(),
            self.options.refund_script(),
            self.options.unilateral_claim_script(),
            self.options.unilateral_refund_script(),
            self.options.unilateral_refund_without_receiver_script(),
        ]
    }

    fn spend_info_for(&self, script: ScriptBuf) -> (ScriptBuf, ControlBlock) {
        let control_block = self
            .spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .expect("script is in the tree");

        (script, control_block)
    }
}
