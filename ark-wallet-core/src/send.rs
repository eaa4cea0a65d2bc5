//! Construction and signing of virtual (off-chain) transactions.
//!
//! An off-chain send is a bundle: one checkpoint transaction per spent VTXO, plus the Ark
//! transaction spending the checkpoint outputs into the receivers' VTXOs. The checkpoint
//! stage gives the server a unilateral way out if the sender disappears mid-transfer, and
//! nothing becomes final until the server has countersigned the whole bundle.

use crate::anchor_output;
use crate::ark_address::ArkAddress;
use crate::asset::AssetPacket;
use crate::psbt::set_condition_witness;
use crate::psbt::set_vtxo_taproot_tree;
use crate::script::csv_multisig_script;
use crate::script::tr_script_pubkey;
use crate::server;
use crate::vtxo::build_taproot_tree;
use crate::Error;
use crate::ErrorContext;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::Secp256k1;
use bitcoin::psbt;
use bitcoin::script::PushBytes;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot;
use bitcoin::taproot::ControlBlock;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::transaction;
use bitcoin::Amount;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::TapLeafHash;
use bitcoin::TapSighashType;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::XOnlyPublicKey;
use std::collections::BTreeMap;

/// A VTXO to be spent into a pre-confirmed VTXO.
#[derive(Debug, Clone)]
pub struct VtxoTxInput {
    outpoint: OutPoint,
    /// The output being spent, as it would appear on-chain.
    prevout: TxOut,
    /// The leaf this spend goes through, with its control block. The checkpoint output is
    /// built around the same leaf.
    spend_info: (ScriptBuf, ControlBlock),
    /// Only set if the selected leaf uses `OP_CLTV`.
    locktime: Option<LockTime>,
    /// The complete leaf list of the VTXO, carried in the `taptree` PSBT field.
    tapscripts: Vec<ScriptBuf>,
    /// Witness elements satisfying a conditional leaf, if the spend path has one.
    condition_witness: Option<Vec<Vec<u8>>>,
}

impl VtxoTxInput {
    pub fn new(
        spend_script: ScriptBuf,
        locktime: Option<LockTime>,
        control_block: ControlBlock,
        tapscripts: Vec<ScriptBuf>,
        script_pubkey: ScriptBuf,
        amount: Amount,
        outpoint: OutPoint,
    ) -> Self {
        Self {
            outpoint,
            prevout: TxOut {
                value: amount,
                script_pubkey,
            },
            spend_info: (spend_script, control_block),
            locktime,
            tapscripts,
            condition_witness: None,
        }
    }

    pub fn with_condition_witness(mut self, witness: Vec<Vec<u8>>) -> Self {
        self.condition_witness = Some(witness);
        self
    }

    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }

    pub fn amount(&self) -> Amount {
        self.prevout.value
    }

    pub fn prevout(&self) -> &TxOut {
        &self.prevout
    }

    pub fn spend_info(&self) -> (&ScriptBuf, &ControlBlock) {
        (&self.spend_info.0, &self.spend_info.1)
    }

    /// The sequence and locktime this input imposes on its spending transaction.
    fn timing(&self) -> (Option<LockTime>, Sequence) {
        match self.locktime {
            Some(locktime) => (Some(locktime), Sequence::ENABLE_LOCKTIME_NO_RBF),
            None => (None, Sequence::MAX),
        }
    }

    /// Build the checkpoint transaction spending this VTXO.
    ///
    /// The checkpoint output keeps the sender's spend leaf and adds a timelocked escape hatch
    /// for the server, so neither party can hold the transfer hostage.
    fn to_checkpoint(&self, server_exit_script: ScriptBuf) -> Result<Checkpoint, Error> {
        let output = CheckpointOutput::new(self.spend_info.0.clone(), server_exit_script)?;

        let (locktime, sequence) = self.timing();

        let mut checkpoint_psbt = Psbt::from_unsigned_tx(Transaction {
            version: transaction::Version::non_standard(3),
            lock_time: locktime.unwrap_or(LockTime::ZERO),
            input: vec![TxIn {
                previous_output: self.outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Default::default(),
            }],
            output: vec![
                TxOut {
                    value: self.amount(),
                    script_pubkey: output.script_pubkey(),
                },
                anchor_output(),
            ],
        })
        .map_err(Error::transaction)?;

        let psbt_input = &mut checkpoint_psbt.inputs[0];
        psbt_input.witness_utxo = Some(self.prevout.clone());
        psbt_input.tap_scripts = BTreeMap::from_iter([(
            self.spend_info.1.clone(),
            (self.spend_info.0.clone(), self.spend_info.1.leaf_version),
        )]);
        set_vtxo_taproot_tree(psbt_input, &self.tapscripts);

        if let Some(condition_witness) = &self.condition_witness {
            set_condition_witness(psbt_input, condition_witness);
        }

        let outpoint = CheckpointOutPoint {
            outpoint: OutPoint {
                txid: checkpoint_psbt.unsigned_tx.compute_txid(),
                vout: 0,
            },
            amount: self.amount(),
        };

        Ok(Checkpoint {
            psbt: checkpoint_psbt,
            output,
            outpoint,
            vtxo_input: self.clone(),
        })
    }
}

/// The taproot of a checkpoint output: the sender's spend leaf next to the server's exit
/// leaf.
#[derive(Debug, Clone)]
pub struct CheckpointOutput {
    spend_script: ScriptBuf,
    spend_info: TaprootSpendInfo,
}

impl CheckpointOutput {
    fn new(spend_script: ScriptBuf, server_exit_script: ScriptBuf) -> Result<Self, Error> {
        let secp = Secp256k1::new();

        let spend_info =
            build_taproot_tree(&secp, &[spend_script.clone(), server_exit_script])?;

        Ok(Self {
            spend_script,
            spend_info,
        })
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        tr_script_pubkey(&self.spend_info)
    }

    fn spend_leaf(&self) -> Result<(ScriptBuf, ControlBlock), Error> {
        let control_block = self
            .spend_info
            .control_block(&(self.spend_script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| Error::script("unknown leaf"))?;

        Ok((self.spend_script.clone(), control_block))
    }
}

/// Where a checkpoint output will live once its transaction has a txid.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointOutPoint {
    pub outpoint: OutPoint,
    pub amount: Amount,
}

/// A checkpoint transaction together with everything needed to spend its output.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub psbt: Psbt,
    pub output: CheckpointOutput,
    pub outpoint: CheckpointOutPoint,
    pub vtxo_input: VtxoTxInput,
}

#[derive(Debug, Clone)]
pub struct OffchainTransactions {
    pub ark_tx: Psbt,
    pub checkpoint_txs: Vec<Checkpoint>,
}

/// Render a receiver output, falling back to the unspendable sub-dust form for amounts the
/// server would refuse to unroll.
fn receiver_tx_out(address: &ArkAddress, amount: Amount, dust: Amount) -> TxOut {
    let script_pubkey = if amount > dust {
        address.to_p2tr_script_pubkey()
    } else {
        address.to_sub_dust_script_pubkey()
    };

    TxOut {
        value: amount,
        script_pubkey,
    }
}

/// The highest absolute timelock demanded by any input.
///
/// Height-based and time-based locktimes cannot be mixed within one transaction.
fn highest_locktime(vtxo_inputs: &[VtxoTxInput]) -> Result<Option<LockTime>, Error> {
    let mut highest: Option<LockTime> = None;

    for locktime in vtxo_inputs.iter().filter_map(|input| input.locktime) {
        highest = Some(match highest {
            None => locktime,
            Some(current) if current.is_same_unit(locktime) => {
                if locktime.to_consensus_u32() > current.to_consensus_u32() {
                    locktime
                } else {
                    current
                }
            }
            Some(_) => return Err(Error::transaction("mixed locktime units")),
        });
    }

    Ok(highest)
}

/// Build the transactions to send VTXOs to other [`ArkAddress`]es.
///
/// An optional [`AssetPacket`] is committed in an extra `OP_RETURN` output of the Ark
/// transaction, assigning token amounts to its outputs.
pub fn build_offchain_transactions(
    outputs: &[(&ArkAddress, Amount)],
    change_address: Option<&ArkAddress>,
    vtxo_inputs: &[VtxoTxInput],
    asset_packet: Option<&AssetPacket>,
    server_info: &server::Info,
) -> Result<OffchainTransactions, Error> {
    if vtxo_inputs.is_empty() {
        return Err(Error::transaction(
            "cannot build Ark transaction without inputs",
        ));
    }

    let dust = server_info.dust;

    let server_exit_script = csv_multisig_script(
        server_info.unilateral_exit_delay,
        &[server_info.pk.x_only_public_key().0],
    )?;

    let checkpoint_txs = vtxo_inputs
        .iter()
        .map(|vtxo_input| {
            vtxo_input
                .to_checkpoint(server_exit_script.clone())
                .with_context(|| {
                    format!(
                        "failed to build checkpoint for input {}",
                        vtxo_input.outpoint()
                    )
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut tx_outputs = outputs
        .iter()
        .map(|(address, amount)| receiver_tx_out(address, *amount, dust))
        .collect::<Vec<_>>();

    let total_in = vtxo_inputs
        .iter()
        .try_fold(Amount::ZERO, |acc, input| acc.checked_add(input.amount()))
        .ok_or_else(|| Error::transaction("input amount overflow"))?;
    let total_out = tx_outputs
        .iter()
        .try_fold(Amount::ZERO, |acc, output| acc.checked_add(output.value))
        .ok_or_else(|| Error::transaction("output amount overflow"))?;

    let change_amount = total_in.checked_sub(total_out).ok_or_else(|| {
        Error::transaction(format!(
            "cannot cover total output amount ({total_out}) with total input amount ({total_in})"
        ))
    })?;

    match change_address {
        Some(change_address) if change_amount > Amount::ZERO => {
            tx_outputs.push(receiver_tx_out(change_address, change_amount, dust));
        }
        Some(_) | None => {}
    }

    if let Some(asset_packet) = asset_packet {
        let bytes = asset_packet.encode();
        let push: &PushBytes = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::transaction("asset packet too large for OP_RETURN"))?;

        tx_outputs.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return(push),
        });
    }

    tx_outputs.push(anchor_output());

    let lock_time = highest_locktime(vtxo_inputs)?;
    let sequence = match lock_time {
        Some(_) => Sequence::ENABLE_LOCKTIME_NO_RBF,
        None => Sequence::MAX,
    };

    let mut ark_psbt = Psbt::from_unsigned_tx(Transaction {
        version: transaction::Version::non_standard(3),
        lock_time: lock_time.unwrap_or(LockTime::ZERO),
        input: checkpoint_txs
            .iter()
            .map(|checkpoint| TxIn {
                previous_output: checkpoint.outpoint.outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Default::default(),
            })
            .collect(),
        output: tx_outputs,
    })
    .map_err(Error::transaction)?;

    for (psbt_input, checkpoint) in ark_psbt.inputs.iter_mut().zip(&checkpoint_txs) {
        // The Ark transaction spends a checkpoint output, whose only script of interest is
        // the sender's spend leaf.
        set_vtxo_taproot_tree(psbt_input, std::slice::from_ref(&checkpoint.output.spend_script));

        if let Some(condition_witness) = &checkpoint.vtxo_input.condition_witness {
            set_condition_witness(psbt_input, condition_witness);
        }
    }

    Ok(OffchainTransactions {
        ark_tx: ark_psbt,
        checkpoint_txs,
    })
}

/// Compute the script-spend sighash of one input and record the returned signature.
fn sign_input_leaf<S>(
    sign_fn: S,
    psbt: &mut Psbt,
    input_index: usize,
    prevouts: &[TxOut],
    leaf_script: &ScriptBuf,
) -> Result<(), Error>
where
    S: FnOnce(
        &mut psbt::Input,
        secp256k1::Message,
    ) -> Result<(schnorr::Signature, XOnlyPublicKey), Error>,
{
    let leaf_hash = TapLeafHash::from_script(leaf_script, LeafVersion::TapScript);

    let tap_sighash = SighashCache::new(&psbt.unsigned_tx)
        .taproot_script_spend_signature_hash(
            input_index,
            &Prevouts::All(prevouts),
            leaf_hash,
            TapSighashType::Default,
        )
        .map_err(Error::crypto)
        .with_context(|| format!("failed to compute sighash for input {input_index}"))?;

    let msg = secp256k1::Message::from_digest(tap_sighash.to_raw_hash().to_byte_array());

    let psbt_input = &mut psbt.inputs[input_index];
    let (signature, pk) = sign_fn(psbt_input, msg)?;

    psbt_input.tap_script_sigs.insert(
        (pk, leaf_hash),
        taproot::Signature {
            signature,
            sighash_type: TapSighashType::Default,
        },
    );

    Ok(())
}

/// Counter-sign the (server-signed) copy of a checkpoint transaction.
pub fn sign_checkpoint_transaction<S>(
    sign_fn: S,
    psbt: &mut Psbt,
    vtxo_input: &VtxoTxInput,
) -> Result<(), Error>
where
    S: FnOnce(
        &mut psbt::Input,
        secp256k1::Message,
    ) -> Result<(schnorr::Signature, XOnlyPublicKey), Error>,
{
    let outpoint = vtxo_input.outpoint();

    let input_index = psbt
        .unsigned_tx
        .input
        .iter()
        .position(|input| input.previous_output == outpoint)
        .ok_or_else(|| Error::transaction(format!("missing input for outpoint {outpoint}")))?;

    tracing::debug!(
        %outpoint,
        index = input_index,
        "Signing selected VTXO for checkpoint transaction"
    );

    let (spend_script, _) = vtxo_input.spend_info();
    let spend_script = spend_script.clone();

    let prevouts = [vtxo_input.prevout().clone()];

    sign_input_leaf(sign_fn, psbt, input_index, &prevouts, &spend_script)
}

/// Sign one checkpoint-spending input of the Ark transaction.
pub fn sign_ark_transaction<S>(
    sign_fn: S,
    psbt: &mut Psbt,
    checkpoint_inputs: &[(CheckpointOutput, CheckpointOutPoint)],
    input_index: usize,
) -> Result<(), Error>
where
    S: FnOnce(
        &mut psbt::Input,
        secp256k1::Message,
    ) -> Result<(schnorr::Signature, XOnlyPublicKey), Error>,
{
    let (checkpoint_output, checkpoint_outpoint) = checkpoint_inputs
        .get(input_index)
        .ok_or_else(|| Error::ad_hoc(format!("no input to sign at index {input_index}")))?;

    if psbt
        .unsigned_tx
        .input
        .get(input_index)
        .map(|input| input.previous_output)
        != Some(checkpoint_outpoint.outpoint)
    {
        return Err(Error::transaction(format!(
            "input {input_index} does not spend checkpoint outpoint {}",
            checkpoint_outpoint.outpoint
        )));
    }

    tracing::debug!(
        outpoint = %checkpoint_outpoint.outpoint,
        index = input_index,
        "Signing checkpoint output for Ark transaction"
    );

    let (spend_script, control_block) = checkpoint_output.spend_leaf()?;

    let psbt_input = &mut psbt.inputs[input_index];
    psbt_input.witness_utxo = Some(TxOut {
        value: checkpoint_outpoint.amount,
        script_pubkey: checkpoint_output.script_pubkey(),
    });
    psbt_input.tap_scripts = BTreeMap::from_iter([(
        control_block,
        (spend_script.clone(), LeafVersion::TapScript),
    )]);

    let prevouts = checkpoint_inputs
        .iter()
        .map(|(output, outpoint)| TxOut {
            value: outpoint.amount,
            script_pubkey: output.script_pubkey(),
        })
        .collect::<Vec<_>>();

    sign_input_leaf(sign_fn, psbt, input_index, &prevouts, &spend_script)
}
