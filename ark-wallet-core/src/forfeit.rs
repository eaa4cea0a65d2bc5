//! Forfeit transactions: the cooperative spend path by which a VTXO holder surrenders the
//! right to unilateral exit in exchange for a new VTXO in the next batch.
//!
//! A forfeit transaction pairs the VTXO with a connector output of the round, so the forfeit
//! only becomes valid if that particular commitment transaction confirms.

use crate::anchor_output;
use crate::intent;
use crate::Error;
use crate::ErrorContext;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::Secp256k1;
use bitcoin::psbt;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot;
use bitcoin::taproot::ControlBlock;
use bitcoin::transaction;
use bitcoin::Amount;
use bitcoin::FeeRate;
use bitcoin::OutPoint;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::TapLeafHash;
use bitcoin::TapSighashType;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Weight;
use bitcoin::XOnlyPublicKey;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Input order of a completed forfeit transaction: the connector comes first, the VTXO second.
const CONNECTOR_VIN: usize = 0;
const VTXO_VIN: usize = 1;

/// A connector output assigned to a VTXO for this round.
#[derive(Debug, Clone)]
struct Connector {
    outpoint: OutPoint,
    prevout: TxOut,
}

/// Whether a VTXO takes part in forfeiting at all.
///
/// Sub-dust VTXOs cannot be unrolled, and swept VTXOs are already back in the server's hands;
/// neither grants an exit that would need to be surrendered.
fn is_forfeitable(vtxo_input: &intent::Input, dust: Amount) -> bool {
    vtxo_input.amount() >= dust && !vtxo_input.is_swept()
}

/// Assign one connector output to every forfeitable VTXO.
///
/// Client and server derive the pairing independently, so it must be deterministic: both sides
/// are ordered by outpoint and matched positionally.
fn assign_connectors(
    vtxo_inputs: &[intent::Input],
    connectors_leaves: &[&Psbt],
    dust: Amount,
) -> Result<HashMap<OutPoint, Connector>, Error> {
    let mut connectors = connectors_leaves
        .iter()
        .flat_map(|psbt| {
            let txid = psbt.unsigned_tx.compute_txid();

            psbt.unsigned_tx
                .output
                .iter()
                .enumerate()
                // Anchors carry no value and cannot fund a forfeit.
                .filter(|(_, output)| output.value > Amount::ZERO)
                .map(move |(vout, output)| Connector {
                    outpoint: OutPoint {
                        txid,
                        vout: vout as u32,
                    },
                    prevout: output.clone(),
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    connectors.sort_by_key(|connector| connector.outpoint);

    let mut vtxo_outpoints = vtxo_inputs
        .iter()
        .filter(|vtxo_input| is_forfeitable(vtxo_input, dust))
        .map(|vtxo_input| vtxo_input.outpoint())
        .collect::<Vec<_>>();
    vtxo_outpoints.sort();

    if vtxo_outpoints.len() != connectors.len() {
        return Err(Error::ad_hoc(format!(
            "{} forfeitable VTXOs but {} connectors",
            vtxo_outpoints.len(),
            connectors.len()
        )));
    }

    Ok(vtxo_outpoints.into_iter().zip(connectors).collect())
}

/// The unsigned skeleton shared by complete and delegated forfeit transactions.
///
/// With a connector the transaction has the canonical two-input layout; without one, only the
/// VTXO input is present and the connector slot is filled in later by the delegate.
fn unsigned_forfeit_psbt(
    vtxo_input: &intent::Input,
    connector: Option<&Connector>,
    server_forfeit_script: &ScriptBuf,
    connector_amount: Amount,
) -> Result<Psbt, Error> {
    let mut inputs = Vec::with_capacity(2);

    if let Some(connector) = connector {
        inputs.push(TxIn {
            previous_output: connector.outpoint,
            ..Default::default()
        });
    }

    inputs.push(TxIn {
        previous_output: vtxo_input.outpoint(),
        ..Default::default()
    });

    let forfeit_output = TxOut {
        value: vtxo_input.amount() + connector_amount,
        script_pubkey: server_forfeit_script.clone(),
    };

    let mut forfeit_psbt = Psbt::from_unsigned_tx(Transaction {
        version: transaction::Version::non_standard(3),
        lock_time: LockTime::ZERO,
        input: inputs,
        output: vec![forfeit_output, anchor_output()],
    })
    .map_err(Error::transaction)?;

    let vtxo_vin = forfeit_psbt.inputs.len() - 1;

    if let Some(connector) = connector {
        forfeit_psbt.inputs[CONNECTOR_VIN].witness_utxo = Some(connector.prevout.clone());
    }

    forfeit_psbt.inputs[vtxo_vin].witness_utxo = Some(TxOut {
        value: vtxo_input.amount(),
        script_pubkey: vtxo_input.script_pubkey().clone(),
    });

    let (forfeit_script, control_block) = vtxo_input.spend_info();
    forfeit_psbt.inputs[vtxo_vin].tap_scripts = BTreeMap::from_iter([(
        control_block.clone(),
        (forfeit_script.clone(), control_block.leaf_version),
    )]);
    forfeit_psbt.inputs[vtxo_vin].witness_script = Some(forfeit_script.clone());

    Ok(forfeit_psbt)
}

/// Script-spend sign the VTXO input of a forfeit transaction and record the signatures.
fn sign_forfeit_vtxo_input<S>(
    sign_fn: &mut S,
    forfeit_psbt: &mut Psbt,
    vtxo_vin: usize,
    sighash_type: TapSighashType,
) -> Result<(), Error>
where
    S: FnMut(
        &mut psbt::Input,
        secp256k1::Message,
    ) -> Result<Vec<(schnorr::Signature, XOnlyPublicKey)>, Error>,
{
    forfeit_psbt.inputs[vtxo_vin].sighash_type = Some(sighash_type.into());

    let prevouts = forfeit_psbt
        .inputs
        .iter()
        .filter_map(|input| input.witness_utxo.clone())
        .collect::<Vec<_>>();

    let (_, (forfeit_script, leaf_version)) = forfeit_psbt.inputs[vtxo_vin]
        .tap_scripts
        .first_key_value()
        .ok_or_else(|| Error::transaction("forfeit input has no spend leaf"))?;
    let leaf_hash = TapLeafHash::from_script(forfeit_script, *leaf_version);

    let tap_sighash = SighashCache::new(&forfeit_psbt.unsigned_tx)
        .taproot_script_spend_signature_hash(
            vtxo_vin,
            &Prevouts::All(&prevouts),
            leaf_hash,
            sighash_type,
        )
        .map_err(Error::crypto)?;

    let msg = secp256k1::Message::from_digest(tap_sighash.to_raw_hash().to_byte_array());

    let secp = Secp256k1::new();

    for (signature, pk) in sign_fn(&mut forfeit_psbt.inputs[vtxo_vin], msg)? {
        // Catch a broken signer before the server does.
        secp.verify_schnorr(&signature, &msg, &pk)
            .map_err(Error::crypto)
            .context("own forfeit signature does not verify")?;

        forfeit_psbt.inputs[vtxo_vin].tap_script_sigs.insert(
            (pk, leaf_hash),
            taproot::Signature {
                signature,
                sighash_type,
            },
        );
    }

    Ok(())
}

/// Build and sign one forfeit transaction per forfeitable [`intent::Input`], pairing each VTXO
/// with its connector.
pub fn create_and_sign_forfeit_txs<S>(
    mut sign_fn: S,
    vtxo_inputs: &[intent::Input],
    connectors_leaves: &[&Psbt],
    server_forfeit_script: &ScriptBuf,
    // As defined by the server.
    dust: Amount,
) -> Result<Vec<Psbt>, Error>
where
    S: FnMut(
        &mut psbt::Input,
        secp256k1::Message,
    ) -> Result<Vec<(schnorr::Signature, XOnlyPublicKey)>, Error>,
{
    let assignments = assign_connectors(vtxo_inputs, connectors_leaves, dust)?;

    vtxo_inputs
        .iter()
        .filter(|vtxo_input| is_forfeitable(vtxo_input, dust))
        .map(|vtxo_input| {
            let outpoint = vtxo_input.outpoint();

            let connector = assignments.get(&outpoint).ok_or_else(|| {
                Error::ad_hoc(format!("no connector assigned to VTXO {outpoint}"))
            })?;

            let mut forfeit_psbt = unsigned_forfeit_psbt(
                vtxo_input,
                Some(connector),
                server_forfeit_script,
                connector.prevout.value,
            )?;

            sign_forfeit_vtxo_input(
                &mut sign_fn,
                &mut forfeit_psbt,
                VTXO_VIN,
                TapSighashType::Default,
            )?;

            Ok(forfeit_psbt)
        })
        .collect()
}

/// Build partial forfeit transactions for a delegate.
///
/// The owner signs only the VTXO input, `SIGHASH_ALL | ANYONECANPAY`, so the delegate can later
/// insert whichever connector the round assigns and submit the completed transactions.
pub fn create_delegate_forfeit_txs<S>(
    mut sign_fn: S,
    vtxo_inputs: &[intent::Input],
    server_forfeit_script: &ScriptBuf,
    dust: Amount,
) -> Result<Vec<Psbt>, Error>
where
    S: FnMut(
        &mut psbt::Input,
        secp256k1::Message,
    ) -> Result<Vec<(schnorr::Signature, XOnlyPublicKey)>, Error>,
{
    vtxo_inputs
        .iter()
        .filter(|vtxo_input| is_forfeitable(vtxo_input, dust))
        .map(|vtxo_input| {
            // The connector is unknown at this point; its dust value is already part of the
            // forfeit output.
            let mut forfeit_psbt =
                unsigned_forfeit_psbt(vtxo_input, None, server_forfeit_script, dust)?;

            sign_forfeit_vtxo_input(
                &mut sign_fn,
                &mut forfeit_psbt,
                0,
                TapSighashType::AllPlusAnyoneCanPay,
            )?;

            Ok(forfeit_psbt)
        })
        .collect()
}

/// Complete delegated forfeit transactions by inserting their assigned connector inputs.
pub fn complete_delegate_forfeit_txs(
    forfeit_psbts: &[Psbt],
    connectors_leaves: &[&Psbt],
) -> Result<Vec<Psbt>, Error> {
    // The partial transactions have the VTXO as their only input.
    let vtxo_inputs_by_outpoint = forfeit_psbts
        .iter()
        .map(|psbt| (psbt.unsigned_tx.input[0].previous_output, psbt))
        .collect::<Vec<_>>();

    let mut connectors = connectors_leaves
        .iter()
        .flat_map(|psbt| {
            let txid = psbt.unsigned_tx.compute_txid();

            psbt.unsigned_tx
                .output
                .iter()
                .enumerate()
                .filter(|(_, output)| output.value > Amount::ZERO)
                .map(move |(vout, output)| Connector {
                    outpoint: OutPoint {
                        txid,
                        vout: vout as u32,
                    },
                    prevout: output.clone(),
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();
    connectors.sort_by_key(|connector| connector.outpoint);

    let mut sorted_outpoints = vtxo_inputs_by_outpoint
        .iter()
        .map(|(outpoint, _)| *outpoint)
        .collect::<Vec<_>>();
    sorted_outpoints.sort();

    if sorted_outpoints.len() != connectors.len() {
        return Err(Error::ad_hoc(format!(
            "{} delegated forfeits but {} connectors",
            sorted_outpoints.len(),
            connectors.len()
        )));
    }

    let assignments: HashMap<OutPoint, Connector> =
        sorted_outpoints.into_iter().zip(connectors).collect();

    vtxo_inputs_by_outpoint
        .into_iter()
        .map(|(vtxo_outpoint, partial_psbt)| {
            let connector = assignments.get(&vtxo_outpoint).ok_or_else(|| {
                Error::ad_hoc(format!("no connector assigned to VTXO {vtxo_outpoint}"))
            })?;

            let mut completed_tx = partial_psbt.unsigned_tx.clone();
            completed_tx.input.insert(
                CONNECTOR_VIN,
                TxIn {
                    previous_output: connector.outpoint,
                    ..Default::default()
                },
            );

            let mut completed_psbt =
                Psbt::from_unsigned_tx(completed_tx).map_err(Error::transaction)?;

            // ANYONECANPAY keeps the owner's signature valid under the new input set.
            completed_psbt.inputs[VTXO_VIN] = partial_psbt.inputs[0].clone();
            completed_psbt.inputs[CONNECTOR_VIN].witness_utxo = Some(connector.prevout.clone());
            completed_psbt.outputs = partial_psbt.outputs.clone();

            Ok(completed_psbt)
        })
        .collect()
}

/// Sign every input of the `commitment_psbt` which spends one of the provided
/// `onchain_inputs`.
pub fn sign_commitment_psbt<F>(
    sign_for_pk_fn: F,
    commitment_psbt: &mut Psbt,
    onchain_inputs: &[intent::OnChainInput],
) -> Result<(), Error>
where
    F: Fn(&XOnlyPublicKey, &secp256k1::Message) -> Result<schnorr::Signature, Error>,
{
    let secp = Secp256k1::new();

    let prevouts = commitment_psbt
        .inputs
        .iter()
        .filter_map(|input| input.witness_utxo.clone())
        .collect::<Vec<_>>();

    // Locate the commitment input spending each of our boarding outputs up front.
    let input_index_by_outpoint = commitment_psbt
        .unsigned_tx
        .input
        .iter()
        .enumerate()
        .map(|(index, input)| (input.previous_output, index))
        .collect::<HashMap<_, _>>();

    for onchain_input in onchain_inputs.iter() {
        let boarding_output = onchain_input.boarding_output();

        let input_index = match input_index_by_outpoint.get(&onchain_input.outpoint()) {
            Some(input_index) => *input_index,
            None => {
                return Err(Error::transaction(format!(
                    "boarding outpoint {} not spent by commitment transaction",
                    onchain_input.outpoint()
                )));
            }
        };

        // Boarding outputs are spent through the script path shared with the server.
        let (forfeit_script, control_block) = boarding_output.forfeit_spend_info();
        let leaf_hash = TapLeafHash::from_script(&forfeit_script, control_block.leaf_version);

        let tap_sighash = SighashCache::new(&commitment_psbt.unsigned_tx)
            .taproot_script_spend_signature_hash(
                input_index,
                &Prevouts::All(&prevouts),
                leaf_hash,
                TapSighashType::Default,
            )
            .map_err(Error::crypto)?;

        let msg = secp256k1::Message::from_digest(tap_sighash.to_raw_hash().to_byte_array());

        let pk = boarding_output.owner_pk();
        let signature = sign_for_pk_fn(&pk, &msg)?;

        secp.verify_schnorr(&signature, &msg, &pk)
            .map_err(Error::crypto)
            .context("own commitment signature does not verify")?;

        let psbt_input = &mut commitment_psbt.inputs[input_index];
        psbt_input.tap_scripts = BTreeMap::from_iter([(
            control_block.clone(),
            (forfeit_script, control_block.leaf_version),
        )]);
        psbt_input.tap_script_sigs.insert(
            (pk, leaf_hash),
            taproot::Signature {
                signature,
                sighash_type: TapSighashType::Default,
            },
        );
    }

    Ok(())
}

/// Closed-form fee estimate for a forfeit transaction.
///
/// The transaction is modelled as a P2PKH connector input, a Tapscript VTXO input (two Schnorr
/// signatures, the forfeit script and its control block) and a P2WPKH output.
pub fn estimate_forfeit_fee(
    forfeit_script: &ScriptBuf,
    control_block: &ControlBlock,
    fee_rate: FeeRate,
) -> Result<Amount, Error> {
    const BASE_TX_WEIGHT: u64 = (4 + 1 + 1 + 4) * 4;
    const P2PKH_INPUT_WEIGHT: u64 = (32 + 4 + 1 + 107 + 4) * 4;
    const TAPROOT_INPUT_BASE_WEIGHT: u64 = (32 + 4 + 1 + 4) * 4;
    const P2WPKH_OUTPUT_WEIGHT: u64 = (8 + 1 + 22) * 4;
    const SCHNORR_SIGNATURE_SIZE: u64 = 64;

    // Witness bytes count once towards the weight.
    let witness_size = 1
        + (1 + SCHNORR_SIGNATURE_SIZE) * 2
        + 1
        + forfeit_script.len() as u64
        + 1
        + control_block.size() as u64;

    let weight = Weight::from_wu(
        BASE_TX_WEIGHT + P2PKH_INPUT_WEIGHT + TAPROOT_INPUT_BASE_WEIGHT + P2WPKH_OUTPUT_WEIGHT,
    ) + Weight::from_witness_data_size(witness_size);

    fee_rate
        .checked_mul_by_weight(weight)
        .ok_or_else(|| Error::ad_hoc("fee calculation overflow"))
}
