//! Intent proofs: signed assertions of VTXO ownership used to register for a settlement round.
//!
//! The proof borrows the two-transaction shape of BIP-322. A non-broadcastable commitment
//! transaction locks the tagged hash of the intent message behind the first input's script;
//! the proof transaction spends it together with every input being proven and is signed like
//! any other PSBT. Neither transaction can ever confirm, but the signatures bind the message
//! to the proven coins.

use crate::boarding_output::BoardingOutput;
use crate::psbt::set_condition_witness;
use crate::psbt::set_vtxo_taproot_tree;
use crate::Error;
use crate::ErrorContext;
use bitcoin::absolute;
use bitcoin::base64;
use bitcoin::base64::Engine;
use bitcoin::hashes::sha256;
use bitcoin::hashes::Hash;
use bitcoin::hashes::HashEngine;
use bitcoin::opcodes::all::OP_PUSHBYTES_0;
use bitcoin::psbt;
use bitcoin::psbt::PsbtSighashType;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot;
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::Version;
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
use bitcoin::Txid;
use bitcoin::Witness;
use bitcoin::XOnlyPublicKey;
use serde::Serialize;

const MESSAGE_TAG: &[u8] = b"ark-intent-proof-message";

/// An input covered by an intent proof: the coin, the leaf it would be spent through, and the
/// timelocks that leaf carries.
#[derive(Clone, Debug)]
pub struct Input {
    outpoint: OutPoint,
    /// The relative timelock of the selected leaf, if any (unilateral exit paths).
    sequence: Sequence,
    /// The absolute timelock of the selected leaf, if any (HTLC refunds).
    locktime: absolute::LockTime,
    witness_utxo: TxOut,
    tapscripts: Vec<ScriptBuf>,
    spend_info: (ScriptBuf, taproot::ControlBlock),
    is_onchain: bool,
    is_swept: bool,
    /// Witness elements satisfying a conditional leaf. When set, they replace the signature.
    condition_witness: Option<Vec<Vec<u8>>>,
}

impl Input {
    pub fn new(
        outpoint: OutPoint,
        sequence: Sequence,
        locktime: Option<absolute::LockTime>,
        witness_utxo: TxOut,
        tapscripts: Vec<ScriptBuf>,
        spend_info: (ScriptBuf, taproot::ControlBlock),
        is_onchain: bool,
        is_swept: bool,
    ) -> Self {
        Self {
            outpoint,
            sequence,
            locktime: locktime.unwrap_or(absolute::LockTime::ZERO),
            witness_utxo,
            tapscripts,
            spend_info,
            is_onchain,
            is_swept,
            condition_witness: None,
        }
    }

    pub fn with_condition_witness(mut self, condition_witness: Vec<Vec<u8>>) -> Self {
        self.condition_witness = Some(condition_witness);
        self
    }

    pub fn script_pubkey(&self) -> &ScriptBuf {
        &self.witness_utxo.script_pubkey
    }

    pub fn amount(&self) -> Amount {
        self.witness_utxo.value
    }

    pub fn spend_info(&self) -> &(ScriptBuf, taproot::ControlBlock) {
        &self.spend_info
    }

    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }

    pub fn tapscripts(&self) -> &[ScriptBuf] {
        &self.tapscripts
    }

    pub fn is_swept(&self) -> bool {
        self.is_swept
    }
}

/// A confirmed boarding UTXO to be settled into a VTXO.
#[derive(Debug, Clone)]
pub struct OnChainInput {
    boarding_output: BoardingOutput,
    amount: Amount,
    outpoint: OutPoint,
}

impl OnChainInput {
    pub fn new(boarding_output: BoardingOutput, amount: Amount, outpoint: OutPoint) -> Self {
        Self {
            boarding_output,
            amount,
            outpoint,
        }
    }

    pub fn boarding_output(&self) -> &BoardingOutput {
        &self.boarding_output
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn outpoint(&self) -> OutPoint {
        self.outpoint
    }

    pub fn to_intent_input(&self) -> Input {
        Input::new(
            self.outpoint,
            self.boarding_output.exit_delay(),
            None,
            TxOut {
                value: self.amount,
                script_pubkey: self.boarding_output.script_pubkey(),
            },
            self.boarding_output.tapscripts(),
            self.boarding_output.forfeit_spend_info(),
            true,
            false,
        )
    }
}

/// An output requested from the next settlement round.
#[derive(Debug, Clone)]
pub enum Output {
    /// A new VTXO.
    Offchain(TxOut),
    /// An on-chain output of the commitment transaction (offboarding).
    Onchain(TxOut),
}

impl Output {
    pub fn tx_out(&self) -> &TxOut {
        match self {
            Output::Offchain(tx_out) | Output::Onchain(tx_out) => tx_out,
        }
    }
}

/// The JSON message committed to by an intent proof. Field order is fixed.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum IntentMessage {
    #[serde(rename = "register")]
    Register {
        onchain_output_indexes: Vec<usize>,
        valid_at: u64,
        expire_at: u64,
        #[serde(rename = "cosigners_public_keys")]
        own_cosigner_pks: Vec<PublicKey>,
    },
    #[serde(rename = "delete")]
    Delete { expire_at: u64 },
    #[serde(rename = "get-pending-tx")]
    GetPendingTx { expire_at: u64 },
}

impl IntentMessage {
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self)
            .map_err(Error::ad_hoc)
            .context("failed to serialize intent message to JSON")
    }
}

/// A signed intent proof, ready to be submitted to the server.
#[derive(Debug, Clone)]
pub struct Intent {
    pub proof: Psbt,
    message: IntentMessage,
}

impl Intent {
    pub fn new(proof: Psbt, message: IntentMessage) -> Self {
        Self { proof, message }
    }

    pub fn serialize_proof(&self) -> String {
        let base64 = base64::engine::GeneralPurpose::new(
            &base64::alphabet::STANDARD,
            base64::engine::GeneralPurposeConfig::new(),
        );

        base64.encode(self.proof.serialize())
    }

    pub fn serialize_message(&self) -> Result<String, Error> {
        self.message.encode()
    }
}

/// Build and sign an intent proof.
///
/// `sign_for_vtxo_fn` may return several signatures (one per key of ours in the leaf script);
/// `sign_for_onchain_fn` signs boarding inputs with the single owner key.
pub fn make_intent<SV, SO>(
    sign_for_vtxo_fn: SV,
    sign_for_onchain_fn: SO,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    message: IntentMessage,
) -> Result<Intent, Error>
where
    SV: Fn(
        &mut psbt::Input,
        secp256k1::Message,
    ) -> Result<Vec<(schnorr::Signature, XOnlyPublicKey)>, Error>,
    SO: Fn(
        &mut psbt::Input,
        secp256k1::Message,
    ) -> Result<(schnorr::Signature, XOnlyPublicKey), Error>,
{
    let (mut proof_psbt, commitment_input) = build_proof_psbt(&message, &inputs, &outputs)?;

    let prevouts = proof_psbt
        .inputs
        .iter()
        .filter_map(|proof_input| proof_input.witness_utxo.clone())
        .collect::<Vec<_>>();

    // Input 0 spends the commitment transaction and reuses the first proven input's leaf; the
    // rest are the proven inputs themselves, in order.
    let sources = std::iter::once(&commitment_input)
        .chain(inputs.iter())
        .collect::<Vec<_>>();

    for (index, (proof_input, source)) in
        proof_psbt.inputs.iter_mut().zip(&sources).enumerate()
    {
        let (leaf_script, control_block) = source.spend_info.clone();

        if index > 0 {
            set_vtxo_taproot_tree(proof_input, &source.tapscripts);
        }

        proof_input.tap_scripts.insert(
            control_block,
            (leaf_script.clone(), LeafVersion::TapScript),
        );

        // Conditional leaves are satisfied by witness elements, not by signatures.
        if let Some(condition_witness) = &source.condition_witness {
            set_condition_witness(proof_input, condition_witness);
            continue;
        }

        let leaf_hash = TapLeafHash::from_script(&leaf_script, LeafVersion::TapScript);

        let tap_sighash = SighashCache::new(&proof_psbt.unsigned_tx)
            .taproot_script_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                leaf_hash,
                TapSighashType::Default,
            )
            .map_err(Error::crypto)
            .with_context(|| format!("failed to compute sighash for intent proof input {index}"))?;

        let msg = secp256k1::Message::from_digest(tap_sighash.to_raw_hash().to_byte_array());

        let signatures = if source.is_onchain {
            vec![sign_for_onchain_fn(proof_input, msg)?]
        } else {
            sign_for_vtxo_fn(proof_input, msg)?
        };

        for (signature, pk) in signatures {
            proof_input.tap_script_sigs.insert(
                (pk, leaf_hash),
                taproot::Signature {
                    signature,
                    sighash_type: TapSighashType::Default,
                },
            );
        }
    }

    Ok(Intent {
        proof: proof_psbt,
        message,
    })
}

/// The non-broadcastable transaction that locks the message digest.
///
/// Its only input spends from nowhere and pushes `OP_0 <digest>` in its script sig; its only
/// output echoes the first proven input's script with zero value.
fn build_to_spend_tx(message_digest: &sha256::Hash, pk_script: ScriptBuf) -> Transaction {
    let script_sig = ScriptBuf::builder()
        .push_opcode(OP_PUSHBYTES_0)
        .push_slice(message_digest.as_byte_array())
        .into_script();

    Transaction {
        version: Version::non_standard(0),
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint {
                txid: Txid::all_zeros(),
                vout: 0xFFFFFFFF,
            },
            script_sig,
            sequence: Sequence::ZERO,
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: pk_script,
        }],
    }
}

/// Build the unsigned proof PSBT, plus the synthetic input that spends the commitment
/// transaction.
pub(crate) fn build_proof_psbt(
    message: &IntentMessage,
    inputs: &[Input],
    outputs: &[Output],
) -> Result<(Psbt, Input), Error> {
    let first_input = match inputs.first() {
        Some(first_input) => first_input.clone(),
        None => return Err(Error::ad_hoc("missing inputs")),
    };

    let digest = message_hash(message.encode()?.as_bytes());

    let to_spend_tx = build_to_spend_tx(&digest, first_input.script_pubkey().clone());

    let commitment_outpoint = OutPoint {
        txid: to_spend_tx.compute_txid(),
        vout: 0,
    };

    let tx_inputs = std::iter::once((commitment_outpoint, first_input.sequence))
        .chain(inputs.iter().map(|input| (input.outpoint, input.sequence)))
        .map(|(previous_output, sequence)| TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        })
        .collect::<Vec<_>>();

    // A proof without requested outputs still needs one output to be a valid transaction.
    let tx_outputs = if outputs.is_empty() {
        vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::new_op_return([]),
        }]
    } else {
        outputs.iter().map(|output| output.tx_out().clone()).collect()
    };

    let lock_time = inputs
        .iter()
        .map(|input| input.locktime)
        .max_by_key(|locktime| locktime.to_consensus_u32())
        .unwrap_or(absolute::LockTime::ZERO);

    let mut proof_psbt = Psbt::from_unsigned_tx(Transaction {
        version: Version::TWO,
        lock_time,
        input: tx_inputs,
        output: tx_outputs,
    })
    .map_err(Error::ad_hoc)
    .context("failed to build intent proof PSBT")?;

    // Every input is signed SIGHASH_ALL, so nothing about the proof can be malleated.
    let sighash_all = PsbtSighashType::from_u32(1);

    let to_spend_prevouts = std::iter::once(&to_spend_tx.output[0])
        .chain(inputs.iter().map(|input| &input.witness_utxo));
    let witness_scripts = std::iter::once(&first_input.spend_info.0)
        .chain(inputs.iter().map(|input| &input.spend_info.0));

    for ((proof_input, prevout), witness_script) in proof_psbt
        .inputs
        .iter_mut()
        .zip(to_spend_prevouts)
        .zip(witness_scripts)
    {
        proof_input.witness_utxo = Some(prevout.clone());
        proof_input.sighash_type = Some(sighash_all);
        proof_input.witness_script = Some(witness_script.clone());
    }

    let mut commitment_input = first_input;
    commitment_input.outpoint = commitment_outpoint;

    Ok((proof_psbt, commitment_input))
}

/// `TaggedHash("ark-intent-proof-message", message)`.
pub fn message_hash(message: &[u8]) -> sha256::Hash {
    let tag_hash = sha256::Hash::hash(MESSAGE_TAG);

    let mut engine = sha256::Hash::engine();
    engine.input(tag_hash.as_byte_array());
    engine.input(tag_hash.as_byte_array());
    engine.input(message);

    sha256::Hash::from_engine(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vtxo::VtxoScript;
    use bitcoin::key::Keypair;
    use bitcoin::key::Secp256k1;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::Network;

    fn cosigner_pk() -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[0x51; 32]).unwrap())
    }

    #[test]
    fn intent_message_register_serialization() {
        let pk = cosigner_pk();
        let msg = IntentMessage::Register {
            onchain_output_indexes: vec![1, 2],
            valid_at: 1726000000,
            expire_at: 1726000300,
            own_cosigner_pks: vec![pk],
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(
            encoded,
            format!(
                r#"{{"type":"register","onchain_output_indexes":[1,2],"valid_at":1726000000,"expire_at":1726000300,"cosigners_public_keys":["{pk}"]}}"#
            )
        );
    }

    #[test]
    fn intent_message_delete_serialization() {
        let msg = IntentMessage::Delete {
            expire_at: 1726000300,
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded, r#"{"type":"delete","expire_at":1726000300}"#);
    }

    #[test]
    fn intent_message_get_pending_tx_serialization() {
        let msg = IntentMessage::GetPendingTx {
            expire_at: 1726000300,
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(
            encoded,
            r#"{"type":"get-pending-tx","expire_at":1726000300}"#
        );
    }

    #[test]
    fn message_hash_is_tagged_and_sensitive() {
        let a = message_hash(b"hello");
        let b = message_hash(b"hellp");

        assert_ne!(a, b);

        // The tag commits to the protocol: a plain SHA256 of the message must not match.
        assert_ne!(a, sha256::Hash::hash(b"hello"));
    }

    fn test_input(byte: u8, amount: Amount) -> Input {
        let secp = Secp256k1::new();
        let server = Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[0x61; 32]).unwrap())
            .x_only_public_key()
            .0;
        let owner = Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[0x62; 32]).unwrap())
            .x_only_public_key()
            .0;

        let vtxo = VtxoScript::new_default(
            &secp,
            server,
            owner,
            Sequence::from_seconds_ceil(512).unwrap(),
            Network::Regtest,
        )
        .unwrap();

        Input::new(
            OutPoint {
                txid: Txid::from_byte_array([byte; 32]),
                vout: 0,
            },
            Sequence::MAX,
            None,
            TxOut {
                value: amount,
                script_pubkey: vtxo.script_pubkey(),
            },
            vtxo.tapscripts(),
            vtxo.forfeit_spend_info().unwrap(),
            false,
            false,
        )
    }

    #[test]
    fn proof_structure() {
        let input = test_input(0x71, Amount::from_sat(5000));

        let message = IntentMessage::Delete {
            expire_at: 1726000300,
        };

        let (to_sign, commitment_input) =
            build_proof_psbt(&message, std::slice::from_ref(&input), &[]).unwrap();

        // The proof spends the synthetic commitment output first, then the proven input.
        assert_eq!(to_sign.unsigned_tx.input.len(), 2);
        assert_eq!(
            to_sign.unsigned_tx.input[0].previous_output,
            commitment_input.outpoint()
        );
        assert_eq!(
            to_sign.unsigned_tx.input[1].previous_output,
            input.outpoint()
        );

        // The commitment output echoes the first input's script, with zero value.
        let commitment_prevout = to_sign.inputs[0].witness_utxo.as_ref().unwrap();
        assert_eq!(commitment_prevout.value, Amount::ZERO);
        assert_eq!(&commitment_prevout.script_pubkey, input.script_pubkey());

        // No outputs requested: a lone OP_RETURN is used.
        assert_eq!(to_sign.unsigned_tx.output.len(), 1);
        assert!(to_sign.unsigned_tx.output[0].script_pubkey.is_op_return());

        // Every input is signed with SIGHASH_ALL.
        for psbt_input in &to_sign.inputs {
            assert_eq!(psbt_input.sighash_type, Some(PsbtSighashType::from_u32(1)));
        }
    }

    #[test]
    fn to_spend_txid_changes_with_message() {
        let input = test_input(0x71, Amount::from_sat(5000));

        let (to_sign_a, _) = build_proof_psbt(
            &IntentMessage::Delete { expire_at: 1 },
            std::slice::from_ref(&input),
            &[],
        )
        .unwrap();
        let (to_sign_b, _) = build_proof_psbt(
            &IntentMessage::Delete { expire_at: 2 },
            std::slice::from_ref(&input),
            &[],
        )
        .unwrap();

        assert_ne!(
            to_sign_a.unsigned_tx.input[0].previous_output,
            to_sign_b.unsigned_tx.input[0].previous_output
        );
    }

    #[test]
    fn make_intent_signs_every_input() {
        let secp = Secp256k1::new();
        let owner = Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[0x62; 32]).unwrap());

        let inputs = vec![
            test_input(0x71, Amount::from_sat(5000)),
            test_input(0x72, Amount::from_sat(7000)),
        ];

        let message = IntentMessage::Register {
            onchain_output_indexes: vec![],
            valid_at: 100,
            expire_at: 200,
            own_cosigner_pks: vec![owner.public_key()],
        };

        let sign_for_vtxo = |_: &mut psbt::Input,
                             msg: secp256k1::Message|
         -> Result<Vec<(schnorr::Signature, XOnlyPublicKey)>, Error> {
            let sig = Secp256k1::new().sign_schnorr_no_aux_rand(&msg, &owner);
            Ok(vec![(sig, owner.x_only_public_key().0)])
        };

        let sign_for_onchain = |_: &mut psbt::Input,
                                _: secp256k1::Message|
         -> Result<(schnorr::Signature, XOnlyPublicKey), Error> {
            unreachable!("no onchain inputs in this test")
        };

        let intent =
            make_intent(sign_for_vtxo, sign_for_onchain, inputs, vec![], message).unwrap();

        assert_eq!(intent.proof.inputs.len(), 3);
        for input in &intent.proof.inputs {
            assert_eq!(input.tap_script_sigs.len(), 1);
        }

        // The proof serialises to standard base64 PSBT.
        assert!(intent.serialize_proof().starts_with("cHNidP"));
    }
}
