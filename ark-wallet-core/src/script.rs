use crate::Error;
use bitcoin::absolute;
use bitcoin::opcodes::all::*;
use bitcoin::script::Builder;
use bitcoin::script::Instruction;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::XOnlyPublicKey;
use std::fmt;

/// Largest value that fits a CLTV/CSV script number without triggering consensus weirdness.
const MAX_TIMELOCK: u32 = 1 << 31;

/// An N-of-N multisignature [`ScriptBuf`]: `<p1> CHECKSIGVERIFY ... <pN> CHECKSIG`.
///
/// Key order matters: the same keys in a different order produce a different script.
pub fn multisig_script(pks: &[XOnlyPublicKey]) -> Result<ScriptBuf, Error> {
    if pks.len() < 2 {
        return Err(Error::script(format!(
            "multisig script needs at least 2 keys, got {}",
            pks.len()
        )));
    }

    Ok(push_checksig_keys(Builder::new(), pks).into_script())
}

/// A [`ScriptBuf`] allowing the owners of `pks` to spend together after the relative timelock
/// `locktime` has passed from the time the corresponding output was included in a block.
pub fn csv_multisig_script(
    locktime: Sequence,
    pks: &[XOnlyPublicKey],
) -> Result<ScriptBuf, Error> {
    if !locktime.is_relative_lock_time() {
        return Err(Error::script(format!(
            "invalid relative timelock: {locktime}"
        )));
    }

    check_timelock_value(locktime.to_consensus_u32())?;
    check_keys(pks)?;

    let builder = Builder::new()
        .push_int(locktime.to_consensus_u32() as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP);

    Ok(push_checksig_keys(builder, pks).into_script())
}

/// A [`ScriptBuf`] allowing the owners of `pks` to spend together after the absolute timelock
/// `locktime`.
pub fn cltv_multisig_script(
    locktime: absolute::LockTime,
    pks: &[XOnlyPublicKey],
) -> Result<ScriptBuf, Error> {
    check_timelock_value(locktime.to_consensus_u32())?;
    check_keys(pks)?;

    let builder = Builder::new()
        .push_int(locktime.to_consensus_u32() as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP);

    Ok(push_checksig_keys(builder, pks).into_script())
}

/// A [`ScriptBuf`] that requires satisfying an arbitrary `condition` script on top of the
/// multisignature.
///
/// The witness elements satisfying the condition are carried in the `condition` PSBT field and
/// appended by the spender.
pub fn condition_multisig_script(
    condition: &ScriptBuf,
    pks: &[XOnlyPublicKey],
) -> Result<ScriptBuf, Error> {
    if condition.is_empty() {
        return Err(Error::script("empty condition script"));
    }

    check_keys(pks)?;

    let mut bytes = condition.to_bytes();
    bytes.push(OP_VERIFY.to_u8());
    bytes.extend_from_slice(push_checksig_keys(Builder::new(), pks).into_script().as_bytes());

    Ok(ScriptBuf::from_bytes(bytes))
}

/// The script pubkey for the Taproot output corresponding to the given [`TaprootSpendInfo`].
pub fn tr_script_pubkey(spend_info: &TaprootSpendInfo) -> ScriptBuf {
    let output_key = spend_info.output_key();

    Builder::new()
        .push_opcode(OP_PUSHNUM_1)
        .push_slice(output_key.serialize())
        .into_script()
}

fn check_keys(pks: &[XOnlyPublicKey]) -> Result<(), Error> {
    if pks.is_empty() {
        return Err(Error::script("multisig script needs at least 1 key"));
    }

    Ok(())
}

fn check_timelock_value(value: u32) -> Result<(), Error> {
    if value >= MAX_TIMELOCK {
        return Err(Error::script(format!("timelock value out of range: {value}")));
    }

    Ok(())
}

fn push_checksig_keys(mut builder: Builder, pks: &[XOnlyPublicKey]) -> Builder {
    let (last, rest) = pks.split_last().expect("at least one key");

    for pk in rest {
        builder = builder.push_x_only_key(pk).push_opcode(OP_CHECKSIGVERIFY);
    }

    builder.push_x_only_key(last).push_opcode(OP_CHECKSIG)
}

/// List the signer keys of a multisig-style script.
///
/// A signer key is any key-sized data push that is consumed by the [`OP_CHECKSIG`] or
/// [`OP_CHECKSIGVERIFY`] right after it, so timelock prefixes and hash locks are skipped
/// naturally.
pub fn extract_checksig_pubkeys(script: &ScriptBuf) -> Vec<XOnlyPublicKey> {
    let mut pubkeys = Vec::new();

    // Tracks the most recent push, which a following checksig opcode would consume.
    let mut candidate: Option<XOnlyPublicKey> = None;

    for instruction in script.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) => {
                candidate = XOnlyPublicKey::from_slice(bytes.as_bytes()).ok();
            }
            Ok(Instruction::Op(op)) => {
                if op == OP_CHECKSIG || op == OP_CHECKSIGVERIFY {
                    if let Some(pk) = candidate.take() {
                        pubkeys.push(pk);
                    }
                } else {
                    candidate = None;
                }
            }
            Err(_) => break,
        }
    }

    pubkeys
}

/// Recover the relative timelock from a CSV-multisig script.
///
/// The script must start with `<locktime> OP_CSV`, the way [`csv_multisig_script`] renders it.
pub fn extract_sequence_from_csv_multisig_script(
    script: &ScriptBuf,
) -> Result<Sequence, InvalidCsvMultisigScriptError> {
    let mut instructions = script.instructions();

    let locktime_push = instructions
        .next()
        .and_then(|instruction| instruction.ok())
        .ok_or(InvalidCsvMultisigScriptError)?;

    let value = match locktime_push {
        // Minimal script numbers are little-endian with the sign bit on top; timelocks are
        // always positive.
        Instruction::PushBytes(bytes) => {
            let bytes = bytes.as_bytes();
            if bytes.len() > 4 {
                return Err(InvalidCsvMultisigScriptError);
            }

            bytes
                .iter()
                .rev()
                .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte))
        }
        // Values 1 through 16 are rendered as OP_PUSHNUM opcodes.
        Instruction::Op(op)
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&op.to_u8()) =>
        {
            u32::from(op.to_u8() - OP_PUSHNUM_1.to_u8()) + 1
        }
        Instruction::Op(_) => return Err(InvalidCsvMultisigScriptError),
    };

    let followed_by_csv = matches!(
        instructions.next(),
        Some(Ok(Instruction::Op(op))) if op == OP_CSV
    );

    if !followed_by_csv {
        return Err(InvalidCsvMultisigScriptError);
    }

    Ok(Sequence::from_consensus(value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidCsvMultisigScriptError;

impl fmt::Display for InvalidCsvMultisigScriptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid CSV-multisig script")
    }
}

impl std::error::Error for InvalidCsvMultisigScriptError {}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::key::Keypair;
    use bitcoin::key::Secp256k1;
    use bitcoin::locktime;
    use bitcoin::secp256k1::SecretKey;

    fn xonly(byte: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(&secp, &sk).x_only_public_key().0
    }

    #[test]
    fn multisig_requires_two_keys() {
        assert!(multisig_script(&[xonly(31)]).is_err());
        assert!(multisig_script(&[xonly(31), xonly(32)]).is_ok());
    }

    #[test]
    fn multisig_key_order_matters() {
        let a = multisig_script(&[xonly(31), xonly(32)]).unwrap();
        let b = multisig_script(&[xonly(32), xonly(31)]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn extract_sequence_roundtrip() {
        // Equivalent to two 512-second intervals.
        let sequence = Sequence::from_seconds_ceil(1024).unwrap();

        let script = csv_multisig_script(sequence, &[xonly(31)]).unwrap();

        let parsed = extract_sequence_from_csv_multisig_script(&script).unwrap();
        let parsed = parsed.to_relative_lock_time();

        assert_eq!(
            parsed,
            Some(locktime::relative::LockTime::from_512_second_intervals(2))
        );
    }

    #[test]
    fn extract_sequence_handles_small_pushnum_values() {
        // 1 through 16 are rendered as OP_PUSHNUM opcodes rather than data pushes.
        for height in [1u16, 7, 16, 17, 144] {
            let sequence = Sequence::from_height(height);
            let script = csv_multisig_script(sequence, &[xonly(31)]).unwrap();

            let parsed = extract_sequence_from_csv_multisig_script(&script).unwrap();
            assert_eq!(parsed, sequence);
        }
    }

    #[test]
    fn extract_sequence_rejects_scripts_without_csv() {
        let script = multisig_script(&[xonly(31), xonly(32)]).unwrap();
        assert!(extract_sequence_from_csv_multisig_script(&script).is_err());
    }

    #[test]
    fn extract_checksig_pubkeys_from_multisig() {
        let script = multisig_script(&[xonly(31), xonly(32), xonly(33)]).unwrap();
        let pubkeys = extract_checksig_pubkeys(&script);

        assert_eq!(pubkeys, vec![xonly(31), xonly(32), xonly(33)]);
    }

    #[test]
    fn extract_checksig_pubkeys_skips_timelock_prefix() {
        let sequence = Sequence::from_seconds_ceil(1024).unwrap();
        let script = csv_multisig_script(sequence, &[xonly(31)]).unwrap();
        let pubkeys = extract_checksig_pubkeys(&script);

        assert_eq!(pubkeys, vec![xonly(31)]);
    }

    #[test]
    fn extract_checksig_pubkeys_ignores_unrelated_pushes() {
        // A hash-lock push must not be mistaken for a signer key.
        let script = ScriptBuf::builder()
            .push_opcode(OP_SHA256)
            .push_slice([0x5A; 32])
            .push_opcode(OP_EQUALVERIFY)
            .push_x_only_key(&xonly(31))
            .push_opcode(OP_CHECKSIG)
            .into_script();

        let pubkeys = extract_checksig_pubkeys(&script);
        assert_eq!(pubkeys, vec![xonly(31)]);
    }

    #[test]
    fn cltv_rejects_out_of_range_timelock() {
        let locktime = absolute::LockTime::from_consensus(1 << 31);
        assert!(cltv_multisig_script(locktime, &[xonly(31), xonly(32)]).is_err());
    }

    #[test]
    fn condition_multisig_appends_verify() {
        let condition = ScriptBuf::builder()
            .push_opcode(bitcoin::opcodes::OP_TRUE)
            .into_script();
        let script = condition_multisig_script(&condition, &[xonly(31)]).unwrap();

        let bytes = script.as_bytes();
        assert_eq!(bytes[0], bitcoin::opcodes::OP_TRUE.to_u8());
        assert_eq!(bytes[1], OP_VERIFY.to_u8());
    }
}
