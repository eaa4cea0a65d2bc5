//! Protocol-specific PSBT fields.
//!
//! All fields live in the `unknown` map of a PSBT input, under the proprietary key type `0xFF`
//! with an ASCII key prefix.

use crate::utils::read_compact_size_uint;
use crate::utils::write_compact_size_uint;
use crate::Error;
use crate::ErrorContext;
use bitcoin::psbt;
use bitcoin::secp256k1::PublicKey;
use bitcoin::taproot::LeafVersion;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use std::io::Cursor;
use std::io::Read;

/// The proprietary key type used for every custom field.
pub const PROPRIETARY_KEY_TYPE: u8 = u8::MAX;

/// The byte value corresponds to the string "cosigner".
pub const COSIGNER_PSBT_KEY_PREFIX: [u8; 8] = [99, 111, 115, 105, 103, 110, 101, 114];

/// The byte value corresponds to the string "taptree".
pub const VTXO_TAPROOT_TREE_PSBT_KEY: [u8; 7] = [116, 97, 112, 116, 114, 101, 101];

/// The byte value corresponds to the string "condition".
pub const CONDITION_WITNESS_PSBT_KEY: [u8; 9] = [99, 111, 110, 100, 105, 116, 105, 111, 110];

/// The byte value corresponds to the string "expiry".
pub const VTXO_TREE_EXPIRY_PSBT_KEY: [u8; 6] = [101, 120, 112, 105, 114, 121];

fn proprietary_key(key: Vec<u8>) -> psbt::raw::Key {
    psbt::raw::Key {
        type_value: PROPRIETARY_KEY_TYPE,
        key,
    }
}

/// Record the cosigner public keys of a shared output in a PSBT input.
///
/// Each key gets its own entry, with the key index appended to the `cosigner` prefix.
pub fn set_cosigner_pks(input: &mut psbt::Input, pks: &[PublicKey]) {
    for (i, pk) in pks.iter().enumerate() {
        let mut key = COSIGNER_PSBT_KEY_PREFIX.to_vec();
        key.push(i as u8);

        input
            .unknown
            .insert(proprietary_key(key), pk.serialize().to_vec());
    }
}

/// Extract all cosigner public keys from a PSBT input, in no particular order.
pub fn extract_cosigner_pks(input: &psbt::Input) -> Result<Vec<PublicKey>, Error> {
    let mut cosigner_pks = Vec::new();
    for (key, pk) in input.unknown.iter() {
        if key.type_value == PROPRIETARY_KEY_TYPE && key.key.starts_with(&COSIGNER_PSBT_KEY_PREFIX)
        {
            cosigner_pks.push(
                PublicKey::from_slice(pk)
                    .map_err(Error::crypto)
                    .context("invalid cosigner PK")?,
            );
        }
    }

    Ok(cosigner_pks)
}

/// Serialise a list of tapscripts for the `taptree` field:
/// `varuint(count) || (depth(1) || leaf_version(1) || varuint(len) || script)*`.
pub fn encode_tapscripts(scripts: &[ScriptBuf]) -> Vec<u8> {
    let mut bytes = Vec::new();

    write_compact_size_uint(&mut bytes, scripts.len() as u64).expect("infallible");

    for script in scripts {
        // All leaves sit at depth 1 as far as this encoding is concerned.
        bytes.push(1);
        bytes.push(LeafVersion::TapScript.to_consensus());

        write_compact_size_uint(&mut bytes, script.len() as u64).expect("infallible");
        bytes.extend_from_slice(script.as_bytes());
    }

    bytes
}

pub fn decode_tapscripts(bytes: &[u8]) -> Result<Vec<ScriptBuf>, Error> {
    let mut cursor = Cursor::new(bytes);

    let count = read_compact_size_uint(&mut cursor)
        .map_err(Error::ad_hoc)
        .context("failed to read tapscript count")?;

    let mut scripts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut depth_and_version = [0u8; 2];
        cursor
            .read_exact(&mut depth_and_version)
            .map_err(Error::ad_hoc)
            .context("failed to read tapscript header")?;

        let script_len = read_compact_size_uint(&mut cursor)
            .map_err(Error::ad_hoc)
            .context("failed to read tapscript length")?;

        let mut script_bytes = vec![0u8; script_len as usize];
        cursor
            .read_exact(&mut script_bytes)
            .map_err(Error::ad_hoc)
            .context("failed to read tapscript bytes")?;

        scripts.push(ScriptBuf::from_bytes(script_bytes));
    }

    Ok(scripts)
}

/// Attach the full Taproot tree of the spent VTXO to a PSBT input.
pub fn set_vtxo_taproot_tree(input: &mut psbt::Input, scripts: &[ScriptBuf]) {
    input.unknown.insert(
        proprietary_key(VTXO_TAPROOT_TREE_PSBT_KEY.to_vec()),
        encode_tapscripts(scripts),
    );
}

pub fn get_vtxo_taproot_tree(input: &psbt::Input) -> Result<Option<Vec<ScriptBuf>>, Error> {
    match input
        .unknown
        .get(&proprietary_key(VTXO_TAPROOT_TREE_PSBT_KEY.to_vec()))
    {
        Some(bytes) => decode_tapscripts(bytes).map(Some),
        None => Ok(None),
    }
}

/// Attach the witness elements that satisfy a conditional leaf to a PSBT input.
///
/// Format: `varuint(count) || (varuint(len) || element)*`.
pub fn set_condition_witness(input: &mut psbt::Input, elements: &[Vec<u8>]) {
    let mut bytes = Vec::new();

    write_compact_size_uint(&mut bytes, elements.len() as u64).expect("infallible");

    for element in elements {
        write_compact_size_uint(&mut bytes, element.len() as u64).expect("infallible");
        bytes.extend_from_slice(element);
    }

    input
        .unknown
        .insert(proprietary_key(CONDITION_WITNESS_PSBT_KEY.to_vec()), bytes);
}

pub fn get_condition_witness(input: &psbt::Input) -> Result<Option<Vec<Vec<u8>>>, Error> {
    let bytes = match input
        .unknown
        .get(&proprietary_key(CONDITION_WITNESS_PSBT_KEY.to_vec()))
    {
        Some(bytes) => bytes,
        None => return Ok(None),
    };

    let mut cursor = Cursor::new(bytes.as_slice());

    let count = read_compact_size_uint(&mut cursor)
        .map_err(Error::ad_hoc)
        .context("failed to read condition witness count")?;

    let mut elements = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_compact_size_uint(&mut cursor)
            .map_err(Error::ad_hoc)
            .context("failed to read condition witness element length")?;

        let mut element = vec![0u8; len as usize];
        cursor
            .read_exact(&mut element)
            .map_err(Error::ad_hoc)
            .context("failed to read condition witness element")?;

        elements.push(element);
    }

    Ok(Some(elements))
}

/// Attach the expiry of the VTXO tree to a PSBT input, as a BIP-68 relative-timelock script
/// number.
pub fn set_vtxo_tree_expiry(input: &mut psbt::Input, expiry: Sequence) {
    input.unknown.insert(
        proprietary_key(VTXO_TREE_EXPIRY_PSBT_KEY.to_vec()),
        write_script_int(expiry.to_consensus_u32() as i64),
    );
}

pub fn get_vtxo_tree_expiry(input: &psbt::Input) -> Result<Option<Sequence>, Error> {
    match input
        .unknown
        .get(&proprietary_key(VTXO_TREE_EXPIRY_PSBT_KEY.to_vec()))
    {
        Some(bytes) => {
            let value = read_script_int(bytes)?;
            let value = u32::try_from(value)
                .map_err(Error::ad_hoc)
                .context("expiry out of range")?;

            Ok(Some(Sequence::from_consensus(value)))
        }
        None => Ok(None),
    }
}

/// Minimal script-number encoding (little-endian, sign bit in the top bit of the last byte).
fn write_script_int(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }

    let mut bytes = Vec::new();
    let mut abs = value.unsigned_abs();

    while abs > 0 {
        bytes.push((abs & 0xFF) as u8);
        abs >>= 8;
    }

    if bytes.last().expect("non-empty") & 0x80 != 0 {
        bytes.push(if value < 0 { 0x80 } else { 0x00 });
    } else if value < 0 {
        let last = bytes.last_mut().expect("non-empty");
        *last |= 0x80;
    }

    bytes
}

fn read_script_int(bytes: &[u8]) -> Result<i64, Error> {
    if bytes.is_empty() {
        return Ok(0);
    }

    if bytes.len() > 8 {
        return Err(Error::ad_hoc("script number too large"));
    }

    let mut value: i64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i == bytes.len() - 1 {
            value |= ((byte & 0x7F) as i64) << (8 * i);
            if byte & 0x80 != 0 {
                value = -value;
            }
        } else {
            value |= (*byte as i64) << (8 * i);
        }
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::opcodes::OP_FALSE;
    use bitcoin::opcodes::OP_TRUE;
    use std::str::FromStr;

    fn empty_input() -> psbt::Input {
        psbt::Input::default()
    }

    #[test]
    fn tapscripts_roundtrip() {
        let scripts = vec![
            ScriptBuf::builder().push_opcode(OP_TRUE).into_script(),
            ScriptBuf::builder().push_opcode(OP_FALSE).into_script(),
        ];

        let mut input = empty_input();
        set_vtxo_taproot_tree(&mut input, &scripts);

        let decoded = get_vtxo_taproot_tree(&input).unwrap().unwrap();
        assert_eq!(decoded, scripts);
    }

    #[test]
    fn cosigner_pks_roundtrip() {
        let pks = vec![
            PublicKey::from_str(
                "02eec7245d6b7d2ccb30380bfbe2a3648cd7a942653f5aa340edcea1f283686619",
            )
            .unwrap(),
            PublicKey::from_str(
                "0324653eac434488002cc06bbfb7f10fe18991e35f9fe4302dbea6d2353dc0ab1c",
            )
            .unwrap(),
        ];

        let mut input = empty_input();
        set_cosigner_pks(&mut input, &pks);

        let mut extracted = extract_cosigner_pks(&input).unwrap();
        extracted.sort_by_key(|pk| pk.serialize());

        let mut expected = pks;
        expected.sort_by_key(|pk| pk.serialize());

        assert_eq!(extracted, expected);
    }

    #[test]
    fn condition_witness_roundtrip() {
        let witness = vec![vec![0x01, 0x02], vec![], vec![0xAB; 80]];

        let mut input = empty_input();
        set_condition_witness(&mut input, &witness);

        let decoded = get_condition_witness(&input).unwrap().unwrap();
        assert_eq!(decoded, witness);
    }

    #[test]
    fn tree_expiry_roundtrip() {
        for value in [1u32, 144, 512, 4194304] {
            let expiry = Sequence::from_consensus(value);

            let mut input = empty_input();
            set_vtxo_tree_expiry(&mut input, expiry);

            let decoded = get_vtxo_tree_expiry(&input).unwrap().unwrap();
            assert_eq!(decoded, expiry);
        }
    }

    #[test]
    fn script_int_minimal_encoding() {
        assert_eq!(write_script_int(0), Vec::<u8>::new());
        assert_eq!(write_script_int(1), vec![0x01]);
        assert_eq!(write_script_int(127), vec![0x7F]);
        // 128 needs a padding byte to keep the sign bit clear.
        assert_eq!(write_script_int(128), vec![0x80, 0x00]);
        assert_eq!(write_script_int(144), vec![0x90, 0x00]);

        for value in [0i64, 1, 127, 128, 144, 512, 65536, (1 << 31) - 1] {
            assert_eq!(read_script_int(&write_script_int(value)).unwrap(), value);
        }
    }

    #[test]
    fn missing_fields_are_none() {
        let input = empty_input();

        assert!(get_vtxo_taproot_tree(&input).unwrap().is_none());
        assert!(get_condition_witness(&input).unwrap().is_none());
        assert!(get_vtxo_tree_expiry(&input).unwrap().is_none());
        assert!(extract_cosigner_pks(&input).unwrap().is_empty());
    }
}
