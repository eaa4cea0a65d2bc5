//! Asset packets: an `OP_RETURN`-embedded TLV that assigns fungible-token amounts to the
//! outputs of a transaction.
//!
//! Framing: `"ARK" || 0x00 || varuint(group_count) || group*`. Each group carries an optional
//! asset id, an optional control asset, optional metadata and its input/output assignments.

use crate::utils::read_compact_size_uint;
use crate::utils::write_compact_size_uint;
use bitcoin::hashes::Hash;
use bitcoin::script::Instruction;
use bitcoin::ScriptBuf;
use bitcoin::Transaction;
use bitcoin::TxOut;
use bitcoin::Txid;
use std::collections::HashSet;
use std::io::Cursor;
use std::io::Read;
use thiserror::Error;

/// The magic prefix identifying a packet.
pub const ASSET_PACKET_MAGIC: [u8; 3] = *b"ARK";

/// The marker byte distinguishing asset packets from other records behind the same magic.
pub const ASSET_PACKET_MARKER: u8 = 0x00;

const MASK_ASSET_ID: u8 = 0x01;
const MASK_CONTROL_ASSET: u8 = 0x02;
const MASK_METADATA: u8 = 0x04;

const INPUT_TYPE_LOCAL: u8 = 1;
const INPUT_TYPE_INTENT: u8 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssetDecodeError {
    #[error("invalid magic")]
    InvalidMagic,
    #[error("invalid marker: {0:#04x}")]
    InvalidMarker(u8),
    #[error("truncated packet")]
    Truncated,
    #[error("unknown record type: {0:#04x}")]
    UnknownType(u8),
    #[error("trailing bytes after packet")]
    TrailingBytes,
    #[error("no asset packet marker found")]
    MarkerNotFound,
    #[error("invalid group: {0}")]
    InvalidGroup(String),
}

/// Identifier of an asset: the issuance outpoint `(txid, index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetId {
    pub txid: Txid,
    pub index: u16,
}

impl AssetId {
    fn encode(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.txid.to_byte_array());
        bytes.extend_from_slice(&self.index.to_le_bytes());
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self, AssetDecodeError> {
        let mut txid = [0u8; 32];
        r.read_exact(&mut txid)
            .map_err(|_| AssetDecodeError::Truncated)?;

        let mut index = [0u8; 2];
        r.read_exact(&mut index)
            .map_err(|_| AssetDecodeError::Truncated)?;

        Ok(Self {
            txid: Txid::from_byte_array(txid),
            index: u16::from_le_bytes(index),
        })
    }
}

/// An amount assigned to a transaction input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetInput {
    /// Refers to an input of the carrying transaction.
    Local { vin: u16, amount: u64 },
    /// Refers to an input of another (intent) transaction.
    Intent { txid: Txid, vin: u16, amount: u64 },
}

impl AssetInput {
    pub fn amount(&self) -> u64 {
        match self {
            AssetInput::Local { amount, .. } | AssetInput::Intent { amount, .. } => *amount,
        }
    }

    fn type_tag(&self) -> u8 {
        match self {
            AssetInput::Local { .. } => INPUT_TYPE_LOCAL,
            AssetInput::Intent { .. } => INPUT_TYPE_INTENT,
        }
    }
}

/// An amount assigned to an output of the carrying transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetOutput {
    pub vout: u16,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssetGroup {
    /// Absent for issuance groups: the issued asset is identified by the carrying transaction.
    pub asset_id: Option<AssetId>,
    pub control_asset: Option<AssetId>,
    pub metadata: Vec<(String, String)>,
    pub inputs: Vec<AssetInput>,
    pub outputs: Vec<AssetOutput>,
}

impl AssetGroup {
    /// A group with no asset id mints a new asset.
    pub fn is_issuance(&self) -> bool {
        self.asset_id.is_none()
    }

    /// A group whose outputs exceed its local inputs mints additional units of an existing
    /// asset.
    pub fn is_reissuance(&self) -> bool {
        if self.asset_id.is_none() {
            return false;
        }

        let local_input_sum: u64 = self
            .inputs
            .iter()
            .filter_map(|input| match input {
                AssetInput::Local { amount, .. } => Some(*amount),
                AssetInput::Intent { .. } => None,
            })
            .sum();

        self.output_sum() > local_input_sum
    }

    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount).sum()
    }

    fn validate(&self) -> Result<(), AssetDecodeError> {
        if self.asset_id.is_none() && !self.inputs.is_empty() {
            return Err(AssetDecodeError::InvalidGroup(
                "issuance group must not have inputs".to_string(),
            ));
        }

        if let Some(first) = self.inputs.first() {
            if self.inputs.iter().any(|i| i.type_tag() != first.type_tag()) {
                return Err(AssetDecodeError::InvalidGroup(
                    "all inputs in a group must share a type".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for output in &self.outputs {
            if !seen.insert(output.vout) {
                return Err(AssetDecodeError::InvalidGroup(format!(
                    "duplicate output index {}",
                    output.vout
                )));
            }
        }

        Ok(())
    }

    fn encode(&self, bytes: &mut Vec<u8>) {
        let mut presence = 0u8;
        if self.asset_id.is_some() {
            presence |= MASK_ASSET_ID;
        }
        if self.control_asset.is_some() {
            presence |= MASK_CONTROL_ASSET;
        }
        if !self.metadata.is_empty() {
            presence |= MASK_METADATA;
        }

        bytes.push(presence);

        if let Some(asset_id) = &self.asset_id {
            asset_id.encode(bytes);
        }

        if let Some(control_asset) = &self.control_asset {
            control_asset.encode(bytes);
        }

        if !self.metadata.is_empty() {
            write_compact_size_uint(bytes, self.metadata.len() as u64).expect("infallible");
            for (key, value) in &self.metadata {
                write_compact_size_uint(bytes, key.len() as u64).expect("infallible");
                bytes.extend_from_slice(key.as_bytes());
                write_compact_size_uint(bytes, value.len() as u64).expect("infallible");
                bytes.extend_from_slice(value.as_bytes());
            }
        }

        write_compact_size_uint(bytes, self.inputs.len() as u64).expect("infallible");
        for input in &self.inputs {
            bytes.push(input.type_tag());
            match input {
                AssetInput::Local { vin, amount } => {
                    bytes.extend_from_slice(&vin.to_le_bytes());
                    write_compact_size_uint(bytes, *amount).expect("infallible");
                }
                AssetInput::Intent { txid, vin, amount } => {
                    bytes.extend_from_slice(&txid.to_byte_array());
                    bytes.extend_from_slice(&vin.to_le_bytes());
                    write_compact_size_uint(bytes, *amount).expect("infallible");
                }
            }
        }

        write_compact_size_uint(bytes, self.outputs.len() as u64).expect("infallible");
        for output in &self.outputs {
            bytes.push(0x01);
            bytes.extend_from_slice(&output.vout.to_le_bytes());
            write_compact_size_uint(bytes, output.amount).expect("infallible");
        }
    }

    fn decode<R: Read>(r: &mut R) -> Result<Self, AssetDecodeError> {
        let presence = read_u8(r)?;

        if presence & !(MASK_ASSET_ID | MASK_CONTROL_ASSET | MASK_METADATA) != 0 {
            return Err(AssetDecodeError::UnknownType(presence));
        }

        let asset_id = if presence & MASK_ASSET_ID != 0 {
            Some(AssetId::decode(r)?)
        } else {
            None
        };

        let control_asset = if presence & MASK_CONTROL_ASSET != 0 {
            Some(AssetId::decode(r)?)
        } else {
            None
        };

        let metadata = if presence & MASK_METADATA != 0 {
            let count = read_varuint(r)?;
            let mut metadata = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let key = read_string(r)?;
                let value = read_string(r)?;
                metadata.push((key, value));
            }
            metadata
        } else {
            Vec::new()
        };

        let input_count = read_varuint(r)?;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let type_tag = read_u8(r)?;
            let input = match type_tag {
                INPUT_TYPE_LOCAL => AssetInput::Local {
                    vin: read_u16_le(r)?,
                    amount: read_varuint(r)?,
                },
                INPUT_TYPE_INTENT => {
                    let mut txid = [0u8; 32];
                    r.read_exact(&mut txid)
                        .map_err(|_| AssetDecodeError::Truncated)?;

                    AssetInput::Intent {
                        txid: Txid::from_byte_array(txid),
                        vin: read_u16_le(r)?,
                        amount: read_varuint(r)?,
                    }
                }
                other => return Err(AssetDecodeError::UnknownType(other)),
            };

            inputs.push(input);
        }

        let output_count = read_varuint(r)?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let type_tag = read_u8(r)?;
            if type_tag != 0x01 {
                return Err(AssetDecodeError::UnknownType(type_tag));
            }

            outputs.push(AssetOutput {
                vout: read_u16_le(r)?,
                amount: read_varuint(r)?,
            });
        }

        let group = Self {
            asset_id,
            control_asset,
            metadata,
            inputs,
            outputs,
        };

        group.validate()?;

        Ok(group)
    }
}

/// A list of asset groups, ready to be carried in an `OP_RETURN` output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssetPacket {
    pub groups: Vec<AssetGroup>,
}

impl AssetPacket {
    pub fn new(groups: Vec<AssetGroup>) -> Result<Self, AssetDecodeError> {
        for group in &groups {
            group.validate()?;
        }

        Ok(Self { groups })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        bytes.extend_from_slice(&ASSET_PACKET_MAGIC);
        bytes.push(ASSET_PACKET_MARKER);

        write_compact_size_uint(&mut bytes, self.groups.len() as u64).expect("infallible");

        for group in &self.groups {
            group.encode(&mut bytes);
        }

        bytes
    }

    /// Strict decoding: the whole buffer must be a single packet.
    pub fn decode(bytes: &[u8]) -> Result<Self, AssetDecodeError> {
        if bytes.len() < 3 || bytes[..3] != ASSET_PACKET_MAGIC {
            return Err(AssetDecodeError::InvalidMagic);
        }

        let marker = *bytes.get(3).ok_or(AssetDecodeError::Truncated)?;
        if marker != ASSET_PACKET_MARKER {
            return Err(AssetDecodeError::InvalidMarker(marker));
        }

        let (packet, consumed) = Self::decode_groups(&bytes[4..])?;

        if consumed != bytes.len() - 4 {
            return Err(AssetDecodeError::TrailingBytes);
        }

        Ok(packet)
    }

    /// Scanning decoder, tolerant of other records sharing the magic.
    ///
    /// `0x00` can legitimately appear inside a foreign record, so every `0x00` after the magic
    /// is treated as a marker candidate and trial-parsed until a parse consumes the rest of the
    /// buffer.
    pub fn scan(bytes: &[u8]) -> Result<Self, AssetDecodeError> {
        if bytes.len() < 3 || bytes[..3] != ASSET_PACKET_MAGIC {
            return Err(AssetDecodeError::InvalidMagic);
        }

        for candidate in 3..bytes.len() {
            if bytes[candidate] != ASSET_PACKET_MARKER {
                continue;
            }

            if let Ok((packet, consumed)) = Self::decode_groups(&bytes[candidate + 1..]) {
                if consumed == bytes.len() - candidate - 1 {
                    return Ok(packet);
                }
            }
        }

        Err(AssetDecodeError::MarkerNotFound)
    }

    /// Find and decode the asset packet carried by a transaction, if any.
    pub fn find_in_tx(tx: &Transaction) -> Option<Self> {
        tx.output.iter().find_map(Self::find_in_output)
    }

    pub fn find_in_output(output: &TxOut) -> Option<Self> {
        if !output.script_pubkey.is_op_return() {
            return None;
        }

        let payload = op_return_payload(&output.script_pubkey)?;

        Self::scan(&payload).ok()
    }

    fn decode_groups(bytes: &[u8]) -> Result<(Self, usize), AssetDecodeError> {
        let mut cursor = Cursor::new(bytes);

        let group_count = read_varuint(&mut cursor)?;

        let mut groups = Vec::with_capacity(group_count.min(1024) as usize);
        for _ in 0..group_count {
            groups.push(AssetGroup::decode(&mut cursor)?);
        }

        Ok((Self { groups }, cursor.position() as usize))
    }
}

fn op_return_payload(script: &ScriptBuf) -> Option<Vec<u8>> {
    let mut payload = Vec::new();

    for instruction in script.instructions().skip(1) {
        match instruction {
            Ok(Instruction::PushBytes(bytes)) => payload.extend_from_slice(bytes.as_bytes()),
            Ok(Instruction::Op(_)) | Err(_) => return None,
        }
    }

    (!payload.is_empty()).then_some(payload)
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, AssetDecodeError> {
    let mut byte = [0u8; 1];
    r.read_exact(&mut byte)
        .map_err(|_| AssetDecodeError::Truncated)?;
    Ok(byte[0])
}

fn read_u16_le<R: Read>(r: &mut R) -> Result<u16, AssetDecodeError> {
    let mut bytes = [0u8; 2];
    r.read_exact(&mut bytes)
        .map_err(|_| AssetDecodeError::Truncated)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_varuint<R: Read>(r: &mut R) -> Result<u64, AssetDecodeError> {
    read_compact_size_uint(r).map_err(|_| AssetDecodeError::Truncated)
}

fn read_string<R: Read>(r: &mut R) -> Result<String, AssetDecodeError> {
    let len = read_varuint(r)?;

    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)
        .map_err(|_| AssetDecodeError::Truncated)?;

    String::from_utf8(bytes).map_err(|_| AssetDecodeError::InvalidGroup("invalid UTF-8".to_string()))
}
