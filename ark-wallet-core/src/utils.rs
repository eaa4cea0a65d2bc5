use crate::Error;
use crate::ErrorContext;
use std::io;
use std::io::Read;
use std::io::Write;

pub fn parse_sequence_number(value: i64) -> Result<bitcoin::Sequence, Error> {
    /// The threshold that determines whether an expiry or exit delay should be parsed as a
    /// number of blocks or a number of seconds.
    ///
    /// - A value below 512 is considered a number of blocks.
    /// - A value over 512 is considered a number of seconds.
    const ARBITRARY_SEQUENCE_THRESHOLD: i64 = 512;

    let sequence = if value.is_negative() {
        return Err(Error::ad_hoc(format!("invalid sequence number: {value}")));
    } else if value < ARBITRARY_SEQUENCE_THRESHOLD {
        bitcoin::Sequence::from_height(value as u16)
    } else {
        bitcoin::Sequence::from_seconds_ceil(value as u32)
            .map_err(Error::ad_hoc)
            .with_context(|| format!("invalid sequence number in seconds: {value}"))?
    };

    Ok(sequence)
}

/// Write a compact size uint (Bitcoin's variable-length integer encoding).
pub(crate) fn write_compact_size_uint<W: Write>(w: &mut W, val: u64) -> io::Result<()> {
    if val < 253 {
        w.write_all(&[val as u8])?;
    } else if val < 0x10000 {
        w.write_all(&[253])?;
        w.write_all(&(val as u16).to_le_bytes())?;
    } else if val < 0x100000000 {
        w.write_all(&[254])?;
        w.write_all(&(val as u32).to_le_bytes())?;
    } else {
        w.write_all(&[255])?;
        w.write_all(&val.to_le_bytes())?;
    }
    Ok(())
}

/// Read a compact size uint from a reader.
pub(crate) fn read_compact_size_uint<R: Read>(r: &mut R) -> io::Result<u64> {
    let mut first = [0u8; 1];
    r.read_exact(&mut first)?;
    match first[0] {
        253 => {
            let mut buf = [0u8; 2];
            r.read_exact(&mut buf)?;
            Ok(u16::from_le_bytes(buf) as u64)
        }
        254 => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)?;
            Ok(u32::from_le_bytes(buf) as u64)
        }
        255 => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf)?;
            Ok(u64::from_le_bytes(buf))
        }
        v => Ok(v as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn compact_size_roundtrip() {
        for val in [0u64, 1, 252, 253, 0xFFFF, 0x10000, 0xFFFF_FFFF, u64::MAX] {
            let mut bytes = Vec::new();
            write_compact_size_uint(&mut bytes, val).unwrap();
            let parsed = read_compact_size_uint(&mut Cursor::new(&bytes)).unwrap();
            assert_eq!(parsed, val);
        }
    }

    #[test]
    fn sequence_number_below_threshold_is_blocks() {
        let sequence = parse_sequence_number(144).unwrap();
        assert_eq!(
            sequence.to_relative_lock_time(),
            Some(bitcoin::relative::LockTime::from_height(144))
        );
    }

    #[test]
    fn sequence_number_above_threshold_is_seconds() {
        let sequence = parse_sequence_number(1024).unwrap();
        assert_eq!(
            sequence.to_relative_lock_time(),
            Some(bitcoin::relative::LockTime::from_512_second_intervals(2))
        );
    }
}
