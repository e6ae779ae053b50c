//! Transaction log records.
//!
//! Every record is `[type u32][length u32][payload]`, where `length` covers the whole
//! record including the 8-byte prefix and the record is zero-padded to a multiple of 8.
//! The type word is [`TX_LOG_MAGIC`] or'ed with a one-byte tag, so a reader that lands on
//! garbage notices it at once.
//!
//! ```text
//! INSERT      rowid u32, pad u32, natts u16, datum * natts
//! DELETE      xid u32, rowid u32, ctid.block u32, ctid.offset u16, pad u16
//! COMMIT/ABORT rowid u32, pad u32
//! ```

use num_enum::{IntoPrimitive, TryFromPrimitive};
use xpu_result::Result;
use xpu_types::Datum;
use xpu_types::codec::{WireReader, WireWriter};

pub const TX_LOG_MAGIC: u32 = 0xEBAD_7C00;

/// Bytes of the `[type][length]` prefix.
pub const RECORD_PREFIX_SZ: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum LogType {
    /// `'I'`
    Insert = 0xEBAD_7C49,
    /// `'D'`
    Delete = 0xEBAD_7C44,
    /// `'C'`
    CommitIns = 0xEBAD_7C43,
    /// `'c'`
    CommitDel = 0xEBAD_7C63,
    /// `'A'`
    AbortIns = 0xEBAD_7C41,
    /// `'a'`
    AbortDel = 0xEBAD_7C61,
}

impl LogType {
    pub fn name(self) -> &'static str {
        match self {
            LogType::Insert => "INSERT",
            LogType::Delete => "DELETE",
            LogType::CommitIns => "COMMIT_INS",
            LogType::CommitDel => "COMMIT_DEL",
            LogType::AbortIns => "ABORT_INS",
            LogType::AbortDel => "ABORT_DEL",
        }
    }
}

/// Physical location of the deleted tuple in the base table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ctid {
    pub block: u32,
    pub offset: u16,
}

impl Ctid {
    pub fn new(block: u32, offset: u16) -> Self {
        Self { block, offset }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Insert { rowid: u32, values: Vec<Datum> },
    Delete { xid: u32, rowid: u32, ctid: Ctid },
    CommitIns { rowid: u32 },
    CommitDel { rowid: u32 },
    AbortIns { rowid: u32 },
    AbortDel { rowid: u32 },
}

impl LogRecord {
    pub fn log_type(&self) -> LogType {
        match self {
            LogRecord::Insert { .. } => LogType::Insert,
            LogRecord::Delete { .. } => LogType::Delete,
            LogRecord::CommitIns { .. } => LogType::CommitIns,
            LogRecord::CommitDel { .. } => LogType::CommitDel,
            LogRecord::AbortIns { .. } => LogType::AbortIns,
            LogRecord::AbortDel { .. } => LogType::AbortDel,
        }
    }

    pub fn rowid(&self) -> u32 {
        match *self {
            LogRecord::Insert { rowid, .. }
            | LogRecord::Delete { rowid, .. }
            | LogRecord::CommitIns { rowid }
            | LogRecord::CommitDel { rowid }
            | LogRecord::AbortIns { rowid }
            | LogRecord::AbortDel { rowid } => rowid,
        }
    }

    /// Append the record, padded to 8 bytes. Returns its length.
    pub fn encode_into(&self, w: &mut WireWriter) -> Result<usize> {
        let start = w.len();
        w.put_u32(u32::from(self.log_type()));
        w.put_u32(0);
        match self {
            LogRecord::Insert { rowid, values } => {
                w.put_u32(*rowid);
                w.put_u32(0);
                w.put_u16(values.len() as u16);
                for v in values {
                    w.put_datum(v)?;
                }
            }
            LogRecord::Delete { xid, rowid, ctid } => {
                w.put_u32(*xid);
                w.put_u32(*rowid);
                w.put_u32(ctid.block);
                w.put_u16(ctid.offset);
                w.put_u16(0);
            }
            LogRecord::CommitIns { rowid }
            | LogRecord::CommitDel { rowid }
            | LogRecord::AbortIns { rowid }
            | LogRecord::AbortDel { rowid } => {
                w.put_u32(*rowid);
                w.put_u32(0);
            }
        }
        w.pad_to(8);
        let len = w.len() - start;
        w.patch_u32(start + 4, len as u32);
        Ok(len)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::with_capacity(32);
        self.encode_into(&mut w)?;
        Ok(w.into_inner())
    }

    /// Decode one record starting at the reader's position, which must be 8-byte aligned.
    pub fn decode(r: &mut WireReader<'_>) -> Result<LogRecord> {
        let start = r.position();
        let raw = r.get_u32()?;
        let log_type =
            LogType::try_from(raw).map_err(|_| r.corrupt(format!("bad record type {raw:#010x}")))?;
        let length = r.get_u32()? as usize;
        if length < RECORD_PREFIX_SZ + 8 || length % 8 != 0 {
            return Err(r.corrupt(format!("{} record of {length} bytes", log_type.name())));
        }
        if r.remaining() < length - RECORD_PREFIX_SZ {
            return Err(r.corrupt(format!(
                "{} record of {length} bytes is truncated",
                log_type.name()
            )));
        }
        let record = match log_type {
            LogType::Insert => {
                let rowid = r.get_u32()?;
                let _pad = r.get_u32()?;
                let natts = r.get_u16()? as usize;
                let mut values = Vec::with_capacity(natts);
                for _ in 0..natts {
                    values.push(r.get_datum()?);
                }
                LogRecord::Insert { rowid, values }
            }
            LogType::Delete => {
                let xid = r.get_u32()?;
                let rowid = r.get_u32()?;
                let block = r.get_u32()?;
                let offset = r.get_u16()?;
                let _pad = r.get_u16()?;
                LogRecord::Delete {
                    xid,
                    rowid,
                    ctid: Ctid { block, offset },
                }
            }
            xact => {
                let rowid = r.get_u32()?;
                let _pad = r.get_u32()?;
                match xact {
                    LogType::CommitIns => LogRecord::CommitIns { rowid },
                    LogType::CommitDel => LogRecord::CommitDel { rowid },
                    LogType::AbortIns => LogRecord::AbortIns { rowid },
                    _ => LogRecord::AbortDel { rowid },
                }
            }
        };
        let consumed = r.position() - start;
        if consumed > length {
            return Err(r.corrupt(format!(
                "{} payload overruns its {length}-byte record",
                log_type.name()
            )));
        }
        r.take(length - consumed)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpu_result::Error;

    #[test]
    fn type_words_carry_the_magic() {
        assert_eq!(u32::from(LogType::Insert), 0xEBAD_7C49);
        assert_eq!(u32::from(LogType::AbortDel), 0xEBAD_7C61);
        assert!(LogType::try_from(TX_LOG_MAGIC).is_err());
        for ty in [LogType::Insert, LogType::CommitDel] {
            assert_eq!(u32::from(ty) & !0xff, TX_LOG_MAGIC);
        }
    }

    #[test]
    fn records_are_padded_and_self_sized() {
        let records = [
            LogRecord::Insert {
                rowid: 7,
                values: vec![Datum::Int8(1), Datum::Null, Datum::Text("abc".into())],
            },
            LogRecord::Delete {
                xid: 99,
                rowid: 7,
                ctid: Ctid::new(3, 12),
            },
            LogRecord::CommitDel { rowid: 7 },
        ];
        let mut w = WireWriter::new();
        for rec in &records {
            let len = rec.encode_into(&mut w).unwrap();
            assert_eq!(len % 8, 0);
        }
        let bytes = w.into_inner();
        assert_eq!(
            u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize,
            records[0].to_bytes().unwrap().len()
        );
        let mut r = WireReader::new(&bytes, "cache log");
        for rec in &records {
            assert_eq!(&LogRecord::decode(&mut r).unwrap(), rec);
        }
        assert!(r.is_empty());
    }

    #[test]
    fn unknown_type_is_corrupt() {
        let mut bytes = LogRecord::CommitIns { rowid: 1 }.to_bytes().unwrap();
        bytes[0] = b'Z';
        let mut r = WireReader::new(&bytes, "cache log");
        assert!(matches!(
            LogRecord::decode(&mut r),
            Err(Error::Corrupt {
                what: "cache log",
                ..
            })
        ));
    }

    #[test]
    fn short_length_is_corrupt() {
        let mut bytes = LogRecord::AbortIns { rowid: 1 }.to_bytes().unwrap();
        bytes[4] = 40;
        let mut r = WireReader::new(&bytes, "cache log");
        assert!(LogRecord::decode(&mut r).is_err());
    }
}
