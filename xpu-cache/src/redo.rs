//! Bounded redo buffer handed to the device in one piece.
//!
//! Records are packed back to back in a byte area of fixed length; an index of record
//! offsets (`redo_items`) bounds how many fit. The buffer carries its own
//! [`ErrorRecord`], so the threads that decode and validate records in parallel can report
//! the first bad one without stopping each other.

use rayon::prelude::*;
use xpu_result::{DeviceError, Error, ErrorRecord, Result};
use xpu_types::{ColumnDef, Datum};
use xpu_types::codec::{WireReader, WireWriter};

use crate::ident::CacheIdent;
use crate::record::LogRecord;

#[derive(Debug)]
pub struct RedoLogBuffer {
    ident: CacheIdent,
    nrooms: u32,
    length: usize,
    items: Vec<u32>,
    data: WireWriter,
    error: ErrorRecord,
}

impl RedoLogBuffer {
    /// Room for at most `nrooms` records in `length` bytes.
    pub fn new(ident: CacheIdent, nrooms: u32, length: usize) -> Self {
        Self {
            ident,
            nrooms,
            length,
            items: Vec::with_capacity(nrooms as usize),
            data: WireWriter::with_capacity(length),
            error: ErrorRecord::new(),
        }
    }

    pub fn ident(&self) -> CacheIdent {
        self.ident
    }

    pub fn nitems(&self) -> u32 {
        self.items.len() as u32
    }

    pub fn nrooms(&self) -> u32 {
        self.nrooms
    }

    /// Bytes of the record area in use.
    pub fn usage(&self) -> usize {
        self.data.len()
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn error_record(&self) -> &ErrorRecord {
        &self.error
    }

    /// Append a record. Fails with [`Error::DataStoreNoSpace`] once either the rooms or
    /// the bytes run out; the buffer is left unchanged in that case.
    pub fn push(&mut self, record: &LogRecord) -> Result<()> {
        if self.items.len() as u32 >= self.nrooms {
            return Err(Error::DataStoreNoSpace(format!(
                "redo buffer holds {} records",
                self.nrooms
            )));
        }
        let bytes = record.to_bytes()?;
        if self.data.len() + bytes.len() > self.length {
            return Err(Error::DataStoreNoSpace(format!(
                "{} record of {} bytes does not fit, {} of {} bytes used",
                record.log_type().name(),
                bytes.len(),
                self.data.len(),
                self.length
            )));
        }
        self.items.push(self.data.len() as u32);
        self.data.put_bytes(&bytes);
        Ok(())
    }

    /// Push records until the buffer fills. Returns how many were taken.
    pub fn fill<'a>(&mut self, records: impl IntoIterator<Item = &'a LogRecord>) -> Result<usize> {
        let mut n = 0;
        for rec in records {
            match self.push(rec) {
                Ok(()) => n += 1,
                Err(Error::DataStoreNoSpace(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(n)
    }

    /// Empty the buffer and its error record for reuse.
    pub fn clear(&mut self) {
        self.items.clear();
        self.data = WireWriter::with_capacity(self.length);
        self.error.reset();
    }

    /// Decode every record in parallel, checking inserted tuples against `columns`.
    ///
    /// Each record is decoded independently from its offset. The first failure claims
    /// the buffer's error record and is returned; records are otherwise returned in
    /// buffer order.
    pub fn decode(&self, columns: &[ColumnDef]) -> Result<Vec<LogRecord>> {
        let bytes = self.data.as_slice();
        let decoded: Vec<Option<LogRecord>> = self
            .items
            .par_iter()
            .enumerate()
            .map(|(i, &offset)| {
                if self.error.has_error() {
                    return None;
                }
                let mut r = WireReader::new(&bytes[offset as usize..], "redo buffer");
                let checked = LogRecord::decode(&mut r)
                    .and_then(|rec| check_record(&rec, columns).map(|()| rec));
                match checked {
                    Ok(rec) => Some(rec),
                    Err(e) => {
                        self.error.report(&DeviceError::fatal(
                            "redo",
                            format!("redo item {i} at offset {offset}: {e}"),
                        ));
                        None
                    }
                }
            })
            .collect();
        if let Some(err) = self.error.to_error() {
            return Err(err);
        }
        decoded
            .into_iter()
            .map(|rec| rec.ok_or_else(|| Error::Internal("redo item skipped without error".into())))
            .collect()
    }
}

/// Inserted tuples must match the cached table's shape.
pub(crate) fn check_record(record: &LogRecord, columns: &[ColumnDef]) -> Result<()> {
    match record {
        LogRecord::Insert { rowid, values } => check_tuple(*rowid, values, columns),
        _ => Ok(()),
    }
}

pub(crate) fn check_tuple(rowid: u32, values: &[Datum], columns: &[ColumnDef]) -> Result<()> {
    if values.len() != columns.len() {
        return Err(Error::corrupt(
            "cache log",
            format!(
                "INSERT of row {rowid} carries {} values for {} columns",
                values.len(),
                columns.len()
            ),
        ));
    }
    for (v, c) in values.iter().zip(columns) {
        if v.is_null() && !c.nullable {
            return Err(Error::corrupt(
                "cache log",
                format!("INSERT of row {rowid} has NULL in not-null column {}", c.name),
            ));
        }
        v.check_type(c.type_op)
            .map_err(|e| Error::corrupt("cache log", format!("INSERT of row {rowid}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpu_result::ErrorCode;
    use xpu_types::TypeOpcode;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("k", TypeOpcode::Int8).not_null(),
            ColumnDef::new("v", TypeOpcode::Text),
        ]
    }

    fn insert(rowid: u32, k: i64) -> LogRecord {
        LogRecord::Insert {
            rowid,
            values: vec![Datum::Int8(k), Datum::Text(format!("v{k}"))],
        }
    }

    #[test]
    fn fills_until_rooms_run_out() {
        let mut buf = RedoLogBuffer::new(CacheIdent::new(1, 2, 3), 4, 1 << 12);
        let records: Vec<_> = (0..10).map(|i| insert(i, i as i64)).collect();
        assert_eq!(buf.fill(&records).unwrap(), 4);
        assert_eq!(buf.nitems(), 4);
        assert!(matches!(
            buf.push(&records[4]),
            Err(Error::DataStoreNoSpace(_))
        ));
        assert_eq!(buf.decode(&columns()).unwrap(), records[..4].to_vec());

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.usage(), 0);
    }

    #[test]
    fn fills_until_bytes_run_out() {
        let one = insert(0, 0).to_bytes().unwrap().len();
        let mut buf = RedoLogBuffer::new(CacheIdent::new(1, 2, 3), 100, one * 3 + one / 2);
        let records: Vec<_> = (0..10).map(|i| insert(i, 0)).collect();
        assert_eq!(buf.fill(&records).unwrap(), 3);
        assert!(buf.usage() <= buf.length());
    }

    #[test]
    fn bad_tuple_claims_the_error_record() {
        let mut buf = RedoLogBuffer::new(CacheIdent::new(1, 2, 3), 64, 1 << 14);
        for i in 0..40 {
            buf.push(&insert(i, i as i64)).unwrap();
        }
        buf.push(&LogRecord::Insert {
            rowid: 99,
            values: vec![Datum::Int4(1), Datum::Null],
        })
        .unwrap();
        buf.push(&LogRecord::Insert {
            rowid: 100,
            values: vec![Datum::Null, Datum::Null],
        })
        .unwrap();

        let err = buf.decode(&columns()).unwrap_err();
        assert!(matches!(err, Error::SystemFatal { .. }), "{err}");
        assert_eq!(buf.error_record().code(), ErrorCode::SystemFatal);
        let message = &buf.error_record().details().unwrap().message;
        assert!(message.contains("row 99") || message.contains("row 100"), "{message}");

        buf.clear();
        assert!(!buf.error_record().has_error());
    }
}
