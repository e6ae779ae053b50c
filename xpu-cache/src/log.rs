//! Append-only transaction log stream.
//!
//! ```text
//! offset  size  field
//! 0       4     magic "XTXL"
//! 4       4     version
//! 8       4     database_oid
//! 12      4     table_oid
//! 16      8     signature
//! 24      ...   records, see [`crate::record`]
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use xpu_result::{Error, Result};
use xpu_types::codec::{WireReader, WireWriter};

use crate::ident::CacheIdent;
use crate::record::{LogRecord, RECORD_PREFIX_SZ};

pub const TX_LOG_FILE_MAGIC: u32 = u32::from_le_bytes(*b"XTXL");
pub const TX_LOG_VERSION: u32 = 1;
pub const TX_LOG_HEADER_SZ: usize = 24;

/// Upper bound on a single record, so a corrupt length cannot trigger a huge allocation.
const MAX_RECORD_SZ: usize = 64 << 20;

pub struct TxLogWriter<W: Write> {
    inner: W,
    ident: CacheIdent,
    nrecords: u64,
    nbytes: u64,
}

impl<W: Write> TxLogWriter<W> {
    /// Start a new log on `inner`, writing the header immediately.
    pub fn new(mut inner: W, ident: CacheIdent) -> Result<Self> {
        let mut w = WireWriter::with_capacity(TX_LOG_HEADER_SZ);
        w.put_u32(TX_LOG_FILE_MAGIC);
        w.put_u32(TX_LOG_VERSION);
        ident.encode_into(&mut w);
        inner.write_all(&w.into_inner())?;
        Ok(Self {
            inner,
            ident,
            nrecords: 0,
            nbytes: TX_LOG_HEADER_SZ as u64,
        })
    }

    pub fn ident(&self) -> CacheIdent {
        self.ident
    }

    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        let bytes = record.to_bytes()?;
        self.inner.write_all(&bytes)?;
        self.nrecords += 1;
        self.nbytes += bytes.len() as u64;
        Ok(())
    }

    pub fn append_all<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a LogRecord>,
    ) -> Result<()> {
        for rec in records {
            self.append(rec)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Records written by this writer.
    pub fn nrecords(&self) -> u64 {
        self.nrecords
    }

    /// Bytes written including the header.
    pub fn nbytes(&self) -> u64 {
        self.nbytes
    }

    pub fn into_inner(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl TxLogWriter<BufWriter<File>> {
    /// Create (or truncate) a log file for `ident`.
    pub fn create(path: impl AsRef<Path>, ident: CacheIdent) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        tracing::debug!(
            "[CACHE] new transaction log {} for {ident}",
            path.as_ref().display()
        );
        Self::new(BufWriter::new(file), ident)
    }
}

pub struct TxLogReader<R: Read> {
    inner: R,
    ident: CacheIdent,
    offset: u64,
}

impl<R: Read> TxLogReader<R> {
    /// Read and validate the header.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut head = [0u8; TX_LOG_HEADER_SZ];
        inner.read_exact(&mut head).map_err(|e| truncated(e, 0))?;
        let mut r = WireReader::new(&head, "cache log");
        if r.get_u32()? != TX_LOG_FILE_MAGIC {
            return Err(r.corrupt("bad magic"));
        }
        let version = r.get_u32()?;
        if version != TX_LOG_VERSION {
            return Err(r.corrupt(format!("unsupported version {version}")));
        }
        let ident = CacheIdent::decode(&mut r)?;
        Ok(Self {
            inner,
            ident,
            offset: TX_LOG_HEADER_SZ as u64,
        })
    }

    pub fn ident(&self) -> CacheIdent {
        self.ident
    }

    /// Next record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        let mut prefix = [0u8; RECORD_PREFIX_SZ];
        let mut filled = 0;
        while filled < prefix.len() {
            match self.inner.read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::corrupt(
                        "cache log",
                        format!("torn record prefix at offset {}", self.offset),
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        let length = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
        if !(RECORD_PREFIX_SZ..=MAX_RECORD_SZ).contains(&length) {
            return Err(Error::corrupt(
                "cache log",
                format!("record length {length} at offset {}", self.offset),
            ));
        }
        let mut buf = vec![0u8; length];
        buf[..RECORD_PREFIX_SZ].copy_from_slice(&prefix);
        self.inner
            .read_exact(&mut buf[RECORD_PREFIX_SZ..])
            .map_err(|e| truncated(e, self.offset))?;
        let mut r = WireReader::new(&buf, "cache log");
        let record = LogRecord::decode(&mut r)?;
        self.offset += length as u64;
        Ok(Some(record))
    }

    pub fn read_all(&mut self) -> Result<Vec<LogRecord>> {
        let mut out = Vec::new();
        while let Some(rec) = self.next_record()? {
            out.push(rec);
        }
        Ok(out)
    }
}

impl TxLogReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> Iterator for TxLogReader<R> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

fn truncated(err: io::Error, offset: u64) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::corrupt("cache log", format!("truncated at offset {offset}"))
    } else {
        Error::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Ctid;
    use xpu_types::Datum;

    fn ident() -> CacheIdent {
        CacheIdent::new(5, 16_384, 0xDEAD_BEEF)
    }

    fn sample() -> Vec<LogRecord> {
        vec![
            LogRecord::Insert {
                rowid: 0,
                values: vec![Datum::Int8(10), Datum::Text("ten".into())],
            },
            LogRecord::CommitIns { rowid: 0 },
            LogRecord::Delete {
                xid: 700,
                rowid: 0,
                ctid: Ctid::new(0, 1),
            },
            LogRecord::AbortDel { rowid: 0 },
        ]
    }

    #[test]
    fn in_memory_stream() {
        let mut w = TxLogWriter::new(Vec::new(), ident()).unwrap();
        w.append_all(&sample()).unwrap();
        assert_eq!(w.nrecords(), 4);
        let nbytes = w.nbytes();
        let bytes = w.into_inner().unwrap();
        assert_eq!(bytes.len() as u64, nbytes);
        assert_eq!(bytes.len() % 8, 0);

        let mut r = TxLogReader::new(bytes.as_slice()).unwrap();
        assert_eq!(r.ident(), ident());
        assert_eq!(r.read_all().unwrap(), sample());
    }

    #[test]
    fn torn_tail_is_corrupt() {
        let mut w = TxLogWriter::new(Vec::new(), ident()).unwrap();
        w.append_all(&sample()).unwrap();
        let bytes = w.into_inner().unwrap();
        for cut in [bytes.len() - 3, bytes.len() - 12] {
            let r = TxLogReader::new(&bytes[..cut]).unwrap();
            let results: Vec<_> = r.collect();
            assert!(results.last().unwrap().is_err(), "cut at {cut}");
            assert!(results[..results.len() - 1].iter().all(|r| r.is_ok()));
        }
    }

    #[test]
    fn bad_header() {
        assert!(TxLogReader::new(&b"XTXL"[..]).is_err());
        let mut bytes = TxLogWriter::new(Vec::new(), ident())
            .unwrap()
            .into_inner()
            .unwrap();
        bytes[4] = 9;
        assert!(matches!(
            TxLogReader::new(bytes.as_slice()),
            Err(Error::Corrupt { .. })
        ));
    }
}
