use std::fmt;

use xpu_types::codec::{WireReader, WireWriter};
use xpu_result::Result;

/// Identity of a cached table: the owning database, the table, and a signature derived
/// from the table definition. A log is only meaningful for the cache with the same
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheIdent {
    pub database_oid: u32,
    pub table_oid: u32,
    pub signature: u64,
}

impl CacheIdent {
    pub fn new(database_oid: u32, table_oid: u32, signature: u64) -> Self {
        Self {
            database_oid,
            table_oid,
            signature,
        }
    }

    /// Same database and table, regardless of signature.
    pub fn same_table(&self, other: &CacheIdent) -> bool {
        self.database_oid == other.database_oid && self.table_oid == other.table_oid
    }

    pub(crate) fn encode_into(&self, w: &mut WireWriter) {
        w.put_u32(self.database_oid);
        w.put_u32(self.table_oid);
        w.put_u64(self.signature);
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<CacheIdent> {
        Ok(CacheIdent {
            database_oid: r.get_u32()?,
            table_oid: r.get_u32()?,
            signature: r.get_u64()?,
        })
    }
}

impl fmt::Display for CacheIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{:016x}",
            self.database_oid, self.table_oid, self.signature
        )
    }
}
