use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use xpu_result::{Error, Result};
use xpu_types::{ColumnDef, Datum, TypeOpcode, align_up, maxalign};

use crate::buffer::DeviceBuffer;
use crate::tuple;

/// Physical layout of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum KdsFormat {
    /// Row index plus heap-style tuples packed from the end of the body.
    Row = b'r',
    /// Per-column null-flag and value arrays plus an extra arena for varlena payloads.
    Column = b'c',
    /// ROW layout where each item carries `(hash, next)` and is linked into a hash slot.
    Hash = b'h',
    /// Fixed-size pages with line-pointer arrays.
    Block = b'b',
}

/// Size of a HASH item prefix: `[hash u32][next u32]`.
pub const HASH_ITEM_PREFIX: usize = 8;

/// Default BLOCK page size.
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;

/// Page header of a BLOCK chunk: `[nlp u32][reserved u32]`.
pub(crate) const PAGE_HEADER_SZ: usize = 8;

/// Where a tuple lives inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TupleLoc {
    /// Row number of a ROW, HASH or COLUMN chunk.
    Row(u32),
    /// Body offset of a tuple inside a BLOCK page.
    Offset(u32),
}

/// Per-column metadata, computed once from the target schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMeta {
    pub type_op: TypeOpcode,
    pub attlen: i16,
    pub attalign: u8,
    pub nullable: bool,
    /// COLUMN format: body offset of the value array.
    pub values_offset: u32,
    /// COLUMN format: body offset of the null-flag array.
    pub nulls_offset: u32,
}

/// Kernel data store: a batch of rows in one of the [`KdsFormat`] layouts.
///
/// `nitems` and the dynamic-area `usage` are packed into one atomic word so that a row slot
/// and its bytes are reserved as a unit. `nitems` never exceeds `nrooms`.
///
/// Population happens through [`Kds::appender`], which borrows the chunk exclusively; reads
/// need `&Kds`, so no reader can overlap a population phase.
#[derive(Debug)]
pub struct Kds {
    pub(crate) format: KdsFormat,
    pub(crate) table_oid: u32,
    pub(crate) nrooms: u32,
    pub(crate) block_size: u32,
    /// Body bytes that are laid out at construction (row index, column arrays, pages).
    pub(crate) fixed_area: u32,
    pub(crate) columns: Vec<ColumnDef>,
    pub(crate) meta: Vec<ColumnMeta>,
    pub(crate) state: AtomicU64,
    pub(crate) hash_slots: Box<[AtomicU32]>,
    pub(crate) body: DeviceBuffer,
}

#[inline]
pub(crate) fn pack_state(nitems: u32, usage: u32) -> u64 {
    (u64::from(usage) << 32) | u64::from(nitems)
}

#[inline]
pub(crate) fn unpack_state(state: u64) -> (u32, u32) {
    (state as u32, (state >> 32) as u32)
}

/// Column metadata and the size of the fixed area for a layout.
pub(crate) fn layout(
    format: KdsFormat,
    columns: &[ColumnDef],
    nrooms: u32,
    block_size: u32,
) -> Result<(Vec<ColumnMeta>, usize)> {
    if columns.is_empty() {
        return Err(Error::InvalidArgumentError(
            "a chunk needs at least one column".into(),
        ));
    }
    if columns.len() > u16::MAX as usize {
        return Err(Error::InvalidArgumentError(format!(
            "too many columns: {}",
            columns.len()
        )));
    }
    if let Some(c) = columns.iter().find(|c| c.name.len() > u8::MAX as usize) {
        return Err(Error::InvalidArgumentError(format!(
            "column name too long: {}",
            c.name
        )));
    }
    let nrooms = nrooms as usize;
    let mut meta = Vec::with_capacity(columns.len());
    let mut off = 0usize;
    let fixed_area = match format {
        KdsFormat::Row | KdsFormat::Hash => maxalign(nrooms * 4),
        KdsFormat::Block => {
            if (block_size as usize) < PAGE_HEADER_SZ + 64 || block_size % 8 != 0 {
                return Err(Error::InvalidArgumentError(format!(
                    "unusable block size {block_size}"
                )));
            }
            nrooms * block_size as usize
        }
        KdsFormat::Column => {
            for c in columns {
                let nulls_offset = off;
                off = maxalign(off + nrooms);
                let values_offset = off;
                off = maxalign(off + nrooms * c.type_op.width().unwrap_or(4));
                meta.push(column_meta(c, values_offset as u32, nulls_offset as u32));
            }
            off
        }
    };
    if format != KdsFormat::Column {
        meta.extend(columns.iter().map(|c| column_meta(c, 0, 0)));
    }
    Ok((meta, fixed_area))
}

fn column_meta(c: &ColumnDef, values_offset: u32, nulls_offset: u32) -> ColumnMeta {
    ColumnMeta {
        type_op: c.type_op,
        attlen: c.type_op.typlen(),
        attalign: c.type_op.align() as u8,
        nullable: c.nullable,
        values_offset,
        nulls_offset,
    }
}

impl Kds {
    fn create(
        format: KdsFormat,
        columns: Vec<ColumnDef>,
        nrooms: u32,
        length: usize,
        block_size: u32,
    ) -> Result<Kds> {
        let (meta, fixed_area) = layout(format, &columns, nrooms, block_size)?;
        let length = if format == KdsFormat::Block {
            fixed_area
        } else {
            maxalign(length)
        };
        if length < fixed_area || length > u32::MAX as usize {
            return Err(Error::InvalidArgumentError(format!(
                "chunk length {length} cannot hold {nrooms} rooms (needs at least {fixed_area} bytes)"
            )));
        }
        let nslots = if format == KdsFormat::Hash {
            nrooms.max(1) as usize
        } else {
            0
        };
        tracing::trace!(
            "[KDS] create format={:?} ncols={} nrooms={} length={}",
            format,
            columns.len(),
            nrooms,
            length
        );
        Ok(Kds {
            format,
            table_oid: 0,
            nrooms,
            block_size: if format == KdsFormat::Block { block_size } else { 0 },
            fixed_area: fixed_area as u32,
            columns,
            meta,
            state: AtomicU64::new(0),
            hash_slots: (0..nslots).map(|_| AtomicU32::new(0)).collect(),
            body: DeviceBuffer::zeroed(length),
        })
    }

    /// ROW chunk with `nrooms` row slots and a body of `length` bytes.
    pub fn new_row(columns: Vec<ColumnDef>, nrooms: u32, length: usize) -> Result<Kds> {
        Self::create(KdsFormat::Row, columns, nrooms, length, 0)
    }

    pub fn new_column(columns: Vec<ColumnDef>, nrooms: u32, length: usize) -> Result<Kds> {
        Self::create(KdsFormat::Column, columns, nrooms, length, 0)
    }

    /// HASH chunk with one hash slot per room.
    pub fn new_hash(columns: Vec<ColumnDef>, nrooms: u32, length: usize) -> Result<Kds> {
        Self::create(KdsFormat::Hash, columns, nrooms, length, 0)
    }

    /// BLOCK chunk of `nblocks` pages of `block_size` bytes, filled with [`Kds::push_block`].
    pub fn new_block(columns: Vec<ColumnDef>, nblocks: u32, block_size: u32) -> Result<Kds> {
        Self::create(KdsFormat::Block, columns, nblocks, 0, block_size)
    }

    /// Body length that comfortably holds `nrooms` rows whose variable-length payloads
    /// average `avg_varlena` bytes per varlena column.
    pub fn estimate_length(
        format: KdsFormat,
        columns: &[ColumnDef],
        nrooms: u32,
        avg_varlena: usize,
    ) -> usize {
        let nrooms = nrooms as usize;
        let natts = columns.len();
        let data: usize = columns
            .iter()
            .map(|c| match c.type_op.width() {
                Some(w) => align_up(w, c.type_op.align()) + w,
                None => 4 + 4 + avg_varlena,
            })
            .sum();
        let tuple = maxalign(tuple::TUPLE_HEADER_SZ + natts.div_ceil(8) + 8 + data);
        match format {
            KdsFormat::Row => maxalign(nrooms * 4) + nrooms * tuple,
            KdsFormat::Hash => maxalign(nrooms * 4) + nrooms * (HASH_ITEM_PREFIX + tuple),
            KdsFormat::Block => nrooms * DEFAULT_BLOCK_SIZE as usize,
            KdsFormat::Column => {
                let arrays: usize = columns
                    .iter()
                    .map(|c| maxalign(nrooms) + maxalign(nrooms * c.type_op.width().unwrap_or(4)))
                    .sum();
                let extra: usize = columns
                    .iter()
                    .filter(|c| c.type_op.is_varlena())
                    .map(|_| maxalign(4 + avg_varlena))
                    .sum();
                arrays + nrooms * extra
            }
        }
    }

    pub fn with_table_oid(mut self, table_oid: u32) -> Self {
        self.table_oid = table_oid;
        self
    }

    #[inline]
    pub fn format(&self) -> KdsFormat {
        self.format
    }

    #[inline]
    pub fn table_oid(&self) -> u32 {
        self.table_oid
    }

    #[inline]
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    #[inline]
    pub fn column_meta(&self) -> &[ColumnMeta] {
        &self.meta
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Populated items: rows, or pages for BLOCK chunks.
    #[inline]
    pub fn nitems(&self) -> u32 {
        unpack_state(self.state.load(Ordering::Acquire)).0
    }

    #[inline]
    pub fn nrooms(&self) -> u32 {
        self.nrooms
    }

    /// Bytes consumed in the dynamic area (tuples, or the COLUMN extra arena).
    #[inline]
    pub fn usage(&self) -> u32 {
        unpack_state(self.state.load(Ordering::Acquire)).1
    }

    /// Body length in bytes.
    #[inline]
    pub fn length(&self) -> usize {
        self.body.len()
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn hash_nslots(&self) -> u32 {
        self.hash_slots.len() as u32
    }

    #[inline]
    pub fn has_varlena(&self) -> bool {
        self.columns.iter().any(|c| c.type_op.is_varlena())
    }

    /// Bytes the dynamic area must provide for one row of `values`.
    pub fn row_footprint(&self, values: &[Datum]) -> Result<u32> {
        let bytes = match self.format {
            KdsFormat::Row => tuple::tuple_footprint(&self.columns, values)?,
            KdsFormat::Hash => HASH_ITEM_PREFIX + tuple::tuple_footprint(&self.columns, values)?,
            KdsFormat::Column => {
                if values.len() != self.columns.len() {
                    return Err(Error::InvalidArgumentError(format!(
                        "row has {} values but the chunk has {} columns",
                        values.len(),
                        self.columns.len()
                    )));
                }
                let mut bytes = 0usize;
                for (c, v) in self.columns.iter().zip(values) {
                    if v.is_null() && !c.nullable {
                        return Err(Error::InvalidArgumentError(format!(
                            "NULL in non-nullable column \"{}\"",
                            c.name
                        )));
                    }
                    v.check_type(c.type_op)?;
                    if let Some(payload) = v.as_bytes() {
                        bytes += align_up(4 + payload.len(), 4);
                    }
                }
                maxalign(bytes)
            }
            KdsFormat::Block => {
                return Err(Error::InvalidArgumentError(
                    "BLOCK chunks are filled page by page with push_block".into(),
                ));
            }
        };
        u32::try_from(bytes)
            .map_err(|_| Error::InvalidArgumentError(format!("row of {bytes} bytes is too large")))
    }

    fn check_row(&self, row: u32) -> Result<()> {
        if self.format == KdsFormat::Block {
            return Err(Error::InvalidArgumentError(
                "BLOCK chunks are addressed by tuple offset".into(),
            ));
        }
        if row >= self.nitems() {
            return Err(Error::InvalidArgumentError(format!(
                "row {row} out of range, chunk has {} items",
                self.nitems()
            )));
        }
        Ok(())
    }

    /// Body offset of the item for `row` (HASH: the `(hash, next)` prefix).
    pub(crate) fn item_offset(&self, row: u32) -> Result<usize> {
        self.body.read_u32(row as usize * 4).map(|o| o as usize)
    }

    /// Body offset of the tuple for a location.
    fn tuple_offset(&self, loc: TupleLoc) -> Result<usize> {
        match (self.format, loc) {
            (KdsFormat::Row, TupleLoc::Row(row)) => {
                self.check_row(row)?;
                self.item_offset(row)
            }
            (KdsFormat::Hash, TupleLoc::Row(row)) => {
                self.check_row(row)?;
                Ok(self.item_offset(row)? + HASH_ITEM_PREFIX)
            }
            (KdsFormat::Block, TupleLoc::Offset(off)) => Ok(off as usize),
            (format, loc) => Err(Error::InvalidArgumentError(format!(
                "{loc:?} does not address a tuple of a {format:?} chunk"
            ))),
        }
    }

    fn tuple_bytes(&self, offset: usize) -> Result<Vec<u8>> {
        let t_len = self.body.read_u32(offset)? as usize;
        self.body.read_vec(offset, t_len)
    }

    fn column_datum(&self, row: u32, col: usize) -> Result<Datum> {
        self.check_row(row)?;
        let m = &self.meta[col];
        let row = row as usize;
        if self.body.read_u8(m.nulls_offset as usize + row)? != 0 {
            return Ok(Datum::Null);
        }
        match m.type_op.width() {
            Some(width) => {
                let raw = self.body.read_vec(m.values_offset as usize + row * width, width)?;
                Datum::read_fixed(m.type_op, &raw)
            }
            None => {
                let off = self.body.read_u32(m.values_offset as usize + row * 4)? as usize;
                let len = self.body.read_u32(off)? as usize;
                let payload = self.body.read_vec(off + 4, len)?;
                Datum::from_varlena(m.type_op, &payload)
            }
        }
    }

    /// Value of column `col` of the tuple at `loc`, resolving varlena values through the
    /// extra arena.
    pub fn datum_at(&self, loc: TupleLoc, col: usize) -> Result<Datum> {
        if col >= self.columns.len() {
            return Err(Error::InvalidArgumentError(format!(
                "column {col} out of range for {} columns",
                self.columns.len()
            )));
        }
        match (self.format, loc) {
            (KdsFormat::Column, TupleLoc::Row(row)) => self.column_datum(row, col),
            _ => {
                let bytes = self.tuple_bytes(self.tuple_offset(loc)?)?;
                tuple::decode_attr(&self.columns, &bytes, col)
            }
        }
    }

    /// Shorthand for [`Kds::datum_at`] with a row number.
    #[inline]
    pub fn datum(&self, row: u32, col: usize) -> Result<Datum> {
        self.datum_at(TupleLoc::Row(row), col)
    }

    /// All values of the tuple at `loc`.
    pub fn row_values(&self, loc: TupleLoc) -> Result<Vec<Datum>> {
        match (self.format, loc) {
            (KdsFormat::Column, TupleLoc::Row(row)) => (0..self.columns.len())
                .map(|col| self.column_datum(row, col))
                .collect(),
            _ => {
                let bytes = self.tuple_bytes(self.tuple_offset(loc)?)?;
                tuple::decode_tuple(&self.columns, &bytes)
            }
        }
    }

    /// Every populated row, in storage order.
    pub fn rows(&self) -> Result<Vec<Vec<Datum>>> {
        match self.format {
            KdsFormat::Block => {
                let mut out = Vec::new();
                for block in 0..self.nitems() {
                    for off in self.block_tuples(block)? {
                        out.push(self.row_values(TupleLoc::Offset(off))?);
                    }
                }
                Ok(out)
            }
            _ => (0..self.nitems())
                .map(|row| self.row_values(TupleLoc::Row(row)))
                .collect(),
        }
    }

    /// Stored hash of a HASH chunk item.
    pub fn hash_value(&self, row: u32) -> Result<u32> {
        self.expect_format(KdsFormat::Hash)?;
        self.check_row(row)?;
        self.body.read_u32(self.item_offset(row)?)
    }

    /// First item of the chain `hash` falls into.
    pub fn hash_first(&self, hash: u32) -> Result<Option<u32>> {
        self.expect_format(KdsFormat::Hash)?;
        let slot = (hash as usize) % self.hash_slots.len();
        Ok(self.hash_slots[slot]
            .load(Ordering::Acquire)
            .checked_sub(1))
    }

    /// Next item on the same chain as `row`.
    pub fn hash_next(&self, row: u32) -> Result<Option<u32>> {
        self.expect_format(KdsFormat::Hash)?;
        self.check_row(row)?;
        let next = self.body.read_u32(self.item_offset(row)? + 4)?;
        Ok(next.checked_sub(1))
    }

    /// Items whose stored hash equals `hash`.
    pub fn hash_matches(&self, hash: u32) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut cur = self.hash_first(hash)?;
        while let Some(row) = cur {
            if self.hash_value(row)? == hash {
                out.push(row);
            }
            cur = self.hash_next(row)?;
        }
        Ok(out)
    }

    pub(crate) fn expect_format(&self, format: KdsFormat) -> Result<()> {
        if self.format != format {
            return Err(Error::InvalidArgumentError(format!(
                "operation requires a {format:?} chunk, this one is {:?}",
                self.format
            )));
        }
        Ok(())
    }
}
