//! Heap-style tuple encoding used by ROW, HASH and BLOCK chunks and by cache log records.
//!
//! ```text
//! 0      4        6         8            10     12
//! +------+--------+---------+------------+------+-----------------+----------------
//! | t_len| t_hoff | t_natts | t_infomask | pad  | null bitmap ... | attributes ...
//! +------+--------+---------+------------+------+-----------------+----------------
//! ```
//!
//! The header is padded to 8 bytes. Each non-null attribute is aligned to its type's
//! alignment; NULL attributes take no space and have their bitmap bit cleared. Varlena
//! attributes are stored inline as `[u32 len][payload]`. Attributes past `t_natts` read as
//! NULL. Whole tuples are padded to 8 bytes.

use xpu_result::{Error, Result};
use xpu_types::{ColumnDef, Datum, TypeOpcode, align_up, maxalign};

pub const TUPLE_HEADER_SZ: usize = 12;

pub const HEAP_HASNULL: u16 = 0x0001;
pub const HEAP_HASVARWIDTH: u16 = 0x0002;

fn header_size(natts: usize, has_nulls: bool) -> usize {
    let bitmap = if has_nulls { natts.div_ceil(8) } else { 0 };
    maxalign(TUPLE_HEADER_SZ + bitmap)
}

fn check_values(columns: &[ColumnDef], values: &[Datum]) -> Result<()> {
    if columns.len() != values.len() {
        return Err(Error::InvalidArgumentError(format!(
            "row has {} values but the chunk has {} columns",
            values.len(),
            columns.len()
        )));
    }
    for (col, v) in columns.iter().zip(values) {
        if v.is_null() && !col.nullable {
            return Err(Error::InvalidArgumentError(format!(
                "NULL in non-nullable column \"{}\"",
                col.name
            )));
        }
        v.check_type(col.type_op)?;
    }
    Ok(())
}

/// Length of the encoded tuple before the trailing 8-byte padding.
pub fn tuple_len(columns: &[ColumnDef], values: &[Datum]) -> Result<usize> {
    check_values(columns, values)?;
    let has_nulls = values.iter().any(Datum::is_null);
    let mut off = header_size(values.len(), has_nulls);
    for (col, v) in columns.iter().zip(values) {
        if v.is_null() {
            continue;
        }
        off = align_up(off, col.type_op.align()) + v.stored_len();
    }
    Ok(off)
}

/// Bytes a tuple occupies inside a chunk.
#[inline]
pub fn tuple_footprint(columns: &[ColumnDef], values: &[Datum]) -> Result<usize> {
    tuple_len(columns, values).map(maxalign)
}

pub fn encode_tuple(columns: &[ColumnDef], values: &[Datum]) -> Result<Vec<u8>> {
    let t_len = tuple_len(columns, values)?;
    let has_nulls = values.iter().any(Datum::is_null);
    let hoff = header_size(values.len(), has_nulls);
    let mut buf = vec![0u8; maxalign(t_len)];

    let mut infomask = 0u16;
    if has_nulls {
        infomask |= HEAP_HASNULL;
    }
    if columns.iter().any(|c| c.type_op.is_varlena()) {
        infomask |= HEAP_HASVARWIDTH;
    }
    buf[0..4].copy_from_slice(&(t_len as u32).to_le_bytes());
    buf[4..6].copy_from_slice(&(hoff as u16).to_le_bytes());
    buf[6..8].copy_from_slice(&(values.len() as u16).to_le_bytes());
    buf[8..10].copy_from_slice(&infomask.to_le_bytes());

    let mut off = hoff;
    for (i, (col, v)) in columns.iter().zip(values).enumerate() {
        if v.is_null() {
            continue;
        }
        if has_nulls {
            buf[TUPLE_HEADER_SZ + i / 8] |= 1 << (i % 8);
        }
        off = align_up(off, col.type_op.align());
        match v.as_bytes() {
            Some(payload) => {
                buf[off..off + 4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
                buf[off + 4..off + 4 + payload.len()].copy_from_slice(payload);
            }
            None => {
                let width = col.type_op.width().unwrap_or(0);
                v.write_fixed(&mut buf[off..off + width])?;
            }
        }
        off += v.stored_len();
    }
    Ok(buf)
}

struct TupleHeader {
    t_len: usize,
    hoff: usize,
    natts: usize,
    has_nulls: bool,
}

fn read_header(bytes: &[u8]) -> Result<TupleHeader> {
    if bytes.len() < TUPLE_HEADER_SZ {
        return Err(Error::corrupt("tuple", "shorter than its header"));
    }
    let t_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let hoff = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
    let natts = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
    let infomask = u16::from_le_bytes([bytes[8], bytes[9]]);
    if t_len > bytes.len() || hoff > t_len || hoff < TUPLE_HEADER_SZ {
        return Err(Error::corrupt(
            "tuple",
            format!("t_len {t_len} / t_hoff {hoff} inconsistent with {} bytes", bytes.len()),
        ));
    }
    Ok(TupleHeader {
        t_len,
        hoff,
        natts,
        has_nulls: infomask & HEAP_HASNULL != 0,
    })
}

fn attr_is_null(bytes: &[u8], hdr: &TupleHeader, i: usize) -> Result<bool> {
    if !hdr.has_nulls {
        return Ok(false);
    }
    let byte = TUPLE_HEADER_SZ + i / 8;
    if byte >= hdr.hoff {
        return Err(Error::corrupt("tuple", "null bitmap overlaps attributes"));
    }
    Ok(bytes[byte] & (1 << (i % 8)) == 0)
}

/// Total tuple length recorded in the header of `bytes`.
pub fn stored_tuple_len(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < 4 {
        return Err(Error::corrupt("tuple", "missing t_len"));
    }
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
}

fn read_attr(ty: TypeOpcode, bytes: &[u8], off: usize, t_len: usize) -> Result<(Datum, usize)> {
    match ty.width() {
        Some(width) => {
            if off + width > t_len {
                return Err(Error::corrupt("tuple", "attribute beyond t_len"));
            }
            Ok((Datum::read_fixed(ty, &bytes[off..off + width])?, width))
        }
        None => {
            if off + 4 > t_len {
                return Err(Error::corrupt("tuple", "varlena header beyond t_len"));
            }
            let len =
                u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
                    as usize;
            if off + 4 + len > t_len {
                return Err(Error::corrupt("tuple", "varlena payload beyond t_len"));
            }
            Ok((Datum::from_varlena(ty, &bytes[off + 4..off + 4 + len])?, 4 + len))
        }
    }
}

/// Decode attribute `col` without materialising the rest of the row.
pub fn decode_attr(columns: &[ColumnDef], bytes: &[u8], col: usize) -> Result<Datum> {
    let hdr = read_header(bytes)?;
    if col >= columns.len() {
        return Err(Error::InvalidArgumentError(format!(
            "column {col} out of range for {} columns",
            columns.len()
        )));
    }
    if col >= hdr.natts {
        return Ok(Datum::Null);
    }
    let mut off = hdr.hoff;
    for (i, c) in columns.iter().enumerate().take(col + 1) {
        if attr_is_null(bytes, &hdr, i)? {
            if i == col {
                return Ok(Datum::Null);
            }
            continue;
        }
        off = align_up(off, c.type_op.align());
        let (datum, used) = read_attr(c.type_op, bytes, off, hdr.t_len)?;
        if i == col {
            return Ok(datum);
        }
        off += used;
    }
    Ok(Datum::Null)
}

pub fn decode_tuple(columns: &[ColumnDef], bytes: &[u8]) -> Result<Vec<Datum>> {
    let hdr = read_header(bytes)?;
    let mut out = Vec::with_capacity(columns.len());
    let mut off = hdr.hoff;
    for (i, c) in columns.iter().enumerate() {
        if i >= hdr.natts || attr_is_null(bytes, &hdr, i)? {
            out.push(Datum::Null);
            continue;
        }
        off = align_up(off, c.type_op.align());
        let (datum, used) = read_attr(c.type_op, bytes, off, hdr.t_len)?;
        out.push(datum);
        off += used;
    }
    Ok(out)
}
