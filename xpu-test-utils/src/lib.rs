//! Helpers shared by the workspace's unit tests, integration tests and benches.

use std::sync::Once;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use xpu_kds::{DEFAULT_BLOCK_SIZE, Kds, KdsFormat};
use xpu_result::Result;
use xpu_types::{ColumnDef, Datum, TypeOpcode, hash_datums};

static INIT: Once = Once::new();

/// Initialize tracing for test binaries. Safe to call multiple times.
pub fn init_tracing_for_tests() {
    INIT.call_once(|| {
        use tracing_subscriber::filter::EnvFilter;
        use tracing_subscriber::fmt;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // another harness in the same binary may have installed a subscriber already
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_test_writer()
            .try_init();
    });
}

/// `(id int8 not null, grp int4, score float8, label text)`.
pub fn sample_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("id", TypeOpcode::Int8).not_null(),
        ColumnDef::new("grp", TypeOpcode::Int4),
        ColumnDef::new("score", TypeOpcode::Float8),
        ColumnDef::new("label", TypeOpcode::Text),
    ]
}

/// Deterministic rows over [`sample_columns`]: `id = 0..n`, `grp = id % 7` (NULL every
/// 11th row), a seeded random score and a label of varying length (NULL every 13th row).
pub fn sample_rows(n: usize, seed: u64) -> Vec<Vec<Datum>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n as i64)
        .map(|id| {
            let grp = if id % 11 == 10 {
                Datum::Null
            } else {
                Datum::Int4((id % 7) as i32)
            };
            let score = Datum::Float8(rng.random_range(-100.0..100.0));
            let label = if id % 13 == 12 {
                Datum::Null
            } else {
                Datum::Text(format!("row-{id}-{}", "x".repeat(rng.random_range(0..24))))
            };
            vec![Datum::Int8(id), grp, score, label]
        })
        .collect()
}

/// A chunk of `format` holding exactly `rows`, sized to fit them. HASH chunks are keyed by
/// the columns in `hash_keys` (ignored for the other formats).
pub fn chunk_of(
    format: KdsFormat,
    columns: Vec<ColumnDef>,
    rows: &[Vec<Datum>],
    hash_keys: &[usize],
) -> Result<Kds> {
    if format == KdsFormat::Block {
        return Kds::block_from_rows(columns, rows, DEFAULT_BLOCK_SIZE);
    }
    let nrooms = rows.len().max(1) as u32;
    let create = |nrooms, length| match format {
        KdsFormat::Column => Kds::new_column(columns.clone(), nrooms, length),
        KdsFormat::Hash => Kds::new_hash(columns.clone(), nrooms, length),
        _ => Kds::new_row(columns.clone(), nrooms, length),
    };
    // one-room chunk, only used to size the rows
    let probe = create(1, Kds::estimate_length(format, &columns, 1, 0))?;
    let mut bytes = 0usize;
    for r in rows {
        bytes += probe.row_footprint(r)? as usize;
    }
    let mut kds = create(nrooms, Kds::estimate_length(format, &columns, nrooms, 0) + bytes)?;
    for r in rows {
        if format == KdsFormat::Hash {
            let keys: Vec<Datum> = hash_keys.iter().map(|&c| r[c].clone()).collect();
            kds.push_hash_row(hash_datums(&keys), r)?;
        } else {
            kds.push_row(r)?;
        }
    }
    Ok(kds)
}

/// ROW chunk over [`sample_columns`] holding [`sample_rows`].
pub fn sample_chunk(n: usize, seed: u64) -> Kds {
    chunk_of(KdsFormat::Row, sample_columns(), &sample_rows(n, seed), &[])
        .unwrap_or_else(|e| panic!("sample chunk of {n} rows: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_of_holds_many_rows_in_every_format() {
        let rows = sample_rows(300, 11);
        for format in [KdsFormat::Row, KdsFormat::Column, KdsFormat::Hash, KdsFormat::Block] {
            let kds = chunk_of(format, sample_columns(), &rows, &[1]).unwrap();
            assert!(kds.nitems() <= kds.nrooms(), "{format:?}");
            assert_eq!(kds.rows().unwrap(), rows, "{format:?}");
        }
    }

    #[test]
    fn sample_chunk_keeps_row_order() {
        let kds = sample_chunk(100, 4);
        assert_eq!(kds.nitems(), 100);
        assert_eq!(kds.rows().unwrap(), sample_rows(100, 4));
    }
}
