use std::collections::HashSet;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use xpu_kds::{Kds, KdsFormat};
use xpu_types::{ColumnDef, Datum, TypeOpcode};

fn columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("id", TypeOpcode::Int8).not_null(),
        ColumnDef::new("payload", TypeOpcode::Text),
    ]
}

fn row(id: i64, len: usize) -> Vec<Datum> {
    vec![Datum::Int8(id), Datum::Text("p".repeat(len))]
}

/// Many threads race for a destination that cannot hold all of them. Reservations must
/// never overshoot the rooms or bytes, and every row that won a slot must read back whole.
fn race(format: KdsFormat) {
    let mut rng = SmallRng::seed_from_u64(7);
    let lens: Vec<usize> = (0..2000).map(|_| rng.random_range(0..40)).collect();
    let nrooms = 700;
    let length = Kds::estimate_length(format, &columns(), nrooms, 12);
    let mut kds = match format {
        KdsFormat::Row => Kds::new_row(columns(), nrooms, length),
        KdsFormat::Column => Kds::new_column(columns(), nrooms, length),
        _ => unreachable!(),
    }
    .unwrap();

    let app = kds.appender();
    let written: Vec<i64> = lens
        .par_chunks(32)
        .enumerate()
        .flat_map_iter(|(chunk, lens)| {
            let rows: Vec<Vec<Datum>> = lens
                .iter()
                .enumerate()
                .map(|(i, &len)| row((chunk * 32 + i) as i64, len))
                .collect();
            let mut prefix = Vec::with_capacity(rows.len());
            let mut acc = 0u32;
            for r in &rows {
                acc += app.footprint(r).unwrap();
                prefix.push(acc);
            }
            let mut out = Vec::new();
            if let Some(res) = app.reserve(&prefix) {
                assert!(res.first_row + res.nrows <= nrooms);
                for i in 0..res.nrows as usize {
                    app.write_row(&res, i, &prefix, &rows[i]).unwrap();
                    out.push((chunk * 32 + i) as i64);
                }
            }
            out
        })
        .collect();

    assert!(kds.nitems() <= kds.nrooms());
    assert_eq!(kds.nitems() as usize, written.len());
    let rows = kds.rows().unwrap();
    let mut seen = HashSet::new();
    for r in rows {
        let id = match r[0] {
            Datum::Int8(id) => id,
            ref other => panic!("bad id {other:?}"),
        };
        assert!(seen.insert(id), "row {id} written twice");
        assert_eq!(r, row(id, lens[id as usize]));
    }
    let expected: HashSet<i64> = written.into_iter().collect();
    assert_eq!(seen, expected);
}

#[test]
fn row_format_parallel_append() {
    race(KdsFormat::Row);
}

#[test]
fn column_format_parallel_append() {
    race(KdsFormat::Column);
}
