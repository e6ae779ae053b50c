//! Cache replay feeding a join scan, driven only through the facade crate.

use tempfile::TempDir;
use xpu::cache::{CacheIdent, Ctid, GpuCache, LogRecord, TxLogReader, TxLogWriter};
use xpu::exec::host;
use xpu::expr::{BuildOptions, FuncOpcode, ProgramBuilder};
use xpu::kds::{Kds, KdsFormat};
use xpu::types::{ColumnDef, Datum, TypeOpcode, hash_datums};
use xpu::{EngineConfig, JoinKind, JoinMethod, KernSession, MultiRels, ScanExecutor};
use xpu_test_utils::{init_tracing_for_tests, sample_columns, sample_rows};

const IDENT: CacheIdent = CacheIdent {
    database_oid: 7,
    table_oid: 7_000,
    signature: 42,
};

/// `grp -> name`, hashed on `grp`.
fn groups() -> Kds {
    let columns = vec![
        ColumnDef::new("g", TypeOpcode::Int4).not_null(),
        ColumnDef::new("name", TypeOpcode::Text),
    ];
    let mut kds = Kds::new_hash(columns, 7, 1 << 12).unwrap();
    for g in 0..7 {
        let key = [Datum::Int4(g)];
        kds.push_hash_row(hash_datums(&key), &[key[0].clone(), Datum::Text(format!("g{g}"))])
            .unwrap();
    }
    kds
}

#[test]
fn replayed_cache_joins_against_a_dimension() {
    init_tracing_for_tests();
    let dir = TempDir::new().unwrap();
    let rows = sample_rows(600, 12);
    let base = rows[..500]
        .iter()
        .enumerate()
        .map(|(i, r)| (i as u32, r.clone()));
    let mut cache = GpuCache::load(IDENT, sample_columns(), base).unwrap();

    // commit rows 500..600, then delete every tenth base row
    let path = dir.path().join("orders.txlog");
    let mut writer = TxLogWriter::create(&path, IDENT).unwrap();
    for (i, r) in rows.iter().enumerate().skip(500) {
        let rowid = i as u32;
        writer
            .append(&LogRecord::Insert {
                rowid,
                values: r.clone(),
            })
            .unwrap();
        writer.append(&LogRecord::CommitIns { rowid }).unwrap();
    }
    for rowid in (0..500).step_by(10) {
        writer
            .append(&LogRecord::Delete {
                xid: 77,
                rowid,
                ctid: Ctid::new(0, rowid as u16),
            })
            .unwrap();
        writer.append(&LogRecord::CommitDel { rowid }).unwrap();
    }
    writer.flush().unwrap();
    let stats = cache.replay_log(TxLogReader::open(&path).unwrap()).unwrap();
    assert_eq!(stats.applied(), 300);
    assert_eq!(cache.nitems(), 550);

    let snapshot = cache.snapshot().unwrap();
    assert_eq!(snapshot.format(), KdsFormat::Row);

    // SELECT o.id, g.name FROM orders o JOIN groups g ON o.grp = g.g
    let mut b = ProgramBuilder::new(1);
    b.load_vars(0, &[(0, 0, TypeOpcode::Int8), (1, 1, TypeOpcode::Int4)]);
    b.load_vars(1, &[(0, 2, TypeOpcode::Int4), (1, 3, TypeOpcode::Text)]);
    let id = b.var(0);
    let grp = b.var(1);
    let g = b.var(2);
    let name = b.var(3);
    let h = b.hash_value(&[grp]);
    b.hash_keys(1, h);
    let eq = b.func(FuncOpcode::Int4Eq, &[grp, g]);
    b.join_quals(1, eq);
    b.projection(&[("id", id), ("name", name)]);
    let program = b.build(&BuildOptions::default()).unwrap();

    let dims = groups();
    let config = EngineConfig {
        dest_nrooms: 32,
        ..EngineConfig::default()
    };
    let rels = MultiRels::new().join(&dims, JoinKind::Inner, JoinMethod::Hash);
    let session = KernSession::join(&config, &program, &[], &snapshot, rels).unwrap();
    let reference = host::reference_rows(&session).unwrap();
    let output = ScanExecutor::new(session).run().unwrap();

    let mut got = output.rows().unwrap();
    let mut want = reference;
    got.sort_by_cached_key(|r| format!("{r:?}"));
    want.sort_by_cached_key(|r| format!("{r:?}"));
    assert_eq!(got, want);
    assert!(output.launches > 1);

    // deleted rows never reach the scan; NULL groups never join
    let ids: Vec<i64> = got.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert!(ids.iter().all(|&i| i >= 500 || i % 10 != 0));
    assert!(ids.iter().all(|&i| i % 11 != 10));
}
