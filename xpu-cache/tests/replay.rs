use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use xpu_cache::{
    CacheIdent, Ctid, GpuCache, LogRecord, RedoLogBuffer, ReplayStats, TxLogReader, TxLogWriter,
};
use xpu_exec::{EngineConfig, KernSession, ScanExecutor};
use xpu_expr::{BuildOptions, ProgramBuilder};
use xpu_result::Error;
use xpu_test_utils::{init_tracing_for_tests, sample_columns, sample_rows};
use xpu_types::{Datum, TypeOpcode};

const IDENT: CacheIdent = CacheIdent {
    database_oid: 16_384,
    table_oid: 24_576,
    signature: 0x5EED_0000_0000_0001,
};

/// One open transaction: the record that will resolve it, and the change it makes to the
/// committed state if it commits (`None` values for a delete).
type OpenTxn = (LogRecord, Option<(u32, Option<Vec<Datum>>)>);

fn resolve(txn: OpenTxn, log: &mut Vec<LogRecord>, committed: &mut BTreeMap<u32, Vec<Datum>>) {
    let (done, effect) = txn;
    log.push(done);
    match effect {
        Some((rowid, Some(values))) => {
            committed.insert(rowid, values);
        }
        Some((rowid, None)) => {
            committed.remove(&rowid);
        }
        None => {}
    }
}

/// A random history of single-row transactions over [`sample_columns`], interleaving the
/// provisional records of several open transactions. Returns the log and the committed
/// state it leads to.
fn random_history(
    seed: u64,
    ntxn: usize,
    delete_rate: f64,
    abort_rate: f64,
) -> (Vec<LogRecord>, BTreeMap<u32, Vec<Datum>>) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut committed: BTreeMap<u32, Vec<Datum>> = BTreeMap::new();
    // rows with a delete in flight
    let mut locked: BTreeSet<u32> = BTreeSet::new();
    let mut log = Vec::new();
    let mut open: Vec<OpenTxn> = Vec::new();
    let mut next_rowid = 0u32;

    for (i, values) in sample_rows(ntxn, seed).into_iter().enumerate() {
        let commit = !rng.random_bool(abort_rate);
        let candidates: Vec<u32> = committed
            .keys()
            .copied()
            .filter(|r| !locked.contains(r))
            .collect();
        let txn = if !candidates.is_empty() && rng.random_bool(delete_rate) {
            let rowid = candidates[rng.random_range(0..candidates.len())];
            locked.insert(rowid);
            log.push(LogRecord::Delete {
                xid: 1_000 + i as u32,
                rowid,
                ctid: Ctid::new(rowid / 64, (rowid % 64) as u16),
            });
            if commit {
                (LogRecord::CommitDel { rowid }, Some((rowid, None)))
            } else {
                (LogRecord::AbortDel { rowid }, None)
            }
        } else {
            let rowid = next_rowid;
            next_rowid += 1;
            log.push(LogRecord::Insert {
                rowid,
                values: values.clone(),
            });
            if commit {
                (LogRecord::CommitIns { rowid }, Some((rowid, Some(values))))
            } else {
                (LogRecord::AbortIns { rowid }, None)
            }
        };
        open.push(txn);

        // resolve a random subset of the open transactions
        while !open.is_empty() && rng.random_bool(0.5) {
            let txn = open.swap_remove(rng.random_range(0..open.len()));
            locked.remove(&txn.0.rowid());
            resolve(txn, &mut log, &mut committed);
        }
    }
    for txn in open {
        resolve(txn, &mut log, &mut committed);
    }
    (log, committed)
}

fn committed_state(cache: &GpuCache) -> BTreeMap<u32, Vec<Datum>> {
    cache
        .visible_rowids()
        .map(|rowid| (rowid, cache.row(rowid).unwrap().to_vec()))
        .collect()
}

fn write_log(dir: &TempDir, name: &str, ident: CacheIdent, log: &[LogRecord]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut writer = TxLogWriter::create(&path, ident).unwrap();
    writer.append_all(log).unwrap();
    writer.flush().unwrap();
    path
}

#[test]
fn file_log_replay_matches_the_committed_history() {
    init_tracing_for_tests();
    let dir = TempDir::new().unwrap();
    for seed in 0..8 {
        let (log, expected) = random_history(seed, 300, 0.3, 0.3);
        let path = write_log(&dir, &format!("txlog-{seed}"), IDENT, &log);

        let mut cache = GpuCache::new(IDENT, sample_columns());
        let stats = cache.replay_log(TxLogReader::open(&path).unwrap()).unwrap();
        assert_eq!(stats.records(), log.len() as u64);
        assert_eq!(cache.npending(), 0, "seed {seed}");
        assert_eq!(committed_state(&cache), expected, "seed {seed}");

        let snapshot = cache.snapshot().unwrap();
        assert_eq!(snapshot.nitems() as usize, expected.len());
        assert_eq!(
            snapshot.rows().unwrap(),
            expected.values().cloned().collect::<Vec<_>>()
        );
    }
}

#[test]
fn replaying_twice_converges() {
    for seed in 10..16 {
        let (log, expected) = random_history(seed, 200, 0.3, 0.3);
        let mut cache = GpuCache::new(IDENT, sample_columns());
        cache.replay(&IDENT, &log).unwrap();
        cache.replay(&IDENT, &log).unwrap();
        assert_eq!(committed_state(&cache), expected, "seed {seed}");

        // a crash mid-log: a prefix first, then the whole log again
        let mut partial = GpuCache::new(IDENT, sample_columns());
        partial.replay(&IDENT, &log[..log.len() / 3]).unwrap();
        partial.replay(&IDENT, &log).unwrap();
        assert_eq!(committed_state(&partial), expected, "seed {seed}");
    }
}

#[test]
fn insert_only_log_is_skipped_on_second_replay() {
    let (log, expected) = random_history(99, 150, 0.0, 0.0);
    let mut cache = GpuCache::new(IDENT, sample_columns());
    let first = cache.replay(&IDENT, &log).unwrap();
    let second = cache.replay(&IDENT, &log).unwrap();
    assert_eq!(second.applied(), 0);
    assert_eq!(second.skipped, log.len() as u64);
    assert_eq!(committed_state(&cache), expected);

    let mut total = ReplayStats::default();
    total += first;
    total += second;
    assert_eq!(total, cache.stats());
}

#[test]
fn stale_log_file_forces_a_reload() {
    init_tracing_for_tests();
    let dir = TempDir::new().unwrap();
    let base: Vec<(u32, Vec<Datum>)> = sample_rows(50, 3)
        .into_iter()
        .enumerate()
        .map(|(i, r)| (i as u32, r))
        .collect();
    let mut cache = GpuCache::load(IDENT, sample_columns(), base.clone()).unwrap();

    let altered = CacheIdent {
        signature: IDENT.signature + 1,
        ..IDENT
    };
    let path = write_log(&dir, "altered", altered, &[LogRecord::CommitIns { rowid: 0 }]);
    let err = cache
        .replay_log(TxLogReader::open(&path).unwrap())
        .unwrap_err();
    assert!(matches!(err, Error::CacheSignatureMismatch { .. }), "{err}");
    assert!(!cache.is_valid());

    cache.reload(altered, base).unwrap();
    assert_eq!(cache.nitems(), 50);
    let stats = cache
        .replay_log(TxLogReader::open(&path).unwrap())
        .unwrap();
    assert_eq!(stats.skipped, 1);
}

#[test]
fn redo_buffers_apply_in_batches() {
    let (log, expected) = random_history(7, 400, 0.3, 0.3);
    let mut cache = GpuCache::new(IDENT, sample_columns());
    let mut buffer = RedoLogBuffer::new(IDENT, 64, 1 << 14);
    let mut rest = log.as_slice();
    let mut batches = 0;
    while !rest.is_empty() {
        let taken = buffer.fill(rest).unwrap();
        assert!(taken > 0);
        cache.apply_redo(&buffer).unwrap();
        buffer.clear();
        rest = &rest[taken..];
        batches += 1;
    }
    assert!(batches > 1);
    assert_eq!(committed_state(&cache), expected);
}

#[test]
fn device_scan_sees_only_committed_rows() {
    init_tracing_for_tests();
    let rows = sample_rows(40, 5);
    let mut log = Vec::new();
    for (i, values) in rows.iter().enumerate() {
        let rowid = i as u32;
        log.push(LogRecord::Insert {
            rowid,
            values: values.clone(),
        });
        // every fourth insert stays in flight, every fifth is rolled back
        match i % 20 {
            r if r % 4 == 3 => {}
            r if r % 5 == 4 => log.push(LogRecord::AbortIns { rowid }),
            _ => log.push(LogRecord::CommitIns { rowid }),
        }
    }
    let mut cache = GpuCache::new(IDENT, sample_columns());
    cache.replay(&IDENT, &log).unwrap();
    assert!(cache.npending() > 0);

    let snapshot = cache.snapshot().unwrap();
    let mut b = ProgramBuilder::new(0);
    b.load_vars(0, &[(0, 0, TypeOpcode::Int8)]);
    let id = b.var(0);
    b.projection(&[("id", id)]);
    let program = b.build(&BuildOptions::default()).unwrap();

    let config = EngineConfig {
        dest_nrooms: 8,
        ..EngineConfig::default()
    };
    let session = KernSession::scan(&config, &program, &[], &snapshot).unwrap();
    let output = ScanExecutor::new(session).run().unwrap();
    let mut ids: Vec<i64> = output
        .rows()
        .unwrap()
        .into_iter()
        .map(|r| r[0].as_i64().unwrap())
        .collect();
    ids.sort_unstable();
    let expected: Vec<i64> = cache.visible_rowids().map(i64::from).collect();
    assert_eq!(ids, expected);
    assert!(ids.iter().all(|&i| i % 4 != 3 && i % 5 != 4));
}
