use xpu_exec::{EngineConfig, JoinKind, JoinMethod, KernSession, MultiRels, ScanExecutor, host};
use xpu_expr::{BuildOptions, ExprProgram, FuncOpcode, ProgramBuilder};
use xpu_kds::{Kds, KdsFormat};
use xpu_test_utils::{chunk_of, init_tracing_for_tests, sample_chunk};
use xpu_types::{ColumnDef, Datum, TypeOpcode};

fn sorted(mut rows: Vec<Vec<Datum>>) -> Vec<Vec<Datum>> {
    rows.sort_by_cached_key(|r| format!("{r:?}"));
    rows
}

fn inner_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("k", TypeOpcode::Int8).not_null(),
        ColumnDef::new("name", TypeOpcode::Text),
    ]
}

/// 60 rows keyed `i % 40`: keys 0..20 twice, 20..40 once.
fn inner_chunk(format: KdsFormat) -> Kds {
    let rows: Vec<Vec<Datum>> = (0..60i64)
        .map(|i| vec![Datum::Int8(i % 40), Datum::Text(format!("inner-{i}"))])
        .collect();
    chunk_of(format, inner_columns(), &rows, &[0]).unwrap()
}

/// `SELECT o.id, o.label, i.name FROM outer o JOIN inner i ON o.id = i.k`
fn join_program(hash: bool) -> ExprProgram {
    let mut b = ProgramBuilder::new(1);
    b.load_vars(0, &[(0, 0, TypeOpcode::Int8), (3, 1, TypeOpcode::Text)]);
    b.load_vars(1, &[(0, 2, TypeOpcode::Int8), (1, 3, TypeOpcode::Text)]);
    let id = b.var(0);
    let label = b.var(1);
    let k = b.var(2);
    let name = b.var(3);
    if hash {
        let h = b.hash_value(&[id]);
        b.hash_keys(1, h);
    }
    let eq = b.func(FuncOpcode::Int8Eq, &[id, k]);
    b.join_quals(1, eq);
    b.projection(&[("id", id), ("label", label), ("name", name)]);
    b.build(&BuildOptions::default()).unwrap()
}

fn check_join(kind: JoinKind, method: JoinMethod, config: &EngineConfig) -> Vec<Vec<Datum>> {
    let hash = method == JoinMethod::Hash;
    let program = join_program(hash);
    let outer = sample_chunk(300, 21);
    let inner = inner_chunk(if hash { KdsFormat::Hash } else { KdsFormat::Row });
    let rels = MultiRels::new().join(&inner, kind, method);
    let session = KernSession::join(config, &program, &[], &outer, rels).unwrap();
    let reference = host::reference_rows(&session).unwrap();
    let output = ScanExecutor::new(session).run().unwrap();
    let rows = sorted(output.rows().unwrap());
    assert_eq!(rows, sorted(reference));
    rows
}

#[test]
fn nested_loop_inner_join() {
    init_tracing_for_tests();
    let rows = check_join(JoinKind::Inner, JoinMethod::NestLoop, &EngineConfig::default());
    assert_eq!(rows.len(), 60);
}

#[test]
fn hash_inner_join() {
    let rows = check_join(JoinKind::Inner, JoinMethod::Hash, &EngineConfig::default());
    assert_eq!(rows.len(), 60);
    let dup: Vec<_> = rows.iter().filter(|r| r[0] == Datum::Int8(7)).collect();
    assert_eq!(dup.len(), 2);
}

#[test]
fn left_outer_joins_null_extend_unmatched_rows() {
    for method in [JoinMethod::NestLoop, JoinMethod::Hash] {
        let rows = check_join(JoinKind::Left, method, &EngineConfig::default());
        assert_eq!(rows.len(), 60 + 260, "{method:?}");
        let unmatched = rows.iter().filter(|r| r[2].is_null()).count();
        assert_eq!(unmatched, 260, "{method:?}");
    }
}

#[test]
fn joins_survive_suspension() {
    let config = EngineConfig {
        dest_nrooms: 16,
        ..EngineConfig::default()
    };
    for kind in [JoinKind::Inner, JoinKind::Left] {
        for method in [JoinMethod::NestLoop, JoinMethod::Hash] {
            check_join(kind, method, &config);
        }
    }
}

/// Two-level join: hash join on `id = k`, then a nested loop on `grp = g`.
#[test]
fn two_level_join_matches_reference() {
    init_tracing_for_tests();
    let mut b = ProgramBuilder::new(2);
    b.load_vars(0, &[(0, 0, TypeOpcode::Int8), (1, 1, TypeOpcode::Int4)]);
    b.load_vars(1, &[(0, 2, TypeOpcode::Int8)]);
    b.load_vars(2, &[(0, 3, TypeOpcode::Int4), (1, 4, TypeOpcode::Text)]);
    let id = b.var(0);
    let grp = b.var(1);
    let k = b.var(2);
    let g = b.var(3);
    let tag = b.var(4);
    let h = b.hash_value(&[id]);
    b.hash_keys(1, h);
    let eq1 = b.func(FuncOpcode::Int8Eq, &[id, k]);
    b.join_quals(1, eq1);
    let eq2 = b.func(FuncOpcode::Int4Eq, &[grp, g]);
    b.join_quals(2, eq2);
    b.projection(&[("id", id), ("grp", grp), ("tag", tag)]);
    let program = b.build(&BuildOptions::default()).unwrap();

    let outer = sample_chunk(500, 4);
    let first = inner_chunk(KdsFormat::Hash);
    let tags: Vec<Vec<Datum>> = (0..14i32)
        .map(|i| vec![Datum::Int4(i % 7), Datum::Text(format!("tag-{i}"))])
        .collect();
    let second = chunk_of(
        KdsFormat::Row,
        vec![
            ColumnDef::new("g", TypeOpcode::Int4).not_null(),
            ColumnDef::new("tag", TypeOpcode::Text),
        ],
        &tags,
        &[],
    )
    .unwrap();

    let config = EngineConfig {
        dest_nrooms: 24,
        ..EngineConfig::default()
    };
    let rels = MultiRels::new()
        .join(&first, JoinKind::Inner, JoinMethod::Hash)
        .join(&second, JoinKind::Inner, JoinMethod::NestLoop);
    let session = KernSession::join(&config, &program, &[], &outer, rels).unwrap();
    let reference = host::reference_rows(&session).unwrap();
    let output = ScanExecutor::new(session).run().unwrap();

    assert!(output.launches > 1);
    assert_eq!(output.stats.depth_out[0], 60);
    assert_eq!(output.stats.depth_out[1], reference.len() as u64);
    assert_eq!(sorted(output.rows().unwrap()), sorted(reference));
}

#[test]
fn session_rejects_mismatched_relations() {
    let config = EngineConfig::default();
    let outer = sample_chunk(10, 0);
    let row_inner = inner_chunk(KdsFormat::Row);
    let hash_inner = inner_chunk(KdsFormat::Hash);

    // hash join over a ROW chunk
    let program = join_program(true);
    let rels = MultiRels::new().join(&row_inner, JoinKind::Inner, JoinMethod::Hash);
    assert!(KernSession::join(&config, &program, &[], &outer, rels).is_err());

    // nested loop with hash keys
    let rels = MultiRels::new().join(&hash_inner, JoinKind::Inner, JoinMethod::NestLoop);
    assert!(KernSession::join(&config, &program, &[], &outer, rels).is_err());

    // relation count differs from the program
    assert!(KernSession::scan(&config, &program, &[], &outer).is_err());

    // a HASH chunk as the outer source
    let plain = join_program(false);
    let rels = MultiRels::new().join(&row_inner, JoinKind::Inner, JoinMethod::NestLoop);
    assert!(KernSession::join(&config, &plain, &[], &hash_inner, rels).is_err());
}
