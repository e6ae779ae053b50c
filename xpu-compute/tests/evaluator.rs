use half::f16;
use xpu_compute::{KVars, KernContext};
use xpu_expr::{AggKind, BuildOptions, DevKind, FuncOpcode, ProgramBuilder};
use xpu_kds::TupleLoc;
use xpu_result::ErrorCode;
use xpu_test_utils::{init_tracing_for_tests, sample_chunk};
use xpu_types::{Datum, TypeOpcode, hash_datums};

#[test]
fn loads_and_filters_chunk_rows() {
    init_tracing_for_tests();
    let kds = sample_chunk(100, 7);

    // WHERE grp = 3 AND id > 50
    let mut b = ProgramBuilder::new(0);
    b.load_vars(0, &[(0, 0, TypeOpcode::Int8), (1, 1, TypeOpcode::Int4)]);
    let id = b.var(0);
    let grp = b.var(1);
    let three = b.constant(Datum::Int4(3));
    let fifty = b.constant(Datum::Int8(50));
    let eq = b.func(FuncOpcode::Int4Eq, &[grp, three]);
    let gt = b.func(FuncOpcode::Int8Gt, &[id, fifty]);
    let qual = b.and(&[eq, gt]);
    b.scan_quals(qual);
    b.projection(&[("id", id)]);
    let prog = b.build(&BuildOptions::default()).unwrap();

    let ctx = KernContext::new(&prog, &[], DevKind::GPU, 1024);
    let mut kvars = ctx.new_kvars();
    let mut ids = Vec::new();
    for row in 0..kds.nitems() {
        kvars.clear();
        ctx.load_vars(0, &kds, Some(TupleLoc::Row(row)), &mut kvars)
            .unwrap();
        if ctx.eval_qual(prog.entries().scan_quals, &mut kvars).unwrap() {
            ids.push(ctx.projection(&mut kvars).unwrap()[0].clone());
        }
    }
    let expected: Vec<Datum> = (51..100)
        .filter(|i| i % 7 == 3 && i % 11 != 10)
        .map(Datum::Int8)
        .collect();
    assert_eq!(ids, expected);
}

#[test]
fn memoised_node_is_read_back() {
    let mut b = ProgramBuilder::new(0);
    b.load_vars(0, &[(0, 0, TypeOpcode::Int4)]);
    let x = b.var(0);
    let one = b.constant(Datum::Int4(1));
    let sum = b.func(FuncOpcode::Int4Pl, &[x, one]);
    b.memoize(sum, 1);
    let again = b.var(1);
    let twice = b.func(FuncOpcode::Int4Mul, &[again, again]);
    b.projection(&[("sum", sum), ("twice", twice)]);
    let prog = b.build(&BuildOptions::default()).unwrap();

    let ctx = KernContext::host(&prog, &[]);
    let mut kvars = KVars::new(prog.nslots() as usize);
    kvars.set(0, Datum::Int4(4));
    assert_eq!(
        ctx.projection(&mut kvars).unwrap(),
        vec![Datum::Int4(5), Datum::Int4(25)]
    );
    assert_eq!(kvars.get(1), Some(&Datum::Int4(5)));

    // a filled slot short-circuits the computation
    kvars.set(1, Datum::Int4(10));
    assert_eq!(ctx.eval(sum, &mut kvars).unwrap(), Datum::Int4(10));
}

#[test]
fn unset_memo_slot_runs_its_producer() {
    let mut b = ProgramBuilder::new(0);
    let a = b.constant(Datum::Int8(20));
    let c = b.constant(Datum::Int8(22));
    let sum = b.func(FuncOpcode::Int8Pl, &[a, c]);
    b.memoize(sum, 0);
    let read = b.var(0);
    b.projection(&[("v", read)]);
    let prog = b.build(&BuildOptions::default()).unwrap();
    let ctx = KernContext::host(&prog, &[]);
    let mut kvars = ctx.new_kvars();
    assert_eq!(ctx.projection(&mut kvars).unwrap(), vec![Datum::Int8(42)]);
}

#[test]
fn kvars_quota_raises_an_eval_error() {
    let mut b = ProgramBuilder::new(0);
    b.load_vars(0, &[(3, 0, TypeOpcode::Text)]);
    let label = b.var(0);
    b.projection(&[("label", label)]);
    let prog = b.build(&BuildOptions::default()).unwrap();
    let kds = sample_chunk(4, 1);

    let ctx = KernContext::new(&prog, &[], DevKind::GPU, 4);
    let mut kvars = ctx.new_kvars();
    let err = ctx
        .load_vars(0, &kds, Some(TupleLoc::Row(0)), &mut kvars)
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ExpressionEval);
    assert!(err.message.contains("kvars buffer exhausted"), "{err}");

    let host = KernContext::host(&prog, &[]);
    let mut kvars = host.new_kvars();
    host.load_vars(0, &kds, Some(TupleLoc::Row(0)), &mut kvars)
        .unwrap();
    assert!(matches!(kvars.get(0), Some(Datum::Text(_))));
}

#[test]
fn gpu_only_function_is_refused_on_dpu() {
    let mut b = ProgramBuilder::new(0);
    let x = b.constant(Datum::Float2(f16::from_f32(1.5)));
    let sum = b.func(FuncOpcode::Float2Pl, &[x, x]);
    b.projection(&[("v", sum)]);
    let prog = b.build(&BuildOptions::default()).unwrap();

    let gpu = KernContext::new(&prog, &[], DevKind::GPU, 64);
    let mut kvars = gpu.new_kvars();
    assert_eq!(
        gpu.projection(&mut kvars).unwrap(),
        vec![Datum::Float2(f16::from_f32(3.0))]
    );

    let dpu = KernContext::new(&prog, &[], DevKind::DPU, 64);
    let mut kvars = dpu.new_kvars();
    let err = dpu.projection(&mut kvars).unwrap_err();
    assert_eq!(err.code, ErrorCode::UnsupportedOpcode);
    assert_eq!(err.aux, u64::from(u16::from(FuncOpcode::Float2Pl)));
}

#[test]
fn parameters_are_type_checked() {
    let mut b = ProgramBuilder::new(0);
    let p = b.declare_param(TypeOpcode::Int4);
    let v = b.param(p);
    let ten = b.constant(Datum::Int4(10));
    let sum = b.func(FuncOpcode::Int4Pl, &[v, ten]);
    b.projection(&[("v", sum)]);
    let prog = b.build(&BuildOptions::default()).unwrap();

    assert!(KernContext::check_params(&prog, &[Datum::Int4(1)]).is_ok());
    assert!(KernContext::check_params(&prog, &[Datum::Text("1".into())]).is_err());
    assert!(KernContext::check_params(&prog, &[]).is_err());

    let params = [Datum::Int4(32)];
    let ctx = KernContext::host(&prog, &params);
    let mut kvars = ctx.new_kvars();
    assert_eq!(ctx.projection(&mut kvars).unwrap(), vec![Datum::Int4(42)]);
}

#[test]
fn hash_value_matches_host_hash() {
    let mut b = ProgramBuilder::new(1);
    b.load_vars(0, &[(1, 0, TypeOpcode::Int4)]);
    b.load_vars(1, &[(0, 1, TypeOpcode::Int4)]);
    let outer = b.var(0);
    let inner = b.var(1);
    let h = b.hash_value(&[outer]);
    b.hash_keys(1, h);
    let eq = b.func(FuncOpcode::Int4Eq, &[outer, inner]);
    b.join_quals(1, eq);
    b.projection(&[("k", outer)]);
    let prog = b.build(&BuildOptions::default()).unwrap();

    let ctx = KernContext::host(&prog, &[]);
    let mut kvars = ctx.new_kvars();
    kvars.set(0, Datum::Int4(6));
    assert_eq!(
        ctx.hash_value(1, &mut kvars).unwrap(),
        Some(hash_datums(&[Datum::Int4(6)]))
    );
    // depth 0 is the outer scan, never hashed
    assert_eq!(ctx.hash_value(0, &mut kvars).unwrap(), None);
}

#[test]
fn preagg_input_pairs_arguments_with_aggregates() {
    let mut b = ProgramBuilder::new(0);
    b.load_vars(0, &[(1, 0, TypeOpcode::Int4), (2, 1, TypeOpcode::Float8)]);
    let grp = b.var(0);
    let score = b.var(1);
    b.preagg(
        &[("grp", grp)],
        &[
            ("n", AggKind::CountStar, None),
            ("total", AggKind::Sum, Some(score)),
            ("hi", AggKind::Max, Some(score)),
        ],
    );
    let prog = b.build(&BuildOptions::default()).unwrap();

    let ctx = KernContext::host(&prog, &[]);
    let mut kvars = ctx.new_kvars();
    kvars.set(0, Datum::Int4(2));
    kvars.set(1, Datum::Float8(0.5));
    let input = ctx.preagg_input(&mut kvars).unwrap();
    assert_eq!(input.keys, vec![Datum::Int4(2)]);
    assert_eq!(
        input.args,
        vec![None, Some(Datum::Float8(0.5)), Some(Datum::Float8(0.5))]
    );
}
