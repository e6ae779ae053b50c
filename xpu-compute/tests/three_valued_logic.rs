//! Boolean connectives and null tests over every combination of TRUE, FALSE and NULL.

use xpu_compute::KernContext;
use xpu_expr::{BuildOptions, NodeId, ProgramBuilder};
use xpu_types::{Datum, TypeOpcode};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tri {
    T,
    F,
    N,
}

use Tri::*;

const ALL: [Tri; 3] = [T, F, N];

impl Tri {
    fn datum(self) -> Datum {
        match self {
            T => Datum::Bool(true),
            F => Datum::Bool(false),
            N => Datum::Null,
        }
    }

    fn node(self, b: &mut ProgramBuilder) -> NodeId {
        match self {
            N => b.const_null(TypeOpcode::Bool),
            v => b.constant(v.datum()),
        }
    }
}

fn truth_and(a: Tri, b: Tri) -> Tri {
    match (a, b) {
        (F, _) | (_, F) => F,
        (T, T) => T,
        _ => N,
    }
}

fn truth_or(a: Tri, b: Tri) -> Tri {
    match (a, b) {
        (T, _) | (_, T) => T,
        (F, F) => F,
        _ => N,
    }
}

/// Evaluate the single projection target `build` produces.
fn eval_one(build: impl FnOnce(&mut ProgramBuilder) -> NodeId) -> Datum {
    let mut b = ProgramBuilder::new(0);
    let node = build(&mut b);
    b.projection(&[("v", node)]);
    let prog = b.build(&BuildOptions::default()).unwrap();
    let ctx = KernContext::host(&prog, &[]);
    let mut kvars = ctx.new_kvars();
    let mut out = ctx.projection(&mut kvars).unwrap();
    out.remove(0)
}

#[test]
fn and_or_truth_tables() {
    for a in ALL {
        for c in ALL {
            let got = eval_one(|b| {
                let (x, y) = (a.node(b), c.node(b));
                b.and(&[x, y])
            });
            assert_eq!(got, truth_and(a, c).datum(), "{a:?} AND {c:?}");
            let got = eval_one(|b| {
                let (x, y) = (a.node(b), c.node(b));
                b.or(&[x, y])
            });
            assert_eq!(got, truth_or(a, c).datum(), "{a:?} OR {c:?}");
        }
    }
}

#[test]
fn variadic_connectives_fold_left() {
    for a in ALL {
        for c in ALL {
            for d in ALL {
                let got = eval_one(|b| {
                    let args = [a.node(b), c.node(b), d.node(b)];
                    b.and(&args)
                });
                assert_eq!(got, truth_and(truth_and(a, c), d).datum());
                let got = eval_one(|b| {
                    let args = [a.node(b), c.node(b), d.node(b)];
                    b.or(&args)
                });
                assert_eq!(got, truth_or(truth_or(a, c), d).datum());
            }
        }
    }
}

#[test]
fn not_and_null_tests() {
    for a in ALL {
        let expected = match a {
            T => F,
            F => T,
            N => N,
        };
        let negated = eval_one(|b| {
            let x = a.node(b);
            b.not(x)
        });
        assert_eq!(negated, expected.datum());
        let is_null = eval_one(|b| {
            let x = a.node(b);
            b.null_test(x, true)
        });
        assert_eq!(is_null, Datum::Bool(a == N));
        let is_not_null = eval_one(|b| {
            let x = a.node(b);
            b.null_test(x, false)
        });
        assert_eq!(is_not_null, Datum::Bool(a != N));
    }
}

#[test]
fn short_circuit_skips_failing_operands() {
    // 1 / 0 raises, but AND stops at the FALSE before it
    let got = eval_one(|b| {
        let f = b.constant(Datum::Bool(false));
        let one = b.constant(Datum::Int4(1));
        let zero = b.constant(Datum::Int4(0));
        let div = b.func(xpu_expr::FuncOpcode::Int4Div, &[one, zero]);
        let cmp = b.func(xpu_expr::FuncOpcode::Int4Eq, &[div, one]);
        b.and(&[f, cmp])
    });
    assert_eq!(got, Datum::Bool(false));
}

#[test]
fn null_qualifier_rejects_the_row() {
    let mut b = ProgramBuilder::new(0);
    let n = b.const_null(TypeOpcode::Bool);
    b.scan_quals(n);
    b.projection(&[("n", n)]);
    let prog = b.build(&BuildOptions::default()).unwrap();
    let ctx = KernContext::host(&prog, &[]);
    let mut kvars = ctx.new_kvars();
    assert!(!ctx.eval_qual(prog.entries().scan_quals, &mut kvars).unwrap());
    assert!(ctx.eval_qual(None, &mut kvars).unwrap());
}
