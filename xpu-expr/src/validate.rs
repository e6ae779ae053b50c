use rustc_hash::FxHashMap;
use xpu_result::Result;
use xpu_types::{Datum, TypeOpcode};

use crate::catalog::FuncOpcode;
use crate::program::{AggKind, BuildOptions, ExprProgram, KexpNode, NodeId, OpCode, OpKind};

pub(crate) fn validate(prog: &ExprProgram, opts: &BuildOptions) -> Result<()> {
    let n_rels = prog.n_rels as usize;
    let e = &prog.entries;
    if e.load_vars.len() != n_rels + 1 || e.join_quals.len() != n_rels || e.hash_keys.len() != n_rels {
        return Err(ExprProgram::invalid(format!(
            "entry tables do not match {n_rels} inner relations"
        )));
    }
    if e.projection.is_some() == e.preagg.is_some() {
        return Err(ExprProgram::invalid(
            "exactly one of projection or pre-aggregation is required",
        ));
    }

    let mut slot_types: FxHashMap<u16, TypeOpcode> = FxHashMap::default();
    for (i, node) in prog.nodes.iter().enumerate() {
        let start = node.args_start as usize;
        let end = start + node.nargs as usize;
        if end > prog.args.len() {
            return Err(ExprProgram::invalid(format!("node {i}: argument range out of bounds")));
        }
        for &arg in &prog.args[start..end] {
            if arg.index() >= i {
                return Err(ExprProgram::invalid(format!(
                    "node {i}: argument {} does not precede it",
                    arg.0
                )));
            }
        }
        if let Some(slot) = node.kvar_slot {
            check_slot(prog, i, slot)?;
            if let Some(ty) = node.exptype {
                bind_slot(&mut slot_types, i, slot, ty)?;
            }
        }
        if let OpCode::LoadVars { loads, .. } = &node.opcode {
            for l in loads {
                check_slot(prog, i, l.slot)?;
                bind_slot(&mut slot_types, i, l.slot, l.type_op)?;
            }
        }
    }

    for (i, node) in prog.nodes.iter().enumerate() {
        check_node(prog, opts, &slot_types, i, node)?;
    }

    for (depth, entry) in e.load_vars.iter().enumerate() {
        if let Some(id) = *entry {
            match &node_of(prog, id)?.opcode {
                OpCode::LoadVars { depth: d, .. } if *d as usize == depth => {}
                _ => {
                    return Err(ExprProgram::invalid(format!(
                        "load-vars entry of depth {depth} is not a load for that depth"
                    )));
                }
            }
        }
    }
    let quals = e.scan_quals.iter().chain(e.join_quals.iter().flatten());
    for &id in quals {
        if node_of(prog, id)?.exptype != Some(TypeOpcode::Bool) {
            return Err(ExprProgram::invalid(format!("qualifier node {} is not boolean", id.0)));
        }
    }
    for &id in e.hash_keys.iter().flatten() {
        if node_of(prog, id)?.opcode.kind() != OpKind::HashValue {
            return Err(ExprProgram::invalid(format!("hash-key node {} is not a hash", id.0)));
        }
    }
    if let Some(id) = e.projection {
        if node_of(prog, id)?.opcode.kind() != OpKind::Projection {
            return Err(ExprProgram::invalid("projection entry is not a projection node"));
        }
    }
    if let Some(id) = e.preagg {
        if node_of(prog, id)?.opcode.kind() != OpKind::PreAgg {
            return Err(ExprProgram::invalid("pre-aggregation entry is not a pre-agg node"));
        }
    }
    Ok(())
}

fn node_of(prog: &ExprProgram, id: NodeId) -> Result<&KexpNode> {
    prog.node(id)
        .ok_or_else(|| ExprProgram::invalid(format!("entry refers to missing node {}", id.0)))
}

fn check_slot(prog: &ExprProgram, i: usize, slot: u16) -> Result<()> {
    if slot >= prog.nslots {
        return Err(ExprProgram::invalid(format!(
            "node {i}: kvars slot {slot} exceeds {} slots",
            prog.nslots
        )));
    }
    Ok(())
}

fn bind_slot(
    slot_types: &mut FxHashMap<u16, TypeOpcode>,
    i: usize,
    slot: u16,
    ty: TypeOpcode,
) -> Result<()> {
    match slot_types.insert(slot, ty) {
        Some(prev) if prev != ty => Err(ExprProgram::invalid(format!(
            "node {i}: kvars slot {slot} holds both {} and {}",
            prev.name(),
            ty.name()
        ))),
        _ => Ok(()),
    }
}

fn check_node(
    prog: &ExprProgram,
    opts: &BuildOptions,
    slot_types: &FxHashMap<u16, TypeOpcode>,
    i: usize,
    node: &KexpNode,
) -> Result<()> {
    let args = prog.args(node);
    let arg_types: Vec<Option<TypeOpcode>> = args
        .iter()
        .map(|&a| prog.nodes[a.index()].exptype)
        .collect();
    let fail = |msg: String| Err(ExprProgram::invalid(format!("node {i}: {msg}")));
    let scalar_args = || arg_types.iter().all(Option::is_some);

    match &node.opcode {
        OpCode::Var { slot } => {
            check_slot(prog, i, *slot)?;
            match (node.exptype, slot_types.get(slot)) {
                (None, _) => return fail("variable without a type".into()),
                (Some(ty), Some(&bound)) if ty != bound => {
                    return fail(format!(
                        "variable of type {} reads slot {slot} holding {}",
                        ty.name(),
                        bound.name()
                    ));
                }
                (_, None) => return fail(format!("slot {slot} is never written")),
                _ => {}
            }
        }
        OpCode::Const(datum) => match (node.exptype, datum) {
            (None, _) => return fail("constant without a type".into()),
            (Some(_), Datum::Null) => {}
            (Some(ty), d) => {
                if d.type_opcode() != Some(ty) {
                    return fail(format!("constant {d} declared as {}", ty.name()));
                }
            }
        },
        OpCode::Param { id } => match prog.params.get(*id as usize) {
            Some(&ty) if node.exptype == Some(ty) => {}
            Some(&ty) => return fail(format!("parameter {id} is declared {}", ty.name())),
            None => return fail(format!("parameter {id} is not declared")),
        },
        OpCode::Func(f) => check_func(opts, node, *f, &arg_types).map_err(|msg| {
            tracing::debug!("[KEXP] rejected {} at node {}: {}", f.name(), i, msg);
            ExprProgram::invalid(format!("node {i}: {msg}"))
        })?,
        OpCode::BoolAnd | OpCode::BoolOr => {
            if args.is_empty() || arg_types.iter().any(|t| *t != Some(TypeOpcode::Bool)) {
                return fail("boolean connective needs boolean arguments".into());
            }
            expect_type(node, TypeOpcode::Bool).or_else(fail)?;
        }
        OpCode::BoolNot => {
            if arg_types.as_slice() != [Some(TypeOpcode::Bool)] {
                return fail("NOT takes one boolean argument".into());
            }
            expect_type(node, TypeOpcode::Bool).or_else(fail)?;
        }
        OpCode::NullTest { .. } => {
            if args.len() != 1 || !scalar_args() {
                return fail("null test takes one scalar argument".into());
            }
            expect_type(node, TypeOpcode::Bool).or_else(fail)?;
        }
        OpCode::LoadVars { depth, .. } => {
            if *depth as usize > prog.n_rels as usize || !args.is_empty() {
                return fail(format!("load for depth {depth} is malformed"));
            }
        }
        OpCode::HashValue => {
            if args.is_empty() || !scalar_args() {
                return fail("hash needs scalar arguments".into());
            }
            expect_type(node, TypeOpcode::Int4).or_else(fail)?;
        }
        OpCode::Projection => {
            if args.is_empty() || !scalar_args() {
                return fail("projection needs scalar targets".into());
            }
        }
        OpCode::PreAgg { nkeys, aggs } => {
            let nkeys = *nkeys as usize;
            let with_arg = aggs.iter().filter(|a| a.takes_argument()).count();
            if nkeys + with_arg != args.len() || aggs.is_empty() || !scalar_args() {
                return fail("pre-aggregation arguments do not match its aggregates".into());
            }
            let mut next = nkeys;
            for agg in aggs.iter().filter(|a| a.takes_argument()) {
                let ty = arg_types[next];
                next += 1;
                let numeric = ty.is_some_and(TypeOpcode::is_numeric);
                if matches!(agg, AggKind::Sum | AggKind::Avg) && !numeric {
                    return fail(format!("{} needs a numeric argument", agg.name()));
                }
            }
        }
    }
    if !matches!(
        node.opcode,
        OpCode::LoadVars { .. } | OpCode::Projection | OpCode::PreAgg { .. }
    ) && node.exptype.is_none()
    {
        return fail("scalar node without a type".into());
    }
    Ok(())
}

fn expect_type(node: &KexpNode, ty: TypeOpcode) -> std::result::Result<(), String> {
    if node.exptype == Some(ty) {
        Ok(())
    } else {
        Err(format!("result must be {}", ty.name()))
    }
}

fn check_func(
    opts: &BuildOptions,
    node: &KexpNode,
    f: FuncOpcode,
    arg_types: &[Option<TypeOpcode>],
) -> std::result::Result<(), String> {
    let info = f.info();
    if info.is_variadic() {
        if arg_types.iter().any(|t| *t != Some(TypeOpcode::Text)) {
            return Err(format!("{} takes text arguments", info.name));
        }
    } else {
        let expected: Vec<Option<TypeOpcode>> = info.args.iter().copied().map(Some).collect();
        if arg_types != expected.as_slice() {
            return Err(format!(
                "{} expects ({}) but got ({})",
                info.name,
                info.args.iter().map(|t| t.name()).collect::<Vec<_>>().join(", "),
                arg_types
                    .iter()
                    .map(|t| t.map_or("?", TypeOpcode::name))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
    }
    if node.exptype != Some(info.result) {
        return Err(format!("{} returns {}", info.name, info.result.name()));
    }
    if !node.devkind.contains(opts.device) {
        return Err(format!(
            "{} is not available on the {} device",
            info.name,
            opts.device.name()
        ));
    }
    if node.locale_aware && !opts.allow_locale_aware {
        return Err(format!("{} depends on the collation locale", info.name));
    }
    Ok(())
}
