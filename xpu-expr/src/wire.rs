//! Program wire image.
//!
//! ```text
//! u32  magic "XKEX"
//! u16  version
//! u16  n_rels
//! u16  nslots
//! u16  nparams, then one type byte per parameter, padded to 4
//! u32  nnodes, then per node:
//!        u16 kind, u8 exptype (0 = none), u8 devkind, u8 flags, u8 pad,
//!        u16 kvar_slot, u16 nargs, u32 arg * nargs, kind payload
//! u32  entry ids (u32::MAX = none): load_vars[n_rels + 1], scan_quals,
//!        join_quals[n_rels], hash_keys[n_rels], projection, preagg
//! u16  noutputs, then length-prefixed output names
//! ```
//!
//! Function opcodes travel as their catalog id. A reader that does not know an id fails
//! with [`Error::UnsupportedOpcode`] rather than guessing.

use xpu_result::{Error, Result};
use xpu_types::TypeOpcode;
use xpu_types::codec::{WireReader, WireWriter};

use crate::catalog::{DevKind, FuncOpcode};
use crate::program::{
    AggKind, BuildOptions, ExprProgram, KexpNode, NodeId, OpCode, OpKind, ProgramEntries, VarLoad,
};

pub const KEXP_MAGIC: u32 = u32::from_le_bytes(*b"XKEX");
pub const KEXP_VERSION: u16 = 1;

const FLAG_LOCALE_AWARE: u8 = 0x01;
const FLAG_MEMOISED: u8 = 0x02;

fn put_entry(w: &mut WireWriter, id: Option<NodeId>) {
    w.put_u32(id.map_or(NodeId::NONE, |n| n.0));
}

fn get_entry(r: &mut WireReader<'_>) -> Result<Option<NodeId>> {
    let raw = r.get_u32()?;
    Ok((raw != NodeId::NONE).then_some(NodeId(raw)))
}

impl ExprProgram {
    /// Serialize into the opaque buffer shipped to the device.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        w.put_u32(KEXP_MAGIC);
        w.put_u16(KEXP_VERSION);
        w.put_u16(self.n_rels);
        w.put_u16(self.nslots);
        w.put_u16(self.params.len() as u16);
        for &p in &self.params {
            w.put_u8(u8::from(p));
        }
        w.pad_to(4);

        w.put_u32(self.nodes.len() as u32);
        for node in &self.nodes {
            w.put_u16(u16::from(node.opcode.kind()));
            w.put_u8(node.exptype.map_or(0, u8::from));
            w.put_u8(node.devkind.bits());
            let mut flags = 0;
            if node.locale_aware {
                flags |= FLAG_LOCALE_AWARE;
            }
            if node.kvar_slot.is_some() {
                flags |= FLAG_MEMOISED;
            }
            w.put_u8(flags);
            w.put_u8(0);
            w.put_u16(node.kvar_slot.unwrap_or(0));
            w.put_u16(node.nargs);
            for arg in self.args(node) {
                w.put_u32(arg.0);
            }
            match &node.opcode {
                OpCode::Var { slot } => w.put_u16(*slot),
                OpCode::Const(datum) => w.put_datum(datum)?,
                OpCode::Param { id } => w.put_u16(*id),
                OpCode::Func(f) => w.put_u16(u16::from(*f)),
                OpCode::NullTest { is_null } => w.put_u8(*is_null as u8),
                OpCode::LoadVars { depth, loads } => {
                    w.put_u16(*depth);
                    w.put_u16(loads.len() as u16);
                    for l in loads {
                        w.put_u16(l.column);
                        w.put_u16(l.slot);
                        w.put_u8(u8::from(l.type_op));
                    }
                }
                OpCode::PreAgg { nkeys, aggs } => {
                    w.put_u16(*nkeys);
                    w.put_u16(aggs.len() as u16);
                    for &a in aggs {
                        w.put_u8(u8::from(a));
                    }
                }
                OpCode::BoolAnd
                | OpCode::BoolOr
                | OpCode::BoolNot
                | OpCode::HashValue
                | OpCode::Projection => {}
            }
            w.pad_to(4);
        }

        let e = &self.entries;
        for &id in &e.load_vars {
            put_entry(&mut w, id);
        }
        put_entry(&mut w, e.scan_quals);
        for &id in &e.join_quals {
            put_entry(&mut w, id);
        }
        for &id in &e.hash_keys {
            put_entry(&mut w, id);
        }
        put_entry(&mut w, e.projection);
        put_entry(&mut w, e.preagg);

        w.put_u16(self.output_names.len() as u16);
        for name in &self.output_names {
            w.put_blob(name.as_bytes());
        }
        Ok(w.into_inner())
    }

    /// Rebuild a program from its wire image and validate it against `opts`.
    pub fn decode(bytes: &[u8], opts: &BuildOptions) -> Result<ExprProgram> {
        let mut r = WireReader::new(bytes, "expression program");
        if r.get_u32()? != KEXP_MAGIC {
            return Err(r.corrupt("bad magic"));
        }
        let version = r.get_u16()?;
        if version != KEXP_VERSION {
            return Err(r.corrupt(format!("unsupported version {version}")));
        }
        let n_rels = r.get_u16()?;
        let nslots = r.get_u16()?;
        let nparams = r.get_u16()? as usize;
        let mut params = Vec::with_capacity(nparams);
        for _ in 0..nparams {
            params.push(r.get_type()?);
        }
        r.skip_to_align(4)?;

        let nnodes = r.get_u32()? as usize;
        // every node takes at least 12 bytes; refuse absurd counts before allocating
        if nnodes > r.remaining() / 12 {
            return Err(r.corrupt(format!("{nnodes} nodes cannot fit")));
        }
        let mut nodes = Vec::with_capacity(nnodes);
        let mut args = Vec::new();
        for _ in 0..nnodes {
            let raw_kind = r.get_u16()?;
            let kind = OpKind::try_from(raw_kind)
                .map_err(|_| Error::UnsupportedOpcode(u32::from(raw_kind)))?;
            let raw_type = r.get_u8()?;
            let exptype = match raw_type {
                0 => None,
                t => Some(
                    TypeOpcode::try_from(t)
                        .map_err(|_| r.corrupt(format!("unknown result type {t}")))?,
                ),
            };
            let devkind = DevKind::from_bits(r.get_u8()?);
            let flags = r.get_u8()?;
            let _pad = r.get_u8()?;
            let slot = r.get_u16()?;
            let nargs = r.get_u16()?;
            let args_start = args.len() as u32;
            for _ in 0..nargs {
                args.push(NodeId(r.get_u32()?));
            }
            let opcode = match kind {
                OpKind::Var => OpCode::Var { slot: r.get_u16()? },
                OpKind::Const => OpCode::Const(r.get_datum()?),
                OpKind::Param => OpCode::Param { id: r.get_u16()? },
                OpKind::Func => {
                    let id = r.get_u16()?;
                    let f = FuncOpcode::try_from(id)
                        .map_err(|_| Error::UnsupportedOpcode(u32::from(id)))?;
                    OpCode::Func(f)
                }
                OpKind::BoolAnd => OpCode::BoolAnd,
                OpKind::BoolOr => OpCode::BoolOr,
                OpKind::BoolNot => OpCode::BoolNot,
                OpKind::NullTest => OpCode::NullTest {
                    is_null: r.get_u8()? != 0,
                },
                OpKind::LoadVars => {
                    let depth = r.get_u16()?;
                    let n = r.get_u16()?;
                    let mut loads = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        let column = r.get_u16()?;
                        let slot = r.get_u16()?;
                        let type_op = r.get_type()?;
                        loads.push(VarLoad {
                            column,
                            slot,
                            type_op,
                        });
                    }
                    OpCode::LoadVars { depth, loads }
                }
                OpKind::HashValue => OpCode::HashValue,
                OpKind::Projection => OpCode::Projection,
                OpKind::PreAgg => {
                    let nkeys = r.get_u16()?;
                    let n = r.get_u16()?;
                    let mut aggs = Vec::with_capacity(n as usize);
                    for _ in 0..n {
                        let raw = r.get_u8()?;
                        aggs.push(
                            AggKind::try_from(raw)
                                .map_err(|_| r.corrupt(format!("unknown aggregate {raw}")))?,
                        );
                    }
                    OpCode::PreAgg { nkeys, aggs }
                }
            };
            r.skip_to_align(4)?;
            nodes.push(KexpNode {
                opcode,
                exptype,
                devkind,
                locale_aware: flags & FLAG_LOCALE_AWARE != 0,
                kvar_slot: (flags & FLAG_MEMOISED != 0).then_some(slot),
                args_start,
                nargs,
            });
        }

        let n = n_rels as usize;
        let mut entries = ProgramEntries::default();
        for _ in 0..=n {
            entries.load_vars.push(get_entry(&mut r)?);
        }
        entries.scan_quals = get_entry(&mut r)?;
        for _ in 0..n {
            entries.join_quals.push(get_entry(&mut r)?);
        }
        for _ in 0..n {
            entries.hash_keys.push(get_entry(&mut r)?);
        }
        entries.projection = get_entry(&mut r)?;
        entries.preagg = get_entry(&mut r)?;

        let noutputs = r.get_u16()?;
        let mut output_names = Vec::with_capacity(noutputs as usize);
        for _ in 0..noutputs {
            let raw = r.get_blob()?;
            let name = std::str::from_utf8(raw)
                .map_err(|e| r.corrupt(format!("output name: {e}")))?;
            output_names.push(name.to_string());
        }
        if !r.is_empty() {
            return Err(r.corrupt(format!("{} trailing bytes", r.remaining())));
        }

        let prog = ExprProgram {
            nodes,
            args,
            entries,
            params,
            output_names,
            n_rels,
            nslots,
        };
        prog.validate(opts)?;
        Ok(prog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;
    use xpu_types::Datum;

    fn join_program() -> ExprProgram {
        let mut b = ProgramBuilder::new(1);
        let p = b.declare_param(TypeOpcode::Int8);
        b.load_vars(0, &[(0, 0, TypeOpcode::Int8), (1, 1, TypeOpcode::Text)]);
        b.load_vars(1, &[(0, 2, TypeOpcode::Int8)]);
        let k = b.var(0);
        let s = b.var(1);
        let ik = b.var(2);
        let lim = b.param(p);
        let lt = b.func(FuncOpcode::Int8Lt, &[k, lim]);
        let nn = b.null_test(s, false);
        let qual = b.and(&[lt, nn]);
        b.scan_quals(qual);
        let h = b.hash_value(&[k]);
        b.hash_keys(1, h);
        let eq = b.func(FuncOpcode::Int8Eq, &[k, ik]);
        b.join_quals(1, eq);
        let bang = b.constant(Datum::Text("!".into()));
        let cat = b.func(FuncOpcode::TextCat, &[s, bang]);
        b.memoize(cat, 3);
        b.projection(&[("k", k), ("loud", cat)]);
        b.build(&BuildOptions::default()).unwrap()
    }

    #[test]
    fn encode_decode_preserves_program() {
        let prog = join_program();
        let bytes = prog.encode().unwrap();
        let back = ExprProgram::decode(&bytes, &BuildOptions::default()).unwrap();
        assert_eq!(back, prog);
        assert_eq!(back.encode().unwrap(), bytes);
    }

    #[test]
    fn unknown_function_id_is_unsupported() {
        let mut b = ProgramBuilder::new(0);
        let empty = b.func(FuncOpcode::Concat, &[]);
        b.projection(&[("s", empty)]);
        let mut bytes = b.build(&BuildOptions::default()).unwrap().encode().unwrap();
        // 12 byte preamble, u32 node count, 10 byte node header, then the function id
        assert_eq!(&bytes[26..28], &u16::from(FuncOpcode::Concat).to_le_bytes());
        bytes[26..28].copy_from_slice(&9999u16.to_le_bytes());
        assert!(matches!(
            ExprProgram::decode(&bytes, &BuildOptions::default()),
            Err(Error::UnsupportedOpcode(9999))
        ));
    }

    #[test]
    fn truncated_or_foreign_buffers_are_corrupt() {
        let bytes = join_program().encode().unwrap();
        assert!(matches!(
            ExprProgram::decode(&bytes[..bytes.len() - 3], &BuildOptions::default()),
            Err(Error::Corrupt { .. })
        ));
        let mut bad = bytes.clone();
        bad[0] = b'Z';
        assert!(matches!(
            ExprProgram::decode(&bad, &BuildOptions::default()),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn decode_revalidates_against_the_device() {
        let mut b = ProgramBuilder::new(0);
        b.load_vars(0, &[(0, 0, TypeOpcode::Float2)]);
        let h = b.var(0);
        let neg = b.func(FuncOpcode::Float2Um, &[h]);
        b.projection(&[("h", neg)]);
        let bytes = b.build(&BuildOptions::default()).unwrap().encode().unwrap();
        let dpu = BuildOptions {
            device: DevKind::DPU,
            allow_locale_aware: false,
        };
        assert!(matches!(
            ExprProgram::decode(&bytes, &dpu),
            Err(Error::InvalidProgram(_))
        ));
    }
}
