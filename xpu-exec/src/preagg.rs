//! Per-warp pre-aggregation.
//!
//! A warp folds the rows reaching the last depth into a small local table of groups and
//! writes the table out as partial rows (`keys ++ partial states`) when it fills up, when
//! the warp finishes, or when it suspends. The host merges partial rows of every warp and
//! every launch with [`finalize_preagg`].

use std::cmp::Ordering;

use rustc_hash::FxHashMap;
use xpu_compute::{DevResult, datum_cmp};
use xpu_expr::{AggKind, ExprProgram, OpCode};
use xpu_kds::Kds;
use xpu_result::{DeviceError, Error, Result};
use xpu_types::codec::{WireReader, WireWriter};
use xpu_types::{Datum, DatumKey, TypeOpcode};

/// Shape of the pre-aggregation entry of a program.
#[derive(Debug, Clone, PartialEq)]
pub struct PreAggLayout {
    pub nkeys: usize,
    pub aggs: Vec<AggKind>,
    /// Argument type per aggregate; `None` for `COUNT(*)`.
    pub arg_types: Vec<Option<TypeOpcode>>,
}

impl PreAggLayout {
    pub fn from_program(program: &ExprProgram) -> Option<PreAggLayout> {
        let node = program.node(program.entries().preagg?)?;
        let OpCode::PreAgg { nkeys, aggs } = &node.opcode else {
            return None;
        };
        let args = program.args(node);
        let nkeys = *nkeys as usize;
        let mut next = nkeys;
        let mut arg_types = Vec::with_capacity(aggs.len());
        for agg in aggs {
            if agg.takes_argument() {
                arg_types.push(args.get(next).and_then(|&a| program.node(a)?.exptype));
                next += 1;
            } else {
                arg_types.push(None);
            }
        }
        Some(PreAggLayout {
            nkeys,
            aggs: aggs.clone(),
            arg_types,
        })
    }

    /// Partial state of an empty group.
    pub fn empty_partials(&self) -> Vec<Datum> {
        let mut out = Vec::new();
        for agg in &self.aggs {
            match agg {
                AggKind::CountStar | AggKind::Count => out.push(Datum::Int8(0)),
                AggKind::Sum | AggKind::Min | AggKind::Max => out.push(Datum::Null),
                AggKind::Avg => {
                    out.push(Datum::Int8(0));
                    out.push(Datum::Float8(0.0));
                }
            }
        }
        out
    }

    /// Fold one row's aggregate arguments into `partials`.
    pub fn accumulate(&self, partials: &mut [Datum], args: &[Option<Datum>]) -> DevResult<()> {
        let mut col = 0;
        for (agg, arg) in self.aggs.iter().zip(args) {
            let arg = arg.as_ref().filter(|a| !a.is_null());
            match agg {
                AggKind::CountStar => add_count(&mut partials[col], 1)?,
                AggKind::Count => add_count(&mut partials[col], arg.is_some() as i64)?,
                AggKind::Sum => {
                    if let Some(v) = arg {
                        partials[col] = sum_datum(&partials[col], v)?;
                    }
                }
                AggKind::Min | AggKind::Max => {
                    if let Some(v) = arg {
                        keep_extreme(&mut partials[col], v, *agg == AggKind::Max);
                    }
                }
                AggKind::Avg => {
                    if let Some(v) = arg {
                        add_count(&mut partials[col], 1)?;
                        let x = v.as_f64().or_else(|| v.as_i64().map(|i| i as f64));
                        let x = x.ok_or_else(|| {
                            DeviceError::fatal("preagg_avg", format!("non-numeric {v:?}"))
                        })?;
                        partials[col + 1] = sum_datum(&partials[col + 1], &Datum::Float8(x))?;
                    }
                    col += 1;
                }
            }
            col += 1;
        }
        Ok(())
    }

    /// Merge the partial state `from` into `into`.
    pub fn combine(&self, into: &mut [Datum], from: &[Datum]) -> DevResult<()> {
        let mut col = 0;
        for agg in &self.aggs {
            let width = if *agg == AggKind::Avg { 2 } else { 1 };
            for c in col..col + width {
                let src = &from[c];
                if src.is_null() {
                    continue;
                }
                match agg {
                    AggKind::Min | AggKind::Max => {
                        keep_extreme(&mut into[c], src, *agg == AggKind::Max)
                    }
                    _ => into[c] = sum_datum(&into[c], src)?,
                }
            }
            col += width;
        }
        Ok(())
    }

    /// Final aggregate values of a merged partial state.
    pub fn finish(&self, partials: &[Datum]) -> Vec<Datum> {
        let mut out = Vec::with_capacity(self.aggs.len());
        let mut col = 0;
        for agg in &self.aggs {
            match agg {
                AggKind::Avg => {
                    let n = partials[col].as_i64().unwrap_or(0);
                    let sum = partials[col + 1].as_f64().unwrap_or(0.0);
                    out.push(if n == 0 {
                        Datum::Null
                    } else {
                        Datum::Float8(sum / n as f64)
                    });
                    col += 2;
                }
                _ => {
                    out.push(partials[col].clone());
                    col += 1;
                }
            }
        }
        out
    }

    /// Width of a partial row.
    pub fn partial_width(&self) -> usize {
        self.nkeys
            + self
                .aggs
                .iter()
                .map(|a| if *a == AggKind::Avg { 2 } else { 1 })
                .sum::<usize>()
    }
}

fn add_count(slot: &mut Datum, n: i64) -> DevResult<()> {
    let cur = slot.as_i64().unwrap_or(0);
    let next = cur
        .checked_add(n)
        .ok_or_else(|| DeviceError::eval("preagg_count", "bigint out of range"))?;
    *slot = Datum::Int8(next);
    Ok(())
}

fn sum_datum(acc: &Datum, v: &Datum) -> DevResult<Datum> {
    if v.type_opcode().is_some_and(TypeOpcode::is_float) {
        let x = v.as_f64().unwrap_or(0.0);
        let cur = acc.as_f64().unwrap_or(0.0);
        let r = cur + x;
        if r.is_infinite() && cur.is_finite() && x.is_finite() {
            return Err(DeviceError::eval("preagg_sum", "value out of range: overflow"));
        }
        return Ok(Datum::Float8(r));
    }
    let x = v
        .as_i64()
        .ok_or_else(|| DeviceError::fatal("preagg_sum", format!("non-numeric {v:?}")))?;
    let cur = acc.as_i64().unwrap_or(0);
    cur.checked_add(x)
        .map(Datum::Int8)
        .ok_or_else(|| DeviceError::eval("preagg_sum", "bigint out of range"))
}

fn keep_extreme(slot: &mut Datum, v: &Datum, max: bool) {
    let replace = match datum_cmp(v, slot) {
        _ if slot.is_null() => true,
        Some(Ordering::Greater) => max,
        Some(Ordering::Less) => !max,
        _ => false,
    };
    if replace {
        *slot = v.clone();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Group {
    pub(crate) keys: Vec<Datum>,
    pub(crate) partials: Vec<Datum>,
}

/// Bounded group table of one warp.
#[derive(Debug, Clone, Default)]
pub struct GroupTable {
    index: FxHashMap<DatumKey, usize>,
    groups: Vec<Group>,
}

impl GroupTable {
    #[inline]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Partial state of the group `keys`, creating it if there is room for `capacity`
    /// groups. `None` means the table must be flushed first.
    pub(crate) fn entry(
        &mut self,
        keys: &[Datum],
        layout: &PreAggLayout,
        capacity: usize,
    ) -> Option<&mut Vec<Datum>> {
        let key = DatumKey(keys.to_vec());
        let idx = match self.index.get(&key) {
            Some(&idx) => idx,
            None if self.groups.len() >= capacity => return None,
            None => {
                self.groups.push(Group {
                    keys: keys.to_vec(),
                    partials: layout.empty_partials(),
                });
                self.index.insert(key, self.groups.len() - 1);
                self.groups.len() - 1
            }
        };
        Some(&mut self.groups[idx].partials)
    }

    /// Partial rows in table order.
    pub(crate) fn rows(&self) -> impl Iterator<Item = Vec<Datum>> + '_ {
        self.groups
            .iter()
            .map(|g| g.keys.iter().chain(&g.partials).cloned().collect())
    }

    /// Forget the first `n` groups once they have been written out.
    pub(crate) fn drain_front(&mut self, n: usize) {
        self.groups.drain(..n.min(self.groups.len()));
        self.index = self
            .groups
            .iter()
            .enumerate()
            .map(|(i, g)| (DatumKey(g.keys.clone()), i))
            .collect();
    }

    pub(crate) fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.put_u32(self.groups.len() as u32);
        for g in &self.groups {
            w.put_u16(g.keys.len() as u16);
            for k in &g.keys {
                w.put_datum(k)?;
            }
            w.put_u16(g.partials.len() as u16);
            for p in &g.partials {
                w.put_datum(p)?;
            }
        }
        Ok(())
    }

    pub(crate) fn decode(r: &mut WireReader<'_>) -> Result<GroupTable> {
        let n = r.get_u32()? as usize;
        let mut table = GroupTable::default();
        for _ in 0..n {
            let nkeys = r.get_u16()? as usize;
            let keys = (0..nkeys).map(|_| r.get_datum()).collect::<Result<Vec<_>>>()?;
            let np = r.get_u16()? as usize;
            let partials = (0..np).map(|_| r.get_datum()).collect::<Result<Vec<_>>>()?;
            table.groups.push(Group { keys, partials });
        }
        table.drain_front(0);
        Ok(table)
    }
}

/// Merge the partial rows of `chunks` and `extra_rows` into one final row per group:
/// the grouping keys followed by one value per aggregate.
pub fn finalize_preagg(
    program: &ExprProgram,
    chunks: &[Kds],
    extra_rows: &[Vec<Datum>],
) -> Result<Vec<Vec<Datum>>> {
    let layout = PreAggLayout::from_program(program)
        .ok_or_else(|| Error::InvalidArgumentError("program has no pre-aggregation".into()))?;
    let mut index: FxHashMap<DatumKey, usize> = FxHashMap::default();
    let mut groups: Vec<Group> = Vec::new();
    let mut merge = |row: &[Datum]| -> Result<()> {
        if row.len() != layout.partial_width() {
            return Err(Error::InvalidArgumentError(format!(
                "partial row has {} columns, expected {}",
                row.len(),
                layout.partial_width()
            )));
        }
        let (keys, partials) = row.split_at(layout.nkeys);
        let key = DatumKey(keys.to_vec());
        match index.get(&key) {
            Some(&i) => layout.combine(&mut groups[i].partials, partials)?,
            None => {
                index.insert(key, groups.len());
                groups.push(Group {
                    keys: keys.to_vec(),
                    partials: partials.to_vec(),
                });
            }
        }
        Ok(())
    };
    for chunk in chunks {
        for row in chunk.rows()? {
            merge(&row)?;
        }
    }
    for row in extra_rows {
        merge(row)?;
    }
    tracing::debug!("[PREAGG] finalized {} groups", groups.len());
    Ok(groups
        .into_iter()
        .map(|g| {
            let mut row = g.keys;
            row.extend(layout.finish(&g.partials));
            row
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PreAggLayout {
        PreAggLayout {
            nkeys: 1,
            aggs: vec![AggKind::CountStar, AggKind::Sum, AggKind::Max, AggKind::Avg],
            arg_types: vec![
                None,
                Some(TypeOpcode::Int4),
                Some(TypeOpcode::Int4),
                Some(TypeOpcode::Int4),
            ],
        }
    }

    fn args(v: Option<i32>) -> Vec<Option<Datum>> {
        let d = v.map_or(Datum::Null, Datum::Int4);
        vec![None, Some(d.clone()), Some(d.clone()), Some(d)]
    }

    #[test]
    fn accumulate_skips_nulls_except_count_star() {
        let l = layout();
        let mut p = l.empty_partials();
        for v in [Some(4), None, Some(10)] {
            l.accumulate(&mut p, &args(v)).unwrap();
        }
        assert_eq!(
            p,
            vec![
                Datum::Int8(3),
                Datum::Int8(14),
                Datum::Int4(10),
                Datum::Int8(2),
                Datum::Float8(14.0)
            ]
        );
        assert_eq!(
            l.finish(&p),
            vec![Datum::Int8(3), Datum::Int8(14), Datum::Int4(10), Datum::Float8(7.0)]
        );
    }

    #[test]
    fn combine_merges_partials() {
        let l = layout();
        let (mut a, mut b) = (l.empty_partials(), l.empty_partials());
        l.accumulate(&mut a, &args(Some(1))).unwrap();
        l.accumulate(&mut b, &args(Some(7))).unwrap();
        l.accumulate(&mut b, &args(None)).unwrap();
        l.combine(&mut a, &b).unwrap();
        assert_eq!(
            l.finish(&a),
            vec![Datum::Int8(3), Datum::Int8(8), Datum::Int4(7), Datum::Float8(4.0)]
        );
        // no non-null input at all
        let empty = l.empty_partials();
        assert_eq!(l.finish(&empty)[1..], [Datum::Null, Datum::Null, Datum::Null]);
    }

    #[test]
    fn integer_sum_overflow_is_an_eval_error() {
        let l = PreAggLayout {
            nkeys: 0,
            aggs: vec![AggKind::Sum],
            arg_types: vec![Some(TypeOpcode::Int8)],
        };
        let mut p = l.empty_partials();
        l.accumulate(&mut p, &[Some(Datum::Int8(i64::MAX))]).unwrap();
        let err = l.accumulate(&mut p, &[Some(Datum::Int8(1))]).unwrap_err();
        assert_eq!(err.message, "bigint out of range");
    }

    #[test]
    fn table_respects_capacity_and_drains() {
        let l = layout();
        let mut t = GroupTable::default();
        assert!(t.entry(&[Datum::Int4(1)], &l, 2).is_some());
        assert!(t.entry(&[Datum::Int4(2)], &l, 2).is_some());
        assert!(t.entry(&[Datum::Int4(3)], &l, 2).is_none());
        // existing groups stay reachable when full
        assert!(t.entry(&[Datum::Int8(1)], &l, 2).is_some());
        t.drain_front(1);
        assert_eq!(t.len(), 1);
        assert_eq!(t.rows().next().unwrap()[0], Datum::Int4(2));
        assert!(t.entry(&[Datum::Int4(3)], &l, 2).is_some());
    }
}
