use std::cmp::Ordering;

use xpu_expr::{FuncInfo, FuncKind};
use xpu_result::DeviceError;
use xpu_types::Datum;

use crate::numeric::mistyped;

/// Float ordering used by every comparison operator: NaN equals NaN and sorts above every
/// other value, `-0.0` equals `0.0`.
pub fn float_cmp(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Order two non-null values of comparable types.
pub fn datum_cmp(a: &Datum, b: &Datum) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return Some(float_cmp(x, y));
    }
    match (a, b) {
        (Datum::Bool(x), Datum::Bool(y)) => Some(x.cmp(y)),
        (Datum::Text(x), Datum::Text(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        (Datum::Bytea(x), Datum::Bytea(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

pub(crate) fn compare(info: &FuncInfo, a: &Datum, b: &Datum) -> Result<Datum, DeviceError> {
    let ord = datum_cmp(a, b).ok_or_else(|| mistyped(info, a))?;
    let v = match info.kind {
        FuncKind::Eq => ord == Ordering::Equal,
        FuncKind::Ne => ord != Ordering::Equal,
        FuncKind::Lt => ord == Ordering::Less,
        FuncKind::Le => ord != Ordering::Greater,
        FuncKind::Gt => ord == Ordering::Greater,
        FuncKind::Ge => ord != Ordering::Less,
        _ => return Err(DeviceError::unsupported(info.name, u32::from(u16::from(info.opcode)))),
    };
    Ok(Datum::Bool(v))
}
