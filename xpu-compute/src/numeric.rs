//! Integer and floating point device routines.
//!
//! Integers are computed in `i128` and range-checked against the declared result type,
//! which covers every overflow case of the narrower types (including `MIN / -1`) with a
//! single check. Floats are computed in `f64` and narrowed; for `+ - * /` of narrower
//! operands this rounds exactly like native arithmetic of that width.

use half::f16;
use xpu_expr::{FuncInfo, FuncKind};
use xpu_result::DeviceError;
use xpu_types::{Datum, TypeOpcode};

pub(crate) const OVERFLOW: &str = "value out of range: overflow";
pub(crate) const UNDERFLOW: &str = "value out of range: underflow";
pub(crate) const DIVISION_BY_ZERO: &str = "division by zero";

pub(crate) fn int_value(info: &FuncInfo, d: &Datum) -> Result<i64, DeviceError> {
    d.as_i64().ok_or_else(|| mistyped(info, d))
}

pub(crate) fn float_value(info: &FuncInfo, d: &Datum) -> Result<f64, DeviceError> {
    d.as_f64().ok_or_else(|| mistyped(info, d))
}

#[track_caller]
pub(crate) fn mistyped(info: &FuncInfo, d: &Datum) -> DeviceError {
    DeviceError::fatal(info.name, format!("argument {d:?} does not match the catalog"))
}

/// Range-check `v` into integer type `ty`.
#[track_caller]
pub(crate) fn int_result(info: &FuncInfo, ty: TypeOpcode, v: i128) -> Result<Datum, DeviceError> {
    i64::try_from(v)
        .ok()
        .and_then(|v| Datum::from_i64(ty, v).ok())
        .ok_or_else(|| DeviceError::eval(info.name, ty.out_of_range_message()))
}

/// Narrow `v` into float type `ty`. Overflow is an error unless an input was infinite;
/// underflow to zero is an error unless `zero_ok`.
#[track_caller]
pub(crate) fn float_result(
    info: &FuncInfo,
    ty: TypeOpcode,
    v: f64,
    inf_ok: bool,
    zero_ok: bool,
) -> Result<Datum, DeviceError> {
    let (out, narrowed) = match ty {
        TypeOpcode::Float2 => {
            let h = f16::from_f64(v);
            (Datum::Float2(h), h.to_f64())
        }
        TypeOpcode::Float4 => {
            let f = v as f32;
            (Datum::Float4(f), f as f64)
        }
        _ => (Datum::Float8(v), v),
    };
    if narrowed.is_infinite() && !inf_ok {
        return Err(DeviceError::eval(info.name, OVERFLOW));
    }
    if narrowed == 0.0 && !zero_ok {
        return Err(DeviceError::eval(info.name, UNDERFLOW));
    }
    Ok(out)
}

pub(crate) fn int_op(info: &FuncInfo, args: &[Datum]) -> Result<Datum, DeviceError> {
    let ty = info.result;
    let a = i128::from(int_value(info, &args[0])?);
    let b = match args.get(1) {
        Some(d) => i128::from(int_value(info, d)?),
        None => 0,
    };
    let v = match info.kind {
        FuncKind::Add => a + b,
        FuncKind::Sub => a - b,
        FuncKind::Mul => a * b,
        FuncKind::Div => {
            if b == 0 {
                return Err(DeviceError::eval(info.name, DIVISION_BY_ZERO));
            }
            a / b
        }
        FuncKind::Mod => {
            if b == 0 {
                return Err(DeviceError::eval(info.name, DIVISION_BY_ZERO));
            }
            // INT_MIN % -1 traps in hardware; the answer is always zero
            if b == -1 { 0 } else { a % b }
        }
        FuncKind::Neg => -a,
        FuncKind::UPlus => a,
        FuncKind::Abs => a.abs(),
        FuncKind::BitAnd => a & b,
        FuncKind::BitOr => a | b,
        FuncKind::BitXor => a ^ b,
        FuncKind::BitNot => !a,
        FuncKind::Shl | FuncKind::Shr => return shift(info, a as i64, b as i64),
        _ => return Err(DeviceError::unsupported(info.name, u32::from(u16::from(info.opcode)))),
    };
    int_result(info, ty, v)
}

/// Shift counts are masked to the operand width, as the hardware does.
fn shift(info: &FuncInfo, a: i64, count: i64) -> Result<Datum, DeviceError> {
    let left = info.kind == FuncKind::Shl;
    let n = count as u32;
    let out = match info.result {
        TypeOpcode::Int1 => {
            let v = a as i8;
            Datum::Int1(if left { v.wrapping_shl(n) } else { v.wrapping_shr(n) })
        }
        TypeOpcode::Int2 => {
            let v = a as i16;
            Datum::Int2(if left { v.wrapping_shl(n) } else { v.wrapping_shr(n) })
        }
        TypeOpcode::Int4 => {
            let v = a as i32;
            Datum::Int4(if left { v.wrapping_shl(n) } else { v.wrapping_shr(n) })
        }
        _ => Datum::Int8(if left { a.wrapping_shl(n) } else { a.wrapping_shr(n) }),
    };
    Ok(out)
}

pub(crate) fn float_op(info: &FuncInfo, args: &[Datum]) -> Result<Datum, DeviceError> {
    let ty = info.result;
    let a = float_value(info, &args[0])?;
    let b = match args.get(1) {
        Some(d) => float_value(info, d)?,
        None => 0.0,
    };
    let any_inf = a.is_infinite() || b.is_infinite();
    match info.kind {
        FuncKind::Add => float_result(info, ty, a + b, any_inf, true),
        FuncKind::Sub => float_result(info, ty, a - b, any_inf, true),
        FuncKind::Mul => float_result(info, ty, a * b, any_inf, a == 0.0 || b == 0.0),
        FuncKind::Div => {
            if b == 0.0 && !a.is_nan() {
                return Err(DeviceError::eval(info.name, DIVISION_BY_ZERO));
            }
            float_result(info, ty, a / b, a.is_infinite(), a == 0.0 || b.is_infinite())
        }
        FuncKind::Neg => float_result(info, ty, -a, true, true),
        FuncKind::UPlus => float_result(info, ty, a, true, true),
        FuncKind::Abs => float_result(info, ty, a.abs(), true, true),
        _ => Err(DeviceError::unsupported(info.name, u32::from(u16::from(info.opcode)))),
    }
}

/// Type conversions listed in the catalog.
pub(crate) fn cast(info: &FuncInfo, arg: &Datum) -> Result<Datum, DeviceError> {
    let to = info.result;
    let from = info.args[0];
    match (from, to) {
        (TypeOpcode::Bool, _) => {
            let v = arg.as_bool().ok_or_else(|| mistyped(info, arg))?;
            int_result(info, to, i128::from(v as i64))
        }
        (_, TypeOpcode::Bool) => Ok(Datum::Bool(int_value(info, arg)? != 0)),
        (f, t) if f.is_integer() && t.is_integer() => {
            int_result(info, t, i128::from(int_value(info, arg)?))
        }
        (f, t) if f.is_integer() && t.is_float() => {
            float_result(info, t, int_value(info, arg)? as f64, false, true)
        }
        (f, t) if f.is_float() && t.is_integer() => {
            let v = float_value(info, arg)?;
            float_to_int(info, t, v)
        }
        (f, t) if f.is_float() && t.is_float() => {
            let v = float_value(info, arg)?;
            float_result(info, t, v, v.is_infinite() || v.is_nan(), v == 0.0)
        }
        _ => Err(DeviceError::unsupported(info.name, u32::from(u16::from(info.opcode)))),
    }
}

/// Round half to even, then require the result to lie in `[MIN, -MIN)` of the target.
fn float_to_int(info: &FuncInfo, ty: TypeOpcode, v: f64) -> Result<Datum, DeviceError> {
    let out_of_range = || DeviceError::eval(info.name, ty.out_of_range_message());
    let (min, _) = ty.int_range().ok_or_else(out_of_range)?;
    let r = v.round_ties_even();
    let lo = min as f64;
    if r.is_nan() || r < lo || r >= -lo {
        return Err(out_of_range());
    }
    int_result(info, ty, r as i128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpu_expr::FuncOpcode;
    use xpu_result::ErrorCode;

    fn call(f: FuncOpcode, args: &[Datum]) -> Result<Datum, DeviceError> {
        let info = f.info();
        match info.kind {
            FuncKind::Cast => cast(info, &args[0]),
            _ if info.result.is_integer() => int_op(info, args),
            _ => float_op(info, args),
        }
    }

    fn message(r: Result<Datum, DeviceError>) -> String {
        let err = r.unwrap_err();
        assert_eq!(err.code, ErrorCode::ExpressionEval);
        err.message
    }

    #[test]
    fn integer_overflow_messages_follow_the_result_type() {
        assert_eq!(
            message(call(FuncOpcode::Int4Pl, &[Datum::Int4(i32::MAX), Datum::Int4(1)])),
            "integer out of range"
        );
        assert_eq!(
            message(call(FuncOpcode::Int2Mul, &[Datum::Int2(300), Datum::Int2(300)])),
            "smallint out of range"
        );
        assert_eq!(
            message(call(FuncOpcode::Int8Mi, &[Datum::Int8(i64::MIN), Datum::Int8(1)])),
            "bigint out of range"
        );
        assert_eq!(
            message(call(FuncOpcode::Int1Pl, &[Datum::Int1(100), Datum::Int1(100)])),
            "tinyint out of range"
        );
        // mixed widths promote to the wider operand
        assert_eq!(
            call(FuncOpcode::Int48Pl, &[Datum::Int4(i32::MAX), Datum::Int8(1)]).unwrap(),
            Datum::Int8(i32::MAX as i64 + 1)
        );
    }

    #[test]
    fn division_rules() {
        assert_eq!(
            message(call(FuncOpcode::Int4Div, &[Datum::Int4(1), Datum::Int4(0)])),
            "division by zero"
        );
        assert_eq!(
            message(call(FuncOpcode::Int4Div, &[Datum::Int4(i32::MIN), Datum::Int4(-1)])),
            "integer out of range"
        );
        assert_eq!(
            call(FuncOpcode::Int4Mod, &[Datum::Int4(i32::MIN), Datum::Int4(-1)]).unwrap(),
            Datum::Int4(0)
        );
        assert_eq!(
            call(FuncOpcode::Int4Div, &[Datum::Int4(-7), Datum::Int4(2)]).unwrap(),
            Datum::Int4(-3)
        );
        assert_eq!(
            call(FuncOpcode::Int4Mod, &[Datum::Int4(-7), Datum::Int4(2)]).unwrap(),
            Datum::Int4(-1)
        );
    }

    #[test]
    fn unary_minimum_overflows() {
        assert!(call(FuncOpcode::Int8Um, &[Datum::Int8(i64::MIN)]).is_err());
        assert!(call(FuncOpcode::Int2Abs, &[Datum::Int2(i16::MIN)]).is_err());
        assert_eq!(
            call(FuncOpcode::Int4Abs, &[Datum::Int4(-5)]).unwrap(),
            Datum::Int4(5)
        );
    }

    #[test]
    fn shifts_mask_the_count() {
        assert_eq!(
            call(FuncOpcode::Int4Shl, &[Datum::Int4(1), Datum::Int4(33)]).unwrap(),
            Datum::Int4(2)
        );
        assert_eq!(
            call(FuncOpcode::Int4Shr, &[Datum::Int4(-8), Datum::Int4(1)]).unwrap(),
            Datum::Int4(-4)
        );
    }

    #[test]
    fn float_overflow_and_underflow() {
        assert_eq!(
            message(call(FuncOpcode::Float8Mul, &[Datum::Float8(1e300), Datum::Float8(1e300)])),
            OVERFLOW
        );
        assert_eq!(
            message(call(FuncOpcode::Float8Mul, &[Datum::Float8(1e-300), Datum::Float8(1e-300)])),
            UNDERFLOW
        );
        assert_eq!(
            message(call(FuncOpcode::Float4Pl, &[Datum::Float4(f32::MAX), Datum::Float4(f32::MAX)])),
            OVERFLOW
        );
        assert_eq!(
            message(call(FuncOpcode::Float8Div, &[Datum::Float8(1.0), Datum::Float8(0.0)])),
            DIVISION_BY_ZERO
        );
        // infinite inputs may produce infinite results
        assert_eq!(
            call(FuncOpcode::Float8Pl, &[Datum::Float8(f64::INFINITY), Datum::Float8(1.0)]).unwrap(),
            Datum::Float8(f64::INFINITY)
        );
        let nan = call(FuncOpcode::Float8Div, &[Datum::Float8(f64::NAN), Datum::Float8(0.0)]).unwrap();
        assert!(nan.as_f64().unwrap().is_nan());
    }

    #[test]
    fn float_to_int_rounds_half_even_and_range_checks() {
        let c = |v: f64| call(FuncOpcode::Float8ToInt4, &[Datum::Float8(v)]);
        assert_eq!(c(2.5).unwrap(), Datum::Int4(2));
        assert_eq!(c(3.5).unwrap(), Datum::Int4(4));
        assert_eq!(c(-2.5).unwrap(), Datum::Int4(-2));
        assert_eq!(c(-2147483648.4).unwrap(), Datum::Int4(i32::MIN));
        assert_eq!(message(c(2147483647.5)), "integer out of range");
        assert_eq!(message(c(f64::NAN)), "integer out of range");
        assert_eq!(
            message(call(FuncOpcode::Float8ToInt8, &[Datum::Float8(9.3e18)])),
            "bigint out of range"
        );
    }

    #[test]
    fn narrowing_float_casts_check_range() {
        assert_eq!(
            message(call(FuncOpcode::Float8ToFloat4, &[Datum::Float8(1e300)])),
            OVERFLOW
        );
        assert_eq!(
            message(call(FuncOpcode::Float8ToFloat4, &[Datum::Float8(1e-300)])),
            UNDERFLOW
        );
        assert_eq!(
            call(FuncOpcode::Float8ToFloat2, &[Datum::Float8(0.5)]).unwrap(),
            Datum::Float2(f16::from_f32(0.5))
        );
        assert_eq!(
            message(call(FuncOpcode::Float8ToFloat2, &[Datum::Float8(1e6)])),
            OVERFLOW
        );
    }

    #[test]
    fn bool_int_casts() {
        assert_eq!(
            call(FuncOpcode::Int4ToBool, &[Datum::Int4(-3)]).unwrap(),
            Datum::Bool(true)
        );
        assert_eq!(
            call(FuncOpcode::BoolToInt4, &[Datum::Bool(true)]).unwrap(),
            Datum::Int4(1)
        );
        assert_eq!(
            message(call(FuncOpcode::Int8ToInt2, &[Datum::Int8(40_000)])),
            "smallint out of range"
        );
    }
}
