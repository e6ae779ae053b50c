//! String routines: pattern matching, concatenation, length.

use xpu_expr::{FuncInfo, FuncKind};
use xpu_result::DeviceError;
use xpu_types::Datum;

use crate::numeric::mistyped;

const ESCAPE_AT_END: &str = "LIKE pattern must not end with escape character";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    True,
    False,
    /// The text ran out before the pattern; no later starting point can match either.
    Abort,
}

/// Units a pattern is made of: `char` for text, `u8` for bytea.
trait PatternUnit: Copy + PartialEq {
    const PERCENT: Self;
    const UNDERSCORE: Self;
    const ESCAPE: Self;
}

impl PatternUnit for char {
    const PERCENT: char = '%';
    const UNDERSCORE: char = '_';
    const ESCAPE: char = '\\';
}

impl PatternUnit for u8 {
    const PERCENT: u8 = b'%';
    const UNDERSCORE: u8 = b'_';
    const ESCAPE: u8 = b'\\';
}

fn like_match<T: PatternUnit>(t: &[T], p: &[T]) -> Result<Match, &'static str> {
    let (mut ti, mut pi) = (0, 0);
    while ti < t.len() && pi < p.len() {
        let pc = p[pi];
        if pc == T::ESCAPE {
            pi += 1;
            if pi >= p.len() {
                return Err(ESCAPE_AT_END);
            }
            if p[pi] != t[ti] {
                return Ok(Match::False);
            }
        } else if pc == T::PERCENT {
            pi += 1;
            // collapse a run of wildcards; each `_` still consumes one unit
            while pi < p.len() {
                if p[pi] == T::PERCENT {
                    pi += 1;
                } else if p[pi] == T::UNDERSCORE {
                    if ti >= t.len() {
                        return Ok(Match::Abort);
                    }
                    ti += 1;
                    pi += 1;
                } else {
                    break;
                }
            }
            if pi >= p.len() {
                return Ok(Match::True);
            }
            let first = if p[pi] == T::ESCAPE {
                match p.get(pi + 1) {
                    Some(&c) => c,
                    None => return Err(ESCAPE_AT_END),
                }
            } else {
                p[pi]
            };
            while ti < t.len() {
                if t[ti] == first {
                    match like_match(&t[ti..], &p[pi..])? {
                        Match::False => {}
                        other => return Ok(other),
                    }
                }
                ti += 1;
            }
            return Ok(Match::Abort);
        } else if pc != T::UNDERSCORE && pc != t[ti] {
            return Ok(Match::False);
        }
        ti += 1;
        pi += 1;
    }
    if ti < t.len() {
        return Ok(Match::False);
    }
    while pi < p.len() && p[pi] == T::PERCENT {
        pi += 1;
    }
    Ok(if pi == p.len() { Match::True } else { Match::Abort })
}

/// SQL `LIKE` over text with the default `\` escape.
pub fn text_like(text: &str, pattern: &str) -> Result<bool, &'static str> {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    Ok(like_match(&t, &p)? == Match::True)
}

/// SQL `LIKE` over raw bytes.
pub fn bytea_like(bytes: &[u8], pattern: &[u8]) -> Result<bool, &'static str> {
    Ok(like_match(bytes, pattern)? == Match::True)
}

fn text_arg<'a>(info: &FuncInfo, d: &'a Datum) -> Result<&'a str, DeviceError> {
    match d {
        Datum::Text(s) => Ok(s),
        other => Err(mistyped(info, other)),
    }
}

fn bytes_arg<'a>(info: &FuncInfo, d: &'a Datum) -> Result<&'a [u8], DeviceError> {
    d.as_bytes().ok_or_else(|| mistyped(info, d))
}

pub(crate) fn like(info: &FuncInfo, a: &Datum, b: &Datum) -> Result<Datum, DeviceError> {
    let matched = match (a, info.kind) {
        (Datum::Text(_), FuncKind::ILike | FuncKind::NotILike) => {
            let t = text_arg(info, a)?.to_lowercase();
            let p = text_arg(info, b)?.to_lowercase();
            text_like(&t, &p)
        }
        (Datum::Text(_), _) => text_like(text_arg(info, a)?, text_arg(info, b)?),
        _ => bytea_like(bytes_arg(info, a)?, bytes_arg(info, b)?),
    }
    .map_err(|msg| DeviceError::eval(info.name, msg))?;
    let negate = matches!(info.kind, FuncKind::NotLike | FuncKind::NotILike);
    Ok(Datum::Bool(matched != negate))
}

pub(crate) fn cat(info: &FuncInfo, a: &Datum, b: &Datum) -> Result<Datum, DeviceError> {
    match (a, b) {
        (Datum::Text(x), Datum::Text(y)) => Ok(Datum::Text(format!("{x}{y}"))),
        (Datum::Bytea(x), Datum::Bytea(y)) => {
            let mut out = Vec::with_capacity(x.len() + y.len());
            out.extend_from_slice(x);
            out.extend_from_slice(y);
            Ok(Datum::Bytea(out))
        }
        _ => Err(mistyped(info, a)),
    }
}

/// Variadic `concat`: NULL arguments are skipped.
pub(crate) fn concat(info: &FuncInfo, args: &[Datum]) -> Result<Datum, DeviceError> {
    let mut out = String::new();
    for a in args.iter().filter(|a| !a.is_null()) {
        out.push_str(text_arg(info, a)?);
    }
    Ok(Datum::Text(out))
}

pub(crate) fn length(info: &FuncInfo, a: &Datum) -> Result<Datum, DeviceError> {
    let n = match info.kind {
        FuncKind::CharLength => text_arg(info, a)?.chars().count(),
        _ => bytes_arg(info, a)?.len(),
    };
    i32::try_from(n)
        .map(Datum::Int4)
        .map_err(|_| DeviceError::eval(info.name, "integer out of range"))
}
