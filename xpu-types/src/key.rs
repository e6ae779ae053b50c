use std::hash::{Hash, Hasher};

use xxhash_rust::xxh3::Xxh3;

use crate::datum::Datum;

const NULL_HASH_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Feed the canonical form of `datum` into `hasher`.
///
/// Integers of any width hash by their `i64` value and floats by their `f64` bits with
/// `-0.0` folded into `0.0` and every NaN folded into one pattern, so values that compare
/// equal also hash equal.
fn canonical_hash(datum: &Datum, hasher: &mut Xxh3) {
    match datum {
        Datum::Null => hasher.update(&NULL_HASH_SEED.to_le_bytes()),
        Datum::Bool(v) => hasher.update(&[1, *v as u8]),
        Datum::Int1(_) | Datum::Int2(_) | Datum::Int4(_) | Datum::Int8(_) => {
            hasher.update(&[2]);
            hasher.update(&datum.as_i64().unwrap_or(0).to_le_bytes());
        }
        Datum::Float2(_) | Datum::Float4(_) | Datum::Float8(_) => {
            let v = datum.as_f64().unwrap_or(0.0);
            let bits = if v.is_nan() {
                f64::NAN.to_bits()
            } else if v == 0.0 {
                0
            } else {
                v.to_bits()
            };
            hasher.update(&[3]);
            hasher.update(&bits.to_le_bytes());
        }
        Datum::Text(s) => {
            hasher.update(&[4]);
            hasher.update(s.as_bytes());
        }
        Datum::Bytea(b) => {
            hasher.update(&[5]);
            hasher.update(b);
        }
    }
}

/// 32-bit hash of a key tuple, as stored in HASH-format chunk items and compared by hash
/// joins.
pub fn hash_datums(values: &[Datum]) -> u32 {
    let mut hasher = Xxh3::new();
    for v in values {
        canonical_hash(v, &mut hasher);
    }
    let h = hasher.digest();
    (h ^ (h >> 32)) as u32
}

/// Grouping key: NULLs group together, NaNs group together, numeric values of the same
/// class compare by value.
#[derive(Debug, Clone)]
pub struct DatumKey(pub Vec<Datum>);

impl DatumKey {
    fn datum_eq(a: &Datum, b: &Datum) -> bool {
        match (a, b) {
            (Datum::Null, Datum::Null) => true,
            (Datum::Bool(x), Datum::Bool(y)) => x == y,
            (Datum::Text(x), Datum::Text(y)) => x == y,
            (Datum::Bytea(x), Datum::Bytea(y)) => x == y,
            // integers and floats never mix; their hash classes differ
            _ => match (a.as_i64(), b.as_i64(), a.as_f64(), b.as_f64()) {
                (Some(x), Some(y), _, _) => x == y,
                (_, _, Some(x), Some(y)) => (x.is_nan() && y.is_nan()) || x == y,
                _ => false,
            },
        }
    }
}

impl PartialEq for DatumKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| DatumKey::datum_eq(a, b))
    }
}

impl Eq for DatumKey {}

impl Hash for DatumKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(hash_datums(&self.0));
    }
}
