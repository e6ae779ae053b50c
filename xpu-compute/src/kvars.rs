use xpu_result::Result;
use xpu_types::Datum;
use xpu_types::codec::{WireReader, WireWriter};

/// Variable slot array of one row combination.
///
/// A slot is unset until a load or a memoising node writes it. The array also tracks how
/// many bytes of variable-length values it holds, which the device bounds per row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KVars {
    slots: Vec<Option<Datum>>,
    varlena_bytes: usize,
}

fn varlena_len(d: Option<&Datum>) -> usize {
    d.and_then(Datum::as_bytes).map_or(0, <[u8]>::len)
}

impl KVars {
    pub fn new(nslots: usize) -> Self {
        Self {
            slots: vec![None; nslots],
            varlena_bytes: 0,
        }
    }

    #[inline]
    pub fn get(&self, slot: u16) -> Option<&Datum> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }

    /// Bytes the array would hold after writing `datum` into `slot`.
    pub fn bytes_after(&self, slot: u16, datum: &Datum) -> usize {
        self.varlena_bytes - varlena_len(self.get(slot)) + varlena_len(Some(datum))
    }

    pub fn set(&mut self, slot: u16, datum: Datum) {
        let idx = slot as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        self.varlena_bytes = self.bytes_after(slot, &datum);
        self.slots[idx] = Some(datum);
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.varlena_bytes = 0;
    }

    #[inline]
    pub fn varlena_bytes(&self) -> usize {
        self.varlena_bytes
    }

    #[inline]
    pub fn nslots(&self) -> usize {
        self.slots.len()
    }

    pub fn encode(&self, w: &mut WireWriter) -> Result<()> {
        w.put_u16(self.slots.len() as u16);
        for slot in &self.slots {
            match slot {
                None => w.put_u8(0),
                Some(d) => {
                    w.put_u8(1);
                    w.put_datum(d)?;
                }
            }
        }
        Ok(())
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<KVars> {
        let n = r.get_u16()? as usize;
        let mut kvars = KVars::new(n);
        for slot in 0..n {
            match r.get_u8()? {
                0 => {}
                1 => kvars.set(slot as u16, r.get_datum()?),
                other => return Err(r.corrupt(format!("bad kvars slot flag {other}"))),
            }
        }
        Ok(kvars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varlena_accounting_follows_overwrites() {
        let mut kv = KVars::new(2);
        kv.set(0, Datum::Text("abcd".into()));
        kv.set(1, Datum::Int4(1));
        assert_eq!(kv.varlena_bytes(), 4);
        kv.set(0, Datum::Text("ab".into()));
        assert_eq!(kv.varlena_bytes(), 2);
        kv.set(0, Datum::Null);
        assert_eq!(kv.varlena_bytes(), 0);
        assert_eq!(kv.get(0), Some(&Datum::Null));
        kv.clear();
        assert_eq!(kv.get(1), None);
    }
}
