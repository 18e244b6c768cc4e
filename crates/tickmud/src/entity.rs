use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::attr::Value;

// Entity id layout (u64):
//   42 bits: milliseconds since ID_EPOCH_UNIX_MS
//   10 bits: node id (derived from NODE_ID)
//   12 bits: per-ms sequence
const ID_EPOCH_UNIX_MS: u64 = 1704067200000; // 2024-01-01T00:00:00Z

const ALPHABET: &[u8; 32] = b"0123456789abcdefghjkmnpqrstvwxyz";
const ENCODED_LEN: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Fixed-width lowercase base32 (no i, l, o, u).
    pub fn encode(self) -> String {
        let mut v = self.0;
        let mut out = [b'0'; ENCODED_LEN];
        for slot in out.iter_mut().rev() {
            *slot = ALPHABET[(v & 31) as usize];
            v >>= 5;
        }
        out.iter().map(|&b| b as char).collect()
    }

    /// Inverse of [`EntityId::encode`]: any case, with the usual look-alike
    /// substitutions. Digit-only strings are base32 too.
    pub fn decode(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() || s.len() > ENCODED_LEN {
            return None;
        }
        let mut v: u64 = 0;
        for c in s.chars() {
            let c = match c.to_ascii_lowercase() {
                'o' => '0',
                'i' | 'l' => '1',
                c => c,
            };
            let d = ALPHABET.iter().position(|&a| a as char == c)? as u64;
            v = v.checked_mul(32)?.checked_add(d)?;
        }
        Some(EntityId(v))
    }

    pub fn created_unix_ms(self) -> u64 {
        ID_EPOCH_UNIX_MS.saturating_add(self.0 >> 22)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        EntityId::decode(&s).ok_or_else(|| serde::de::Error::custom(format!("bad entity id {s:?}")))
    }
}

/// Mints entity ids that are unique across nodes and never reused.
///
/// After a restart the generator is seeded with every id loaded from storage,
/// so a clock that moved backwards cannot hand out an id twice.
#[derive(Debug)]
pub struct IdGen {
    node_bits: u16,
    last_ts_ms: u64,
    seq: u16,
    floor: u64,
}

impl IdGen {
    pub fn new(node_id: Option<&str>) -> Self {
        Self {
            node_bits: node_id_bits(node_id),
            last_ts_ms: 0,
            seq: 0,
            floor: 0,
        }
    }

    pub fn observe(&mut self, id: EntityId) {
        self.floor = self.floor.max(id.0);
    }

    pub fn next_id(&mut self, now_unix_ms: u64) -> EntityId {
        let mut ts_ms = now_unix_ms.max(self.last_ts_ms);
        if ts_ms == self.last_ts_ms {
            self.seq = self.seq.wrapping_add(1) & 0x0fff;
            if self.seq == 0 {
                ts_ms = ts_ms.saturating_add(1);
            }
        } else {
            self.seq = 0;
        }
        self.last_ts_ms = ts_ms;

        let delta_ms = ts_ms.saturating_sub(ID_EPOCH_UNIX_MS);
        let mut id = (delta_ms << 22)
            | ((u64::from(self.node_bits) & 0x03ff) << 12)
            | (u64::from(self.seq) & 0x0fff);
        if id <= self.floor {
            id = self.floor + 1;
        }
        self.floor = id;
        EntityId(id)
    }
}

fn node_id_bits(node_id: Option<&str>) -> u16 {
    let Some(node_id) = node_id.map(str::trim).filter(|s| !s.is_empty()) else {
        let mut b = [0u8; 2];
        getrandom::getrandom(&mut b).ok();
        return u16::from_be_bytes(b) & 0x03ff;
    };
    if let Ok(v) = node_id.parse::<u16>() {
        return v & 0x03ff;
    }
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    node_id.hash(&mut h);
    (h.finish() as u16) & 0x03ff
}

/// A persistent game object. Owned by the `EntityStore`; everything else
/// holds its id.
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    kind: String,
    attrs: BTreeMap<String, Value>,
    dirty: bool,
    savable: bool,
}

impl Entity {
    pub(crate) fn new(id: EntityId, kind: &str, attrs: BTreeMap<String, Value>) -> Self {
        Self {
            id,
            kind: kind.to_string(),
            attrs,
            dirty: true,
            savable: true,
        }
    }

    /// Entity as read back from storage: nothing to write yet.
    pub(crate) fn loaded(id: EntityId, kind: String, attrs: BTreeMap<String, Value>, savable: bool) -> Self {
        Self {
            id,
            kind,
            attrs,
            dirty: false,
            savable,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_text)
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    pub fn flag(&self, name: &str) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn list(&self, name: &str) -> &[String] {
        self.get(name).and_then(Value::as_list).unwrap_or(&[])
    }

    pub fn entity_ref(&self, name: &str) -> Option<EntityId> {
        self.get(name).and_then(Value::as_entity)
    }

    pub fn attrs(&self) -> &BTreeMap<String, Value> {
        &self.attrs
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_savable(&self) -> bool {
        self.savable
    }

    /// Scratch entities (never written) can be made with this.
    pub fn set_savable(&mut self, savable: bool) {
        self.savable = savable;
    }

    pub(crate) fn put(&mut self, name: &str, v: Value) -> Option<Value> {
        self.dirty = true;
        self.attrs.insert(name.to_string(), v)
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_text_form_is_fixed_width_and_reversible() {
        let id = EntityId(0x0123_4567_89ab_cdef);
        let s = id.encode();
        assert_eq!(s.len(), 13);
        assert_eq!(EntityId::decode(&s), Some(id));
        assert_eq!(EntityId::decode(&s.to_uppercase()), Some(id));
        assert_eq!(EntityId::decode("12345"), Some(EntityId(1_117_317)));
        assert_eq!(EntityId::decode("u"), None);
        assert_eq!(EntityId::decode(""), None);
    }

    #[test]
    fn digit_only_encodings_read_back_as_base32() {
        let id = EntityId(32);
        assert_eq!(id.encode(), "0000000000010");
        assert_eq!(EntityId::decode(&id.encode()), Some(id));
        for n in [0u64, 1, 9, 31, 32, 1_000, 1 << 40] {
            assert_eq!(EntityId::decode(&EntityId(n).encode()), Some(EntityId(n)));
        }
    }

    #[test]
    fn ids_are_monotonic_within_a_millisecond_and_across_clock_skew() {
        let mut g = IdGen::new(Some("7"));
        let t = ID_EPOCH_UNIX_MS + 1_000;
        let a = g.next_id(t);
        let b = g.next_id(t);
        let c = g.next_id(t - 500);
        assert!(a < b && b < c);
        assert_eq!(a.created_unix_ms(), t);
    }

    #[test]
    fn observed_ids_are_never_handed_out_again() {
        let mut g = IdGen::new(Some("1"));
        let seen = EntityId(u64::MAX / 2);
        g.observe(seen);
        let next = g.next_id(ID_EPOCH_UNIX_MS + 5);
        assert!(next > seen);
    }

    #[test]
    fn serde_uses_the_text_form() {
        let id = EntityId(99_000_000);
        let j = serde_json::to_string(&id).unwrap();
        assert_eq!(j, format!("\"{}\"", id.encode()));
        let back: EntityId = serde_json::from_str(&j).unwrap();
        assert_eq!(back, id);
    }
}
