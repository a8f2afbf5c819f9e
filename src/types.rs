//! Core types for the fact store.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Position in the global log, assigned by storage at commit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Serial(pub u64);

impl Serial {
    /// The position before the first fact.
    pub const ZERO: Serial = Serial(0);

    pub fn next(self) -> Self {
        Serial(self.0 + 1)
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", self.0)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content hash (SHA-256) used for scripts, transformation steps and chains.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Hash an ordered sequence of hashes (content address of a list).
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a Hash>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.0);
        }
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }

    /// First eight bytes as a signed integer (advisory lock codes).
    pub fn prefix_i64(&self) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        i64::from_be_bytes(buf)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    /// This timestamp moved back by `duration`.
    pub fn minus(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.as_micros() as i64))
    }

    /// Time elapsed between `self` and a later `now`, zero if `now` is earlier.
    pub fn age_at(self, now: Timestamp) -> Duration {
        Duration::from_micros(now.0.saturating_sub(self.0).max(0) as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Open, multi-valued metadata map of a fact.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(BTreeMap<String, Vec<String>>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value for `key`. Existing values are kept.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// All values stored under `key`.
    pub fn values(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First value stored under `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.values(key).first().map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Whether any value under `key` equals `value`.
    pub fn contains_value(&self, key: &str, value: &str) -> bool {
        self.values(key).iter().any(|v| v == value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single immutable fact in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Unique identifier (chosen by the producer).
    pub id: Uuid,

    /// Namespace the fact belongs to.
    pub ns: String,

    /// Application-defined type.
    #[serde(rename = "type")]
    pub fact_type: String,

    /// Schema version of the payload (positive).
    pub version: u32,

    /// Aggregates this fact is about.
    #[serde(rename = "aggIds", default)]
    pub aggregate_ids: Vec<Uuid>,

    /// Open metadata.
    #[serde(default)]
    pub meta: Meta,

    /// Position in the log (assigned by storage).
    pub serial: Serial,

    /// Application-defined payload. `Null` on header-only rows.
    pub payload: Value,
}

impl Fact {
    /// Header as a JSON object, as seen by filter scripts.
    pub fn header_json(&self) -> Value {
        json!({
            "id": self.id.to_string(),
            "ns": self.ns,
            "type": self.fact_type,
            "version": self.version,
            "aggIds": self.aggregate_ids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
            "meta": self.meta,
            "serial": self.serial.0,
        })
    }

    pub fn transformation_key(&self) -> TransformationKey {
        TransformationKey::new(&self.ns, &self.fact_type)
    }
}

/// Input for publishing a fact (before a serial is assigned).
#[derive(Clone, Debug)]
pub struct FactInput {
    pub id: Uuid,
    pub ns: String,
    pub fact_type: String,
    pub version: u32,
    pub aggregate_ids: Vec<Uuid>,
    pub meta: Meta,
    pub payload: Value,
}

impl FactInput {
    /// Create a new version-1 fact with a random id.
    pub fn new(ns: impl Into<String>, fact_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            ns: ns.into(),
            fact_type: fact_type.into(),
            version: 1,
            aggregate_ids: Vec::new(),
            meta: Meta::new(),
            payload,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_ids.push(id);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.add(key, value);
        self
    }

    /// Turn into a stored fact at `serial`.
    pub fn into_fact(self, serial: Serial) -> Fact {
        Fact {
            id: self.id,
            ns: self.ns,
            fact_type: self.fact_type,
            version: self.version,
            aggregate_ids: self.aggregate_ids,
            meta: self.meta,
            serial,
            payload: self.payload,
        }
    }
}

/// One filter clause of a subscription. Fields are ANDed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactSpec {
    pub ns: String,

    #[serde(rename = "type", default)]
    pub fact_type: Option<String>,

    /// Requested version, 0 means any.
    #[serde(default)]
    pub version: u32,

    /// Every listed aggregate id must be among the fact's ids.
    #[serde(rename = "aggIds", default)]
    pub aggregate_ids: Vec<Uuid>,

    /// Every (key, value) pair must be present among the fact's meta values.
    #[serde(default)]
    pub meta: Vec<(String, String)>,

    /// Key presence (`true`) or absence (`false`) requirements.
    #[serde(rename = "metaKeyExists", default)]
    pub meta_key_exists: Vec<(String, bool)>,

    /// Source of an optional filter script.
    #[serde(rename = "filterScript", default)]
    pub filter_script: Option<String>,
}

impl FactSpec {
    /// A spec matching every fact in `ns`.
    pub fn ns(ns: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            ..Default::default()
        }
    }

    pub fn fact_type(mut self, fact_type: impl Into<String>) -> Self {
        self.fact_type = Some(fact_type.into());
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn aggregate_id(mut self, id: Uuid) -> Self {
        self.aggregate_ids.push(id);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.push((key.into(), value.into()));
        self
    }

    pub fn meta_key_exists(mut self, key: impl Into<String>, exists: bool) -> Self {
        self.meta_key_exists.push((key.into(), exists));
        self
    }

    pub fn filter_script(mut self, source: impl Into<String>) -> Self {
        self.filter_script = Some(source.into());
        self
    }

    /// Whether evaluating this spec needs the payload.
    pub fn needs_payload(&self) -> bool {
        self.filter_script.is_some()
    }
}

/// Namespace and type a transformation applies to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransformationKey {
    pub ns: String,
    #[serde(rename = "type")]
    pub fact_type: String,
}

impl TransformationKey {
    pub fn new(ns: impl Into<String>, fact_type: impl Into<String>) -> Self {
        Self {
            ns: ns.into(),
            fact_type: fact_type.into(),
        }
    }
}

impl fmt::Display for TransformationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ns, self.fact_type)
    }
}

/// Newest position a subscription may safely fast-forward to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterMark {
    pub fact_id: Uuid,
    pub serial: Serial,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_roundtrip() {
        let hash = Hash::from_bytes(b"hello world");
        let parsed = Hash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_hash_combine_is_order_sensitive() {
        let a = Hash::from_bytes(b"a");
        let b = Hash::from_bytes(b"b");
        assert_ne!(Hash::combine([&a, &b]), Hash::combine([&b, &a]));
        assert_eq!(Hash::combine([&a, &b]), Hash::combine([&a, &b]));
    }

    #[test]
    fn test_meta_multiple_values() {
        let mut meta = Meta::new();
        meta.add("tag", "a");
        meta.add("tag", "b");
        assert!(meta.contains_value("tag", "b"));
        assert!(!meta.contains_value("tag", "c"));
        assert_eq!(meta.first("tag"), Some("a"));
        assert!(meta.values("missing").is_empty());
    }

    #[test]
    fn test_header_json() {
        let agg = Uuid::new_v4();
        let fact = FactInput::new("users", "UserCreated", json!({"name": "x"}))
            .with_version(2)
            .with_aggregate_id(agg)
            .with_meta("source", "import")
            .into_fact(Serial(7));

        let header = fact.header_json();
        assert_eq!(header["ns"], "users");
        assert_eq!(header["type"], "UserCreated");
        assert_eq!(header["version"], 2);
        assert_eq!(header["serial"], 7);
        assert_eq!(header["aggIds"][0], agg.to_string());
        assert_eq!(header["meta"]["source"][0], "import");
    }

    #[test]
    fn test_timestamp_age() {
        let now = Timestamp::now();
        let earlier = now.minus(Duration::from_secs(60));
        assert_eq!(earlier.age_at(now), Duration::from_secs(60));
        assert_eq!(now.age_at(earlier), Duration::ZERO);
    }
}
