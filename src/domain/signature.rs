//! Stage signatures and the records persisted for them.
//!
//! A signature describes what a stage's output would currently be, given
//! the external world. Two signatures are equal iff their canonical JSON
//! forms are equal; object keys are always emitted in sorted order.

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::identity::StageId;

/// Opaque, structurally comparable fingerprint of a stage's output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(Value);

impl Signature {
    /// Build a signature from any serializable value
    pub fn new<T: Serialize>(value: T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(Self)
    }

    /// Wrap an existing JSON value
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// Parse a signature from its canonical JSON text
    pub fn parse(canonical: &str) -> serde_json::Result<Self> {
        serde_json::from_str(canonical).map(Self)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Canonical serialized form (compact JSON, sorted object keys)
    pub fn canonical(&self) -> String {
        // Value's Display never fails and map keys are BTreeMap-ordered
        self.0.to_string()
    }

    /// Short hash of the canonical form (first 16 hex chars of SHA256)
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..8])
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Signature {}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl From<&str> for Signature {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<String> for Signature {
    fn from(value: String) -> Self {
        Self(Value::String(value))
    }
}

impl From<Value> for Signature {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Last signature under which a stage successfully completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage the record belongs to
    pub stage: StageId,

    /// Signature committed after the last successful execute
    pub signature: Signature,

    /// When the record was written
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_ignores_key_order() {
        let a = Signature::from_value(json!({"b": 2, "a": [1, 2]}));
        let b = Signature::parse(r#"{"a":[1,2],"b":2}"#).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.canonical(), r#"{"a":[1,2],"b":2}"#);
    }

    #[test]
    fn test_structural_difference_is_inequality() {
        assert_ne!(Signature::from("v1"), Signature::from("v2"));
        assert_ne!(
            Signature::from_value(json!({"n": 1})),
            Signature::from_value(json!({"n": "1"}))
        );
    }

    #[test]
    fn test_string_signature_canonical_form() {
        let sig = Signature::from("v1");
        assert_eq!(sig.canonical(), "\"v1\"");
        assert_eq!(Signature::parse(&sig.canonical()).unwrap(), sig);
    }

    #[test]
    fn test_extreme_floats_parse_back_exactly() {
        for f in [1.0715660391465826e-75, 2.2250738585072014e-308, 0.30000000000000004] {
            let sig = Signature::from_value(json!({ "f": f }));
            let parsed = Signature::parse(&sig.canonical()).unwrap();
            assert_eq!(parsed.canonical(), sig.canonical());
        }
    }

    #[test]
    fn test_digest_is_stable() {
        let a = Signature::from_value(json!({"x": 1, "y": 2}));
        let b = Signature::from_value(json!({"y": 2, "x": 1}));

        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 16);
        assert_ne!(a.digest(), Signature::from("other").digest());
    }
}
