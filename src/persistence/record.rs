//! Record contract for everything written to an evidence ledger.
//!
//! Every record carries its own `event_hash`, a SHA-256 over the record's
//! canonical JSON with the hash field blanked. Hashes are always recomputed
//! from content; a stored hash is only ever compared, never trusted.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// SHA-256 (lower hex) over the canonical JSON encoding of `value`.
///
/// Struct fields serialize in declaration order and maps used in records are
/// `BTreeMap`s, so the encoding is deterministic.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// A persisted event family
pub trait LedgerRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Type tag written into every ledger envelope
    const FAMILY: &'static str;

    /// Stable id; later versions of the same record share it
    fn record_id(&self) -> &str;

    fn event_hash(&self) -> &str;

    fn set_event_hash(&mut self, hash: String);

    /// Whether the record is still open (no recovery/clearing field set).
    fn is_open(&self) -> bool {
        false
    }

    fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.set_event_hash(String::new());
        content_hash(&unsealed)
    }

    fn seal(&mut self) -> Result<(), serde_json::Error> {
        let hash = self.compute_hash()?;
        self.set_event_hash(hash);
        Ok(())
    }

    fn verify(&self) -> bool {
        self.compute_hash()
            .map(|hash| hash == self.event_hash())
            .unwrap_or(false)
    }
}

/// Fixed timestamp format for persisted records: `2024-01-31T09:30:00.000000Z`.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

    pub fn format(dt: &DateTime<Utc>) -> String {
        dt.format(FORMAT).to_string()
    }

    pub fn parse(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(s, FORMAT).map(|naive| Utc.from_utc_datetime(&naive))
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            dt: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match dt {
                Some(dt) => serializer.serialize_some(&super::format(dt)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
        #[serde(with = "timestamp")]
        at: DateTime<Utc>,
        #[serde(with = "timestamp::option")]
        closed_at: Option<DateTime<Utc>>,
        event_hash: String,
    }

    impl LedgerRecord for Note {
        const FAMILY: &'static str = "note";

        fn record_id(&self) -> &str {
            &self.id
        }

        fn event_hash(&self) -> &str {
            &self.event_hash
        }

        fn set_event_hash(&mut self, hash: String) {
            self.event_hash = hash;
        }
    }

    fn note() -> Note {
        Note {
            id: "n-1".to_string(),
            body: "drawdown 0.12 >= 0.10".to_string(),
            at: Utc.with_ymd_and_hms(2024, 1, 31, 9, 30, 0).unwrap(),
            closed_at: None,
            event_hash: String::new(),
        }
    }

    #[test]
    fn test_timestamp_format_is_fixed() {
        let json = serde_json::to_string(&note()).unwrap();
        assert!(json.contains("\"at\":\"2024-01-31T09:30:00.000000Z\""));
        assert!(json.contains("\"closed_at\":null"));
    }

    #[test]
    fn test_seal_and_verify() {
        let mut n = note();
        assert!(!n.verify());
        n.seal().unwrap();
        assert_eq!(n.event_hash.len(), 64);
        assert!(n.verify());

        n.body = "drawdown 0.01 >= 0.10".to_string();
        assert!(!n.verify());
    }

    #[test]
    fn test_reload_is_byte_identical() {
        let mut n = note();
        n.closed_at = Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
        n.seal().unwrap();

        let first = serde_json::to_string(&n).unwrap();
        let mut reloaded: Note = serde_json::from_str(&first).unwrap();
        assert!(reloaded.verify());
        reloaded.seal().unwrap();
        let second = serde_json::to_string(&reloaded).unwrap();
        assert_eq!(first, second);
    }
}
