use super::record::{RecordCodec, Summary};
use crate::core::error::{Error, Result};
use crate::storage::schema::Schema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::Path;

/// A record type that knows its identity and summary
pub trait JsonRecord: Serialize + DeserializeOwned + Send {
    fn summary(&self) -> Summary;

    /// Bank-relative path for a new record, without extension
    fn file_stem(&self) -> String {
        sanitize(&self.summary().identity)
    }
}

/// Stores records as JSON arrays in `.json` files
pub struct JsonCodec<R> {
    schema: Schema,
    _record: PhantomData<fn() -> R>,
}

impl<R: JsonRecord> JsonCodec<R> {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            _record: PhantomData,
        }
    }
}

impl<R: JsonRecord> RecordCodec for JsonCodec<R> {
    type Record = R;

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
    }

    fn read(&self, path: &Path) -> Result<Vec<R>> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::decode(path, e))?;
        let value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| Error::decode(path, e))?;
        // A bare object is a file with one record.
        let value = match value {
            serde_json::Value::Array(_) => value,
            other => serde_json::Value::Array(vec![other]),
        };
        serde_json::from_value(value).map_err(|e| Error::decode(path, e))
    }

    fn encode(&self, records: &[R]) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(records)
            .map_err(|e| Error::Encode(format!("Failed to serialize records: {}", e)))
    }

    fn summarize(&self, record: &R) -> Summary {
        record.summary()
    }

    fn relative_path(&self, record: &R) -> String {
        format!("{}.json", record.file_stem())
    }
}

/// Make an identity safe to use as a single file name
pub fn sanitize(identity: &str) -> String {
    let cleaned: String = identity
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') => c,
            _ => '_',
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::{Attributes, FieldKind, Value};
    use serde::Deserialize;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pick {
        id: String,
        amplitude: Option<f64>,
    }

    impl JsonRecord for Pick {
        fn summary(&self) -> Summary {
            let mut attributes = Attributes::new();
            attributes.insert("amplitude".into(), self.amplitude.into());
            Summary {
                identity: self.id.clone(),
                attributes,
            }
        }
    }

    fn codec() -> JsonCodec<Pick> {
        JsonCodec::new(Schema::new("1.0.0").unwrap().field("amplitude", FieldKind::Float))
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("smi:local/event/1"), "smi_local_event_1");
        assert_eq!(sanitize("..hidden"), "hidden");
        assert_eq!(sanitize(""), "_");
    }

    #[test]
    fn test_decode_array_and_bare_object() {
        let temp_dir = TempDir::new().unwrap();
        let many = temp_dir.path().join("many.json");
        let one = temp_dir.path().join("one.json");
        fs::write(&many, r#"[{"id":"a","amplitude":1.5},{"id":"b","amplitude":null}]"#).unwrap();
        fs::write(&one, r#"{"id":"c","amplitude":2.0}"#).unwrap();

        let decoded = codec().decode(&many).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].identity, "a");
        assert_eq!(decoded[1].attributes["amplitude"], Value::Null);
        assert_eq!(codec().decode(&one).unwrap()[0].identity, "c");
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let temp_dir = TempDir::new().unwrap();
        let bad = temp_dir.path().join("bad.json");
        fs::write(&bad, b"\x00\x01 not json").unwrap();
        assert!(matches!(codec().decode(&bad), Err(Error::Decode { .. })));
    }

    #[test]
    fn test_encode_round_trips_through_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("p.json");
        let picks = vec![Pick { id: "p/1".into(), amplitude: Some(0.5) }];
        fs::write(&path, codec().encode(&picks).unwrap()).unwrap();
        assert_eq!(codec().read(&path).unwrap(), picks);
        assert_eq!(codec().relative_path(&picks[0]), "p_1.json");
    }
}
