use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Text values that stand in for a missing value
const MISSING_MARKERS: &[&str] = &["", "None", "nan", "NaN", "null"];

/// Scalar type of a summary field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Float,
    Int,
    Text,
    /// Seconds since the Unix epoch
    Timestamp,
}

impl FieldKind {
    /// Whether range filters apply to this kind
    pub fn is_numeric(self) -> bool {
        !matches!(self, Self::Text)
    }
}

/// A single summary attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Float(f64),
    Int(i64),
    Text(String),
    Timestamp(f64),
}

impl Value {
    /// Collapse missing markers and NaN into `Null`
    pub fn normalized(self) -> Self {
        match self {
            Self::Float(v) | Self::Timestamp(v) if v.is_nan() => Self::Null,
            Self::Text(s) if MISSING_MARKERS.contains(&s.as_str()) => Self::Null,
            other => other,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view used by range filters; `None` for null and text
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) | Self::Timestamp(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Null | Self::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Float(v) | Self::Timestamp(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Summary attributes of one record, keyed by field name
pub type Attributes = BTreeMap<String, Value>;

/// Name and type of one summary field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// A version tag of the form `x.y.z`. Components may be negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersion {
    raw: String,
    parts: Vec<i64>,
}

impl SchemaVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let parts = raw
            .trim()
            .split('.')
            .map(|part| part.parse::<i64>().ok())
            .collect::<Option<Vec<_>>>()?;
        if parts.is_empty() {
            return None;
        }
        Some(Self {
            raw: raw.trim().to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// The fixed, versioned set of summary fields a codec produces
#[derive(Debug, Clone)]
pub struct Schema {
    version: SchemaVersion,
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new(version: &str) -> Result<Self> {
        let version = SchemaVersion::parse(version)
            .ok_or_else(|| Error::Config(format!("Invalid schema version: {version}")))?;
        Ok(Self {
            version,
            fields: Vec::new(),
        })
    }

    /// Add a field. Re-declaring a name replaces its kind.
    pub fn field(mut self, name: &str, kind: FieldKind) -> Self {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(existing) => existing.kind = kind,
            None => self.fields.push(FieldSpec {
                name: name.to_string(),
                kind,
            }),
        }
        self
    }

    pub fn version(&self) -> &SchemaVersion {
        &self.version
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.kind)
    }

    /// Type-check and coerce attributes to this schema.
    ///
    /// Every declared field is present in the output (absent ones as `Null`);
    /// undeclared fields are dropped.
    pub fn conform(&self, path: &Path, mut attrs: Attributes) -> Result<Attributes> {
        let mut out = Attributes::new();
        for spec in &self.fields {
            let value = attrs.remove(&spec.name).unwrap_or(Value::Null).normalized();
            let value = coerce(spec, value).map_err(|message| Error::decode(path, message))?;
            out.insert(spec.name.clone(), value);
        }
        for extra in attrs.keys() {
            tracing::debug!("Dropping undeclared attribute '{}' from {}", extra, path.display());
        }
        Ok(out)
    }
}

fn coerce(spec: &FieldSpec, value: Value) -> std::result::Result<Value, String> {
    let coerced = match (spec.kind, value) {
        (_, Value::Null) => Value::Null,
        (FieldKind::Float, Value::Float(v)) => Value::Float(v),
        (FieldKind::Float, Value::Int(v)) => Value::Float(v as f64),
        (FieldKind::Int, Value::Int(v)) => Value::Int(v),
        (FieldKind::Int, Value::Float(v)) if v.fract() == 0.0 => Value::Int(v as i64),
        (FieldKind::Text, Value::Text(s)) => Value::Text(s),
        (FieldKind::Timestamp, Value::Timestamp(v) | Value::Float(v)) => Value::Timestamp(v),
        (FieldKind::Timestamp, Value::Int(v)) => Value::Timestamp(v as f64),
        (kind, other) => {
            return Err(format!(
                "field '{}' expects {:?}, got {:?}",
                spec.name, kind, other
            ))
        }
    };
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new("1.2.0")
            .unwrap()
            .field("magnitude", FieldKind::Float)
            .field("station_count", FieldKind::Int)
            .field("description", FieldKind::Text)
            .field("time", FieldKind::Timestamp)
    }

    #[test]
    fn test_missing_markers_become_null() {
        assert_eq!(Value::from("None").normalized(), Value::Null);
        assert_eq!(Value::from("").normalized(), Value::Null);
        assert_eq!(Value::Float(f64::NAN).normalized(), Value::Null);
        assert_eq!(Value::from("LR").normalized(), Value::from("LR"));
    }

    #[test]
    fn test_version_ordering() {
        let v = |s| SchemaVersion::parse(s).unwrap();
        assert!(v("0.0.-1") < v("0.0.0"));
        assert!(v("1.2.0") < v("1.10.0"));
        assert!(v("2.0") == v("2.0.0"));
        assert!(SchemaVersion::parse("one.two").is_none());
    }

    #[test]
    fn test_conform_fills_and_coerces() {
        let mut attrs = Attributes::new();
        attrs.insert("magnitude".into(), Value::Int(2));
        attrs.insert("description".into(), Value::from("None"));
        attrs.insert("unknown".into(), Value::from("x"));

        let out = schema().conform(Path::new("a.json"), attrs).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out["magnitude"], Value::Float(2.0));
        assert_eq!(out["description"], Value::Null);
        assert_eq!(out["time"], Value::Null);
        assert!(!out.contains_key("unknown"));
    }

    #[test]
    fn test_conform_rejects_wrong_type() {
        let mut attrs = Attributes::new();
        attrs.insert("station_count".into(), Value::from("many"));
        let err = schema().conform(Path::new("a.json"), attrs).unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }
}
