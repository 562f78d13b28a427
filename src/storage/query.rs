//! Filter parameters for index scans.
//!
//! A [`Query`] is an untyped list of `name = value` parameters. It is compiled
//! against a [`Schema`] into a [`CompiledQuery`], which rejects parameter
//! names the schema cannot answer instead of ignoring them.

use super::schema::{FieldKind, Schema, Value};
use crate::core::error::{Error, Result};
use std::collections::{BTreeSet, HashSet};

const EARTH_RADIUS_KM: f64 = 6371.0;
const KM_PER_DEGREE: f64 = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

/// A filter value: a scalar or any finite collection of scalars
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Null,
    Number(f64),
    Text(String),
    List(Vec<QueryValue>),
}

impl QueryValue {
    /// Flatten into a list of scalars, whatever the container shape
    fn scalars(&self) -> Vec<&QueryValue> {
        match self {
            Self::List(items) => items.iter().flat_map(|item| item.scalars()).collect(),
            scalar => vec![scalar],
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<f64> for QueryValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<f32> for QueryValue {
    fn from(v: f32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<i64> for QueryValue {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<i32> for QueryValue {
    fn from(v: i32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<usize> for QueryValue {
    fn from(v: usize) -> Self {
        Self::Number(v as f64)
    }
}

impl From<&str> for QueryValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for QueryValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&String> for QueryValue {
    fn from(v: &String) -> Self {
        Self::Text(v.clone())
    }
}

impl<T: Into<QueryValue>> From<Option<T>> for QueryValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

impl<T: Into<QueryValue>> From<Vec<T>> for QueryValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<QueryValue> + Clone> From<&[T]> for QueryValue {
    fn from(v: &[T]) -> Self {
        Self::List(v.iter().cloned().map(Into::into).collect())
    }
}

impl<T: Into<QueryValue>, const N: usize> From<[T; N]> for QueryValue {
    fn from(v: [T; N]) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<QueryValue>, S> From<HashSet<T, S>> for QueryValue {
    fn from(v: HashSet<T, S>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<QueryValue>> From<BTreeSet<T>> for QueryValue {
    fn from(v: BTreeSet<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// Ordered filter parameters as supplied by a caller
#[derive(Debug, Clone, Default)]
pub struct Query {
    params: Vec<(String, QueryValue)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter. A later parameter with the same name replaces the earlier one.
    pub fn with(mut self, name: &str, value: impl Into<QueryValue>) -> Self {
        self.params.retain(|(n, _)| n != name);
        self.params.push((name.to_string(), value.into()));
        self
    }

    /// Shorthand for `identity = <identity>`
    pub fn identity(identity: &str) -> Self {
        Self::new().with("identity", identity)
    }

    pub fn params(&self) -> &[(String, QueryValue)] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Validate every parameter against the schema
    pub fn compile(&self, schema: &Schema) -> Result<CompiledQuery> {
        let mut compiled = CompiledQuery::default();
        let mut circle = CircleParams::default();

        for (name, value) in &self.params {
            if matches!(value, QueryValue::Null) {
                continue;
            }
            match name.as_str() {
                "limit" => compiled.limit = Some(parse_limit(value)?),
                "identity" | "identities" => {
                    let ids = value
                        .scalars()
                        .into_iter()
                        .map(|v| match v {
                            QueryValue::Text(s) => Ok(s.clone()),
                            QueryValue::Number(n) => Ok(n.to_string()),
                            _ => Err(unsupported(name, value)),
                        })
                        .collect::<Result<BTreeSet<_>>>()?;
                    compiled.predicates.push(Predicate::Identity(ids));
                }
                "updated_after" => {
                    let after = value.as_number().ok_or_else(|| unsupported(name, value))?;
                    compiled.predicates.push(Predicate::UpdatedAfter(after));
                }
                "latitude" => circle.latitude = Some(number(name, value)?),
                "longitude" => circle.longitude = Some(number(name, value)?),
                "min_radius" => circle.min_radius = Some(number(name, value)?),
                "max_radius" => circle.max_radius = Some(number(name, value)?),
                _ => compiled.predicates.push(field_predicate(schema, name, value)?),
            }
        }

        if let Some(predicate) = circle.into_predicate(schema, &compiled.predicates)? {
            compiled.predicates.push(predicate);
        }
        Ok(compiled)
    }
}

/// A single validated filter
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Identity(BTreeSet<String>),
    Range {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    Member {
        field: String,
        values: Vec<Value>,
    },
    UpdatedAfter(f64),
    Radius {
        latitude: f64,
        longitude: f64,
        min_degrees: Option<f64>,
        max_degrees: Option<f64>,
    },
}

/// The fields of a row a predicate can look at
pub trait Filterable {
    fn identity(&self) -> &str;
    fn attribute(&self, field: &str) -> Option<&Value>;
    fn file_mtime(&self) -> f64;
}

impl Predicate {
    pub fn matches(&self, row: &impl Filterable) -> bool {
        match self {
            Self::Identity(ids) => ids.contains(row.identity()),
            Self::Range { field, min, max } => {
                // A bound on a null value always excludes the row.
                match row.attribute(field).and_then(Value::as_f64) {
                    Some(v) => min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m),
                    None => false,
                }
            }
            Self::Member { field, values } => match row.attribute(field) {
                Some(stored) if !stored.is_null() => values.iter().any(|v| value_eq(stored, v)),
                _ => false,
            },
            Self::UpdatedAfter(after) => row.file_mtime() > *after,
            Self::Radius {
                latitude,
                longitude,
                min_degrees,
                max_degrees,
            } => {
                let lat = row.attribute("latitude").and_then(Value::as_f64);
                let lon = row.attribute("longitude").and_then(Value::as_f64);
                match (lat, lon) {
                    (Some(lat), Some(lon)) => {
                        let dist = great_circle_degrees(*latitude, *longitude, lat, lon);
                        min_degrees.map_or(true, |m| dist >= m)
                            && max_degrees.map_or(true, |m| dist <= m)
                    }
                    _ => false,
                }
            }
        }
    }
}

/// A query validated against a schema
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledQuery {
    pub predicates: Vec<Predicate>,
    pub limit: Option<usize>,
}

impl CompiledQuery {
    pub fn matches(&self, row: &impl Filterable) -> bool {
        self.predicates.iter().all(|p| p.matches(row))
    }
}

#[derive(Default)]
struct CircleParams {
    latitude: Option<f64>,
    longitude: Option<f64>,
    min_radius: Option<f64>,
    max_radius: Option<f64>,
}

impl CircleParams {
    fn into_predicate(self, schema: &Schema, others: &[Predicate]) -> Result<Option<Predicate>> {
        let any = self.latitude.is_some()
            || self.longitude.is_some()
            || self.min_radius.is_some()
            || self.max_radius.is_some();
        if !any {
            return Ok(None);
        }
        for coord in ["latitude", "longitude"] {
            if !schema.kind_of(coord).is_some_and(FieldKind::is_numeric) {
                return Err(Error::UnsupportedQuery(format!(
                    "circular search requires a numeric '{coord}' field"
                )));
            }
        }
        let boxed = others.iter().any(|p| {
            matches!(
                p,
                Predicate::Range { field, .. } if field == "latitude" || field == "longitude"
            )
        });
        if boxed {
            return Err(Error::UnsupportedQuery(
                "circular search cannot be combined with latitude/longitude ranges".to_string(),
            ));
        }
        let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) else {
            return Err(Error::UnsupportedQuery(
                "circular search requires both latitude and longitude".to_string(),
            ));
        };
        if self.min_radius.is_none() && self.max_radius.is_none() {
            return Ok(None);
        }
        Ok(Some(Predicate::Radius {
            latitude,
            longitude,
            min_degrees: self.min_radius,
            max_degrees: self.max_radius,
        }))
    }
}

fn field_predicate(schema: &Schema, name: &str, value: &QueryValue) -> Result<Predicate> {
    if let Some(kind) = schema.kind_of(name) {
        let values = value
            .scalars()
            .into_iter()
            .map(|v| member_value(kind, v).ok_or_else(|| unsupported(name, value)))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Predicate::Member {
            field: name.to_string(),
            values,
        });
    }

    let (field, is_min) = match name {
        "starttime" => ("time", true),
        "endtime" => ("time", false),
        _ => match (name.strip_prefix("min_"), name.strip_prefix("max_")) {
            (Some(field), _) => (field, true),
            (_, Some(field)) => (field, false),
            _ => return Err(Error::UnsupportedQuery(name.to_string())),
        },
    };

    match schema.kind_of(field) {
        Some(kind) if kind.is_numeric() => {
            let bound = number(name, value)?;
            let (min, max) = if is_min { (Some(bound), None) } else { (None, Some(bound)) };
            Ok(Predicate::Range {
                field: field.to_string(),
                min,
                max,
            })
        }
        _ => Err(Error::UnsupportedQuery(name.to_string())),
    }
}

fn member_value(kind: FieldKind, v: &QueryValue) -> Option<Value> {
    match (kind, v) {
        (FieldKind::Text, QueryValue::Text(s)) => Some(Value::Text(s.clone())),
        (FieldKind::Text, QueryValue::Number(n)) => Some(Value::Text(n.to_string())),
        (_, v) => v.as_number().map(Value::Float),
    }
}

fn value_eq(stored: &Value, wanted: &Value) -> bool {
    match (stored, wanted) {
        (Value::Text(a), Value::Text(b)) => a == b,
        _ => match (stored.as_f64(), wanted.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
    }
}

fn number(name: &str, value: &QueryValue) -> Result<f64> {
    value
        .as_number()
        .filter(|n| !n.is_nan())
        .ok_or_else(|| unsupported(name, value))
}

fn parse_limit(value: &QueryValue) -> Result<usize> {
    match value.as_number() {
        Some(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as usize),
        _ => Err(unsupported("limit", value)),
    }
}

fn unsupported(name: &str, value: &QueryValue) -> Error {
    Error::UnsupportedQuery(format!("{name} = {value:?}"))
}

/// Great-circle distance between two points, in degrees of arc
pub fn great_circle_degrees(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let km = 2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin();
    km / KM_PER_DEGREE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Row {
        id: String,
        attrs: BTreeMap<String, Value>,
        mtime: f64,
    }

    impl Filterable for Row {
        fn identity(&self) -> &str {
            &self.id
        }
        fn attribute(&self, field: &str) -> Option<&Value> {
            self.attrs.get(field)
        }
        fn file_mtime(&self) -> f64 {
            self.mtime
        }
    }

    fn row(id: &str, magnitude: Value, desc: &str) -> Row {
        let mut attrs = BTreeMap::new();
        attrs.insert("magnitude".to_string(), magnitude);
        attrs.insert("description".to_string(), Value::from(desc));
        attrs.insert("latitude".to_string(), Value::Float(40.0));
        attrs.insert("longitude".to_string(), Value::Float(-111.0));
        Row {
            id: id.to_string(),
            attrs,
            mtime: 100.0,
        }
    }

    fn schema() -> Schema {
        Schema::new("1.0.0")
            .unwrap()
            .field("magnitude", FieldKind::Float)
            .field("description", FieldKind::Text)
            .field("latitude", FieldKind::Float)
            .field("longitude", FieldKind::Float)
            .field("time", FieldKind::Timestamp)
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = Query::new().with("minradius", 20.0).compile(&schema()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedQuery(_)));

        let err = Query::new().with("min_description", 1.0).compile(&schema()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedQuery(_)));
    }

    #[test]
    fn test_range_is_inclusive_and_excludes_null() {
        let q = Query::new().with("min_magnitude", 1.1).compile(&schema()).unwrap();
        assert!(q.matches(&row("a", Value::Float(1.1), "LR")));
        assert!(q.matches(&row("b", Value::Float(2.0), "LR")));
        assert!(!q.matches(&row("c", Value::Float(0.9), "LR")));
        assert!(!q.matches(&row("d", Value::Null, "LR")));
    }

    #[test]
    fn test_membership_normalizes_container_shape() {
        let schema = schema();
        let shapes: Vec<QueryValue> = vec![
            "LR".into(),
            vec!["LR"].into(),
            ["LR"].into(),
            HashSet::from(["LR"]).into(),
            BTreeSet::from(["LR".to_string()]).into(),
            (&["LR"][..]).into(),
        ];
        let expected = Query::new().with("description", "LR").compile(&schema).unwrap();
        for shape in shapes {
            let q = Query::new().with("description", shape).compile(&schema).unwrap();
            assert_eq!(q.predicates, expected.predicates);
        }
    }

    #[test]
    fn test_limit_validation() {
        let q = Query::new().with("limit", 2).compile(&schema()).unwrap();
        assert_eq!(q.limit, Some(2));
        assert!(Query::new().with("limit", -1).compile(&schema()).is_err());
        assert!(Query::new().with("limit", 1.5).compile(&schema()).is_err());
    }

    #[test]
    fn test_time_aliases() {
        let q = Query::new()
            .with("starttime", 10.0)
            .with("endtime", 20.0)
            .compile(&schema())
            .unwrap();
        assert_eq!(q.predicates.len(), 2);
        assert!(matches!(&q.predicates[0], Predicate::Range { field, min: Some(_), .. } if field == "time"));
    }

    #[test]
    fn test_circular_search() {
        let schema = schema();
        let near = Query::new()
            .with("latitude", 40.0)
            .with("longitude", -111.5)
            .with("max_radius", 1.0)
            .compile(&schema)
            .unwrap();
        assert!(near.matches(&row("a", Value::Float(1.0), "LR")));

        let far = Query::new()
            .with("latitude", 0.0)
            .with("longitude", 0.0)
            .with("max_radius", 1.0)
            .compile(&schema)
            .unwrap();
        assert!(!far.matches(&row("a", Value::Float(1.0), "LR")));

        let missing_lon = Query::new().with("latitude", 0.0).with("max_radius", 1.0);
        assert!(missing_lon.compile(&schema).is_err());

        let mixed = Query::new()
            .with("latitude", 0.0)
            .with("longitude", 0.0)
            .with("max_radius", 1.0)
            .with("min_latitude", -5.0);
        assert!(mixed.compile(&schema).is_err());
    }

    #[test]
    fn test_great_circle_degrees() {
        assert!(great_circle_degrees(0.0, 0.0, 0.0, 0.0).abs() < 1e-9);
        assert!((great_circle_degrees(0.0, 0.0, 0.0, 90.0) - 90.0).abs() < 1e-6);
        assert!((great_circle_degrees(0.0, 0.0, 1.0, 0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_identity_membership() {
        let q = Query::new()
            .with("identities", vec!["a", "c"])
            .compile(&schema())
            .unwrap();
        assert!(q.matches(&row("a", Value::Null, "")));
        assert!(!q.matches(&row("b", Value::Null, "")));
    }
}
