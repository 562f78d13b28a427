#![allow(dead_code)]

use recordbank::{
    Attributes, Bank, BankConfig, FieldKind, JsonCodec, JsonRecord, Schema, Summary, Value,
};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Route library logs to the test output; `RUST_LOG` picks the level
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_target(false)
        .try_init();
}

/// A seismic event as stored in the test banks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub magnitude: Option<f64>,
    pub latitude: f64,
    pub longitude: f64,
    pub time: f64,
    #[serde(default)]
    pub description: Option<String>,
    /// Groups events into one file when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
}

impl JsonRecord for Event {
    fn summary(&self) -> Summary {
        let mut attributes = Attributes::new();
        attributes.insert("magnitude".into(), self.magnitude.into());
        attributes.insert("latitude".into(), Value::Float(self.latitude));
        attributes.insert("longitude".into(), Value::Float(self.longitude));
        attributes.insert("time".into(), Value::Timestamp(self.time));
        attributes.insert("description".into(), self.description.clone().into());
        Summary {
            identity: self.id.clone(),
            attributes,
        }
    }

    fn file_stem(&self) -> String {
        match &self.catalog {
            Some(catalog) => format!("catalogs/{}", catalog),
            None => format!("events/{}", recordbank::codec::json::sanitize(&self.id)),
        }
    }
}

pub fn event(id: &str, magnitude: Option<f64>) -> Event {
    Event {
        id: id.to_string(),
        magnitude,
        latitude: 40.0,
        longitude: -111.0,
        time: 1_600_000_000.0,
        description: None,
        catalog: None,
    }
}

pub fn schema(version: &str) -> Schema {
    Schema::new(version)
        .unwrap()
        .field("magnitude", FieldKind::Float)
        .field("latitude", FieldKind::Float)
        .field("longitude", FieldKind::Float)
        .field("time", FieldKind::Timestamp)
        .field("description", FieldKind::Text)
}

pub fn codec(version: &str) -> JsonCodec<Event> {
    JsonCodec::new(schema(version))
}

pub fn open_bank(dir: &Path) -> Bank<JsonCodec<Event>> {
    Bank::new(dir, codec(SCHEMA_VERSION)).unwrap()
}

/// A bank that decodes serially and always shows progress
pub fn open_bank_with_progress(dir: &Path, interval: usize) -> Bank<JsonCodec<Event>> {
    let config = BankConfig::new(dir)
        .unwrap()
        .with_progress(interval, 0)
        .with_parallel_decode(false);
    Bank::with_config(config, codec(SCHEMA_VERSION))
}

/// Write events to `relative` the way the codec would
pub fn write_events(dir: &Path, relative: &str, events: &[Event]) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, serde_json::to_vec_pretty(events).unwrap()).unwrap();
}

/// Pin a file's modification time to a fixed offset in the past
pub fn set_mtime(path: &Path, seconds_ago: u64) {
    let when = SystemTime::now() - Duration::from_secs(seconds_ago);
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}

pub fn mtime(path: &Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

pub fn restore_mtime(path: &Path, when: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}
