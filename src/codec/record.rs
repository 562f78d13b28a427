use crate::core::error::Result;
use crate::storage::schema::{Attributes, Schema};
use std::path::Path;

/// Identity and summary attributes of one record
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub identity: String,
    pub attributes: Attributes,
}

/// A record read back from a file, with its summary
#[derive(Debug, Clone)]
pub struct DecodedRecord<R> {
    pub identity: String,
    pub attributes: Attributes,
    pub record: R,
}

/// Serialization of records to and from bank files.
///
/// A codec owns no state of its own; the bank shares it across threads
/// while decoding in parallel.
pub trait RecordCodec: Send + Sync {
    type Record: Send;

    /// Summary fields this codec produces, with their version tag
    fn schema(&self) -> &Schema;

    /// Whether a file could hold records of this codec
    fn accepts(&self, path: &Path) -> bool;

    /// Read every record stored in a file
    fn read(&self, path: &Path) -> Result<Vec<Self::Record>>;

    /// Serialize records that share one file
    fn encode(&self, records: &[Self::Record]) -> Result<Vec<u8>>;

    /// Identity and summary attributes of a record
    fn summarize(&self, record: &Self::Record) -> Summary;

    /// Deterministic bank-relative path (`/`-separated) for a new record
    fn relative_path(&self, record: &Self::Record) -> String;

    /// Read a file and summarize each record in it
    fn decode(&self, path: &Path) -> Result<Vec<DecodedRecord<Self::Record>>> {
        let records = self.read(path)?;
        Ok(records
            .into_iter()
            .map(|record| {
                let Summary {
                    identity,
                    attributes,
                } = self.summarize(&record);
                DecodedRecord {
                    identity,
                    attributes,
                    record,
                }
            })
            .collect())
    }
}
