use super::source::RecordSource;
use crate::core::error::{Error, Result};
use crate::storage::query::Query;

/// Cache state of one identity
#[derive(Debug, Clone, PartialEq)]
pub enum Slot<R> {
    Unresolved,
    Resolved(R),
}

/// A list of identities whose records are fetched on request and kept.
///
/// Reading never resolves anything; only `resolve*` calls fill slots.
#[derive(Debug, Clone)]
pub struct LazyRecords<R> {
    entries: Vec<(String, Slot<R>)>,
}

impl<R> LazyRecords<R> {
    pub fn new<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: identities
                .into_iter()
                .map(|id| (id.into(), Slot::Unresolved))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identity(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|(id, _)| id.as_str())
    }

    pub fn slot(&self, index: usize) -> Option<&Slot<R>> {
        self.entries.get(index).map(|(_, slot)| slot)
    }

    /// The record at `index` if it has been resolved
    pub fn get(&self, index: usize) -> Option<&R> {
        match self.slot(index)? {
            Slot::Resolved(record) => Some(record),
            Slot::Unresolved => None,
        }
    }

    pub fn resolved_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Resolved(_)))
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Slot<R>)> {
        self.entries.iter().map(|(id, slot)| (id.as_str(), slot))
    }

    /// Resolve the record at `index`, calling `resolver` only the first time
    pub fn resolve<F>(&mut self, index: usize, resolver: F) -> Result<&R>
    where
        F: FnOnce(&str) -> Result<R>,
    {
        let len = self.entries.len();
        let (identity, slot) = self.entries.get_mut(index).ok_or_else(|| {
            Error::Config(format!("Index {} out of range for {} records", index, len))
        })?;
        if let Slot::Unresolved = slot {
            *slot = Slot::Resolved(resolver(identity.as_str())?);
        }
        match slot {
            Slot::Resolved(record) => Ok(record),
            Slot::Unresolved => Err(Error::NotFound(identity.clone())),
        }
    }

    /// Resolve every remaining slot, stopping at the first failure
    pub fn resolve_all<F>(&mut self, mut resolver: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<R>,
    {
        for (identity, slot) in &mut self.entries {
            if let Slot::Unresolved = slot {
                *slot = Slot::Resolved(resolver(identity.as_str())?);
            }
        }
        Ok(())
    }

    /// Resolve the record at `index` by identity lookup in `source`
    pub fn resolve_from<S>(&mut self, index: usize, source: &S) -> Result<&R>
    where
        S: RecordSource<Record = R> + ?Sized,
    {
        self.resolve(index, |identity| {
            source
                .get_records(&Query::identity(identity))?
                .into_iter()
                .next()
                .ok_or_else(|| Error::NotFound(identity.to_string()))
        })
    }

    /// Consume the list, keeping resolved records in order
    pub fn into_resolved(self) -> Vec<R> {
        self.entries
            .into_iter()
            .filter_map(|(_, slot)| match slot {
                Slot::Resolved(record) => Some(record),
                Slot::Unresolved => None,
            })
            .collect()
    }
}
