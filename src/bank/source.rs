use super::facade::Bank;
use crate::codec::record::RecordCodec;
use crate::core::error::{Error, Result};
use crate::storage::query::Query;
use std::collections::BTreeMap;

/// Anything that can answer a record query
pub trait RecordSource {
    type Record;

    fn get_records(&self, query: &Query) -> Result<Vec<Self::Record>>;
}

impl<C: RecordCodec> RecordSource for Bank<C> {
    type Record = C::Record;

    fn get_records(&self, query: &Query) -> Result<Vec<C::Record>> {
        self.get(query)
    }
}

type BoxedSource<R> = Box<dyn RecordSource<Record = R> + Send + Sync>;

/// Named record sources, built by the caller and handed to whoever needs them
pub struct SourceRegistry<R> {
    sources: BTreeMap<String, BoxedSource<R>>,
}

impl<R> Default for SourceRegistry<R> {
    fn default() -> Self {
        Self {
            sources: BTreeMap::new(),
        }
    }
}

impl<R> SourceRegistry<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, returning the one it replaced
    pub fn register(
        &mut self,
        name: impl Into<String>,
        source: impl RecordSource<Record = R> + Send + Sync + 'static,
    ) -> Option<BoxedSource<R>> {
        let name = name.into();
        tracing::debug!("Registering record source {}", name);
        self.sources.insert(name, Box::new(source))
    }

    pub fn get(&self, name: &str) -> Option<&(dyn RecordSource<Record = R> + Send + Sync)> {
        self.sources.get(name).map(|source| source.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Query the named source
    pub fn get_records(&self, name: &str, query: &Query) -> Result<Vec<R>> {
        match self.get(name) {
            Some(source) => source.get_records(query),
            None => Err(Error::Config(format!("No record source named '{}'", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::query::QueryValue;

    struct Fixed(Vec<&'static str>);

    impl RecordSource for Fixed {
        type Record = String;

        fn get_records(&self, query: &Query) -> Result<Vec<String>> {
            let wanted = query.params().iter().find_map(|(name, value)| match (name.as_str(), value) {
                ("identity", QueryValue::Text(id)) => Some(id.clone()),
                _ => None,
            });
            Ok(self
                .0
                .iter()
                .filter(|id| wanted.as_deref().map_or(true, |w| w == **id))
                .map(|id| id.to_string())
                .collect())
        }
    }

    #[test]
    fn test_registry_dispatches_by_name() {
        let mut registry = SourceRegistry::new();
        assert!(registry.is_empty());
        registry.register("local", Fixed(vec!["a", "b"]));
        assert!(registry.register("remote", Fixed(vec!["c"])).is_none());
        assert!(registry.register("remote", Fixed(vec!["d"])).is_some());

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["local", "remote"]);
        assert_eq!(registry.get_records("local", &Query::new()).unwrap(), vec!["a", "b"]);
        assert_eq!(
            registry.get_records("local", &Query::identity("b")).unwrap(),
            vec!["b"]
        );
        assert_eq!(registry.get_records("remote", &Query::new()).unwrap(), vec!["d"]);
        assert!(matches!(
            registry.get_records("missing", &Query::new()),
            Err(Error::Config(_))
        ));
    }
}
