use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use zookeeper_core::{
    filter_by_query, find_by_id, integrity_check, Animal, AnimalCandidate, AnimalId, CoreError,
    FilterCriteria, IdStrategy, IntegrityReport, SequentialIds,
};
use zookeeper_store_json::{JsonFileStore, Persistence};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Validation(#[from] CoreError),
    #[error("animal not found: {id}")]
    NotFound { id: String },
    #[error("animal id already exists: {id}")]
    IdConflict { id: AnimalId },
    #[error("failed to persist animals: {0:#}")]
    Persistence(anyhow::Error),
}

/// The catalog: sole owner of the in-memory animals, mirrored to a [`Persistence`] backend.
///
/// Cloning is cheap and every clone shares the same store.
#[derive(Clone)]
pub struct AnimalCatalog {
    records: Arc<RwLock<Vec<Animal>>>,
    persistence: Arc<dyn Persistence>,
    ids: Arc<dyn IdStrategy>,
}

impl Debug for AnimalCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimalCatalog").field("len", &self.len()).finish_non_exhaustive()
    }
}

impl AnimalCatalog {
    /// Wrap an already loaded set of animals with sequential id assignment.
    #[must_use]
    pub fn new(records: Vec<Animal>, persistence: impl Persistence + 'static) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
            persistence: Arc::new(persistence),
            ids: Arc::new(SequentialIds),
        }
    }

    #[must_use]
    pub fn with_id_strategy(mut self, ids: impl IdStrategy + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    /// Load the catalog from a JSON document on disk; saves rewrite the same file.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = JsonFileStore::new(path);
        let records = store.load()?;

        let report = integrity_check(&records);
        if !report.is_clean() {
            tracing::warn!(
                path = %store.path().display(),
                duplicate_ids = report.duplicate_ids.len(),
                invalid_records = report.invalid_records.len(),
                "animals file failed integrity check"
            );
        }

        Ok(Self::new(records, store))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Copy of every animal in store order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Animal> {
        self.records.read().clone()
    }

    #[must_use]
    pub fn integrity_check(&self) -> IntegrityReport {
        integrity_check(&self.records.read())
    }

    /// Animals matching every constraint in `criteria`, in store order.
    #[must_use]
    pub fn list(&self, criteria: &FilterCriteria) -> Vec<Animal> {
        let records = self.records.read();
        filter_by_query(criteria, &records).into_iter().cloned().collect()
    }

    #[must_use]
    pub fn find(&self, id: &str) -> Option<Animal> {
        find_by_id(id, &self.records.read()).cloned()
    }

    /// Fetch one animal by id.
    ///
    /// # Errors
    /// Returns [`CatalogError::NotFound`] when no animal carries `id`.
    pub fn get(&self, id: &str) -> Result<Animal, CatalogError> {
        self.find(id).ok_or_else(|| CatalogError::NotFound { id: id.to_string() })
    }

    /// Create an animal from a raw JSON request body.
    ///
    /// # Errors
    /// See [`AnimalCatalog::create`]; a non-object body is a validation failure.
    pub fn create_from_value(&self, body: Value) -> Result<Animal, CatalogError> {
        let candidate = AnimalCandidate::from_value(body).inspect_err(|err| {
            tracing::info!(reason = err.reason(), "rejected animal candidate");
        })?;
        self.create(candidate)
    }

    /// Assign an id, validate, append and persist the whole catalog, all under the write lock.
    /// Returns the record that was appended.
    ///
    /// # Errors
    /// Returns [`CatalogError::Validation`] for a malformed candidate,
    /// [`CatalogError::IdConflict`] when the generated id is already taken, and
    /// [`CatalogError::Persistence`] when the backing store could not be rewritten. In every
    /// error case the in-memory catalog is left as it was.
    pub fn create(&self, candidate: AnimalCandidate) -> Result<Animal, CatalogError> {
        let mut records = self.records.write();
        let id = self.ids.next_id(records.len());

        let animal = candidate.into_animal(id).inspect_err(|err| {
            tracing::info!(reason = err.reason(), "rejected animal candidate");
        })?;

        if find_by_id(animal.id.as_str(), &records).is_some() {
            tracing::warn!(id = %animal.id, "generated animal id collides with an existing record");
            return Err(CatalogError::IdConflict { id: animal.id });
        }

        records.push(animal.clone());
        if let Err(err) = self.persist(&records) {
            records.pop();
            tracing::error!(id = %animal.id, error = %format!("{err:#}"), "rolled back animal create");
            return Err(CatalogError::Persistence(err));
        }

        tracing::info!(id = %animal.id, name = %animal.name, "created animal");
        Ok(animal)
    }

    fn persist(&self, records: &[Animal]) -> Result<()> {
        match self.persistence.save(records) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "persisting animals failed; retrying once");
                self.persistence.save(records)
            }
        }
    }
}
