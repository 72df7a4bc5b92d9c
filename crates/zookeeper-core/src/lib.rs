use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller-facing message for every rejected candidate, whatever the underlying reason.
pub const INVALID_ANIMAL_MESSAGE: &str = "The animal is not properly formatted.";

pub const FIELD_ID: &str = "id";
pub const FIELD_NAME: &str = "name";
pub const FIELD_SPECIES: &str = "species";
pub const FIELD_DIET: &str = "diet";
pub const FIELD_PERSONALITY_TRAITS: &str = "personalityTraits";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("The animal is not properly formatted.")]
    Validation { reason: String },
}

impl CoreError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }

    /// Internal detail explaining the rejection; not meant for API clients.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Validation { reason } => reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AnimalId(pub String);

impl AnimalId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AnimalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AnimalId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for AnimalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Animal {
    pub id: AnimalId,
    pub name: String,
    pub species: String,
    pub diet: String,
    pub personality_traits: Vec<String>,
}

impl Animal {
    #[must_use]
    pub fn has_trait(&self, personality_trait: &str) -> bool {
        self.personality_traits.iter().any(|candidate| candidate == personality_trait)
    }

    /// Re-check a typed record against the shape rules, e.g. after loading it from disk.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when `name`, `species` or `diet` is empty.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (field, value) in
            [(FIELD_NAME, &self.name), (FIELD_SPECIES, &self.species), (FIELD_DIET, &self.diet)]
        {
            if value.is_empty() {
                return Err(CoreError::validation(format!("{field} MUST be non-empty")));
            }
        }
        Ok(())
    }
}

/// Untyped request body for a new animal. The only way to turn it into an [`Animal`] is
/// [`AnimalCandidate::into_animal`], which runs the shape rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnimalCandidate {
    fields: Map<String, Value>,
}

impl AnimalCandidate {
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Wrap an arbitrary JSON value.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the value is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(CoreError::validation(format!(
                "candidate MUST be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Record the system-assigned id on the candidate, replacing any id the client sent.
    pub fn assign_id(&mut self, id: &AnimalId) {
        self.fields.insert(FIELD_ID.to_string(), Value::String(id.0.clone()));
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Check the candidate's shape. `id` is never inspected.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] naming the first field that is missing or mistyped.
    pub fn validate(&self) -> Result<(), CoreError> {
        required_string(&self.fields, FIELD_NAME)?;
        required_string(&self.fields, FIELD_SPECIES)?;
        required_string(&self.fields, FIELD_DIET)?;
        required_traits(&self.fields)?;
        Ok(())
    }

    /// Validate and convert into a typed record carrying `id`.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the shape rules reject the candidate.
    pub fn into_animal(mut self, id: AnimalId) -> Result<Animal, CoreError> {
        self.assign_id(&id);
        let name = required_string(&self.fields, FIELD_NAME)?.to_string();
        let species = required_string(&self.fields, FIELD_SPECIES)?.to_string();
        let diet = required_string(&self.fields, FIELD_DIET)?.to_string();
        let personality_traits = required_traits(&self.fields)?;
        Ok(Animal { id, name, species, diet, personality_traits })
    }
}

/// Shape predicate over a raw JSON value.
#[must_use]
pub fn validate(candidate: &Value) -> bool {
    match candidate {
        Value::Object(fields) => AnimalCandidate::new(fields.clone()).is_valid(),
        _ => false,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_string<'a>(fields: &'a Map<String, Value>, field: &str) -> Result<&'a str, CoreError> {
    match fields.get(field) {
        None | Some(Value::Null) => {
            Err(CoreError::validation(format!("{field} MUST be provided")))
        }
        Some(Value::String(value)) if value.is_empty() => {
            Err(CoreError::validation(format!("{field} MUST be non-empty")))
        }
        Some(Value::String(value)) => Ok(value),
        Some(other) => Err(CoreError::validation(format!(
            "{field} MUST be a string, got {}",
            json_type_name(other)
        ))),
    }
}

fn required_traits(fields: &Map<String, Value>) -> Result<Vec<String>, CoreError> {
    let items = match fields.get(FIELD_PERSONALITY_TRAITS) {
        None | Some(Value::Null) => {
            return Err(CoreError::validation(format!(
                "{FIELD_PERSONALITY_TRAITS} MUST be provided"
            )));
        }
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(CoreError::validation(format!(
                "{FIELD_PERSONALITY_TRAITS} MUST be an array, got {}",
                json_type_name(other)
            )));
        }
    };

    items
        .iter()
        .map(|item| match item {
            Value::String(value) => Ok(value.clone()),
            other => Err(CoreError::validation(format!(
                "{FIELD_PERSONALITY_TRAITS} entries MUST be strings, got {}",
                json_type_name(other)
            ))),
        })
        .collect()
}

/// Attribute constraints for narrowing the catalog. Every populated field must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriteria {
    #[serde(default)]
    pub personality_traits: Vec<String>,
    pub diet: Option<String>,
    pub species: Option<String>,
    pub name: Option<String>,
    /// Scalar keys supplied more than once. A repeated key carries a list of values, which no
    /// single attribute equals, so any entry here makes the criteria match nothing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repeated_keys: Vec<String>,
}

impl FilterCriteria {
    /// Build criteria from decoded query-string pairs.
    ///
    /// `personalityTraits` (and the bracketed `personalityTraits[]` form) may repeat. A scalar
    /// key given more than once, even with empty values, lands in `repeated_keys`. A single
    /// empty value and unknown keys are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut criteria = Self::default();
        let mut seen = BTreeSet::new();
        for (key, value) in pairs {
            let key = key.as_ref();
            let value = value.into();
            if key == FIELD_PERSONALITY_TRAITS || key == "personalityTraits[]" {
                if !value.is_empty() {
                    criteria.personality_traits.push(value);
                }
                continue;
            }
            if !matches!(key, FIELD_DIET | FIELD_SPECIES | FIELD_NAME) {
                continue;
            }
            if !seen.insert(key.to_string()) {
                if !criteria.repeated_keys.iter().any(|repeated| repeated == key) {
                    criteria.repeated_keys.push(key.to_string());
                }
                continue;
            }
            if value.is_empty() {
                continue;
            }
            if let Some(slot) = criteria.scalar_slot(key) {
                *slot = Some(value);
            }
        }
        criteria
    }

    fn scalar_slot(&mut self, key: &str) -> Option<&mut Option<String>> {
        match key {
            FIELD_DIET => Some(&mut self.diet),
            FIELD_SPECIES => Some(&mut self.species),
            FIELD_NAME => Some(&mut self.name),
            _ => None,
        }
    }

    #[must_use]
    pub fn with_trait(mut self, personality_trait: impl Into<String>) -> Self {
        self.personality_traits.push(personality_trait.into());
        self
    }

    #[must_use]
    pub fn with_diet(mut self, diet: impl Into<String>) -> Self {
        self.diet = Some(diet.into());
        self
    }

    #[must_use]
    pub fn with_species(mut self, species: impl Into<String>) -> Self {
        self.species = Some(species.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.personality_traits.is_empty()
            && self.diet.is_none()
            && self.species.is_none()
            && self.name.is_none()
            && self.repeated_keys.is_empty()
    }

    #[must_use]
    pub fn matches(&self, animal: &Animal) -> bool {
        if !self.repeated_keys.is_empty() {
            return false;
        }
        if !self.personality_traits.iter().all(|wanted| animal.has_trait(wanted)) {
            return false;
        }
        if self.diet.as_ref().is_some_and(|diet| animal.diet != *diet) {
            return false;
        }
        if self.species.as_ref().is_some_and(|species| animal.species != *species) {
            return false;
        }
        if self.name.as_ref().is_some_and(|name| animal.name != *name) {
            return false;
        }
        true
    }
}

/// Narrow `records` to the ones satisfying every constraint in `criteria`, keeping store order.
#[must_use]
pub fn filter_by_query<'a>(criteria: &FilterCriteria, records: &'a [Animal]) -> Vec<&'a Animal> {
    if criteria.is_empty() {
        return records.iter().collect();
    }
    records.iter().filter(|animal| criteria.matches(animal)).collect()
}

/// First record in store order whose id equals `id`.
#[must_use]
pub fn find_by_id<'a>(id: &str, records: &'a [Animal]) -> Option<&'a Animal> {
    records.iter().find(|animal| animal.id.as_str() == id)
}

/// Source of identifiers for newly created animals.
pub trait IdStrategy: Send + Sync {
    fn next_id(&self, current_len: usize) -> AnimalId;
}

/// Positional ids: the decimal form of the store length before insertion.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialIds;

impl IdStrategy for SequentialIds {
    fn next_id(&self, current_len: usize) -> AnimalId {
        AnimalId(current_len.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct InvalidRecord {
    pub position: usize,
    pub id: AnimalId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IntegrityReport {
    pub record_count: usize,
    pub duplicate_ids: Vec<AnimalId>,
    pub invalid_records: Vec<InvalidRecord>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.duplicate_ids.is_empty() && self.invalid_records.is_empty()
    }
}

/// Report id collisions and records that no longer satisfy the shape rules.
#[must_use]
pub fn integrity_check(records: &[Animal]) -> IntegrityReport {
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    let mut invalid_records = Vec::new();

    for (position, animal) in records.iter().enumerate() {
        if !seen.insert(animal.id.clone()) {
            duplicates.insert(animal.id.clone());
        }
        if let Err(err) = animal.validate() {
            invalid_records.push(InvalidRecord {
                position,
                id: animal.id.clone(),
                reason: err.reason().to_string(),
            });
        }
    }

    IntegrityReport {
        record_count: records.len(),
        duplicate_ids: duplicates.into_iter().collect(),
        invalid_records,
    }
}
