use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use zookeeper_core::Animal;

/// Durable mirror of the in-memory catalog.
pub trait Persistence: Send + Sync {
    /// Replace the durable copy with `animals`.
    ///
    /// # Errors
    /// Returns an error when the new state could not be written completely.
    fn save(&self, animals: &[Animal]) -> Result<()>;
}

/// On-disk layout: `{ "animals": [ ... ] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AnimalsDocument {
    pub animals: Vec<Animal>,
}

#[derive(Serialize)]
struct AnimalsDocumentRef<'a> {
    animals: &'a [Animal],
}

/// Render the catalog as pretty JSON with 2-space indentation.
///
/// # Errors
/// Returns an error when serialization fails.
pub fn render_document(animals: &[Animal]) -> Result<String> {
    serde_json::to_string_pretty(&AnimalsDocumentRef { animals })
        .context("failed to serialize animals document")
}

/// Parse a document produced by [`render_document`] (or written by hand in the same layout).
///
/// # Errors
/// Returns an error when `raw` is not a valid animals document.
pub fn parse_document(raw: &str) -> Result<Vec<Animal>> {
    let document: AnimalsDocument =
        serde_json::from_str(raw).context("failed to parse animals document")?;
    Ok(document.animals)
}

/// File-backed store that rewrites the whole document on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(ToOwned::to_owned).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Load every animal from the backing file. A missing file is an empty catalog.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Vec<Animal>> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "animals file not found; starting empty");
            return Ok(Vec::new());
        }

        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read animals file {}", self.path.display()))?;
        let animals = parse_document(&raw)
            .with_context(|| format!("invalid animals file {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), count = animals.len(), "loaded animals");
        Ok(animals)
    }
}

impl Persistence for JsonFileStore {
    fn save(&self, animals: &[Animal]) -> Result<()> {
        let body = render_document(animals)?;

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create data directory {}", parent.display())
            })?;
        }

        let temp_path = self.temp_path();
        let file = File::create(&temp_path)
            .with_context(|| format!("failed to create temp file {}", temp_path.display()))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(body.as_bytes())
            .with_context(|| format!("failed to write temp file {}", temp_path.display()))?;
        let file = writer
            .into_inner()
            .map_err(std::io::IntoInnerError::into_error)
            .with_context(|| format!("failed to flush temp file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp file {}", temp_path.display()))?;

        if let Err(err) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err).with_context(|| {
                format!("failed to replace animals file {}", self.path.display())
            });
        }

        tracing::debug!(path = %self.path.display(), count = animals.len(), "persisted animals");
        Ok(())
    }
}
