use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::error::CacheError;
use crate::fingerprint::FileSetSpec;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("converter error: {0}")]
    Failed(String),
    #[error("converter panicked: {0}")]
    ConverterPanicked(String),
    #[error("conversion worker stopped")]
    WorkerStopped,
}

/// Converter-specific options. Opaque to the cache apart from their bytes,
/// which are folded into every key of the kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ConversionSettings(BTreeMap<String, String>);

impl ConversionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `name=value\n` lines in name order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.0 {
            out.extend_from_slice(name.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out
    }
}

/// A deterministic source -> artifact transform. For a fixed settings value
/// and format version the output must never change; bump the kind's version
/// whenever it does.
pub trait Converter: Send + Sync + 'static {
    fn convert(
        &self,
        source: &[u8],
        settings: &ConversionSettings,
    ) -> Result<Vec<u8>, ConversionError>;
}

impl<F> Converter for F
where
    F: Fn(&[u8], &ConversionSettings) -> Result<Vec<u8>, ConversionError> + Send + Sync + 'static,
{
    fn convert(
        &self,
        source: &[u8],
        settings: &ConversionSettings,
    ) -> Result<Vec<u8>, ConversionError> {
        self(source, settings)
    }
}

/// Pass-through converter, for kinds whose derived format is the source.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyConverter;

impl Converter for CopyConverter {
    fn convert(
        &self,
        source: &[u8],
        _settings: &ConversionSettings,
    ) -> Result<Vec<u8>, ConversionError> {
        Ok(source.to_vec())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionMode {
    /// Converted on the calling thread.
    #[default]
    Inline,
    /// Converted on a dedicated background worker.
    Worker,
}

impl fmt::Display for ConversionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConversionMode::Inline => "inline",
            ConversionMode::Worker => "worker",
        };
        write!(f, "{}", label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AssetKind {
    pub name: String,
    pub source_extension: String,
    pub target_extension: String,
    pub version: u32,
    #[serde(default)]
    pub mode: ConversionMode,
    #[serde(default)]
    pub settings: ConversionSettings,
    #[serde(default)]
    pub aux_file_sets: Vec<FileSetSpec>,
}

impl AssetKind {
    pub fn new(name: &str, source_extension: &str, target_extension: &str, version: u32) -> Self {
        Self {
            name: name.to_string(),
            source_extension: source_extension.to_string(),
            target_extension: target_extension.to_string(),
            version,
            mode: ConversionMode::Inline,
            settings: ConversionSettings::default(),
            aux_file_sets: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: ConversionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_settings(mut self, settings: ConversionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_aux_file_set(mut self, dir: &str, extension: &str) -> Self {
        self.aux_file_sets.push(FileSetSpec {
            dir: dir.to_string(),
            extension: extension.to_string(),
        });
        self
    }
}

#[derive(Clone)]
pub struct Registration {
    pub kind: AssetKind,
    pub converter: Arc<dyn Converter>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Kind name -> converter table, filled at startup.
#[derive(Debug, Default)]
pub struct ConverterRegistry {
    entries: BTreeMap<String, Registration>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: AssetKind,
        converter: Arc<dyn Converter>,
    ) -> Result<(), CacheError> {
        if self.entries.contains_key(&kind.name) {
            return Err(CacheError::Config(format!(
                "asset kind '{}' registered twice",
                kind.name
            )));
        }
        self.entries
            .insert(kind.name.clone(), Registration { kind, converter });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Registration> {
        self.entries.get(name)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &AssetKind> {
        self.entries.values().map(|registration| &registration.kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_registrations(self) -> impl Iterator<Item = Registration> {
        self.entries.into_values()
    }
}
