//! The entry point applications use: "give me something loadable for this
//! source stem".
//!
//! Resolution order is archive cache, loose cache, fresh conversion, then a
//! hand-provided `<stem>.<target_ext>` file. Worker-backed kinds convert on
//! their own thread; callers either block in `get_loadable_path` or issue
//! `request` and collect completions with `pump` at a point of their choosing.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache_key::{CacheKey, CacheKeyBuilder};
use crate::cache_paths;
use crate::config::CacheConfig;
use crate::converter::{AssetKind, ConversionError, ConversionMode, Converter, ConverterRegistry, Registration};
use crate::error::CacheError;
use crate::fingerprint::FileSetFingerprint;
use crate::resolver::{CacheLocation, CacheResolver, ResolveReport};
use crate::storage::Storage;
use crate::worker::{ConversionRequest, ConversionResult, ConversionWorker, RequestTag, WorkerTelemetry};

#[derive(Debug)]
pub enum Loadable {
    /// Shipped archive cache.
    Archive(String),
    /// Loose cache written by an earlier conversion.
    Loose(String),
    /// Converted just now and written to the loose cache.
    Converted { path: String, bytes: Arc<Vec<u8>> },
    /// Converted, but the artifact could not be stored. The bytes are still
    /// usable for this session.
    Unpersisted {
        path: String,
        bytes: Arc<Vec<u8>>,
        error: CacheError,
    },
    /// Hand-provided artifact used as-is, possibly after a failed conversion.
    Uncached {
        path: String,
        conversion_error: Option<ConversionError>,
    },
}

impl Loadable {
    pub fn path(&self) -> &str {
        match self {
            Loadable::Archive(path) | Loadable::Loose(path) => path,
            Loadable::Converted { path, .. }
            | Loadable::Unpersisted { path, .. }
            | Loadable::Uncached { path, .. } => path,
        }
    }

    /// In-memory artifact bytes, when the load produced them.
    pub fn bytes(&self) -> Option<&Arc<Vec<u8>>> {
        match self {
            Loadable::Converted { bytes, .. } | Loadable::Unpersisted { bytes, .. } => Some(bytes),
            _ => None,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(
            self,
            Loadable::Archive(_) | Loadable::Loose(_) | Loadable::Converted { .. }
        )
    }
}

#[derive(Debug)]
pub enum LoadTicket {
    Ready(Loadable),
    /// Submitted to the kind's worker; the outcome arrives through `pump`.
    Pending(RequestTag),
}

#[derive(Debug)]
pub struct CompletedLoad {
    pub tag: RequestTag,
    pub kind: String,
    pub stem: String,
    pub outcome: Result<Loadable, CacheError>,
}

struct KindSlot {
    kind: AssetKind,
    converter: Arc<dyn Converter>,
    resolver: CacheResolver,
    worker: Option<ConversionWorker>,
    fingerprints: Vec<FileSetFingerprint>,
}

struct PendingLoad {
    kind: String,
    stem: String,
    destination: String,
}

pub struct AssetCacheManager {
    storage: Arc<dyn Storage>,
    slots: BTreeMap<String, KindSlot>,
    pending: HashMap<RequestTag, PendingLoad>,
    in_flight: HashMap<String, RequestTag>,
    stashed: VecDeque<CompletedLoad>,
    poll_interval: Duration,
}

impl AssetCacheManager {
    /// Starts one worker per worker-mode kind in `registry`.
    pub fn new(
        storage: Arc<dyn Storage>,
        config: &CacheConfig,
        registry: ConverterRegistry,
    ) -> Result<Self, CacheError> {
        let validation = config.validate();
        if !validation.is_ok() {
            return Err(CacheError::Config(validation.errors.join("; ")));
        }
        for warning in &validation.warnings {
            warn!("{}", warning);
        }

        let settings = config.resolver_settings();
        let mut slots = BTreeMap::new();
        for Registration { kind, converter } in registry.into_registrations() {
            let resolver = CacheResolver::new(
                Arc::clone(&storage),
                kind.target_extension.clone(),
                settings.clone(),
            );
            let worker = match kind.mode {
                ConversionMode::Worker => Some(
                    ConversionWorker::spawn(&kind.name, Arc::clone(&converter)).map_err(
                        |source| CacheError::WorkerSpawn {
                            kind: kind.name.clone(),
                            source,
                        },
                    )?,
                ),
                ConversionMode::Inline => None,
            };
            let fingerprints = kind
                .aux_file_sets
                .iter()
                .cloned()
                .map(FileSetFingerprint::new)
                .collect();
            debug!(kind = %kind.name, mode = %kind.mode, version = kind.version, "registered asset kind");
            slots.insert(
                kind.name.clone(),
                KindSlot {
                    kind,
                    converter,
                    resolver,
                    worker,
                    fingerprints,
                },
            );
        }

        Ok(Self {
            storage,
            slots,
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            stashed: VecDeque::new(),
            poll_interval: config.poll_interval(),
        })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &AssetKind> {
        self.slots.values().map(|slot| &slot.kind)
    }

    /// Blocking load. For worker-backed kinds this polls until the
    /// conversion finishes; completions for other requests seen meanwhile
    /// are kept for the next `pump`.
    pub fn get_loadable_path(&mut self, stem: &str, kind: &str) -> Result<Loadable, CacheError> {
        match self.request(stem, kind)? {
            LoadTicket::Ready(loadable) => Ok(loadable),
            LoadTicket::Pending(tag) => self.wait_for(tag),
        }
    }

    /// Non-blocking load. Requests for an artifact that is already being
    /// converted share the earlier ticket.
    pub fn request(&mut self, stem: &str, kind: &str) -> Result<LoadTicket, CacheError> {
        let storage = Arc::clone(&self.storage);
        let slot = self
            .slots
            .get_mut(kind)
            .ok_or_else(|| CacheError::UnknownKind(kind.to_string()))?;
        let source = cache_paths::source_path(stem, &slot.kind.source_extension);
        let inputs = key_inputs(storage.as_ref(), slot)?;

        let location = match slot.resolver.resolve(&source, &inputs) {
            Ok(location) => location,
            Err(CacheError::NoSource { .. }) => {
                debug!(%source, "no source, trying uncached artifact");
                return fallback(storage.as_ref(), stem, &slot.kind, &source, None)
                    .map(LoadTicket::Ready);
            }
            Err(err) => return Err(err),
        };
        let destination = match location {
            CacheLocation::Archive(path) => return Ok(LoadTicket::Ready(Loadable::Archive(path))),
            CacheLocation::Loose(path) => return Ok(LoadTicket::Ready(Loadable::Loose(path))),
            CacheLocation::Miss(path) => path,
        };
        if slot.worker.is_some() {
            if let Some(tag) = self.in_flight.get(&destination) {
                debug!(%source, %tag, "conversion already in flight");
                return Ok(LoadTicket::Pending(*tag));
            }
        }

        let identity = slot.resolver.source_identity(&source)?;
        let source_bytes = storage
            .load(&source)
            .map_err(|err| CacheError::SourceUnavailable {
                path: source.clone(),
                source: err,
            })?;
        let request = ConversionRequest {
            source: identity,
            destination: destination.clone(),
            settings: slot.kind.settings.clone(),
            source_bytes,
        };

        match &slot.worker {
            Some(worker) => {
                let tag = worker.submit(request);
                info!(kind, %source, %tag, "queued conversion");
                self.pending.insert(
                    tag,
                    PendingLoad {
                        kind: kind.to_string(),
                        stem: stem.to_string(),
                        destination: destination.clone(),
                    },
                );
                self.in_flight.insert(destination, tag);
                Ok(LoadTicket::Pending(tag))
            }
            None => {
                info!(kind, %source, "converting");
                let outcome = slot
                    .converter
                    .convert(&request.source_bytes, &request.settings);
                finish(storage.as_ref(), stem, &slot.kind, &source, destination, outcome)
                    .map(LoadTicket::Ready)
            }
        }
    }

    /// Collects every finished worker conversion, persisting successes and
    /// applying the uncached fallback to failures.
    pub fn pump(&mut self) -> Vec<CompletedLoad> {
        let mut completed: Vec<CompletedLoad> = self.stashed.drain(..).collect();
        completed.extend(self.collect_results());
        completed
    }

    /// True while any worker has queued or running conversions, or finished
    /// ones have not been collected yet.
    pub fn is_busy(&self) -> bool {
        !self.pending.is_empty()
            || !self.stashed.is_empty()
            || self
                .slots
                .values()
                .filter_map(|slot| slot.worker.as_ref())
                .any(ConversionWorker::is_busy)
    }

    /// Stops every worker, waiting for running conversions. Requests that
    /// were still queued complete with `WorkerStopped` on the next `pump`.
    pub fn shutdown(&mut self) {
        for slot in self.slots.values_mut() {
            if let Some(worker) = slot.worker.as_mut() {
                worker.shutdown();
            }
        }
    }

    /// File-watch entry point. Returns how many auxiliary fingerprints were
    /// invalidated by a change to `path`.
    pub fn notify_file_changed(&mut self, path: &str) -> usize {
        let mut invalidated = 0usize;
        for slot in self.slots.values_mut() {
            for fingerprint in &mut slot.fingerprints {
                if fingerprint.covers(path) {
                    fingerprint.invalidate();
                    invalidated += 1;
                }
            }
        }
        if invalidated > 0 {
            debug!(path, invalidated, "auxiliary fingerprints invalidated");
        }
        invalidated
    }

    /// Final cache key of `<stem>.<source_ext>` for `kind`.
    pub fn key_for(&mut self, stem: &str, kind: &str) -> Result<CacheKey, CacheError> {
        let storage = Arc::clone(&self.storage);
        let slot = self
            .slots
            .get_mut(kind)
            .ok_or_else(|| CacheError::UnknownKind(kind.to_string()))?;
        let source = cache_paths::source_path(stem, &slot.kind.source_extension);
        let inputs = key_inputs(storage.as_ref(), slot)?;
        let identity = slot.resolver.source_identity(&source)?;
        Ok(inputs.build(&identity))
    }

    pub fn explain(&mut self, stem: &str, kind: &str) -> Result<ResolveReport, CacheError> {
        let storage = Arc::clone(&self.storage);
        let slot = self
            .slots
            .get_mut(kind)
            .ok_or_else(|| CacheError::UnknownKind(kind.to_string()))?;
        let source = cache_paths::source_path(stem, &slot.kind.source_extension);
        let inputs = key_inputs(storage.as_ref(), slot)?;
        slot.resolver.explain(&source, &inputs)
    }

    pub fn worker_telemetry(&self, kind: &str) -> Option<WorkerTelemetry> {
        self.slots
            .get(kind)
            .and_then(|slot| slot.worker.as_ref())
            .map(ConversionWorker::telemetry)
    }

    fn wait_for(&mut self, tag: RequestTag) -> Result<Loadable, CacheError> {
        if let Some(index) = self.stashed.iter().position(|done| done.tag == tag) {
            if let Some(done) = self.stashed.remove(index) {
                return done.outcome;
            }
        }
        loop {
            let mut found = None;
            for done in self.collect_results() {
                if done.tag == tag {
                    found = Some(done.outcome);
                } else {
                    self.stashed.push_back(done);
                }
            }
            if let Some(outcome) = found {
                return outcome;
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn collect_results(&mut self) -> Vec<CompletedLoad> {
        let storage = Arc::clone(&self.storage);
        let mut completed = Vec::new();
        for slot in self.slots.values() {
            let Some(worker) = slot.worker.as_ref() else {
                continue;
            };
            while let Some(result) = worker.poll() {
                let ConversionResult {
                    tag,
                    destination,
                    outcome,
                } = result;
                let Some(pending) = self.pending.remove(&tag) else {
                    warn!(kind = %slot.kind.name, %tag, "dropping result for unknown request");
                    continue;
                };
                self.in_flight.remove(&destination);
                let source = cache_paths::source_path(&pending.stem, &slot.kind.source_extension);
                let outcome = finish(
                    storage.as_ref(),
                    &pending.stem,
                    &slot.kind,
                    &source,
                    pending.destination,
                    outcome,
                );
                completed.push(CompletedLoad {
                    tag,
                    kind: pending.kind,
                    stem: pending.stem,
                    outcome,
                });
            }
        }
        completed
    }
}

impl Drop for AssetCacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// Version, then settings bytes, then one digest per auxiliary file set.
fn key_inputs(storage: &dyn Storage, slot: &mut KindSlot) -> Result<CacheKeyBuilder, CacheError> {
    let mut inputs = CacheKeyBuilder::new(slot.kind.version);
    if !slot.kind.settings.is_empty() {
        inputs.push_aux(slot.kind.settings.canonical_bytes());
    }
    for fingerprint in &mut slot.fingerprints {
        let key = fingerprint
            .get(storage)
            .map_err(|err| CacheError::SourceUnavailable {
                path: fingerprint.spec().dir.clone(),
                source: err,
            })?;
        inputs.push_aux(key.as_bytes().to_vec());
    }
    Ok(inputs)
}

// Writes only happen here, and only for a successful non-empty output.
fn finish(
    storage: &dyn Storage,
    stem: &str,
    kind: &AssetKind,
    source: &str,
    destination: String,
    outcome: Result<Vec<u8>, ConversionError>,
) -> Result<Loadable, CacheError> {
    match outcome {
        Ok(bytes) if bytes.is_empty() => {
            warn!(%source, "converter produced no output, not caching");
            Ok(Loadable::Unpersisted {
                error: CacheError::EmptyOutput {
                    path: destination.clone(),
                },
                path: destination,
                bytes: Arc::new(bytes),
            })
        }
        Ok(bytes) => match storage.create(&destination, &bytes) {
            Ok(()) => {
                info!(%source, path = %destination, size = bytes.len(), "cached conversion");
                Ok(Loadable::Converted {
                    path: destination,
                    bytes: Arc::new(bytes),
                })
            }
            Err(err) => {
                warn!(%source, path = %destination, "cache write failed: {}", err);
                Ok(Loadable::Unpersisted {
                    error: CacheError::CacheWriteFailed {
                        path: destination.clone(),
                        source: err,
                    },
                    path: destination,
                    bytes: Arc::new(bytes),
                })
            }
        },
        Err(err) => {
            warn!(%source, "conversion failed: {}", err);
            fallback(storage, stem, kind, source, Some(err))
        }
    }
}

fn fallback(
    storage: &dyn Storage,
    stem: &str,
    kind: &AssetKind,
    source: &str,
    conversion_error: Option<ConversionError>,
) -> Result<Loadable, CacheError> {
    let uncached = cache_paths::uncached_artifact_path(stem, &kind.target_extension);
    match storage.stat(&uncached) {
        Ok(Some(_)) => {
            debug!(path = %uncached, "using uncached artifact");
            Ok(Loadable::Uncached {
                path: uncached,
                conversion_error,
            })
        }
        Ok(None) => Err(match conversion_error {
            Some(err) => CacheError::ConversionFailed {
                path: source.to_string(),
                source: err,
            },
            None => CacheError::NoSourceNoCache { path: uncached },
        }),
        Err(err) => Err(CacheError::SourceUnavailable {
            path: uncached,
            source: err,
        }),
    }
}
