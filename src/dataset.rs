//! # Dataset Module
//!
//! A named collection of channels plus the dataset metadata, backed by one
//! directory on disk.
//!
//! ## Lifecycle
//! ```text
//! Empty → Receiving → (Analysed ↔ Receiving) → Persisted
//!                                      Loaded ↗
//! ```
//! Samples arrive through `new_line` + `add` or `add_all`; `analyse` rebuilds
//! the time-base; `save` refuses to run before that.
//!
//! ## Lazy Channels
//! The directory is scanned once, on first access to the channel collection.
//! Every blob found becomes a `NotLoaded` channel that reads itself on first
//! use. `free` drops everything in memory without touching disk.

use crate::channel::{Channel, Value, Values};
use crate::collaborators::{Collaborators, EventSource, Plotter};
use crate::config::Config;
use crate::error::{EventError, RawDataError};
use crate::events::{self, Event, NewEvent};
use crate::filter::FilterKind;
use crate::meta::{DatasetMeta, DbInfo, RawdataFile};
use crate::registry::{registry, Source};
use crate::storage;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetState {
    Empty,
    Receiving,
    Analysed,
    Persisted,
    Loaded,
}

#[derive(Debug)]
pub struct Dataset {
    pub(crate) path: Option<PathBuf>,
    pub(crate) config: Config,
    pub(crate) meta: DatasetMeta,
    pub(crate) channels: BTreeMap<String, Channel>,
    /// Directory already scanned for channel blobs
    pub(crate) status_cols: bool,
    current_line: Option<(f64, f64)>,
    pub(crate) state: DatasetState,
    pub(crate) collaborators: Collaborators,
}

impl Dataset {
    /// Dataset stored in `path`, with default settings
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(Some(path.into()), Config::default())
    }

    pub fn with_config(path: Option<PathBuf>, config: Config) -> Self {
        let meta = DatasetMeta::new(config.check_sum);
        Self {
            path,
            config,
            meta,
            channels: BTreeMap::new(),
            status_cols: false,
            current_line: None,
            state: DatasetState::Empty,
            collaborators: Collaborators::default(),
        }
    }

    /// Dataset without a directory; `save` and `load` fail with `NoPath`
    pub fn in_memory() -> Self {
        Self::with_config(None, Config::default())
    }

    /// Open `<data_dir>/<id>` and read its metadata
    pub fn open(id: &str, config: &Config) -> Result<Self, RawDataError> {
        let mut dataset = Self::with_config(Some(config.dataset_dir(id)), config.clone());
        dataset.load()?;
        Ok(dataset)
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn set_collaborators(&mut self, collaborators: Collaborators) {
        self.collaborators = collaborators;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn state(&self) -> DatasetState {
        self.state
    }

    pub fn is_analysed(&self) -> bool {
        matches!(self.state, DatasetState::Analysed | DatasetState::Persisted)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    /// Identity fields supplied by the caller
    pub fn db_mut(&mut self) -> &mut DbInfo {
        &mut self.meta.db
    }

    pub fn events(&self) -> &[Event] {
        &self.meta.events
    }

    fn dir(&self) -> Result<&Path, RawDataError> {
        self.path.as_deref().ok_or(RawDataError::NoPath)
    }

    /// Set the time used by subsequent single-sample `add` calls
    pub fn new_line(&mut self, t_calc: f64, t_rec: f64) {
        self.current_line = Some((t_calc, t_rec));
    }

    /// Append one sample at the current line
    ///
    /// Returns `false` without raising when there is no current line, the
    /// identifier is unknown or the value does not fit the channel.
    pub fn add(
        &mut self,
        identifier: &str,
        value: impl Into<Value>,
        source: Source,
        checksum: Option<u8>,
    ) -> bool {
        let Some((t_calc, t_rec)) = self.current_line else {
            log::debug!("Dropping {} sample: new_line was never called", identifier);
            return false;
        };
        let result = self
            .channel_entry(identifier, source)
            .and_then(|channel| channel.add(t_calc, t_rec, value, checksum));
        match result {
            Ok(()) => {
                self.state = DatasetState::Receiving;
                true
            }
            Err(e) => {
                log::warn!("Dropping {} sample: {}", identifier, e);
                false
            }
        }
    }

    /// Bulk append to one channel, bypassing the current line
    pub fn add_all(
        &mut self,
        identifier: &str,
        t_rec: &[f64],
        t_calc: &[f64],
        values: Vec<Value>,
        sort: bool,
        checksum: Option<&[u8]>,
    ) -> Result<(), RawDataError> {
        self.channel_entry(identifier, Source::Received)?
            .add_all(t_rec, t_calc, values, checksum, sort)?;
        self.state = DatasetState::Receiving;
        Ok(())
    }

    /// Existing channel (loaded) or a fresh one for a registry identifier
    fn channel_entry(&mut self, identifier: &str, source: Source) -> Result<&mut Channel, RawDataError> {
        let info = registry()
            .get(identifier)
            .ok_or_else(|| RawDataError::UnknownChannel(identifier.to_string()))?;
        self.discover_channels()?;
        let check_sum = self.meta.check_sum;
        let channel = self
            .channels
            .entry(identifier.to_string())
            .or_insert_with(|| Channel::new(info, source, check_sum));
        channel.ensure_loaded()?;
        Ok(channel)
    }

    /// Scan the directory once for channel blobs
    pub(crate) fn discover_channels(&mut self) -> Result<(), RawDataError> {
        if self.status_cols {
            return Ok(());
        }
        self.status_cols = true;
        let Some(dir) = self.path.clone() else {
            return Ok(());
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let retries = self.config.load_retries;
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(storage::channel_stem) else {
                continue;
            };
            let Some(info) = registry().get(stem) else {
                log::debug!("Ignoring unknown blob {}", entry.path().display());
                continue;
            };
            self.channels
                .entry(stem.to_string())
                .or_insert_with(|| Channel::on_disk(info, entry.path(), retries));
        }
        log::debug!("Discovered {} channels in {}", self.channels.len(), dir.display());
        Ok(())
    }

    /// Channel by identifier, reading it from disk on first use
    pub fn channel(&mut self, identifier: &str) -> Result<&Channel, RawDataError> {
        self.channel_mut(identifier).map(|channel| &*channel)
    }

    pub fn channel_mut(&mut self, identifier: &str) -> Result<&mut Channel, RawDataError> {
        self.discover_channels()?;
        let channel = self
            .channels
            .get_mut(identifier)
            .ok_or_else(|| RawDataError::MissingChannel(identifier.to_string()))?;
        channel.ensure_loaded()?;
        Ok(channel)
    }

    /// Channel as currently held in memory, without discovery or loading
    pub fn loaded(&self, identifier: &str) -> Option<&Channel> {
        self.channels.get(identifier)
    }

    /// Present identifiers in display order
    pub fn identifiers(&mut self) -> Result<Vec<String>, RawDataError> {
        self.discover_channels()?;
        let mut identifiers: Vec<String> = self.channels.keys().cloned().collect();
        identifiers.sort_by_key(|id| registry().position(id));
        Ok(identifiers)
    }

    /// Read the metadata blob, dropping in-memory channels
    pub fn load(&mut self) -> Result<(), RawDataError> {
        let dir = self.dir()?.to_path_buf();
        match storage::read_meta(&dir, self.config.load_retries)? {
            Some(file) => self.meta = file.meta,
            None => {
                log::warn!("No metadata blob in {}, using defaults", dir.display());
                self.meta = DatasetMeta::new(self.config.check_sum);
            }
        }
        self.free();
        self.current_line = None;
        self.state = DatasetState::Loaded;
        log::info!(
            "Loaded dataset {} (rd_version {})",
            dir.display(),
            self.meta.rd_version
        );
        Ok(())
    }

    /// Point the dataset at `<data_dir>/<id>` and load it
    pub fn load_id(&mut self, id: &str) -> Result<(), RawDataError> {
        self.path = Some(self.config.dataset_dir(id));
        self.load()
    }

    /// Persist metadata, the summary document and, unless `meta_only`, all channels
    pub fn save(&mut self, meta_only: bool) -> Result<(), RawDataError> {
        let dir = self.dir()?.to_path_buf();
        if !self.is_analysed() {
            return Err(RawDataError::NotAnalysed);
        }
        self.discover_channels()?;
        for channel in self.channels.values_mut() {
            channel.ensure_loaded()?;
        }

        let mut available: Vec<String> = self
            .channels
            .values()
            .filter(|c| !c.is_volatile() && !c.is_empty())
            .map(|c| c.identifier().to_string())
            .collect();
        available.sort_by_key(|id| registry().position(id));
        self.meta.available_cols = available;
        self.meta.last_update = Some(Utc::now().timestamp_millis());
        self.meta.last_update_username = Some(self.config.username.clone());

        fs::create_dir_all(&dir)?;
        storage::write_meta(
            &dir,
            &RawdataFile {
                meta: self.meta.clone(),
            },
        )?;
        storage::write_summary(&dir, &self.meta, self.channels.values())?;

        if !meta_only {
            for channel in self.channels.values_mut() {
                if !channel.is_empty() {
                    channel.save(&dir)?;
                }
            }
        }
        self.state = DatasetState::Persisted;
        log::info!(
            "Saved dataset {} ({} channels)",
            dir.display(),
            self.meta.available_cols.len()
        );
        Ok(())
    }

    /// Drop all in-memory channels; the next access scans the directory again
    pub fn free(&mut self) {
        self.channels.clear();
        self.status_cols = false;
    }

    fn persist_meta(&self) -> Result<(), RawDataError> {
        if let Some(dir) = &self.path {
            storage::write_meta(
                dir,
                &RawdataFile {
                    meta: self.meta.clone(),
                },
            )?;
        }
        Ok(())
    }

    /// Place an annotation on the timeline and persist the metadata
    pub fn add_event(&mut self, event: NewEvent) -> Result<u64, RawDataError> {
        let id = events::insert(
            &mut self.meta.events,
            event,
            self.meta.db.start_time(),
            self.meta.rd.duration,
        )?;
        self.persist_meta()?;
        Ok(id)
    }

    pub fn delete_event(&mut self, id: u64) -> Result<Event, RawDataError> {
        let removed = events::remove(&mut self.meta.events, id)?;
        self.persist_meta()?;
        Ok(removed)
    }

    /// Add every event the source knows for this session; returns how many were new
    pub fn import_events(&mut self, source: &dyn EventSource) -> Result<usize, RawDataError> {
        let mut added = 0;
        for draft in source.events(&self.meta.db) {
            match events::insert(
                &mut self.meta.events,
                draft,
                self.meta.db.start_time(),
                self.meta.rd.duration,
            ) {
                Ok(_) => added += 1,
                Err(EventError::Duplicate(start)) => {
                    log::debug!("Event at {} already present", start)
                }
                Err(EventError::NoSessionStart) => return Err(EventError::NoSessionStart.into()),
                Err(e) => log::warn!("Skipping imported event: {}", e),
            }
        }
        if added > 0 {
            self.persist_meta()?;
        }
        Ok(added)
    }

    /// Delete a channel from memory and its blob from disk
    pub fn remove_channel(&mut self, identifier: &str) -> Result<Option<Channel>, RawDataError> {
        self.discover_channels()?;
        let removed = self.channels.remove(identifier);
        if let Some(dir) = &self.path {
            match fs::remove_file(storage::blob_path(dir, identifier)) {
                Ok(()) => log::debug!("Deleted blob for {}", identifier),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Replace a computed channel wholesale
    pub(crate) fn put_calculated(
        &mut self,
        identifier: &str,
        t_calc: Vec<f64>,
        t_rec: Vec<f64>,
        values: Values,
    ) -> Result<(), RawDataError> {
        let info = registry()
            .get(identifier)
            .ok_or_else(|| RawDataError::UnknownChannel(identifier.to_string()))?;
        let mut channel = Channel::new(info, info.source(), self.meta.check_sum);
        channel.replace(t_calc, t_rec, values)?;
        channel.update_range();
        self.channels.insert(identifier.to_string(), channel);
        Ok(())
    }

    /// Filter a channel and keep the result in its volatile `<id>_filtered` twin
    pub fn store_filtered(
        &mut self,
        identifier: &str,
        kind: FilterKind,
    ) -> Result<&Channel, RawDataError> {
        let target = format!("{}_filtered", identifier);
        if !registry().contains(&target) {
            return Err(RawDataError::UnknownChannel(target));
        }
        let channel = self.channel_mut(identifier)?;
        let filtered = channel.filter(kind).to_vec();
        let t_calc = channel.t_calc().to_vec();
        let t_rec = channel.t_rec().to_vec();
        self.put_calculated(&target, t_calc, t_rec, Values::Float(filtered))?;
        self.channel(&target)
    }

    /// Spike-removed view of a PPG channel through the configured remover
    pub fn rm_spikes(&mut self, identifier: &str, filled: bool) -> Result<&[f64], RawDataError> {
        self.discover_channels()?;
        let remover = self
            .collaborators
            .spike_remover
            .as_deref()
            .ok_or(RawDataError::CollaboratorUnavailable("spike removal"))?;
        let channel = self
            .channels
            .get_mut(identifier)
            .ok_or_else(|| RawDataError::MissingChannel(identifier.to_string()))?;
        channel.ensure_loaded()?;
        channel.rm_spikes(remover, filled)
    }

    /// Estimate SpO2 from `ppg_red` and `ppg_ir` into the calculated `spo2` channel
    pub fn compute_spo2(&mut self) -> Result<usize, RawDataError> {
        if self.collaborators.spo2.is_none() {
            return Err(RawDataError::CollaboratorUnavailable("SpO2"));
        }
        self.channel_mut("ppg_red")?;
        self.channel_mut("ppg_ir")?;
        let (Some(estimator), Some(red), Some(ir)) = (
            self.collaborators.spo2.as_deref(),
            self.channels.get("ppg_red"),
            self.channels.get("ppg_ir"),
        ) else {
            return Err(RawDataError::MissingChannel("ppg_red/ppg_ir".to_string()));
        };
        let samples = estimator.estimate(red, ir);
        let count = samples.len();
        let t_calc = samples.iter().map(|s| s.t_calc).collect();
        let t_rec = samples.iter().map(|s| s.t_rec).collect();
        let values = Values::Float(samples.iter().map(|s| s.value).collect());
        self.put_calculated("spo2", t_calc, t_rec, values)?;
        log::info!("Computed {} SpO2 estimates", count);
        Ok(count)
    }

    /// Hand channels to a plotting collaborator
    pub fn plot(&self, plotter: &dyn Plotter, identifiers: &[String]) -> Result<(), RawDataError> {
        plotter
            .plot(self, identifiers)
            .map_err(RawDataError::Collaborator)
    }
}
