//! # Channel Storage Module
//!
//! Per-channel storage of aligned sample triples `(t_calc, t_rec, value)`.
//!
//! ## Key Types
//! - `Value`: a sample as supplied by a caller, before casting
//! - `Values`: a typed column matching the channel's registry cast
//! - `Channel`: the three parallel sequences, optional checksums, metadata,
//!   lazy persistence and memoized derived views
//!
//! ## Lazy Loading
//! A channel discovered on disk starts as `NotLoaded` and reads its blob the
//! first time samples are needed. A missing file leaves it `NoFile`, which is
//! not an error.
//!
//! ## Derived Views
//! Minutes, hours, timestamps, smoothed, moving-max, filtered and
//! spike-removed views are computed on first request and kept until
//! `invalidate` or any mutation of the samples.

use crate::collaborators::SpikeRemover;
use crate::error::RawDataError;
use crate::filter::FilterKind;
use crate::registry::{Cast, ChannelInfo, Source};
use crate::storage::{self, ChannelBlob, ChannelFile, StoredValues};
use crate::timeseries::{SeriesExt, VIEW_WINDOW};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A sample value as handed to `add`
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Time(DateTime<Utc>),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Time(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl Value {
    /// Convert to the canonical variant for `cast`, or `None` if impossible
    pub fn coerce(&self, cast: Cast) -> Option<Value> {
        match (cast, self) {
            (Cast::Int, Value::Int(v)) => Some(Value::Int(*v)),
            (Cast::Int, Value::Float(v)) if v.is_finite() && v.abs() < i64::MAX as f64 => {
                Some(Value::Int(v.trunc() as i64))
            }
            (Cast::Int, Value::Text(s)) => s.trim().parse::<i64>().ok().map(Value::Int),
            (Cast::Float, Value::Int(v)) => Some(Value::Float(*v as f64)),
            (Cast::Float, Value::Float(v)) => Some(Value::Float(*v)),
            (Cast::Float, Value::Text(s)) => s.trim().parse::<f64>().ok().map(Value::Float),
            (Cast::Time, Value::Time(v)) => to_micros(*v).map(Value::Time),
            (Cast::Time, Value::Int(secs)) => Utc.timestamp_opt(*secs, 0).single().map(Value::Time),
            (Cast::Time, Value::Float(secs)) if secs.is_finite() => Utc
                .timestamp_micros((secs * 1e6).round() as i64)
                .single()
                .map(Value::Time),
            (Cast::Time, Value::Text(s)) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .and_then(|t| to_micros(t.with_timezone(&Utc)))
                .map(Value::Time),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Time(v) => Some(v.timestamp_micros() as f64 / 1e6),
            Value::Text(_) => None,
        }
    }
}

/// Instants are held at the microsecond resolution they are stored with
fn to_micros(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Utc.timestamp_micros(t.timestamp_micros()).single()
}

/// Typed sample column
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Time(Vec<DateTime<Utc>>),
}

impl Values {
    pub fn empty(cast: Cast) -> Self {
        match cast {
            Cast::Int => Values::Int(Vec::new()),
            Cast::Float => Values::Float(Vec::new()),
            Cast::Time => Values::Time(Vec::new()),
        }
    }

    pub fn cast(&self) -> Cast {
        match self {
            Values::Int(_) => Cast::Int,
            Values::Float(_) => Cast::Float,
            Values::Time(_) => Cast::Time,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Values::Int(v) => v.len(),
            Values::Float(v) => v.len(),
            Values::Time(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        match self {
            Values::Int(v) => v.get(index).copied().map(Value::Int),
            Values::Float(v) => v.get(index).copied().map(Value::Float),
            Values::Time(v) => v.get(index).copied().map(Value::Time),
        }
    }

    /// Numeric view; instants become Unix seconds
    pub fn to_f64(&self) -> Vec<f64> {
        match self {
            Values::Int(v) => v.iter().map(|x| *x as f64).collect(),
            Values::Float(v) => v.clone(),
            Values::Time(v) => v
                .iter()
                .map(|t| t.timestamp_micros() as f64 / 1e6)
                .collect(),
        }
    }

    /// Append `value` after casting; hands it back on failure
    pub fn try_push(&mut self, value: Value) -> Result<(), Value> {
        let Some(cast) = value.coerce(self.cast()) else {
            return Err(value);
        };
        match (self, cast) {
            (Values::Int(v), Value::Int(x)) => v.push(x),
            (Values::Float(v), Value::Float(x)) => v.push(x),
            (Values::Time(v), Value::Time(x)) => v.push(x),
            _ => unreachable!("coerce returns the column's variant"),
        }
        Ok(())
    }

    /// Re-type a column loaded from disk
    fn recast(self, cast: Cast) -> Result<Values, Value> {
        if self.cast() == cast {
            return Ok(self);
        }
        let mut out = Values::empty(cast);
        for i in 0..self.len() {
            if let Some(value) = self.get(i) {
                out.try_push(value)?;
            }
        }
        Ok(out)
    }

    fn append(&mut self, other: Values) {
        match (self, other) {
            (Values::Int(v), Values::Int(o)) => v.extend(o),
            (Values::Float(v), Values::Float(o)) => v.extend(o),
            (Values::Time(v), Values::Time(o)) => v.extend(o),
            _ => unreachable!("columns of a channel share one cast"),
        }
    }

    fn permute(&mut self, order: &[usize]) {
        match self {
            Values::Int(v) => *v = permuted(v, order),
            Values::Float(v) => *v = permuted(v, order),
            Values::Time(v) => *v = permuted(v, order),
        }
    }
}

impl From<StoredValues> for Values {
    fn from(stored: StoredValues) -> Self {
        match stored {
            StoredValues::Int(v) => Values::Int(v),
            StoredValues::Float(v) => Values::Float(v),
            StoredValues::Time(v) => Values::Time(
                v.into_iter()
                    .filter_map(|us| Utc.timestamp_micros(us).single())
                    .collect(),
            ),
        }
    }
}

impl From<&Values> for StoredValues {
    fn from(values: &Values) -> Self {
        match values {
            Values::Int(v) => StoredValues::Int(v.clone()),
            Values::Float(v) => StoredValues::Float(v.clone()),
            Values::Time(v) => StoredValues::Time(v.iter().map(|t| t.timestamp_micros()).collect()),
        }
    }
}

/// `t0` shifted by `seconds`, or `None` when the result is not representable
fn offset_instant(t0: DateTime<Utc>, seconds: f64) -> Option<DateTime<Utc>> {
    let micros = (seconds * 1e6).round();
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return None;
    }
    t0.checked_add_signed(TimeDelta::microseconds(micros as i64))
}

fn permuted<T: Copy>(values: &[T], order: &[usize]) -> Vec<T> {
    order.iter().map(|&i| values[i]).collect()
}

/// Persisted per-channel metadata
#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq,
)]
#[archive(check_bytes)]
pub struct ChannelMeta {
    pub identifier: String,
    pub source: Source,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Overrides the registry's nominal rate when set
    pub sampling_rate_custom: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Created in memory, nothing added yet
    Empty,
    /// Known on disk, blob not read yet
    NotLoaded,
    /// Blob was looked for and does not exist
    NoFile,
    Loaded,
    /// Samples added since creation or load
    Added,
}

/// Memoized views that can be dropped individually
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedKind {
    Minutes,
    Hours,
    Timestamps,
    Smoothed,
    MovingMax,
    Filtered,
    SpikesRemoved,
}

#[derive(Debug, Clone, Default)]
struct Derived {
    minutes: Option<Vec<f64>>,
    hours: Option<Vec<f64>>,
    timestamps: Option<(DateTime<Utc>, Vec<DateTime<Utc>>)>,
    smoothed: Option<Vec<f64>>,
    moving_max: Option<Vec<f64>>,
    filtered: Option<Vec<f64>>,
    spikes_removed: Option<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct Channel {
    info: &'static ChannelInfo,
    t_calc: Vec<f64>,
    t_rec: Vec<f64>,
    values: Values,
    check_sum: Option<Vec<u8>>,
    meta: ChannelMeta,
    status: ChannelStatus,
    file: Option<PathBuf>,
    load_retries: u32,
    legacy: bool,
    derived: Derived,
}

impl Channel {
    pub fn new(info: &'static ChannelInfo, source: Source, check_sum: bool) -> Self {
        Self {
            info,
            t_calc: Vec::new(),
            t_rec: Vec::new(),
            values: Values::empty(info.cast),
            check_sum: check_sum.then(Vec::new),
            meta: ChannelMeta {
                identifier: info.name.to_string(),
                source,
                min: None,
                max: None,
                sampling_rate_custom: None,
            },
            status: ChannelStatus::Empty,
            file: None,
            load_retries: 1,
            legacy: false,
            derived: Derived::default(),
        }
    }

    /// Wrapper for a blob found on disk; samples are read on first use
    pub fn on_disk(info: &'static ChannelInfo, file: PathBuf, load_retries: u32) -> Self {
        Self {
            status: ChannelStatus::NotLoaded,
            file: Some(file),
            load_retries: load_retries.max(1),
            ..Self::new(info, info.source(), false)
        }
    }

    pub fn identifier(&self) -> &str {
        &self.meta.identifier
    }

    pub fn info(&self) -> &'static ChannelInfo {
        self.info
    }

    pub fn meta(&self) -> &ChannelMeta {
        &self.meta
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn is_volatile(&self) -> bool {
        self.info.volatile
    }

    /// Loaded from the legacy layout whose counter may still overflow
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub fn t_calc(&self) -> &[f64] {
        &self.t_calc
    }

    pub fn t_rec(&self) -> &[f64] {
        &self.t_rec
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn check_sum(&self) -> Option<&[u8]> {
        self.check_sum.as_deref()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Custom rate if set, otherwise the registry's nominal rate
    pub fn sampling_rate(&self) -> Option<f64> {
        self.meta.sampling_rate_custom.or(self.info.sampling_rate)
    }

    pub fn set_sampling_rate_custom(&mut self, rate: Option<f64>) {
        self.meta.sampling_rate_custom = rate;
    }

    pub fn ensure_loaded(&mut self) -> Result<(), RawDataError> {
        if self.status == ChannelStatus::NotLoaded {
            self.load()?;
        }
        Ok(())
    }

    /// Read the channel blob, replacing anything held in memory
    pub fn load(&mut self) -> Result<(), RawDataError> {
        let path = self.file.clone().ok_or(RawDataError::NoPath)?;
        let Some(file) = storage::read_channel(&path, self.load_retries)? else {
            log::debug!("No blob for channel {} at {}", self.identifier(), path.display());
            self.status = ChannelStatus::NoFile;
            return Ok(());
        };

        let corrupt = |reason: String| RawDataError::CorruptBlob {
            path: path.clone(),
            reason,
        };

        let (t_calc, t_rec, values, check_sum, meta, legacy) = match file {
            ChannelFile::Current(blob) => (
                blob.time_calc,
                blob.time_rec,
                blob.values,
                blob.check_sum,
                blob.meta,
                false,
            ),
            ChannelFile::Legacy(blob) => {
                log::info!("Reading legacy layout for channel {}", self.identifier());
                let source = Source::parse(&blob.source).unwrap_or(self.info.source());
                let meta = ChannelMeta {
                    identifier: self.info.name.to_string(),
                    source,
                    min: None,
                    max: None,
                    sampling_rate_custom: None,
                };
                (blob.time, blob.time_rec, blob.values, None, meta, true)
            }
        };

        let values = Values::from(values)
            .recast(self.info.cast)
            .map_err(|v| corrupt(format!("value {} does not fit {}", v, self.info.cast)))?;
        if t_calc.len() != t_rec.len() || t_calc.len() != values.len() {
            return Err(corrupt(format!(
                "sequence lengths differ: time_calc {}, time_rec {}, values {}",
                t_calc.len(),
                t_rec.len(),
                values.len()
            )));
        }
        if let Some(sums) = &check_sum {
            if sums.len() != t_calc.len() {
                return Err(corrupt("check_sum length differs from samples".to_string()));
            }
        }

        self.t_calc = t_calc;
        self.t_rec = t_rec;
        self.values = values;
        self.check_sum = check_sum;
        self.meta = meta;
        self.legacy = legacy;
        self.status = ChannelStatus::Loaded;
        self.derived = Derived::default();
        log::debug!("Loaded channel {} ({} samples)", self.identifier(), self.len());
        Ok(())
    }

    /// Write the channel blob into `dir`; volatile and untouched channels are skipped
    pub fn save(&mut self, dir: &Path) -> Result<(), RawDataError> {
        if self.info.volatile || self.status == ChannelStatus::NotLoaded {
            return Ok(());
        }
        let path = storage::blob_path(dir, self.identifier());
        let blob = ChannelBlob {
            time_calc: self.t_calc.clone(),
            time_rec: self.t_rec.clone(),
            values: StoredValues::from(&self.values),
            meta: self.meta.clone(),
            check_sum: self.check_sum.clone(),
        };
        storage::write_channel(&path, &ChannelFile::Current(blob))?;
        self.file = Some(path);
        Ok(())
    }

    fn cast_error(&self, value: &Value) -> RawDataError {
        RawDataError::Cast {
            identifier: self.identifier().to_string(),
            expected: self.info.cast,
            value: value.to_string(),
        }
    }

    /// Append one sample; a value that cannot be cast leaves the channel unchanged
    pub fn add(
        &mut self,
        t_calc: f64,
        t_rec: f64,
        value: impl Into<Value>,
        checksum: Option<u8>,
    ) -> Result<(), RawDataError> {
        self.ensure_loaded()?;
        self.values
            .try_push(value.into())
            .map_err(|rejected| self.cast_error(&rejected))?;
        self.t_calc.push(t_calc);
        self.t_rec.push(t_rec);
        if let Some(sums) = &mut self.check_sum {
            sums.push(checksum.unwrap_or(0));
        }
        self.mark_added();
        Ok(())
    }

    /// Append many samples at once; either all are appended or none
    pub fn add_all(
        &mut self,
        t_rec: &[f64],
        t_calc: &[f64],
        values: Vec<Value>,
        checksum: Option<&[u8]>,
        sort: bool,
    ) -> Result<(), RawDataError> {
        let mismatch = RawDataError::LengthMismatch {
            t_rec: t_rec.len(),
            t_calc: t_calc.len(),
            values: values.len(),
        };
        if t_rec.len() != t_calc.len() || t_calc.len() != values.len() {
            return Err(mismatch);
        }
        if checksum.map_or(false, |sums| sums.len() != values.len()) {
            return Err(mismatch);
        }
        self.ensure_loaded()?;

        let mut staged = Values::empty(self.info.cast);
        for value in values {
            staged
                .try_push(value)
                .map_err(|rejected| self.cast_error(&rejected))?;
        }

        let count = staged.len();
        self.values.append(staged);
        self.t_calc.extend_from_slice(t_calc);
        self.t_rec.extend_from_slice(t_rec);
        if let Some(sums) = &mut self.check_sum {
            match checksum {
                Some(given) => sums.extend_from_slice(given),
                None => sums.extend(std::iter::repeat(0).take(count)),
            }
        }
        if sort {
            self.sort_by_t_calc();
        }
        self.mark_added();
        Ok(())
    }

    /// Stable permutation of all parallel sequences by ascending `t_calc`
    pub fn sort_by_t_calc(&mut self) {
        let mut order: Vec<usize> = (0..self.t_calc.len()).collect();
        order.sort_by(|&a, &b| self.t_calc[a].total_cmp(&self.t_calc[b]));
        self.t_calc = permuted(&self.t_calc, &order);
        self.t_rec = permuted(&self.t_rec, &order);
        self.values.permute(&order);
        if let Some(sums) = &mut self.check_sum {
            *sums = permuted(sums, &order);
        }
        self.invalidate_all();
    }

    /// Replace the whole series (used for channels the pipeline computes)
    pub(crate) fn replace(
        &mut self,
        t_calc: Vec<f64>,
        t_rec: Vec<f64>,
        values: Values,
    ) -> Result<(), RawDataError> {
        if t_calc.len() != t_rec.len() || t_calc.len() != values.len() {
            return Err(RawDataError::LengthMismatch {
                t_rec: t_rec.len(),
                t_calc: t_calc.len(),
                values: values.len(),
            });
        }
        let values = values
            .recast(self.info.cast)
            .map_err(|rejected| self.cast_error(&rejected))?;
        if let Some(sums) = &mut self.check_sum {
            *sums = vec![0; t_calc.len()];
        }
        self.t_calc = t_calc;
        self.t_rec = t_rec;
        self.values = values;
        self.mark_added();
        Ok(())
    }

    /// Overwrite the calculated time-base, keeping the other sequences
    pub(crate) fn set_t_calc(&mut self, t_calc: Vec<f64>) -> Result<(), RawDataError> {
        if t_calc.len() != self.t_rec.len() {
            return Err(RawDataError::LengthMismatch {
                t_rec: self.t_rec.len(),
                t_calc: t_calc.len(),
                values: self.values.len(),
            });
        }
        self.t_calc = t_calc;
        self.mark_added();
        Ok(())
    }

    /// Recompute `min` and `max` from the values
    pub fn update_range(&mut self) {
        let range = self.values.to_f64().min_max();
        self.meta.min = range.map(|(min, _)| min);
        self.meta.max = range.map(|(_, max)| max);
    }

    fn mark_added(&mut self) {
        self.status = ChannelStatus::Added;
        self.invalidate_all();
    }

    pub fn x_minutes(&mut self) -> &[f64] {
        let t = &self.t_calc;
        self.derived
            .minutes
            .get_or_insert_with(|| t.iter().map(|s| s / 60.0).collect())
    }

    pub fn x_hours(&mut self) -> &[f64] {
        let t = &self.t_calc;
        self.derived
            .hours
            .get_or_insert_with(|| t.iter().map(|s| s / 3600.0).collect())
    }

    /// Wall-clock instant of every sample given the session start `t0`
    ///
    /// Fails with `TimeOutOfRange` on the first `t_calc` that is not finite or
    /// lands outside the representable calendar.
    pub fn x_timestamps(&mut self, t0: DateTime<Utc>) -> Result<&[DateTime<Utc>], RawDataError> {
        let fresh = matches!(&self.derived.timestamps, Some((origin, _)) if *origin == t0);
        if !fresh {
            let stamps = self
                .t_calc
                .iter()
                .map(|&s| {
                    offset_instant(t0, s).ok_or_else(|| RawDataError::TimeOutOfRange {
                        identifier: self.info.name.to_string(),
                        t_calc: s,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            self.derived.timestamps = Some((t0, stamps));
        }
        match &self.derived.timestamps {
            Some((_, stamps)) => Ok(stamps.as_slice()),
            None => Ok(&[]),
        }
    }

    pub fn y_smoothed(&mut self) -> &[f64] {
        let values = &self.values;
        self.derived
            .smoothed
            .get_or_insert_with(|| values.to_f64().centered_mean(VIEW_WINDOW))
    }

    pub fn y_moving_max(&mut self) -> &[f64] {
        let values = &self.values;
        self.derived
            .moving_max
            .get_or_insert_with(|| values.to_f64().centered_max(VIEW_WINDOW))
    }

    /// Apply `kind` to the filtered buffer and return the result
    ///
    /// The buffer starts from the spike-removed view if one exists, otherwise
    /// from the raw values; successive calls compound.
    pub fn filter(&mut self, kind: FilterKind) -> &[f64] {
        let base = match self.derived.filtered.take() {
            Some(buffer) => buffer,
            None => match &self.derived.spikes_removed {
                Some(cleaned) => cleaned.clone(),
                None => self.values.to_f64(),
            },
        };
        self.derived.filtered.insert(kind.apply(&base))
    }

    /// Remove motion spikes through the collaborator; PPG channels only
    pub fn rm_spikes(
        &mut self,
        remover: &dyn SpikeRemover,
        filled: bool,
    ) -> Result<&[f64], RawDataError> {
        if !self.info.is_ppg() {
            log::warn!(
                "Spike removal needs a PPG channel, {} is not one",
                self.identifier()
            );
            return Err(RawDataError::MissingChannel(format!(
                "ppg (got {})",
                self.identifier()
            )));
        }
        let cleaned = remover.remove_spikes(&self.t_calc, &self.values.to_f64(), filled);
        if cleaned.len() != self.len() {
            return Err(RawDataError::Collaborator(format!(
                "spike removal returned {} samples for {}",
                cleaned.len(),
                self.len()
            )));
        }
        self.derived.filtered = None;
        Ok(self.derived.spikes_removed.insert(cleaned).as_slice())
    }

    pub fn invalidate(&mut self, kind: DerivedKind) {
        match kind {
            DerivedKind::Minutes => self.derived.minutes = None,
            DerivedKind::Hours => self.derived.hours = None,
            DerivedKind::Timestamps => self.derived.timestamps = None,
            DerivedKind::Smoothed => self.derived.smoothed = None,
            DerivedKind::MovingMax => self.derived.moving_max = None,
            DerivedKind::Filtered => self.derived.filtered = None,
            DerivedKind::SpikesRemoved => self.derived.spikes_removed = None,
        }
    }

    pub fn invalidate_all(&mut self) {
        self.derived = Derived::default();
    }
}
