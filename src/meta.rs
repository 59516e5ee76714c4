//! Dataset metadata sections persisted in the `rawdata` blob.
//!
//! - `DbInfo`: identity supplied by the caller, opaque to the pipeline
//! - `RdInfo`: fields computed by `analyse`
//! - `DatasetMeta`: everything above plus events, version log and bookkeeping
//!
//! Instants are stored as Unix milliseconds so the records archive with rkyv.

use crate::events::Event;
use crate::registry::Source;
use chrono::{DateTime, TimeZone, Utc};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Schema version written by this crate
pub const RD_VERSION: u32 = 5;

#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Default, PartialEq,
)]
#[archive(check_bytes)]
pub struct DbInfo {
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub device_serial: Option<String>,
    pub device_type: Option<String>,
    pub person_id: Option<String>,
    pub project_id: Option<String>,
    /// Session start, Unix milliseconds
    pub start: Option<i64>,
    /// Session end, Unix milliseconds
    pub end: Option<i64>,
}

impl DbInfo {
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.start.and_then(from_millis)
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end.and_then(from_millis)
    }

    pub fn set_start(&mut self, start: DateTime<Utc>) {
        self.start = Some(start.timestamp_millis());
    }

    pub fn set_end(&mut self, end: DateTime<Utc>) {
        self.end = Some(end.timestamp_millis());
    }
}

#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Default, PartialEq,
)]
#[archive(check_bytes)]
pub struct RdInfo {
    pub duration: Option<f64>,
    pub transfer_rate_all: Option<f64>,
    pub quality_red: Option<f64>,
    pub quality_yellow: Option<f64>,
    pub quality_green: Option<f64>,
    pub battery_start: Option<f64>,
    pub battery_end: Option<f64>,
    pub sampling_rate_real: Option<f64>,
    pub linear_fit_m: Option<f64>,
    pub linear_fit_b: Option<f64>,
}

/// One entry of the append-only schema migration log
#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq,
)]
#[archive(check_bytes)]
pub struct VersionUpdate {
    pub from: u32,
    pub to: u32,
    /// Unix milliseconds
    pub at: i64,
    pub username: String,
}

#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq,
)]
#[archive(check_bytes)]
pub struct DatasetMeta {
    pub rd_version: u32,
    pub db: DbInfo,
    pub rd: RdInfo,
    pub events: Vec<Event>,
    pub rd_version_updates: Vec<VersionUpdate>,
    /// Unix milliseconds of the last save
    pub last_update: Option<i64>,
    pub last_update_username: Option<String>,
    pub check_sum: bool,
    pub available_cols: Vec<String>,
    pub source: Source,
}

impl DatasetMeta {
    pub fn new(check_sum: bool) -> Self {
        Self {
            rd_version: RD_VERSION,
            db: DbInfo::default(),
            rd: RdInfo::default(),
            events: Vec::new(),
            rd_version_updates: Vec::new(),
            last_update: None,
            last_update_username: None,
            check_sum,
            available_cols: Vec::new(),
            source: Source::Received,
        }
    }

    /// Move to the current schema version, logging the step
    pub fn bump_version(&mut self, username: &str) {
        if self.rd_version != RD_VERSION {
            self.rd_version_updates.push(VersionUpdate {
                from: self.rd_version,
                to: RD_VERSION,
                at: Utc::now().timestamp_millis(),
                username: username.to_string(),
            });
            self.rd_version = RD_VERSION;
        }
    }
}

/// Root record of the metadata blob
#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq,
)]
#[archive(check_bytes)]
pub struct RawdataFile {
    pub meta: DatasetMeta,
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_meta_is_current() {
        let meta = DatasetMeta::new(true);
        assert_eq!(meta.rd_version, RD_VERSION);
        assert!(meta.check_sum);
        assert!(meta.rd_version_updates.is_empty());
    }

    #[test]
    fn test_bump_version_logs_once() {
        let mut meta = DatasetMeta::new(false);
        meta.rd_version = 0;
        meta.bump_version("lab");
        meta.bump_version("lab");
        assert_eq!(meta.rd_version, RD_VERSION);
        assert_eq!(meta.rd_version_updates.len(), 1);
        assert_eq!(meta.rd_version_updates[0].from, 0);
        assert_eq!(meta.rd_version_updates[0].username, "lab");
    }

    #[test]
    fn test_db_times() {
        let mut db = DbInfo::default();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        db.set_start(start);
        assert_eq!(db.start_time(), Some(start));
        assert_eq!(db.end_time(), None);
    }
}
