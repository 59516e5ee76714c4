//! On-disk layout of a dataset directory.
//!
//! - `rawdata.gz`: the metadata blob (`RawdataFile`)
//! - `<identifier>.gz`: one blob per channel (`ChannelFile`)
//! - `rawdata_json.txt`: pretty-printed summary for humans
//!
//! Blobs are rkyv records compressed with gzip. Reads validate the archive
//! before deserialising and retry a bounded number of times, since a file may
//! still be in the middle of being written by another process.

use crate::channel::{Channel, ChannelMeta, Values};
use crate::error::RawDataError;
use crate::meta::{DatasetMeta, RawdataFile};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rkyv::{Archive, Deserialize, Serialize};
use serde_json::{json, Map, Value as Json};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

pub const BLOB_EXTENSION: &str = "gz";
pub const META_STEM: &str = "rawdata";
pub const SUMMARY_FILE: &str = "rawdata_json.txt";

/// File stems in a dataset directory that never hold a channel
pub const RESERVED: &[&str] = &[
    META_STEM,
    "data_lines.raw",
    "data_blocks.raw",
    "old_versions",
    "seizures",
    SUMMARY_FILE,
];

const RETRY_DELAY: Duration = Duration::from_millis(20);
const SUMMARY_EDGE: usize = 5;

/// Channel values as archived; instants are Unix microseconds
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum StoredValues {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Time(Vec<i64>),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct ChannelBlob {
    pub time_calc: Vec<f64>,
    pub time_rec: Vec<f64>,
    pub values: StoredValues,
    pub meta: ChannelMeta,
    pub check_sum: Option<Vec<u8>>,
}

/// Version 0 channel layout: one time series that still carries the raw counter
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct LegacyChannelBlob {
    pub source: String,
    pub time: Vec<f64>,
    pub time_rec: Vec<f64>,
    pub values: StoredValues,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub enum ChannelFile {
    Legacy(LegacyChannelBlob),
    Current(ChannelBlob),
}

pub fn blob_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{}.{}", stem, BLOB_EXTENSION))
}

pub fn meta_path(dir: &Path) -> PathBuf {
    blob_path(dir, META_STEM)
}

/// Whether a directory entry must be skipped during channel discovery
pub fn is_reserved(file_name: &str) -> bool {
    if file_name.starts_with('.') || file_name.starts_with("~$") {
        return true;
    }
    let stem = file_name
        .strip_suffix(&format!(".{}", BLOB_EXTENSION))
        .unwrap_or(file_name);
    RESERVED.contains(&stem) || RESERVED.contains(&file_name)
}

/// Channel identifier encoded in a blob file name
pub fn channel_stem(file_name: &str) -> Option<&str> {
    if is_reserved(file_name) {
        return None;
    }
    file_name.strip_suffix(&format!(".{}", BLOB_EXTENSION))
}

fn write_gz(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{}.tmp", BLOB_EXTENSION));
    let mut encoder = GzEncoder::new(File::create(&tmp)?, Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()?.sync_all()?;
    fs::rename(&tmp, path)
}

fn read_gz(path: &Path) -> io::Result<rkyv::AlignedVec> {
    let mut raw = Vec::new();
    GzDecoder::new(File::open(path)?).read_to_end(&mut raw)?;
    let mut aligned = rkyv::AlignedVec::with_capacity(raw.len());
    aligned.extend_from_slice(&raw);
    Ok(aligned)
}

/// Read and decode a blob, retrying transient failures
///
/// Returns `Ok(None)` when the file does not exist.
fn read_with_retries<T>(
    path: &Path,
    retries: u32,
    decode: impl Fn(&[u8]) -> Result<T, String>,
) -> Result<Option<T>, RawDataError> {
    let attempts = retries.max(1);
    let mut reason = String::new();
    for attempt in 1..=attempts {
        match read_gz(path) {
            Ok(bytes) => match decode(&bytes) {
                Ok(value) => return Ok(Some(value)),
                Err(e) => reason = e,
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => reason = e.to_string(),
        }
        if attempt < attempts {
            log::warn!(
                "Reading {} failed (attempt {}/{}): {}",
                path.display(),
                attempt,
                attempts,
                reason
            );
            thread::sleep(RETRY_DELAY);
        }
    }
    log::error!("Giving up on {}: {}", path.display(), reason);
    Err(RawDataError::CorruptBlob {
        path: path.to_path_buf(),
        reason,
    })
}

fn serialize_err(e: impl std::fmt::Display) -> RawDataError {
    RawDataError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

pub fn write_channel(path: &Path, file: &ChannelFile) -> Result<(), RawDataError> {
    let bytes = rkyv::to_bytes::<_, 4096>(file).map_err(serialize_err)?;
    write_gz(path, &bytes)?;
    log::debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

pub fn read_channel(path: &Path, retries: u32) -> Result<Option<ChannelFile>, RawDataError> {
    read_with_retries(path, retries, |bytes| {
        let archived =
            rkyv::check_archived_root::<ChannelFile>(bytes).map_err(|e| format!("{:?}", e))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| format!("{:?}", e))
    })
}

pub fn write_meta(dir: &Path, file: &RawdataFile) -> Result<(), RawDataError> {
    let path = meta_path(dir);
    let bytes = rkyv::to_bytes::<_, 4096>(file).map_err(serialize_err)?;
    write_gz(&path, &bytes)?;
    log::debug!("Wrote {}", path.display());
    Ok(())
}

pub fn read_meta(dir: &Path, retries: u32) -> Result<Option<RawdataFile>, RawDataError> {
    read_with_retries(&meta_path(dir), retries, |bytes| {
        let archived =
            rkyv::check_archived_root::<RawdataFile>(bytes).map_err(|e| format!("{:?}", e))?;
        archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|e| format!("{:?}", e))
    })
}

/// Shorten arrays longer than ten entries to `first5, "...", last5`, recursively
pub fn abbreviate(value: Json) -> Json {
    match value {
        Json::Array(items) => {
            let items: Vec<Json> = items.into_iter().map(abbreviate).collect();
            if items.len() > 2 * SUMMARY_EDGE {
                let tail = items.len() - SUMMARY_EDGE;
                let mut short = items[..SUMMARY_EDGE].to_vec();
                short.push(Json::String("...".to_string()));
                short.extend_from_slice(&items[tail..]);
                Json::Array(short)
            } else {
                Json::Array(items)
            }
        }
        Json::Object(map) => Json::Object(
            map.into_iter()
                .map(|(key, value)| (key, abbreviate(value)))
                .collect(),
        ),
        other => other,
    }
}

fn values_json(values: &Values) -> Json {
    match values {
        Values::Int(v) => json!(v),
        Values::Float(v) => json!(v),
        Values::Time(v) => Json::Array(v.iter().map(|t| json!(t.to_rfc3339())).collect()),
    }
}

fn channel_json(channel: &Channel) -> Json {
    let meta = channel.meta();
    let mut entry = Map::new();
    entry.insert("time_calc".into(), json!(channel.t_calc()));
    entry.insert("time_rec".into(), json!(channel.t_rec()));
    entry.insert("values".into(), values_json(channel.values()));
    entry.insert("min".into(), json!(meta.min));
    entry.insert("max".into(), json!(meta.max));
    entry.insert("source".into(), json!(meta.source.as_str()));
    entry.insert(
        "sampling_rate_custom".into(),
        json!(meta.sampling_rate_custom),
    );
    entry.insert("volatile".into(), json!(channel.is_volatile()));
    if let Some(sums) = channel.check_sum() {
        entry.insert("check_sum".into(), json!(sums));
    }
    Json::Object(entry)
}

/// Build the summary document for `meta` and the given channels
pub fn summary<'a>(
    meta: &DatasetMeta,
    channels: impl IntoIterator<Item = &'a Channel>,
) -> Result<Json, RawDataError> {
    let cols: Map<String, Json> = channels
        .into_iter()
        .map(|channel| (channel.identifier().to_string(), channel_json(channel)))
        .collect();
    let meta = serde_json::to_value(meta).map_err(serialize_err)?;
    Ok(abbreviate(json!({ "meta": meta, "~cols": cols })))
}

pub fn write_summary<'a>(
    dir: &Path,
    meta: &DatasetMeta,
    channels: impl IntoIterator<Item = &'a Channel>,
) -> Result<(), RawDataError> {
    let doc = summary(meta, channels)?;
    let text = serde_json::to_string_pretty(&doc).map_err(serialize_err)?;
    fs::create_dir_all(dir)?;
    fs::write(dir.join(SUMMARY_FILE), text)?;
    Ok(())
}
