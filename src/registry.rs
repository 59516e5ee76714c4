//! # Channel Registry Module
//!
//! Static catalog of every channel the sensor and the analysis pipeline know.
//! Each entry fixes the identifier, value type, nominal sampling rate, unit,
//! BLE service, display color and order of a channel.
//!
//! ## Invariants
//! - ids are dense `1..=N` with no duplicates
//! - display `order` is unique
//! - identifiers are unique
//!
//! The process-wide registry is validated on first use; a violation is a
//! programming error in the catalog and aborts the process.

use crate::error::RegistryError;
use once_cell::sync::Lazy;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Pseudo-entries listed ahead of every channel in `identifier_sorted`
pub const TIME: &str = "time";
pub const TIME_REC: &str = "time_rec";

/// Nominal rate of the debug-data stream that defines the time-base
pub const PRIMARY_RATE_HZ: f64 = 50.0;

/// Value type stored by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cast {
    Int,
    Float,
    Time,
}

impl fmt::Display for Cast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cast::Int => write!(f, "int"),
            Cast::Float => write!(f, "float"),
            Cast::Time => write!(f, "time"),
        }
    }
}

/// Where a channel's samples come from
#[derive(
    Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq,
)]
#[archive(check_bytes)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Received,
    Calculated,
    Imported,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Received => "received",
            Source::Calculated => "calculated",
            Source::Imported => "imported",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(Source::Received),
            "calculated" => Some(Source::Calculated),
            "imported" => Some(Source::Imported),
            _ => None,
        }
    }
}

/// BLE service a channel is transported on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleService {
    DebugData,
    HeartRate,
    Battery,
    HealthThermometer,
    DeviceInformation,
    /// Produced on the host, never transported
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelInfo {
    pub id: u32,
    pub name: &'static str,
    pub cast: Cast,
    /// `None` for irregular streams (events, beat intervals)
    pub sampling_rate: Option<f64>,
    pub unit: &'static str,
    pub ble_service: BleService,
    pub desc: &'static str,
    pub color: &'static str,
    pub order: u32,
    /// `None` means the channel is received from the device
    pub source: Option<Source>,
    pub volatile: bool,
}

impl ChannelInfo {
    pub fn source(&self) -> Source {
        self.source.unwrap_or(Source::Received)
    }

    pub fn is_calculated(&self) -> bool {
        self.source() == Source::Calculated
    }

    /// Whether the channel shares the 50 Hz debug-data counter
    pub fn on_primary_clock(&self) -> bool {
        self.ble_service == BleService::DebugData && self.sampling_rate == Some(PRIMARY_RATE_HZ)
    }

    pub fn is_ppg(&self) -> bool {
        self.name.starts_with("ppg_") && !self.volatile
    }
}

const fn entry(
    id: u32,
    name: &'static str,
    cast: Cast,
    sampling_rate: Option<f64>,
    unit: &'static str,
    ble_service: BleService,
    desc: &'static str,
    color: &'static str,
    order: u32,
) -> ChannelInfo {
    ChannelInfo {
        id,
        name,
        cast,
        sampling_rate,
        unit,
        ble_service,
        desc,
        color,
        order,
        source: None,
        volatile: false,
    }
}

const fn calculated(info: ChannelInfo) -> ChannelInfo {
    ChannelInfo {
        source: Some(Source::Calculated),
        ..info
    }
}

const fn volatile(info: ChannelInfo) -> ChannelInfo {
    ChannelInfo {
        volatile: true,
        ..calculated(info)
    }
}

use BleService::*;
use Cast::*;

pub static CATALOG: &[ChannelInfo] = &[
    entry(1, "ppg_ir", Int, Some(50.0), "a.u.", DebugData, "PPG infrared", "#7f0000", 10),
    entry(2, "ppg_red", Int, Some(50.0), "a.u.", DebugData, "PPG red", "#d62728", 11),
    entry(3, "ppg_green", Int, Some(50.0), "a.u.", DebugData, "PPG green", "#2ca02c", 12),
    entry(4, "ppg_ambient", Int, Some(50.0), "a.u.", DebugData, "Ambient light", "#7f7f7f", 13),
    entry(5, "acc_x", Int, Some(50.0), "mg", DebugData, "Acceleration x", "#1f77b4", 20),
    entry(6, "acc_y", Int, Some(50.0), "mg", DebugData, "Acceleration y", "#ff7f0e", 21),
    entry(7, "acc_z", Int, Some(50.0), "mg", DebugData, "Acceleration z", "#9467bd", 22),
    entry(8, "quality", Int, Some(1.0), "%", DebugData, "PPG signal quality", "#bcbd22", 30),
    entry(9, "heart_rate", Int, Some(1.0), "bpm", HeartRate, "Heart rate", "#e377c2", 40),
    entry(10, "rr_interval", Int, None, "ms", HeartRate, "Beat-to-beat interval", "#8c564b", 41),
    entry(11, "temperature", Float, Some(1.0), "degC", HealthThermometer, "Skin temperature", "#17becf", 50),
    entry(12, "battery_percentage", Int, Some(1.0 / 60.0), "%", Battery, "Battery level", "#98df8a", 60),
    entry(13, "device_clock", Time, None, "", DeviceInformation, "Device wall clock", "#c5b0d5", 70),
    calculated(entry(14, "spo2", Float, Some(1.0), "%", Host, "Oxygen saturation", "#ff9896", 80)),
    calculated(entry(15, "transfer_rate", Float, Some(1.0), "", Host, "Received share of nominal samples", "#aec7e8", 90)),
    calculated(entry(16, "ble_service_debug_data_inserts", Int, Some(50.0), "", Host, "Reconstructed missing samples", "#ffbb78", 91)),
    calculated(entry(17, "diff_time_rec_calc", Float, Some(1.0), "s", Host, "Receive minus calculated time", "#c49c94", 92)),
    calculated(entry(18, "insert_time_calc", Float, None, "s", Host, "Offsets inserted at time leaps", "#f7b6d2", 93)),
    volatile(entry(19, "ppg_ir_filtered", Float, Some(50.0), "a.u.", Host, "Filtered PPG infrared", "#dbdb8d", 100)),
    volatile(entry(20, "ppg_red_filtered", Float, Some(50.0), "a.u.", Host, "Filtered PPG red", "#9edae5", 101)),
];

/// Validated, immutable view over a catalog
#[derive(Debug)]
pub struct ChannelRegistry {
    by_identifier: HashMap<&'static str, &'static ChannelInfo>,
    identifier_sorted: Vec<&'static str>,
    id2identifier: HashMap<u32, &'static str>,
}

impl ChannelRegistry {
    pub fn new(catalog: &'static [ChannelInfo]) -> Result<Self, RegistryError> {
        let mut ids: Vec<u32> = catalog.iter().map(|c| c.id).collect();
        ids.sort_unstable();
        for (i, &id) in ids.iter().enumerate() {
            if i > 0 && ids[i - 1] == id {
                return Err(RegistryError::DuplicateId(id));
            }
            let expected = i as u32 + 1;
            if id != expected {
                return Err(RegistryError::IdGap { expected, found: id });
            }
        }

        let mut orders = HashSet::new();
        let mut by_identifier = HashMap::new();
        let mut id2identifier = HashMap::new();
        for info in catalog {
            if !orders.insert(info.order) {
                return Err(RegistryError::DuplicateOrder(info.order));
            }
            if by_identifier.insert(info.name, info).is_some() {
                return Err(RegistryError::DuplicateIdentifier(info.name));
            }
            id2identifier.insert(info.id, info.name);
        }

        let mut sorted: Vec<&'static ChannelInfo> = catalog.iter().collect();
        sorted.sort_by_key(|c| c.order);
        let identifier_sorted = [TIME, TIME_REC]
            .into_iter()
            .chain(sorted.into_iter().map(|c| c.name))
            .collect();

        Ok(Self {
            by_identifier,
            identifier_sorted,
            id2identifier,
        })
    }

    pub fn get(&self, identifier: &str) -> Option<&'static ChannelInfo> {
        self.by_identifier.get(identifier).copied()
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.by_identifier.contains_key(identifier)
    }

    /// Identifiers in display order, led by the `time` and `time_rec` pseudo-entries
    pub fn identifier_sorted(&self) -> &[&'static str] {
        &self.identifier_sorted
    }

    pub fn identifier_for_id(&self, id: u32) -> Option<&'static str> {
        self.id2identifier.get(&id).copied()
    }

    /// Display position of `identifier`; unknown identifiers sort last
    pub fn position(&self, identifier: &str) -> usize {
        self.identifier_sorted
            .iter()
            .position(|name| *name == identifier)
            .unwrap_or(usize::MAX)
    }

    /// Channels in display order
    pub fn channels(&self) -> impl Iterator<Item = &'static ChannelInfo> + '_ {
        self.identifier_sorted
            .iter()
            .filter_map(move |name| self.by_identifier.get(name).copied())
    }
}

static REGISTRY: Lazy<ChannelRegistry> = Lazy::new(|| {
    ChannelRegistry::new(CATALOG)
        .unwrap_or_else(|e| panic!("channel registry is misconfigured: {}", e))
});

/// The process-wide channel registry
pub fn registry() -> &'static ChannelRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    static GAPPED: &[ChannelInfo] = &[
        entry(1, "a", Int, None, "", Host, "", "", 1),
        entry(3, "b", Int, None, "", Host, "", "", 2),
    ];

    static DUPLICATE_ID: &[ChannelInfo] = &[
        entry(1, "a", Int, None, "", Host, "", "", 1),
        entry(1, "b", Int, None, "", Host, "", "", 2),
    ];

    static DUPLICATE_ORDER: &[ChannelInfo] = &[
        entry(1, "a", Int, None, "", Host, "", "", 5),
        entry(2, "b", Int, None, "", Host, "", "", 5),
    ];

    static DUPLICATE_NAME: &[ChannelInfo] = &[
        entry(1, "a", Int, None, "", Host, "", "", 1),
        entry(2, "a", Int, None, "", Host, "", "", 2),
    ];

    #[test]
    fn test_catalog_is_valid() {
        assert!(ChannelRegistry::new(CATALOG).is_ok());
    }

    #[test]
    fn test_id_gap_rejected() {
        assert_eq!(
            ChannelRegistry::new(GAPPED).unwrap_err(),
            RegistryError::IdGap {
                expected: 2,
                found: 3
            }
        );
    }

    #[test]
    fn test_duplicates_rejected() {
        assert_eq!(
            ChannelRegistry::new(DUPLICATE_ID).unwrap_err(),
            RegistryError::DuplicateId(1)
        );
        assert_eq!(
            ChannelRegistry::new(DUPLICATE_ORDER).unwrap_err(),
            RegistryError::DuplicateOrder(5)
        );
        assert_eq!(
            ChannelRegistry::new(DUPLICATE_NAME).unwrap_err(),
            RegistryError::DuplicateIdentifier("a")
        );
    }

    #[test]
    fn test_identifier_sorted_starts_with_time() {
        let sorted = registry().identifier_sorted();
        assert_eq!(&sorted[..2], &[TIME, TIME_REC]);
        assert_eq!(sorted[2], "ppg_ir");
        assert_eq!(sorted.len(), CATALOG.len() + 2);
    }

    #[test]
    fn test_id2identifier() {
        assert_eq!(registry().identifier_for_id(9), Some("heart_rate"));
        assert_eq!(registry().identifier_for_id(0), None);
    }

    #[test]
    fn test_channel_flags() {
        let reg = registry();
        assert!(reg.get("ppg_ir").unwrap().on_primary_clock());
        assert!(!reg.get("quality").unwrap().on_primary_clock());
        assert!(reg.get("transfer_rate").unwrap().is_calculated());
        assert!(reg.get("ppg_ir_filtered").unwrap().volatile);
        assert!(!reg.get("ppg_ir_filtered").unwrap().is_ppg());
        assert_eq!(reg.get("heart_rate").unwrap().cast, Cast::Int);
    }
}
