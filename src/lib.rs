//! # rawdata
//!
//! Container for multi-channel biosignal recordings from a BLE wearable.
//!
//! Samples are captured per channel as `(t_calc, t_rec, value)` triples,
//! persisted as one compressed blob per channel, and run through an analysis
//! pass that rebuilds a coherent time-base from the device counter and the
//! host receive clock.
//!
//! ## Modules
//! - `registry`: static catalog of known channels
//! - `channel`: typed sample storage with lazy loading and derived views
//! - `dataset`: channel collection, metadata, events and persistence
//! - `analyse` / `timebase`: the time-base reconstruction pipeline
//! - `quality`, `filter`: signal-quality scoring and Chebyshev-II filters
//! - `storage`: on-disk layout
//! - `collaborators`: traits for spike removal, SpO2, plotting and event import

pub mod analyse;
pub mod channel;
pub mod collaborators;
pub mod config;
pub mod dataset;
pub mod error;
pub mod events;
pub mod filter;
pub mod meta;
pub mod quality;
pub mod registry;
pub mod storage;
pub mod timebase;
pub mod timeseries;

pub use analyse::AnalysisReport;
pub use channel::{Channel, ChannelStatus, DerivedKind, Value, Values};
pub use config::Config;
pub use dataset::{Dataset, DatasetState};
pub use error::{ConfigError, EventError, RawDataError, RegistryError};
pub use events::{Event, NewEvent};
pub use filter::FilterKind;
pub use registry::{registry, Cast, Source};
