//! Abstract dependencies the dataset calls but does not implement.
//!
//! Spike removal, SpO2 estimation, plotting and event lookup live outside this
//! crate. A dataset works without any of them; only the operations that need
//! one fail, with `CollaboratorUnavailable` or `MissingChannel`.

use crate::channel::Channel;
use crate::dataset::Dataset;
use crate::events::NewEvent;
use crate::meta::DbInfo;

/// Removes motion artefacts from a PPG trace
pub trait SpikeRemover {
    /// Returns one cleaned value per input sample; `filled` interpolates over
    /// removed spikes instead of leaving NaN
    fn remove_spikes(&self, t_calc: &[f64], values: &[f64], filled: bool) -> Vec<f64>;
}

/// One SpO2 estimate placed on the dataset's time-base
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spo2Sample {
    pub t_calc: f64,
    pub t_rec: f64,
    pub value: f64,
}

pub trait Spo2Estimator {
    fn estimate(&self, red: &Channel, ir: &Channel) -> Vec<Spo2Sample>;
}

/// Renders analysed channels; errors are reported as text
pub trait Plotter {
    fn plot(&self, dataset: &Dataset, identifiers: &[String]) -> Result<(), String>;
}

/// Supplies annotation events for a session, e.g. from a clinical database
pub trait EventSource {
    fn events(&self, db: &DbInfo) -> Vec<NewEvent>;
}

/// Collaborators a dataset calls during analysis
#[derive(Default)]
pub struct Collaborators {
    pub spike_remover: Option<Box<dyn SpikeRemover>>,
    pub spo2: Option<Box<dyn Spo2Estimator>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("spike_remover", &self.spike_remover.is_some())
            .field("spo2", &self.spo2.is_some())
            .finish()
    }
}
