//! # Analysis Pipeline
//!
//! `Dataset::analyse` turns captured, drifting sensor streams into one
//! coherent time-base and fills the computed metadata.
//!
//! ## Phases
//! 1. Drop calculated channels, load everything else
//! 2. Pick the primary 50 Hz debug-data channel; without one the dataset is
//!    "non-real" and every channel simply uses its receive time
//! 3. Rebuild the primary time-base (overflow, leaps, offsets, drift) and
//!    derive `insert_time_calc`, `diff_time_rec_calc`,
//!    `ble_service_debug_data_inserts` and `transfer_rate`
//! 4. Propagate the time-base to every channel on the same clock
//! 5. Aggregates: sampling rate, quality, battery, ranges, SpO2
//! 6. Mark analysed and move to the current schema version

use crate::channel::Values;
use crate::dataset::{Dataset, DatasetState};
use crate::error::RawDataError;
use crate::quality::QualityFractions;
use crate::registry::{registry, Source};
use crate::timebase::{self, LinearFit, Series, NOMINAL_DT};
use crate::timeseries::SeriesExt;
use std::collections::BTreeMap;

/// What `analyse` found on the primary time-base
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisReport {
    /// `None` for non-real datasets
    pub primary: Option<String>,
    pub gap_candidates: Vec<usize>,
    /// Confirmed offsets by sample index
    pub inserts: BTreeMap<usize, f64>,
    pub linear_fit: Option<LinearFit>,
    pub missing_samples: usize,
}

const CUSTOM_RATE_DOUBLE: f64 = 100.0;

impl Dataset {
    /// Rebuild the time-base and fill the computed metadata
    pub fn analyse(&mut self) -> Result<AnalysisReport, RawDataError> {
        self.reset_calculated()?;

        let mut report = AnalysisReport::default();
        match self.primary_channel() {
            Some(primary) => {
                log::info!("Analysing with primary channel {}", primary);
                self.rebuild_time_base(&primary, &mut report)?;
                report.primary = Some(primary);
            }
            None => {
                log::info!("No primary time-base, treating dataset as non-real");
                self.use_receive_time()?;
            }
        }

        self.aggregate()?;
        self.state = DatasetState::Analysed;
        let username = self.config.username.clone();
        self.meta.bump_version(&username);
        log::info!(
            "Analysis done: duration {:?} s, transfer rate {:?}",
            self.meta.rd.duration,
            self.meta.rd.transfer_rate_all
        );
        Ok(report)
    }

    /// Drop computed channels from memory and disk; load the rest
    fn reset_calculated(&mut self) -> Result<(), RawDataError> {
        self.discover_channels()?;
        let calculated: Vec<String> = self
            .channels
            .values()
            .filter(|c| c.info().is_calculated())
            .map(|c| c.identifier().to_string())
            .collect();
        for identifier in calculated {
            self.remove_channel(&identifier)?;
        }
        for channel in self.channels.values_mut() {
            channel.ensure_loaded()?;
        }
        Ok(())
    }

    /// First received 50 Hz debug-data channel with samples, preferring the
    /// ones without a 100 Hz custom rate
    fn primary_channel(&self) -> Option<String> {
        let candidates: Vec<&str> = registry()
            .channels()
            .filter(|info| info.source() == Source::Received && info.on_primary_clock())
            .filter_map(|info| self.channels.get(info.name))
            .filter(|c| !c.is_empty())
            .map(|c| c.identifier())
            .collect();
        candidates
            .iter()
            .find(|id| {
                self.channels
                    .get(**id)
                    .map_or(false, |c| c.meta().sampling_rate_custom != Some(CUSTOM_RATE_DOUBLE))
            })
            .or_else(|| candidates.first())
            .map(|id| id.to_string())
    }

    fn use_receive_time(&mut self) -> Result<(), RawDataError> {
        let mut duration: Option<f64> = None;
        let mut total = 0usize;
        let mut longest: Vec<f64> = Vec::new();
        for channel in self.channels.values_mut() {
            let t_rec = channel.t_rec().to_vec();
            if let Some(&last) = t_rec.last() {
                duration = Some(duration.map_or(last, |d: f64| d.max(last)));
            }
            total += t_rec.len();
            if t_rec.len() > longest.len() {
                longest = t_rec.clone();
            }
            channel.set_t_calc(t_rec)?;
        }

        let rd = &mut self.meta.rd;
        rd.duration = duration;
        rd.transfer_rate_all = match duration {
            Some(d) if total > 0 => Some((d / total as f64).clamp(0.0, 1.0)),
            _ => None,
        };
        rd.linear_fit_m = None;
        rd.linear_fit_b = None;
        rd.sampling_rate_real = timebase::estimate_sampling_rate(&longest);
        Ok(())
    }

    fn rebuild_time_base(
        &mut self,
        primary: &str,
        report: &mut AnalysisReport,
    ) -> Result<(), RawDataError> {
        let (original, t_rec, legacy) = {
            let channel = self.channel(primary)?;
            (channel.t_calc().to_vec(), channel.t_rec().to_vec(), channel.is_legacy())
        };

        let unwrap_counter = self.meta.rd_version == 0 || legacy;
        let unwrapped = if unwrap_counter {
            log::debug!("Removing counter overflow from {}", primary);
            timebase::remove_counter_overflow(&original)
        } else {
            original
        };

        report.gap_candidates = timebase::detect_time_leaps(&t_rec);
        report.inserts = timebase::estimate_gap_offsets(&t_rec, &unwrapped, &report.gap_candidates);
        log::info!(
            "{} time leaps, {} confirmed gaps",
            report.gap_candidates.len(),
            report.inserts.len()
        );
        let shifted = timebase::apply_inserts(&unwrapped, &report.inserts);

        let fit = timebase::fit_drift(&shifted, &t_rec);
        report.linear_fit = fit;
        match fit {
            Some(f) => log::info!("Linear drift fit m={:.3e} b={:.4}", f.m, f.b),
            None => log::info!("Too few residuals for a drift fit"),
        }
        let corrected = timebase::correct_all(&shifted, fit);

        let mut gaps = Series::default();
        for (&index, &gap) in &report.inserts {
            gaps.push(unwrapped[index], t_rec[index], gap);
        }
        self.put_series("insert_time_calc", gaps)?;
        self.put_series(
            "diff_time_rec_calc",
            timebase::residual_series(&corrected, &t_rec),
        )?;

        let missing = timebase::reconstruct_missing(&shifted, &t_rec, fit);
        report.missing_samples = missing.inserted;
        log::info!(
            "{} samples missing against {} received",
            missing.inserted,
            missing.real
        );
        let transfer_rate_all = missing.transfer_rate_all();
        let flags = missing.flags;
        if !flags.is_empty() {
            let values = Values::Int(flags.values.iter().map(|&f| f as i64).collect());
            self.put_calculated("ble_service_debug_data_inserts", flags.t_calc, flags.t_rec, values)?;
        }
        self.put_series("transfer_rate", missing.transfer_rate)?;

        let rd = &mut self.meta.rd;
        rd.transfer_rate_all = transfer_rate_all.map(|r| r.clamp(0.0, 1.0));
        rd.duration = match (corrected.first(), corrected.last()) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        };
        rd.linear_fit_m = fit.map(|f| f.m);
        rd.linear_fit_b = fit.map(|f| f.b);
        rd.sampling_rate_real = timebase::estimate_sampling_rate(&corrected);

        self.propagate(&unwrapped, &corrected, unwrap_counter)
    }

    /// Store a computed float series unless it is empty
    fn put_series(&mut self, identifier: &str, series: Series) -> Result<(), RawDataError> {
        if series.is_empty() {
            return Ok(());
        }
        self.put_calculated(identifier, series.t_calc, series.t_rec, Values::Float(series.values))
    }

    /// Move every channel onto the rebuilt clock, or onto receive time when
    /// it does not share the primary counter
    fn propagate(
        &mut self,
        reference: &[f64],
        corrected: &[f64],
        unwrap_counter: bool,
    ) -> Result<(), RawDataError> {
        let n = corrected.len();
        for channel in self.channels.values_mut() {
            let info = channel.info();
            if info.is_calculated() {
                continue;
            }
            if !info.on_primary_clock() {
                let t_rec = channel.t_rec().to_vec();
                channel.set_t_calc(t_rec)?;
                continue;
            }

            let len = channel.len();
            let t_calc = if len == n {
                corrected.to_vec()
            } else if len == 2 * n
                && channel.meta().sampling_rate_custom == Some(CUSTOM_RATE_DOUBLE)
            {
                interleave(corrected)
            } else {
                let own = if unwrap_counter {
                    timebase::remove_counter_overflow(channel.t_calc())
                } else {
                    channel.t_calc().to_vec()
                };
                shift_by_nearest(&own, reference, corrected)
            };
            channel.set_t_calc(t_calc)?;
            if !channel.t_calc().is_non_decreasing() {
                log::debug!("Reordering {} by rebuilt time", channel.identifier());
                channel.sort_by_t_calc();
            }
        }
        Ok(())
    }

    fn aggregate(&mut self) -> Result<(), RawDataError> {
        let quality = self
            .channels
            .get("quality")
            .map(|c| QualityFractions::score(&c.values().to_f64()))
            .unwrap_or_default();
        let quality = if self.config.live_quality {
            quality.live()
        } else {
            quality
        };
        let battery = self
            .channels
            .get("battery_percentage")
            .map(|c| c.values().to_f64())
            .unwrap_or_default();

        let rd = &mut self.meta.rd;
        rd.quality_green = quality.green;
        rd.quality_yellow = quality.yellow;
        rd.quality_red = quality.red;
        rd.battery_start = battery.first().copied();
        rd.battery_end = battery.last().copied();

        let has_ppg = ["ppg_red", "ppg_ir"]
            .iter()
            .all(|id| self.channels.get(*id).map_or(false, |c| !c.is_empty()));
        if self.collaborators.spo2.is_some() && has_ppg {
            if let Err(e) = self.compute_spo2() {
                log::warn!("SpO2 estimation failed: {}", e);
            }
        }

        for channel in self.channels.values_mut() {
            channel.update_range();
        }
        Ok(())
    }
}

/// Double-rate series: every corrected time followed by the midpoint to the next
fn interleave(corrected: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(corrected.len() * 2);
    for (i, &t) in corrected.iter().enumerate() {
        let next = match corrected.get(i + 1) {
            Some(&next) => next,
            None if i > 0 => t + (t - corrected[i - 1]),
            None => t + NOMINAL_DT,
        };
        out.push(t);
        out.push((t + next) / 2.0);
    }
    out
}

/// Shift each time by the correction of the closest preceding reference sample
fn shift_by_nearest(times: &[f64], reference: &[f64], corrected: &[f64]) -> Vec<f64> {
    times
        .iter()
        .map(|&t| {
            let j = reference.partition_point(|&r| r <= t).saturating_sub(1);
            match (reference.get(j), corrected.get(j)) {
                (Some(r), Some(c)) => t + (c - r),
                _ => t,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Value;
    use crate::collaborators::{Collaborators, Spo2Estimator, Spo2Sample};
    use crate::config::Config;
    use crate::meta::RD_VERSION;
    use tempfile::tempdir;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * NOMINAL_DT).collect()
    }

    fn ints(n: usize) -> Vec<Value> {
        (0..n).map(|i| Value::Int(i as i64)).collect()
    }

    fn with_primary(t_calc: &[f64], t_rec: &[f64]) -> Dataset {
        let mut ds = Dataset::in_memory();
        ds.add_all("ppg_ir", t_rec, t_calc, ints(t_calc.len()), false, None)
            .unwrap();
        ds
    }

    fn float_values(ds: &mut Dataset, identifier: &str) -> Vec<f64> {
        ds.channel(identifier).unwrap().values().to_f64()
    }

    #[test]
    fn test_gap_detection() {
        let t_calc = ramp(1500);
        let mut t_rec = t_calc.clone();
        for t in t_rec.iter_mut().skip(500) {
            *t += 5.0;
        }
        let mut ds = with_primary(&t_calc, &t_rec);
        let report = ds.analyse().unwrap();

        assert_eq!(report.primary.as_deref(), Some("ppg_ir"));
        assert_eq!(report.gap_candidates, vec![500]);
        let inserts = float_values(&mut ds, "insert_time_calc");
        assert_eq!(inserts.len(), 1);
        assert!((inserts[0] - 5.0).abs() < 1e-6);

        let t = ds.channel("ppg_ir").unwrap().t_calc().to_vec();
        assert!((t[500] - t[499] - 5.02).abs() < 1e-6);
        assert!((t[499] - t_calc[499]).abs() < 1e-6);
        assert_eq!(report.missing_samples, 250);
    }

    #[test]
    fn test_linear_drift() {
        let t_calc = ramp(6000);
        let t_rec: Vec<f64> = (0..6000).map(|i| t_calc[i] + 1e-4 * i as f64 + 0.01).collect();
        let mut ds = with_primary(&t_calc, &t_rec);
        ds.analyse().unwrap();

        let m = ds.meta().rd.linear_fit_m.unwrap();
        let b = ds.meta().rd.linear_fit_b.unwrap();
        assert!((m - 1e-4 / 0.02).abs() < 1e-6);
        assert!((b - 0.01).abs() < 1e-6);
        let residuals = float_values(&mut ds, "diff_time_rec_calc");
        assert!(!residuals.is_empty());
        assert!(residuals.iter().all(|d| d.abs() <= 1e-3));
    }

    #[test]
    fn test_missing_samples() {
        let t = [0.0, 0.02, 0.06];
        let mut ds = with_primary(&t, &t);
        let report = ds.analyse().unwrap();

        assert_eq!(report.missing_samples, 1);
        let inserts = ds.channel("ble_service_debug_data_inserts").unwrap();
        assert_eq!(inserts.values(), &Values::Int(vec![0, 0, 1, 0]));
        assert!((inserts.t_calc()[2] - 0.04).abs() < 1e-9);
        assert_eq!(ds.meta().rd.transfer_rate_all, Some(0.75));
    }

    #[test]
    fn test_time_base_non_decreasing_and_duration() {
        let mut t_calc = ramp(400);
        t_calc.extend((420..900).map(|i| i as f64 * NOMINAL_DT));
        let mut t_rec: Vec<f64> = t_calc.iter().map(|t| t + 0.3).collect();
        for t in t_rec.iter_mut().skip(200) {
            *t += 6.0;
        }
        let n = t_calc.len();
        let mut ds = with_primary(&t_calc, &t_rec);
        ds.add_all("acc_x", &t_rec, &t_calc, ints(n), false, None).unwrap();
        ds.add_all(
            "ppg_red",
            &t_rec[..n - 10],
            &t_calc[..n - 10],
            ints(n - 10),
            false,
            None,
        )
        .unwrap();
        ds.add_all("heart_rate", &[3.0, 4.0], &[99.0, 98.0], ints(2), false, None)
            .unwrap();
        ds.analyse().unwrap();

        for id in ["ppg_ir", "acc_x", "ppg_red", "ble_service_debug_data_inserts"] {
            let channel = ds.channel(id).unwrap();
            assert!(channel.t_calc().is_non_decreasing(), "{}", id);
            assert_eq!(channel.t_calc().len(), channel.len(), "{}", id);
            assert_eq!(channel.t_rec().len(), channel.len(), "{}", id);
        }
        let primary = ds.channel("ppg_ir").unwrap().t_calc().to_vec();
        let duration = ds.meta().rd.duration.unwrap();
        assert!((duration - (primary[n - 1] - primary[0])).abs() < 1e-9);
        let rate = ds.meta().rd.transfer_rate_all.unwrap();
        assert!((0.0..=1.0).contains(&rate));
        assert_eq!(ds.channel("heart_rate").unwrap().t_calc(), &[3.0, 4.0]);
        assert_eq!(ds.channel("acc_x").unwrap().t_calc(), primary.as_slice());
    }

    #[test]
    fn test_double_rate_channel_interleaves() {
        let t = ramp(10);
        let mut ds = with_primary(&t, &t);
        let t_double: Vec<f64> = (0..20).map(|i| i as f64 * 0.01).collect();
        ds.add_all("ppg_green", &t_double, &t_double, ints(20), false, None)
            .unwrap();
        ds.channel_mut("ppg_green")
            .unwrap()
            .set_sampling_rate_custom(Some(100.0));
        let report = ds.analyse().unwrap();
        assert_eq!(report.primary.as_deref(), Some("ppg_ir"));

        let green = ds.channel("ppg_green").unwrap().t_calc().to_vec();
        assert_eq!(green.len(), 20);
        assert!((green[1] - 0.01).abs() < 1e-9);
        assert!((green[19] - 0.19).abs() < 1e-9);
    }

    #[test]
    fn test_non_real_dataset() {
        let mut ds = Dataset::in_memory();
        ds.add_all(
            "heart_rate",
            &[10.0, 11.0, 12.0, 13.0],
            &[0.0, 0.0, 0.0, 0.0],
            ints(4),
            false,
            None,
        )
        .unwrap();
        ds.add_all("temperature", &[20.0], &[5.0], vec![Value::Float(36.0)], false, None)
            .unwrap();
        let report = ds.analyse().unwrap();

        assert_eq!(report.primary, None);
        assert_eq!(ds.channel("heart_rate").unwrap().t_calc(), &[10.0, 11.0, 12.0, 13.0]);
        assert_eq!(ds.meta().rd.duration, Some(20.0));
        assert_eq!(ds.meta().rd.transfer_rate_all, Some(1.0));
        assert!((ds.meta().rd.sampling_rate_real.unwrap() - 1.0).abs() < 1e-9);
        assert!(ds.loaded("transfer_rate").is_none());
    }

    #[test]
    fn test_aggregates() {
        let mut ds = Dataset::with_config(
            None,
            Config {
                live_quality: true,
                ..Config::default()
            },
        );
        let seconds: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let quality = (0..100).map(|_| Value::Int(20)).collect();
        ds.add_all("quality", &seconds, &seconds, quality, false, None)
            .unwrap();
        ds.add_all(
            "battery_percentage",
            &[0.0, 60.0, 120.0],
            &[0.0, 60.0, 120.0],
            ints(3).into_iter().rev().collect(),
            false,
            None,
        )
        .unwrap();
        ds.analyse().unwrap();

        let rd = &ds.meta().rd;
        assert_eq!(rd.quality_red, Some(1.0));
        assert_eq!(rd.quality_green, Some(0.0));
        assert_eq!(rd.battery_start, Some(2.0));
        assert_eq!(rd.battery_end, Some(0.0));
        let battery = ds.loaded("battery_percentage").unwrap();
        assert_eq!((battery.meta().min, battery.meta().max), (Some(0.0), Some(2.0)));
    }

    #[test]
    fn test_calculated_channels_are_rebuilt() {
        let dir = tempdir().unwrap();
        let t = [0.0, 0.02, 0.06];
        let mut ds = Dataset::new(dir.path());
        ds.add_all("ppg_ir", &t, &t, ints(3), false, None).unwrap();
        ds.analyse().unwrap();
        ds.save(false).unwrap();
        assert!(crate::storage::blob_path(dir.path(), "ble_service_debug_data_inserts").exists());

        let mut reopened = Dataset::new(dir.path());
        reopened.load().unwrap();
        reopened.analyse().unwrap();
        let inserts = reopened.channel("ble_service_debug_data_inserts").unwrap();
        assert_eq!(inserts.len(), 4);
        assert_eq!(reopened.meta().rd_version, RD_VERSION);
    }

    #[test]
    fn test_legacy_version_is_logged_and_unwrapped() {
        let t_calc = vec![0.0, 0.02, 5.16, 5.18];
        let t_rec = vec![0.0, 0.02, 0.04, 0.06];
        let mut ds = with_primary(&t_calc, &t_rec);
        ds.meta.rd_version = 0;
        ds.analyse().unwrap();

        let t = ds.channel("ppg_ir").unwrap().t_calc().to_vec();
        assert!((t[3] - 0.06).abs() < 1e-9);
        assert_eq!(ds.meta().rd_version, RD_VERSION);
        assert_eq!(ds.meta().rd_version_updates.len(), 1);
        assert_eq!(ds.meta().rd_version_updates[0].from, 0);
    }

    struct Constant;

    impl Spo2Estimator for Constant {
        fn estimate(
            &self,
            red: &crate::channel::Channel,
            _ir: &crate::channel::Channel,
        ) -> Vec<Spo2Sample> {
            red.t_calc()
                .iter()
                .zip(red.t_rec())
                .map(|(&t_calc, &t_rec)| Spo2Sample {
                    t_calc,
                    t_rec,
                    value: 97.0,
                })
                .collect()
        }
    }

    #[test]
    fn test_spo2_computed_when_configured() {
        let t = ramp(5);
        let mut ds = with_primary(&t, &t).with_collaborators(Collaborators {
            spike_remover: None,
            spo2: Some(Box::new(Constant)),
        });
        ds.add_all("ppg_red", &t, &t, ints(5), false, None).unwrap();
        ds.analyse().unwrap();
        let spo2 = ds.loaded("spo2").unwrap();
        assert_eq!(spo2.len(), 5);
        assert_eq!(spo2.meta().max, Some(97.0));
    }

    #[test]
    fn test_interleave_and_shift() {
        assert_eq!(interleave(&[0.0, 1.0]), vec![0.0, 0.5, 1.0, 1.5]);
        let reference = [0.0, 1.0, 2.0];
        let corrected = [10.0, 11.5, 12.0];
        let shifted = shift_by_nearest(&[0.5, 1.2, 2.5], &reference, &corrected);
        for (got, want) in shifted.iter().zip([10.5, 11.7, 12.5]) {
            assert!((got - want).abs() < 1e-12, "{} vs {}", got, want);
        }
    }
}
