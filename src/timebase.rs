//! # Time-base Reconstruction
//!
//! Pure functions over the primary 50 Hz series used by `Dataset::analyse`.
//!
//! ## Steps
//! 1. `remove_counter_overflow`: undo 8-bit counter wraps in legacy data
//! 2. `detect_time_leaps`: indices where receive time jumps ahead
//! 3. `estimate_gap_offsets`: confirm leaps whose offset exceeds the jitter
//! 4. `apply_inserts`: shift everything after a confirmed gap
//! 5. `fit_drift`: linear model of the remaining receive/calc offset
//! 6. `reconstruct_missing`: count dropped samples and the transfer rate
//! 7. `estimate_sampling_rate`: dominant sample spacing
//!
//! All times are seconds.

use crate::timeseries::{linear_regression, SeriesExt};
use std::collections::BTreeMap;

/// Nominal spacing of the debug-data stream
pub const NOMINAL_DT: f64 = 0.02;
/// Span of the 8-bit sample counter
pub const COUNTER_WRAP: f64 = 256.0 * NOMINAL_DT;

pub const LEAP_THRESHOLD: f64 = 4.0;
/// Number of receive-time steps summed per leap
pub const LEAP_SPAN: usize = 3;
pub const MIN_GAP_DISTANCE: usize = 3;

/// Samples per side used for an offset estimate (15 s at 50 Hz)
pub const OFFSET_WINDOW: usize = 750;

/// Residuals are fitted at 1 Hz
pub const FIT_STRIDE: usize = 50;
pub const OUTLIER_LOOKBACK: usize = 20;
pub const OUTLIER_TOLERANCE: f64 = 0.1;

pub const TRANSFER_WINDOW: f64 = 5.0;
pub const TRANSFER_WINDOW_SAMPLES: f64 = 250.0;

/// Longest counter gap filled with synthesized samples (one hour at 50 Hz);
/// larger jumps are treated as corrupt and left unfilled
pub const MAX_MISSING_PER_GAP: i64 = 180_000;

const HISTOGRAM_DELTAS: usize = 100;
const HISTOGRAM_BINS: usize = 10;

/// Parallel `(t_calc, t_rec, value)` columns of a computed channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub t_calc: Vec<f64>,
    pub t_rec: Vec<f64>,
    pub values: Vec<f64>,
}

impl Series {
    pub fn push(&mut self, t_calc: f64, t_rec: f64, value: f64) {
        self.t_calc.push(t_calc);
        self.t_rec.push(t_rec);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Drift model `d = m*t + b` of receive time minus calculated time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub m: f64,
    pub b: f64,
}

impl LinearFit {
    /// Map a gap-corrected time onto the receive clock
    pub fn correct(&self, t: f64) -> f64 {
        t + self.m * t + self.b
    }
}

fn correct(fit: Option<LinearFit>, t: f64) -> f64 {
    fit.map_or(t, |f| f.correct(t))
}

/// Apply the drift correction to a whole series; identity without a fit
pub fn correct_all(t_calc: &[f64], fit: Option<LinearFit>) -> Vec<f64> {
    t_calc.iter().map(|&t| correct(fit, t)).collect()
}

/// Subtract a cumulative multiple of the counter span at every wrap
pub fn remove_counter_overflow(t_calc: &[f64]) -> Vec<f64> {
    let mut correction = 0.0;
    let mut out = Vec::with_capacity(t_calc.len());
    for (i, &t) in t_calc.iter().enumerate() {
        if i > 0 {
            let delta = t_calc[i] - t_calc[i - 1];
            if delta > COUNTER_WRAP {
                correction += (delta / COUNTER_WRAP).floor() * COUNTER_WRAP;
            }
        }
        out.push(t - correction);
    }
    out
}

/// Candidate gap indices where three receive-time steps sum above the threshold
pub fn detect_time_leaps(t_rec: &[f64]) -> Vec<usize> {
    let mut candidates = Vec::new();
    let mut last: Option<usize> = None;
    for i in 1..t_rec.len() {
        let leap = t_rec[i] - t_rec[i.saturating_sub(LEAP_SPAN)];
        let far_enough = last.map_or(true, |g| i - g > MIN_GAP_DISTANCE);
        if leap > LEAP_THRESHOLD && far_enough {
            candidates.push(i);
            last = Some(i);
        }
    }
    candidates
}

fn min_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

/// Offset to insert at every candidate whose jump exceeds the jitter threshold
///
/// Each candidate is judged on up to `OFFSET_WINDOW` samples on either side,
/// bounded by the neighbouring candidates.
pub fn estimate_gap_offsets(
    t_rec: &[f64],
    t_calc: &[f64],
    candidates: &[usize],
) -> BTreeMap<usize, f64> {
    let n = t_rec.len().min(t_calc.len());
    let offsets: Vec<f64> = (0..n).map(|i| t_rec[i] - t_calc[i]).collect();
    let mut inserts = BTreeMap::new();
    let mut previous_min_after: Option<f64> = None;

    for (k, &gap_index) in candidates.iter().enumerate() {
        if gap_index == 0 || gap_index >= n {
            continue;
        }
        let left_bound = if k > 0 { candidates[k - 1].min(gap_index) } else { 0 };
        let right_bound = candidates.get(k + 1).copied().unwrap_or(n).min(n);
        let len_left = (gap_index - left_bound).min(OFFSET_WINDOW);
        let len_right = right_bound.saturating_sub(gap_index).min(OFFSET_WINDOW);
        if len_left == 0 || len_right == 0 {
            continue;
        }

        let min_before = previous_min_after
            .unwrap_or_else(|| min_of(&offsets[gap_index - len_left..gap_index]));
        let min_after = min_of(&offsets[gap_index..gap_index + len_right]);
        previous_min_after = Some(min_after);

        let gap = min_after - min_before;
        let threshold = (OFFSET_WINDOW as f64 / len_left as f64).sqrt() * 0.5
            + (OFFSET_WINDOW as f64 / len_right as f64).sqrt() * 0.5;
        if gap > threshold {
            log::debug!(
                "Gap at sample {} confirmed: {:.3} s (threshold {:.3})",
                gap_index,
                gap,
                threshold
            );
            inserts.insert(gap_index, gap);
        } else {
            log::debug!("Gap candidate at sample {} dropped ({:.3} s)", gap_index, gap);
        }
    }
    inserts
}

/// Add the running sum of inserts at and after each confirmed gap
pub fn apply_inserts(t_calc: &[f64], inserts: &BTreeMap<usize, f64>) -> Vec<f64> {
    let mut shift = 0.0;
    t_calc
        .iter()
        .enumerate()
        .map(|(i, t)| {
            if let Some(gap) = inserts.get(&i) {
                shift += gap;
            }
            t + shift
        })
        .collect()
}

/// Every `FIT_STRIDE`th index
pub fn stride_indices(len: usize) -> impl Iterator<Item = usize> {
    (0..len).step_by(FIT_STRIDE)
}

/// Fit the 1 Hz residual `t_rec - t_calc` after dropping delayed outliers
///
/// A residual survives when it lies within `OUTLIER_TOLERANCE` of the
/// minimum of the preceding `OUTLIER_LOOKBACK` residuals.
pub fn fit_drift(t_calc: &[f64], t_rec: &[f64]) -> Option<LinearFit> {
    let n = t_calc.len().min(t_rec.len());
    let (times, residuals): (Vec<f64>, Vec<f64>) = stride_indices(n)
        .map(|i| (t_calc[i], t_rec[i] - t_calc[i]))
        .unzip();

    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for (j, &r) in residuals.iter().enumerate() {
        let keep = j == 0
            || r - min_of(&residuals[j.saturating_sub(OUTLIER_LOOKBACK)..j]) <= OUTLIER_TOLERANCE;
        if keep && r.is_finite() {
            xs.push(times[j]);
            ys.push(r);
        }
    }
    let (m, b) = linear_regression(&xs, &ys)?;
    log::debug!(
        "Drift fit over {}/{} residuals: m={:.3e} b={:.4}",
        xs.len(),
        residuals.len(),
        m,
        b
    );
    Some(LinearFit { m, b })
}

/// 1 Hz residual `t_rec - t_calc` of the corrected series
pub fn residual_series(t_calc: &[f64], t_rec: &[f64]) -> Series {
    let mut series = Series::default();
    for i in stride_indices(t_calc.len().min(t_rec.len())) {
        series.push(t_calc[i], t_rec[i], t_rec[i] - t_calc[i]);
    }
    series
}

/// Outcome of the missing-sample walk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissingSamples {
    /// One entry per real (0) or synthesized (1) slot
    pub flags: Series,
    /// Fraction of nominal samples received over the trailing window, per second
    pub transfer_rate: Series,
    pub real: usize,
    pub inserted: usize,
}

impl MissingSamples {
    pub fn transfer_rate_all(&self) -> Option<f64> {
        let total = self.real + self.inserted;
        (total > 0).then(|| self.real as f64 / total as f64)
    }
}

/// Count dropped samples on the gap-corrected series
///
/// Synthesized slots sit evenly between their real neighbours and take the
/// preceding real sample's receive time. All emitted times pass through `fit`.
pub fn reconstruct_missing(
    t_calc: &[f64],
    t_rec: &[f64],
    fit: Option<LinearFit>,
) -> MissingSamples {
    let n = t_calc.len().min(t_rec.len());
    let mut out = MissingSamples {
        real: n,
        ..MissingSamples::default()
    };
    let mut synthesized = Vec::new();

    for i in 0..n {
        out.flags.push(correct(fit, t_calc[i]), t_rec[i], 0.0);
        if i + 1 == n {
            break;
        }
        let delta = t_calc[i + 1] - t_calc[i];
        let missing = (delta / NOMINAL_DT).round() as i64 - 1;
        if missing <= 0 {
            continue;
        }
        if missing > MAX_MISSING_PER_GAP {
            log::warn!(
                "Not filling {:.1} s counter jump after sample {}: exceeds {} missing samples",
                delta,
                i,
                MAX_MISSING_PER_GAP
            );
            continue;
        }
        let step = delta / (missing + 1) as f64;
        for k in 1..=missing {
            let t = correct(fit, t_calc[i] + step * k as f64);
            out.flags.push(t, t_rec[i], 1.0);
            synthesized.push(t);
        }
    }
    out.inserted = synthesized.len();
    synthesized.sort_by(f64::total_cmp);

    if n > 0 {
        let first = correct(fit, t_calc[0]);
        let last = correct(fit, t_calc[n - 1]);
        let mut rec_cursor = 0;
        let mut second = first.floor() + 1.0;
        while second <= last {
            let lo = synthesized.partition_point(|&t| t < second - TRANSFER_WINDOW);
            let hi = synthesized.partition_point(|&t| t < second);
            let rate = ((TRANSFER_WINDOW_SAMPLES - (hi - lo) as f64) / TRANSFER_WINDOW_SAMPLES)
                .clamp(0.0, 1.0);
            while rec_cursor + 1 < n && correct(fit, t_calc[rec_cursor + 1]) < second {
                rec_cursor += 1;
            }
            out.transfer_rate.push(second, t_rec[rec_cursor], rate);
            second += 1.0;
        }
    }

    log::debug!(
        "Reconstructed {} missing samples against {} received",
        out.inserted,
        out.real
    );
    out
}

/// Dominant sampling rate from a histogram of the first sample spacings
pub fn estimate_sampling_rate(t_calc: &[f64]) -> Option<f64> {
    let head = &t_calc[..t_calc.len().min(HISTOGRAM_DELTAS + 1)];
    let deltas = head.diffs();
    let (min, max) = deltas.min_max()?;
    let spacing = if max - min <= f64::EPSILON {
        min
    } else {
        let width = (max - min) / HISTOGRAM_BINS as f64;
        let mut counts = [0usize; HISTOGRAM_BINS];
        for d in deltas.iter().filter(|d| !d.is_nan()) {
            let bin = (((d - min) / width) as usize).min(HISTOGRAM_BINS - 1);
            counts[bin] += 1;
        }
        let mut best = 0;
        for (bin, &count) in counts.iter().enumerate() {
            if count > counts[best] {
                best = bin;
            }
        }
        min + width * (best as f64 + 0.5)
    };
    (spacing > 0.0 && spacing.is_finite()).then(|| 1.0 / spacing)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64 * NOMINAL_DT).collect()
    }

    #[test]
    fn test_counter_overflow_removed() {
        let t = vec![0.0, 0.02, 5.16, 5.18, 10.32];
        let fixed = remove_counter_overflow(&t);
        let expected = [0.0, 0.02, 0.04, 0.06, 0.08];
        for (a, b) in fixed.iter().zip(expected) {
            assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_counter_overflow_untouched_when_regular() {
        let t = ramp(600);
        assert_eq!(remove_counter_overflow(&t), t);
    }

    #[test]
    fn test_single_leap_detected_once() {
        let mut t_rec = ramp(1500);
        for t in t_rec.iter_mut().skip(500) {
            *t += 5.0;
        }
        assert_eq!(detect_time_leaps(&t_rec), vec![500]);
    }

    #[test]
    fn test_leaps_need_spacing() {
        let mut t_rec = ramp(100);
        for t in t_rec.iter_mut().skip(10) {
            *t += 5.0;
        }
        for t in t_rec.iter_mut().skip(12) {
            *t += 5.0;
        }
        for t in t_rec.iter_mut().skip(40) {
            *t += 5.0;
        }
        assert_eq!(detect_time_leaps(&t_rec), vec![10, 14, 40]);
    }

    #[test]
    fn test_gap_offset_confirmed() {
        let t_calc = ramp(1500);
        let mut t_rec = t_calc.clone();
        for t in t_rec.iter_mut().skip(500) {
            *t += 5.0;
        }
        let inserts = estimate_gap_offsets(&t_rec, &t_calc, &[500]);
        assert_eq!(inserts.len(), 1);
        assert!((inserts[&500] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_small_gap_dropped() {
        let t_calc = ramp(1500);
        let mut t_rec = t_calc.clone();
        for t in t_rec.iter_mut().skip(500) {
            *t += 0.8;
        }
        assert!(estimate_gap_offsets(&t_rec, &t_calc, &[500]).is_empty());
    }

    fn shifted_at(t_calc: &[f64], gaps: &[usize], jump: f64) -> Vec<f64> {
        t_calc
            .iter()
            .enumerate()
            .map(|(i, t)| t + jump * gaps.iter().filter(|&&g| i >= g).count() as f64)
            .collect()
    }

    #[test]
    fn test_two_gaps_confirmed() {
        let t_calc = ramp(1500);
        let t_rec = shifted_at(&t_calc, &[500, 1000], 5.0);
        assert_eq!(detect_time_leaps(&t_rec), vec![500, 1000]);
        let inserts = estimate_gap_offsets(&t_rec, &t_calc, &[500, 1000]);
        assert_eq!(inserts.keys().copied().collect::<Vec<_>>(), vec![500, 1000]);
        assert!((inserts[&500] - 5.0).abs() < 1e-9);
        assert!((inserts[&1000] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_second_gap_starts_from_previous_min_after() {
        let t_calc = ramp(2500);
        let mut t_rec = shifted_at(&t_calc, &[100, 1500], 5.0);
        // early fast delivery, seen only by the window after the first gap
        t_rec[200] -= 0.5;
        let inserts = estimate_gap_offsets(&t_rec, &t_calc, &[100, 1500]);
        assert!((inserts[&100] - 4.5).abs() < 1e-9);
        assert!((inserts[&1500] - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_dropped_candidate_then_confirmed_gap() {
        let t_calc = ramp(1500);
        let mut t_rec = shifted_at(&t_calc, &[1000], 5.0);
        for t in t_rec.iter_mut().skip(300) {
            *t += 0.2;
        }
        let inserts = estimate_gap_offsets(&t_rec, &t_calc, &[300, 1000]);
        assert_eq!(inserts.keys().copied().collect::<Vec<_>>(), vec![1000]);
        assert!((inserts[&1000] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_inserts_is_cumulative() {
        let t = ramp(6);
        let inserts = BTreeMap::from([(2, 1.0), (4, 0.5)]);
        let shifted = apply_inserts(&t, &inserts);
        assert_eq!(shifted[1], t[1]);
        assert_eq!(shifted[2], t[2] + 1.0);
        assert_eq!(shifted[5], t[5] + 1.5);
    }

    #[test]
    fn test_fit_drift() {
        let t_calc = ramp(5000);
        let t_rec: Vec<f64> = (0..5000).map(|i| t_calc[i] + 1e-4 * i as f64 + 0.01).collect();
        let fit = fit_drift(&t_calc, &t_rec).unwrap();
        assert!((fit.m - 0.005).abs() < 1e-9);
        assert!((fit.b - 0.01).abs() < 1e-9);
    }

    #[test]
    fn test_fit_ignores_delayed_outliers() {
        let t_calc = ramp(5000);
        let mut t_rec = t_calc.clone();
        t_rec[2500] += 2.0;
        let fit = fit_drift(&t_calc, &t_rec).unwrap();
        assert!(fit.m.abs() < 1e-12);
        assert!(fit.b.abs() < 1e-12);
    }

    #[test]
    fn test_fit_needs_two_points() {
        let t = ramp(3);
        assert_eq!(fit_drift(&t, &t), None);
    }

    #[test]
    fn test_missing_sample_reconstruction() {
        let t_calc = vec![0.0, 0.02, 0.06];
        let missing = reconstruct_missing(&t_calc, &t_calc, None);
        assert_eq!(missing.inserted, 1);
        assert_eq!(missing.real, 3);
        assert_eq!(missing.flags.values, vec![0.0, 0.0, 1.0, 0.0]);
        assert!((missing.flags.t_calc[2] - 0.04).abs() < 1e-12);
        assert_eq!(missing.flags.t_rec[2], 0.02);
        assert_eq!(missing.transfer_rate_all(), Some(0.75));
    }

    #[test]
    fn test_oversized_counter_jump_is_not_filled() {
        let t_calc = vec![0.0, 0.02, 7200.0, 7200.02];
        let missing = reconstruct_missing(&t_calc, &t_calc, None);
        assert_eq!(missing.inserted, 0);
        assert_eq!(missing.flags.len(), 4);
        assert_eq!(missing.transfer_rate_all(), Some(1.0));
    }

    #[test]
    fn test_transfer_rate_windows() {
        // one second of samples dropped between 2.0 and 3.0
        let mut t_calc: Vec<f64> = (0..=100).map(|i| i as f64 * NOMINAL_DT).collect();
        t_calc.extend((150..=310).map(|i| i as f64 * NOMINAL_DT));
        let missing = reconstruct_missing(&t_calc, &t_calc, None);
        assert_eq!(missing.inserted, 49);
        assert_eq!(missing.transfer_rate.t_calc, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(missing.transfer_rate.values[0], 1.0);
        assert!((missing.transfer_rate.values[3] - (250.0 - 49.0) / 250.0).abs() < 1e-12);
    }

    #[test]
    fn test_sampling_rate_regular() {
        let rate = estimate_sampling_rate(&ramp(200)).unwrap();
        assert!((rate - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_sampling_rate_with_jitter() {
        let mut t = ramp(101);
        t[50] += 0.005;
        let rate = estimate_sampling_rate(&t).unwrap();
        assert!((rate - 50.0).abs() < 2.0);
    }

    #[test]
    fn test_sampling_rate_underflow() {
        assert_eq!(estimate_sampling_rate(&[1.0]), None);
        assert_eq!(estimate_sampling_rate(&[1.0, 1.0, 1.0]), None);
    }
}
