//! Slice helpers shared by channels and the analysis pipeline.

/// Window used by the smoothed and moving-max channel views
pub const VIEW_WINDOW: usize = 15;

pub trait SeriesExt {
    fn min_max(&self) -> Option<(f64, f64)>;
    /// Centered moving average; windows shrink at the edges
    fn centered_mean(&self, window: usize) -> Vec<f64>;
    /// Centered rolling maximum; windows shrink at the edges
    fn centered_max(&self, window: usize) -> Vec<f64>;
    fn diffs(&self) -> Vec<f64>;
    fn is_non_decreasing(&self) -> bool;
}

impl SeriesExt for [f64] {
    fn min_max(&self) -> Option<(f64, f64)> {
        self.iter()
            .filter(|v| !v.is_nan())
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((min, max)) => Some((min.min(v), max.max(v))),
            })
    }

    fn centered_mean(&self, window: usize) -> Vec<f64> {
        centered(self, window, |w| w.iter().sum::<f64>() / w.len() as f64)
    }

    fn centered_max(&self, window: usize) -> Vec<f64> {
        centered(self, window, |w| {
            w.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        })
    }

    fn diffs(&self) -> Vec<f64> {
        self.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn is_non_decreasing(&self) -> bool {
        self.windows(2).all(|w| w[1] >= w[0])
    }
}

fn centered<F>(values: &[f64], window: usize, reduce: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let half = window / 2;
    (0..values.len())
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = (i + half + 1).min(values.len());
            reduce(&values[start..end])
        })
        .collect()
}

/// Least-squares line `y = m*x + b`; `None` when fewer than two distinct x
pub fn linear_regression(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let mean_x = x[..n].iter().sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().sum::<f64>() / n as f64;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (xi, yi) in x[..n].iter().zip(&y[..n]) {
        sxx += (xi - mean_x) * (xi - mean_x);
        sxy += (xi - mean_x) * (yi - mean_y);
    }
    if sxx <= f64::EPSILON {
        return None;
    }
    let m = sxy / sxx;
    Some((m, mean_y - m * mean_x))
}
