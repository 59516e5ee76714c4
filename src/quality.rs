//! Signal-quality scoring from the device-reported `quality` channel.
//!
//! Every trailing window of five samples is labelled by its maximum:
//! below 25 red, below 45 yellow, otherwise green.

/// Trailing window length
pub const QUALITY_WINDOW: usize = 5;
pub const RED_BELOW: f64 = 25.0;
pub const YELLOW_BELOW: f64 = 45.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLabel {
    Red,
    Yellow,
    Green,
}

impl QualityLabel {
    pub fn classify(window_max: f64) -> Self {
        if window_max < RED_BELOW {
            QualityLabel::Red
        } else if window_max < YELLOW_BELOW {
            QualityLabel::Yellow
        } else {
            QualityLabel::Green
        }
    }
}

/// Share of windows per label; all `None` when nothing was classified
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityFractions {
    pub green: Option<f64>,
    pub yellow: Option<f64>,
    pub red: Option<f64>,
}

impl QualityFractions {
    /// Score a quality trace; indices before the first full window are skipped
    pub fn score(quality: &[f64]) -> Self {
        let mut counts = [0usize; 3];
        for i in QUALITY_WINDOW..quality.len() {
            let window_max = quality[i - QUALITY_WINDOW..i]
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            match QualityLabel::classify(window_max) {
                QualityLabel::Red => counts[0] += 1,
                QualityLabel::Yellow => counts[1] += 1,
                QualityLabel::Green => counts[2] += 1,
            }
        }
        let total = counts.iter().sum::<usize>();
        if total == 0 {
            return Self::default();
        }
        let share = |n: usize| Some(n as f64 / total as f64);
        Self {
            red: share(counts[0]),
            yellow: share(counts[1]),
            green: share(counts[2]),
        }
    }

    /// Collapse to the dominant label if it holds the majority, otherwise yellow
    pub fn live(self) -> Self {
        if self.green.is_none() {
            return self;
        }
        let dominant = [
            (QualityLabel::Green, self.green),
            (QualityLabel::Yellow, self.yellow),
            (QualityLabel::Red, self.red),
        ]
        .into_iter()
        .find(|(_, share)| share.map_or(false, |s| s > 0.5))
        .map(|(label, _)| label)
        .unwrap_or(QualityLabel::Yellow);
        Self::one_hot(dominant)
    }

    fn one_hot(label: QualityLabel) -> Self {
        let flag = |l: QualityLabel| Some(if l == label { 1.0 } else { 0.0 });
        Self {
            green: flag(QualityLabel::Green),
            yellow: flag(QualityLabel::Yellow),
            red: flag(QualityLabel::Red),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_green() {
        let q = QualityFractions::score(&[50.0; 100]);
        assert_eq!(q.green, Some(1.0));
        assert_eq!(q.yellow, Some(0.0));
        assert_eq!(q.red, Some(0.0));
    }

    #[test]
    fn test_all_red() {
        let q = QualityFractions::score(&[20.0; 100]);
        assert_eq!((q.green, q.yellow, q.red), (Some(0.0), Some(0.0), Some(1.0)));
    }

    #[test]
    fn test_nothing_classified() {
        assert_eq!(QualityFractions::score(&[]), QualityFractions::default());
        assert_eq!(
            QualityFractions::score(&[50.0; 5]),
            QualityFractions::default()
        );
    }

    #[test]
    fn test_window_uses_maximum() {
        // windows ending at 5..10; only the first two see the 30
        let q = QualityFractions::score(&[10.0, 30.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0]);
        assert_eq!(q.yellow, Some(0.4));
        assert_eq!(q.red, Some(0.6));
    }

    #[test]
    fn test_live_mode() {
        let mostly_red = QualityFractions {
            green: Some(0.2),
            yellow: Some(0.2),
            red: Some(0.6),
        };
        assert_eq!(mostly_red.live().red, Some(1.0));
        assert_eq!(mostly_red.live().green, Some(0.0));

        let split = QualityFractions {
            green: Some(0.5),
            yellow: Some(0.0),
            red: Some(0.5),
        };
        assert_eq!(split.live().yellow, Some(1.0));
        assert_eq!(QualityFractions::default().live(), QualityFractions::default());
    }
}
