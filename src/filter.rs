//! # IIR Filter Module
//!
//! Chebyshev type II filters with fixed, published coefficients, designed as
//! cascaded second-order sections and applied forward and backward for zero
//! phase distortion.
//!
//! ## Published Designs (normalized frequency, Nyquist = 1)
//! | kind       | order | Wn     | Rp | Rs |
//! |------------|-------|--------|----|----|
//! | highpass   | 5     | 0.004  | 1  | 80 |
//! | lowpass1   | 12    | 0.1992 | 1  | 40 |
//! | lowpass2   | 18    | 0.1992 | 1  | 80 |
//!
//! Rp is kept for reference only; a type II design is fixed by order, Wn and
//! the stopband attenuation Rs.

use num_complex::Complex64;
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Lowpass,
    Highpass,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cheby2Spec {
    pub order: usize,
    pub wn: f64,
    pub rp: f64,
    pub rs: f64,
    pub band: Band,
}

pub const HIGHPASS: Cheby2Spec = Cheby2Spec {
    order: 5,
    wn: 0.004,
    rp: 1.0,
    rs: 80.0,
    band: Band::Highpass,
};

pub const LOWPASS1: Cheby2Spec = Cheby2Spec {
    order: 12,
    wn: 0.1992,
    rp: 1.0,
    rs: 40.0,
    band: Band::Lowpass,
};

pub const LOWPASS2: Cheby2Spec = Cheby2Spec {
    order: 18,
    wn: 0.1992,
    rp: 1.0,
    rs: 80.0,
    band: Band::Lowpass,
};

/// Filters a channel view can apply to its filtered buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Highpass,
    Lowpass1,
    Lowpass2,
    /// highpass, then highpass again, then lowpass1
    HighpassHighpassLowpass1,
}

impl FilterKind {
    pub fn stages(&self) -> &'static [Cheby2Spec] {
        match self {
            FilterKind::Highpass => &[HIGHPASS],
            FilterKind::Lowpass1 => &[LOWPASS1],
            FilterKind::Lowpass2 => &[LOWPASS2],
            FilterKind::HighpassHighpassLowpass1 => &[HIGHPASS, HIGHPASS, LOWPASS1],
        }
    }

    pub fn apply(&self, input: &[f64]) -> Vec<f64> {
        self.stages().iter().fold(input.to_vec(), |signal, spec| {
            SosFilter::design(spec).filtfilt(&signal)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Biquad {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl Biquad {
    fn dc_gain(&self) -> f64 {
        let den = 1.0 + self.a1 + self.a2;
        if den.abs() < 1e-12 {
            0.0
        } else {
            (self.b0 + self.b1 + self.b2) / den
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct BiquadState {
    z1: f64,
    z2: f64,
}

impl BiquadState {
    /// State at which a constant input `x` passes through unchanged in shape
    fn steady(coeffs: &Biquad, x: f64) -> Self {
        let y = coeffs.dc_gain() * x;
        let z1 = y - coeffs.b0 * x;
        let z2 = z1 - coeffs.b1 * x + coeffs.a1 * y;
        Self { z1, z2 }
    }

    fn process(&mut self, c: &Biquad, input: f64) -> f64 {
        // Transposed direct form II
        let y = c.b0 * input + self.z1;
        self.z1 = c.b1 * input - c.a1 * y + self.z2;
        self.z2 = c.b2 * input - c.a2 * y;
        y
    }
}

#[derive(Clone, Debug)]
pub struct SosFilter {
    sections: Vec<Biquad>,
}

impl SosFilter {
    pub fn design(spec: &Cheby2Spec) -> Self {
        let (zeros, poles, gain) = cheby2_zpk(spec);
        Self {
            sections: zpk_to_sos(&zeros, &poles, gain),
        }
    }

    pub fn sections(&self) -> &[Biquad] {
        &self.sections
    }

    /// Gain at DC (lowpass designs are 1, highpass designs are 0)
    pub fn dc_gain(&self) -> f64 {
        self.sections.iter().map(Biquad::dc_gain).product()
    }

    /// Single forward pass, started from the steady state of the first sample
    pub fn filter(&self, input: &[f64]) -> Vec<f64> {
        let mut output = input.to_vec();
        let Some(&first) = input.first() else {
            return output;
        };
        let mut x0 = first;
        for section in &self.sections {
            let mut state = BiquadState::steady(section, x0);
            x0 *= section.dc_gain();
            for value in output.iter_mut() {
                *value = state.process(section, *value);
            }
        }
        output
    }

    /// Forward-backward pass with zero phase
    pub fn filtfilt(&self, input: &[f64]) -> Vec<f64> {
        let mut forward = self.filter(input);
        forward.reverse();
        let mut backward = self.filter(&forward);
        backward.reverse();
        backward
    }
}

/// Analog prototype, frequency transform and bilinear map of a type II design
fn cheby2_zpk(spec: &Cheby2Spec) -> (Vec<Complex64>, Vec<Complex64>, f64) {
    let n = spec.order as i64;
    let nf = spec.order as f64;

    // Analog prototype with stopband edge at 1 rad/s
    let de = 1.0 / (10f64.powf(0.1 * spec.rs) - 1.0).sqrt();
    let mu = (1.0 / de).asinh() / nf;

    let zeros: Vec<Complex64> = (1 - n..n)
        .step_by(2)
        .filter(|&m| m != 0)
        .map(|m| Complex64::new(0.0, 1.0 / (m as f64 * PI / (2.0 * nf)).sin()))
        .collect();

    let poles: Vec<Complex64> = (1 - n..n)
        .step_by(2)
        .map(|m| {
            let p = -Complex64::new(0.0, PI * m as f64 / (2.0 * nf)).exp();
            Complex64::new(mu.sinh() * p.re, mu.cosh() * p.im).inv()
        })
        .collect();

    let gain = (product(poles.iter().map(|p| -*p)) / product(zeros.iter().map(|z| -*z))).re;

    // Pre-warp for the bilinear transform with fs = 2
    let fs2 = 4.0;
    let warped = fs2 * (PI * spec.wn / 2.0).tan();

    let (zeros, poles, gain) = match spec.band {
        Band::Lowpass => {
            let degree = (poles.len() - zeros.len()) as i32;
            (
                zeros.iter().map(|z| *z * warped).collect::<Vec<_>>(),
                poles.iter().map(|p| *p * warped).collect::<Vec<_>>(),
                gain * warped.powi(degree),
            )
        }
        Band::Highpass => {
            let degree = poles.len() - zeros.len();
            let gain = gain
                * (product(zeros.iter().map(|z| -*z)) / product(poles.iter().map(|p| -*p))).re;
            let mut hp_zeros: Vec<Complex64> = zeros.iter().map(|z| warped / *z).collect();
            hp_zeros.extend(std::iter::repeat(Complex64::new(0.0, 0.0)).take(degree));
            let hp_poles = poles.iter().map(|p| warped / *p).collect();
            (hp_zeros, hp_poles, gain)
        }
    };

    let degree = poles.len() - zeros.len();
    let gain = gain
        * (product(zeros.iter().map(|z| fs2 - *z)) / product(poles.iter().map(|p| fs2 - *p))).re;
    let mut digital_zeros: Vec<Complex64> =
        zeros.iter().map(|z| (fs2 + *z) / (fs2 - *z)).collect();
    digital_zeros.extend(std::iter::repeat(Complex64::new(-1.0, 0.0)).take(degree));
    let digital_poles = poles.iter().map(|p| (fs2 + *p) / (fs2 - *p)).collect();

    (digital_zeros, digital_poles, gain)
}

fn product<I: Iterator<Item = Complex64>>(values: I) -> Complex64 {
    values.fold(Complex64::new(1.0, 0.0), |acc, v| acc * v)
}

/// A first or second order polynomial factor, stored by its roots
#[derive(Clone, Debug)]
struct Factor {
    roots: Vec<Complex64>,
}

impl Factor {
    fn coefficients(&self) -> [f64; 3] {
        match self.roots.as_slice() {
            [] => [1.0, 0.0, 0.0],
            [r] => [1.0, -r.re, 0.0],
            [r1, r2] => {
                let sum = *r1 + *r2;
                let prod = *r1 * *r2;
                [1.0, -sum.re, prod.re]
            }
            _ => unreachable!("factors hold at most two roots"),
        }
    }

    fn anchor(&self) -> Complex64 {
        self.roots.first().copied().unwrap_or_default()
    }
}

/// Group roots into conjugate pairs and pairs of real roots
fn factors(roots: &[Complex64]) -> Vec<Factor> {
    let tol = 1e-9;
    let mut factors = Vec::new();
    let mut reals = Vec::new();
    for r in roots {
        if r.im > tol * r.norm().max(1.0) {
            factors.push(Factor {
                roots: vec![*r, r.conj()],
            });
        } else if r.im.abs() <= tol * r.norm().max(1.0) {
            reals.push(Complex64::new(r.re, 0.0));
        }
    }
    reals.sort_by(|a, b| a.re.total_cmp(&b.re));
    for chunk in reals.chunks(2) {
        factors.push(Factor {
            roots: chunk.to_vec(),
        });
    }
    factors
}

fn zpk_to_sos(zeros: &[Complex64], poles: &[Complex64], gain: f64) -> Vec<Biquad> {
    let mut pole_factors = factors(poles);
    let mut zero_factors = factors(zeros);

    // Poles closest to the unit circle get first pick of the zeros
    pole_factors.sort_by(|a, b| b.anchor().norm().total_cmp(&a.anchor().norm()));

    let mut sections = Vec::with_capacity(pole_factors.len());
    for pole_factor in &pole_factors {
        let zero_factor = if zero_factors.is_empty() {
            Factor { roots: Vec::new() }
        } else {
            let anchor = pole_factor.anchor();
            let (best, _) = zero_factors
                .iter()
                .enumerate()
                .map(|(i, z)| (i, (z.anchor() - anchor).norm()))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .unwrap_or((0, 0.0));
            zero_factors.swap_remove(best)
        };
        let [b0, b1, b2] = zero_factor.coefficients();
        let [_, a1, a2] = pole_factor.coefficients();
        sections.push(Biquad { b0, b1, b2, a1, a2 });
    }

    // Leftover zeros would mean more zeros than poles; not produced by these designs
    debug_assert!(zero_factors.is_empty());

    if let Some(first) = sections.first_mut() {
        first.b0 *= gain;
        first.b1 *= gain;
        first.b2 *= gain;
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, len: usize) -> Vec<f64> {
        // freq normalized to Nyquist = 1
        (0..len).map(|i| (PI * freq * i as f64).sin()).collect()
    }

    fn peak(values: &[f64]) -> f64 {
        values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
    }

    #[test]
    fn test_section_counts() {
        assert_eq!(SosFilter::design(&HIGHPASS).sections().len(), 3);
        assert_eq!(SosFilter::design(&LOWPASS1).sections().len(), 6);
        assert_eq!(SosFilter::design(&LOWPASS2).sections().len(), 9);
    }

    #[test]
    fn test_dc_gains() {
        assert!((SosFilter::design(&LOWPASS1).dc_gain() - 1.0).abs() < 1e-6);
        assert!((SosFilter::design(&LOWPASS2).dc_gain() - 1.0).abs() < 1e-6);
        assert!(SosFilter::design(&HIGHPASS).dc_gain().abs() < 1e-6);
    }

    #[test]
    fn test_lowpass_keeps_constant() {
        let out = FilterKind::Lowpass1.apply(&vec![5.0; 300]);
        assert!(out.iter().all(|v| (v - 5.0).abs() < 1e-6));
    }

    #[test]
    fn test_highpass_removes_offset() {
        let out = FilterKind::Highpass.apply(&vec![1200.0; 300]);
        assert!(peak(&out) < 1e-6);
    }

    #[test]
    fn test_lowpass_attenuates_stopband() {
        let input = sine(0.6, 2000);
        let out = FilterKind::Lowpass2.apply(&input);
        assert!(peak(&out[500..1500]) < 1e-3);
    }

    #[test]
    fn test_lowpass_passes_slow_wave() {
        let input = sine(0.02, 2000);
        let out = FilterKind::Lowpass1.apply(&input);
        let err = input[500..1500]
            .iter()
            .zip(&out[500..1500])
            .fold(0.0, |acc: f64, (a, b)| acc.max((a - b).abs()));
        assert!(err < 0.05);
    }

    #[test]
    fn test_empty_input() {
        assert!(FilterKind::HighpassHighpassLowpass1.apply(&[]).is_empty());
    }
}
