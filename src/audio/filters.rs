//! Pre-emphasis filters applied to `(predicted, target)` pairs before a loss.
//!
//! - [`PreEmphasisFilter::HighPass`]: first-order `y[i] = x[i] - c * x[i-1]`,
//!   first sample passed through.
//! - [`PreEmphasisFilter::AWeighting`]: linear-phase FIR approximating the
//!   IEC 61672 A-weighting curve.

use candle_core::{D, Device, Result, Tensor};
use rustfft::FftPlanner;
use rustfft::num_complex::Complex;

/// Default high-pass pre-emphasis coefficient.
pub const DEFAULT_COEFF: f32 = 0.95;

/// Number of taps of the A-weighting FIR.
pub const A_WEIGHTING_TAPS: usize = 101;

/// Grid size for the frequency-sampling design of the A-weighting FIR.
const DESIGN_GRID: usize = 1024;

/// Stateless pre-emphasis filter.
#[derive(Debug, Clone)]
pub enum PreEmphasisFilter {
    HighPass { coeff: f32 },
    AWeighting { taps: Tensor }, // [1, 1, A_WEIGHTING_TAPS]
}

impl PreEmphasisFilter {
    pub fn high_pass(coeff: f32) -> Self {
        Self::HighPass { coeff }
    }

    /// A-weighting FIR designed for `sample_rate`.
    pub fn a_weighting(sample_rate: u32, device: &Device) -> Result<Self> {
        let taps = a_weighting_taps(sample_rate, A_WEIGHTING_TAPS);
        let taps = Tensor::from_vec(taps, (1, 1, A_WEIGHTING_TAPS), device)?;
        Ok(Self::AWeighting { taps })
    }

    /// Filter both operands, returning `(predicted', target')`.
    pub fn apply(&self, predicted: &Tensor, target: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.filter(predicted)?, self.filter(target)?))
    }

    /// Filter one `[batch, channels, samples]` waveform.
    pub fn filter(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::HighPass { coeff } => high_pass(xs, *coeff),
            Self::AWeighting { taps } => {
                let (b, c, len) = xs.dims3()?;
                let taps = if taps.device().same_device(xs.device()) {
                    taps.clone()
                } else {
                    taps.to_device(xs.device())?
                };
                xs.reshape((b * c, 1, len))?
                    .conv1d(&taps, A_WEIGHTING_TAPS / 2, 1, 1, 1)?
                    .reshape((b, c, len))
            }
        }
    }
}

/// `x[0]` unchanged, `x[i] - coeff * x[i-1]` for `i > 0`, along the last axis.
pub fn high_pass(xs: &Tensor, coeff: f32) -> Result<Tensor> {
    let len = xs.dim(D::Minus1)?;
    if len < 2 {
        return Ok(xs.clone());
    }
    let head = xs.narrow(D::Minus1, 0, 1)?;
    let current = xs.narrow(D::Minus1, 1, len - 1)?;
    let previous = xs.narrow(D::Minus1, 0, len - 1)?;
    let tail = (current - previous.affine(coeff as f64, 0.0)?)?;
    Tensor::cat(&[&head, &tail], D::Minus1)
}

/// Linear A-weighting gain at `f` Hz (0 dB at 1 kHz).
fn a_weighting_gain(f: f64) -> f64 {
    const F1: f64 = 20.598_997;
    const F2: f64 = 107.652_65;
    const F3: f64 = 737.862_23;
    const F4: f64 = 12_194.217;
    const A1000_DB: f64 = 1.9997;
    let f2 = f * f;
    let num = F4 * F4 * f2 * f2;
    let den = (f2 + F1 * F1) * ((f2 + F2 * F2) * (f2 + F3 * F3)).sqrt() * (f2 + F4 * F4);
    num / den * 10f64.powf(A1000_DB / 20.0)
}

/// Frequency-sampling design: sample the magnitude response on a dense grid,
/// inverse FFT to a zero-phase impulse response, then window `ntaps` around 0.
fn a_weighting_taps(sample_rate: u32, ntaps: usize) -> Vec<f32> {
    let n = DESIGN_GRID;
    let sr = sample_rate as f64;
    let mut spectrum: Vec<Complex<f64>> = (0..n)
        .map(|k| {
            let bin = if k <= n / 2 { k } else { n - k };
            Complex::new(a_weighting_gain(bin as f64 * sr / n as f64), 0.0)
        })
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_inverse(n).process(&mut spectrum);

    let center = ntaps / 2;
    (0..ntaps)
        .map(|i| {
            let lag = (i as isize - center as isize).rem_euclid(n as isize) as usize;
            let window = 0.5
                * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / (ntaps - 1) as f64).cos());
            (spectrum[lag].re / n as f64 * window) as f32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use rand::{Rng, SeedableRng};

    #[test]
    fn high_pass_matches_definition() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let coeff: f32 = rng.random_range(0.0..1.0);
            let samples: Vec<f32> = (0..64).map(|_| rng.random_range(-1.0..1.0)).collect();
            let x = Tensor::from_vec(samples.clone(), (1, 1, 64), &Device::Cpu).unwrap();
            let y: Vec<f32> = high_pass(&x, coeff)
                .unwrap()
                .i((0, 0))
                .unwrap()
                .to_vec1()
                .unwrap();
            assert_eq!(y[0], samples[0]);
            for i in 1..64 {
                let want = samples[i] - coeff * samples[i - 1];
                assert!((y[i] - want).abs() < 1e-6, "coeff {coeff}, i {i}");
            }
        }
    }

    #[test]
    fn filter_pair_keeps_shapes() {
        let dev = Device::Cpu;
        let pred = Tensor::randn(0f32, 1.0, (2, 1, 256), &dev).unwrap();
        let target = Tensor::randn(0f32, 1.0, (2, 1, 256), &dev).unwrap();
        for filter in [
            PreEmphasisFilter::high_pass(DEFAULT_COEFF),
            PreEmphasisFilter::a_weighting(44100, &dev).unwrap(),
        ] {
            let (p, t) = filter.apply(&pred, &target).unwrap();
            assert_eq!(p.dims(), &[2, 1, 256]);
            assert_eq!(t.dims(), &[2, 1, 256]);
        }
    }

    #[test]
    fn a_weighting_curve_reference_points() {
        // 0 dB at 1 kHz, strongly attenuated in the low bass
        let db = |f: f64| 20.0 * a_weighting_gain(f).log10();
        assert!(db(1000.0).abs() < 0.01);
        assert!((db(100.0) + 19.1).abs() < 0.2);
        assert!(db(20.0) < -45.0);
    }

    #[test]
    fn a_weighting_fir_is_symmetric_and_tracks_the_curve() {
        let sr = 44100.0;
        let taps = a_weighting_taps(44100, A_WEIGHTING_TAPS);
        for i in 0..A_WEIGHTING_TAPS / 2 {
            assert!((taps[i] - taps[A_WEIGHTING_TAPS - 1 - i]).abs() < 1e-6);
        }
        let response_db = |f: f64| {
            let (mut re, mut im) = (0.0, 0.0);
            for (i, &t) in taps.iter().enumerate() {
                let w = 2.0 * std::f64::consts::PI * f / sr * i as f64;
                re += t as f64 * w.cos();
                im -= t as f64 * w.sin();
            }
            10.0 * (re * re + im * im).log10()
        };
        // 101 taps cannot resolve the bass slope, but the shape holds
        assert!(response_db(0.0) < response_db(1000.0) - 6.0);
        assert!((response_db(4000.0) - 0.96).abs() < 0.5);
        assert!((response_db(10000.0) + 2.49).abs() < 0.5);
    }
}
