//! Analysis windows and Slaney mel filterbanks.
//!
//! Filterbanks follow librosa's defaults (`htk=False`, `norm="slaney"`), which
//! is what both the Mel-STFT loss and the speaker embedder were trained against.

use candle_core::{Device, Result, Tensor};

/// Window shape for STFT frames. All windows are periodic (DFT-even).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Hann,
    Hamming,
    Blackman,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Hann, Window::Hamming, Window::Blackman];

    /// Generate the window coefficients.
    pub fn coefficients(self, length: usize) -> Vec<f32> {
        let n = length as f64;
        (0..length)
            .map(|i| {
                let phase = 2.0 * std::f64::consts::PI * i as f64 / n;
                let w = match self {
                    Window::Hann => 0.5 * (1.0 - phase.cos()),
                    Window::Hamming => 0.54 - 0.46 * phase.cos(),
                    Window::Blackman => 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos(),
                };
                w as f32
            })
            .collect()
    }
}

/// Build a Slaney-normalized mel filterbank as a `[n_fft/2 + 1, n_mels]` tensor,
/// ready to right-multiply `[.., frames, bins]` spectra.
pub fn mel_filterbank(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
    device: &Device,
) -> Result<Tensor> {
    let filters = mel_filters(n_fft, n_mels, sample_rate, f_min, f_max);
    let num_bins = n_fft / 2 + 1;
    let mut data = vec![0f32; num_bins * n_mels];
    for (mel_idx, filter) in filters.iter().enumerate() {
        for (bin_idx, &weight) in filter.iter().enumerate() {
            data[bin_idx * n_mels + mel_idx] = weight as f32;
        }
    }
    Tensor::from_vec(data, (num_bins, n_mels), device)
}

/// Triangular filters, `n_mels` rows of `n_fft/2 + 1` weights.
fn mel_filters(
    n_fft: usize,
    n_mels: usize,
    sample_rate: u32,
    f_min: f64,
    f_max: f64,
) -> Vec<Vec<f64>> {
    let num_bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;

    let mel_min = hz_to_mel_slaney(f_min);
    let mel_max = hz_to_mel_slaney(f_max);
    let hz_points: Vec<f64> = (0..=(n_mels + 1))
        .map(|i| mel_to_hz_slaney(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let bin_freqs: Vec<f64> = (0..num_bins)
        .map(|i| sr * i as f64 / n_fft as f64)
        .collect();

    (0..n_mels)
        .map(|i| {
            let (f_left, f_center, f_right) = (hz_points[i], hz_points[i + 1], hz_points[i + 2]);
            let norm = 2.0 / (f_right - f_left);
            bin_freqs
                .iter()
                .map(|&f| {
                    let lower = (f - f_left) / (f_center - f_left);
                    let upper = (f_right - f) / (f_right - f_center);
                    norm * lower.min(upper).max(0.0)
                })
                .collect()
        })
        .collect()
}

/// Convert frequency in Hz to Slaney mel scale.
///
/// Below 1000 Hz: linear mapping (mel = 3 * f / 200).
/// Above 1000 Hz: logarithmic (mel = 15 + 27 * ln(f / 1000) / ln(6.4)).
fn hz_to_mel_slaney(hz: f64) -> f64 {
    if hz < 1000.0 {
        3.0 * hz / 200.0
    } else {
        15.0 + 27.0 * (hz / 1000.0).ln() / (6.4_f64).ln()
    }
}

fn mel_to_hz_slaney(mel: f64) -> f64 {
    if mel < 15.0 {
        200.0 * mel / 3.0
    } else {
        1000.0 * ((mel - 15.0) * (6.4_f64).ln() / 27.0).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mel_conversion_roundtrip() {
        for &freq in &[40.0, 100.0, 440.0, 1000.0, 4000.0, 16000.0] {
            let back = mel_to_hz_slaney(hz_to_mel_slaney(freq));
            assert!((freq - back).abs() < 0.01, "roundtrip failed for {freq} Hz: got {back}");
        }
    }

    #[test]
    fn hann_window_properties() {
        let w = Window::Hann.coefficients(512);
        assert_eq!(w.len(), 512);
        assert!(w[0].abs() < 1e-7);
        assert!((w[256] - 1.0).abs() < 1e-6);
        assert!((w[100] - w[512 - 100]).abs() < 1e-6);
    }

    #[test]
    fn other_windows_peak_at_center() {
        for window in [Window::Hamming, Window::Blackman] {
            let w = window.coefficients(64);
            let max = w.iter().cloned().fold(f32::MIN, f32::max);
            assert!((w[32] - max).abs() < 1e-6, "{window:?}");
        }
    }

    #[test]
    fn filterbank_shape_and_weights() {
        let fb = mel_filterbank(512, 40, 16000, 0.0, 8000.0, &Device::Cpu).unwrap();
        assert_eq!(fb.dims(), &[257, 40]);
        let weights: Vec<Vec<f32>> = fb.to_vec2().unwrap();
        assert!(weights.iter().flatten().all(|&w| w >= 0.0));
        // every band picks up some energy
        let column_sums: Vec<f32> = fb.sum(0).unwrap().to_vec1().unwrap();
        assert!(column_sums.iter().all(|&s| s > 0.0), "{column_sums:?}");
    }
}
