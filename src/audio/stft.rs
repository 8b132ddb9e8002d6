//! Differentiable short-time Fourier transform.
//!
//! Frames are gathered with `index_select` and projected onto a windowed DFT
//! basis with a single matmul, so gradients flow back to the waveform through
//! ordinary tensor ops. Framing matches `torch.stft(center=True)`: the signal is
//! reflect-padded by `n_fft / 2` on both sides and the window is zero-padded to
//! `n_fft`, centered.

use candle_core::{D, Device, Result, Tensor, bail};

use super::mel::Window;

/// Real and imaginary STFT parts, each `[batch, frames, n_fft/2 + 1]`.
#[derive(Debug, Clone)]
pub struct Spectrum {
    pub re: Tensor,
    pub im: Tensor,
}

impl Spectrum {
    /// Power spectrum `re² + im²`.
    pub fn power(&self) -> Result<Tensor> {
        self.re.sqr()? + self.im.sqr()?
    }

    /// Magnitude with the power clamped at `eps` before the square root.
    pub fn magnitude(&self, eps: f64) -> Result<Tensor> {
        self.power()?.clamp(eps, f64::MAX)?.sqrt()
    }

    /// Phase angle in `(-π, π]`.
    pub fn phase(&self) -> Result<Tensor> {
        atan2(&self.im, &self.re)
    }
}

/// STFT with a precomputed windowed DFT basis.
#[derive(Debug, Clone)]
pub struct Stft {
    n_fft: usize,
    hop_length: usize,
    num_bins: usize,
    basis: Tensor, // [n_fft, 2 * num_bins], cosine columns then sine columns
}

impl Stft {
    pub fn new(
        n_fft: usize,
        hop_length: usize,
        win_length: usize,
        window: Window,
        device: &Device,
    ) -> Result<Self> {
        if hop_length == 0 || win_length == 0 || win_length > n_fft {
            bail!("invalid STFT setting: n_fft={n_fft} hop={hop_length} win={win_length}");
        }
        let num_bins = n_fft / 2 + 1;

        let mut padded_window = vec![0f32; n_fft];
        let offset = (n_fft - win_length) / 2;
        for (i, w) in window.coefficients(win_length).into_iter().enumerate() {
            padded_window[offset + i] = w;
        }

        let width = 2 * num_bins;
        let mut data = vec![0f32; n_fft * width];
        for (n, &w) in padded_window.iter().enumerate() {
            if w == 0.0 {
                continue;
            }
            for k in 0..num_bins {
                // reduce k*n modulo n_fft first so large transforms keep precision
                let phase =
                    2.0 * std::f64::consts::PI * ((k * n) % n_fft) as f64 / n_fft as f64;
                data[n * width + k] = w * phase.cos() as f32;
                data[n * width + num_bins + k] = -w * phase.sin() as f32;
            }
        }
        let basis = Tensor::from_vec(data, (n_fft, width), device)?;

        Ok(Self {
            n_fft,
            hop_length,
            num_bins,
            basis,
        })
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    /// Number of frames produced for a signal of `len` samples.
    pub fn num_frames(&self, len: usize) -> usize {
        let padded = len + 2 * (self.n_fft / 2);
        (padded - self.n_fft) / self.hop_length + 1
    }

    /// Transform `[batch, samples]` into a [`Spectrum`].
    pub fn forward(&self, xs: &Tensor) -> Result<Spectrum> {
        let (batch, len) = xs.dims2()?;
        let padded = reflect_pad(xs, self.n_fft / 2)?;
        let num_frames = self.num_frames(len);

        let mut idx = Vec::with_capacity(num_frames * self.n_fft);
        for f in 0..num_frames {
            let start = (f * self.hop_length) as u32;
            idx.extend((0..self.n_fft as u32).map(|j| start + j));
        }
        let idx = Tensor::from_vec(idx, num_frames * self.n_fft, xs.device())?;

        let frames = padded
            .index_select(&idx, 1)?
            .reshape((batch, num_frames, self.n_fft))?;
        let spec = frames.broadcast_matmul(&self.basis)?;
        Ok(Spectrum {
            re: spec.narrow(D::Minus1, 0, self.num_bins)?,
            im: spec.narrow(D::Minus1, self.num_bins, self.num_bins)?,
        })
    }
}

/// Reflect-pad `[batch, samples]` by `pad` on both sides (edge sample excluded).
pub fn reflect_pad(xs: &Tensor, pad: usize) -> Result<Tensor> {
    let (_batch, len) = xs.dims2()?;
    if pad == 0 {
        return Ok(xs.clone());
    }
    if pad >= len {
        bail!("reflect padding of {pad} needs more than {len} samples");
    }
    let mut idx: Vec<u32> = Vec::with_capacity(len + 2 * pad);
    idx.extend((1..=pad).rev().map(|i| i as u32));
    idx.extend(0..len as u32);
    idx.extend((0..pad).map(|i| (len - 2 - i) as u32));
    let n = idx.len();
    let idx = Tensor::from_vec(idx, n, xs.device())?;
    xs.index_select(&idx, 1)
}

const ATAN_COEFFS: [f64; 6] = [
    0.999_977_26,
    -0.332_623_47,
    0.193_543_46,
    -0.116_432_87,
    0.052_653_32,
    -0.011_721_20,
];

/// Elementwise `atan2(y, x)` built from differentiable primitives.
///
/// Uses an odd degree-11 polynomial arctangent on `[0, 1]` (max error ≈ 2e-6
/// rad) and folds the octants back with `where_cond`.
pub fn atan2(y: &Tensor, x: &Tensor) -> Result<Tensor> {
    let ax = x.abs()?;
    let ay = y.abs()?;
    let hi = ax.maximum(&ay)?.clamp(1e-12f64, f64::MAX)?;
    let lo = ax.minimum(&ay)?;
    let a = (lo / hi)?;
    let s = a.sqr()?;

    let mut poly = s.affine(ATAN_COEFFS[5], ATAN_COEFFS[4])?;
    for &c in ATAN_COEFFS[..4].iter().rev() {
        poly = (poly * &s)?.affine(1.0, c)?;
    }
    let r = (poly * a)?;

    let half_pi = std::f64::consts::FRAC_PI_2;
    let pi = std::f64::consts::PI;
    let r = ay.gt(&ax)?.where_cond(&r.affine(-1.0, half_pi)?, &r)?;
    let zeros = x.zeros_like()?;
    let r = x.lt(&zeros)?.where_cond(&r.affine(-1.0, pi)?, &r)?;
    y.lt(&zeros)?.where_cond(&r.neg()?, &r)
}
