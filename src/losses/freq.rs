//! Frequency-domain losses.
//!
//! Each resolution contributes spectral convergence, L1 log-magnitude distance
//! and, when `w_phs > 0`, the MSE between phase angles:
//!
//! ```text
//! loss = ‖|Y| - |X|‖_F / ‖|Y|‖_F + mean|log|X| - log|Y|| + w_phs * mse(∠X, ∠Y)
//! ```
//!
//! Multi- and random-resolution variants average over their resolutions.

use std::sync::Mutex;

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::audio::mel::{Window, mel_filterbank};
use crate::audio::stft::Stft;
use crate::config::StftResolution;

/// Power floor before taking magnitudes.
const EPS: f64 = 1e-8;

/// Single-resolution STFT loss, optionally on a mel-warped magnitude.
#[derive(Debug, Clone)]
pub struct StftLoss {
    stft: Stft,
    mel_basis: Option<Tensor>, // [bins, n_mels]
    w_phs: f64,
}

impl StftLoss {
    pub fn new(res: StftResolution, w_phs: f64, window: Window, device: &Device) -> Result<Self> {
        let stft = Stft::new(res.fft_size, res.hop_size, res.win_length, window, device)?;
        Ok(Self {
            stft,
            mel_basis: None,
            w_phs,
        })
    }

    /// Mel-scaled variant covering `0 ..= sample_rate / 2`.
    pub fn mel(
        res: StftResolution,
        n_mels: usize,
        sample_rate: u32,
        w_phs: f64,
        device: &Device,
    ) -> Result<Self> {
        let mut loss = Self::new(res, w_phs, Window::Hann, device)?;
        loss.mel_basis = Some(mel_filterbank(
            res.fft_size,
            n_mels,
            sample_rate,
            0.0,
            sample_rate as f64 / 2.0,
            device,
        )?);
        Ok(loss)
    }

    /// Loss between `[batch, channels, samples]` waveforms.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (b, c, len) = input.dims3()?;
        let x = self.stft.forward(&input.reshape((b * c, len))?)?;
        let y = self.stft.forward(&target.reshape((b * c, len))?)?;

        let mut x_mag = x.magnitude(EPS)?;
        let mut y_mag = y.magnitude(EPS)?;
        if let Some(basis) = &self.mel_basis {
            x_mag = x_mag.broadcast_matmul(basis)?.clamp(EPS, f64::MAX)?;
            y_mag = y_mag.broadcast_matmul(basis)?.clamp(EPS, f64::MAX)?;
        }

        let sc = ((&y_mag - &x_mag)?.sqr()?.sum_all()?.sqrt()?
            / y_mag.sqr()?.sum_all()?.sqrt()?)?;
        let log_mag = (x_mag.log()? - y_mag.log()?)?.abs()?.mean_all()?;
        let mut loss = (sc + log_mag)?;

        if self.w_phs > 0.0 {
            let phs = candle_nn::loss::mse(&x.phase()?, &y.phase()?)?;
            loss = (loss + (phs * self.w_phs)?)?;
        }
        Ok(loss)
    }
}

/// Average of [`StftLoss`] over fixed resolutions.
#[derive(Debug, Clone)]
pub struct MultiResolutionStftLoss {
    losses: Vec<StftLoss>,
}

impl MultiResolutionStftLoss {
    pub fn new(resolutions: &[StftResolution], w_phs: f64, device: &Device) -> Result<Self> {
        if resolutions.is_empty() {
            candle_core::bail!("multi-resolution STFT loss needs at least one resolution");
        }
        let losses = resolutions
            .iter()
            .map(|&res| StftLoss::new(res, w_phs, Window::Hann, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { losses })
    }

    pub fn num_resolutions(&self) -> usize {
        self.losses.len()
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for loss in &self.losses {
            let value = loss.forward(input, target)?;
            total = Some(match total {
                Some(acc) => (acc + value)?,
                None => value,
            });
        }
        match total {
            Some(total) => total / self.losses.len() as f64,
            None => candle_core::bail!("no resolutions"),
        }
    }
}

/// Bounds for randomly drawn resolutions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomResolution {
    pub resolutions: usize,
    pub min_fft_size: usize,
    pub max_fft_size: usize,
    pub min_hop_ratio: f64,
    pub max_hop_ratio: f64,
}

impl Default for RandomResolution {
    fn default() -> Self {
        Self {
            resolutions: 3,
            min_fft_size: 16,
            max_fft_size: 32768,
            min_hop_ratio: 0.1,
            max_hop_ratio: 1.0,
        }
    }
}

/// STFT loss over resolutions and windows redrawn on every call.
#[derive(Debug)]
pub struct RandomResolutionStftLoss {
    bounds: RandomResolution,
    w_phs: f64,
    device: Device,
    rng: Mutex<StdRng>,
}

impl RandomResolutionStftLoss {
    pub fn new(bounds: RandomResolution, w_phs: f64, seed: Option<u64>, device: &Device) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            bounds,
            w_phs,
            device: device.clone(),
            rng: Mutex::new(rng),
        }
    }

    /// Draw one set of resolutions for a signal of `len` samples.
    ///
    /// FFT sizes are powers of two in `[min_fft_size, min(max_fft_size, len))`.
    pub fn draw(&self, len: usize) -> Vec<(StftResolution, Window)> {
        let lo = self.bounds.min_fft_size.max(2).ilog2();
        let hi = self.bounds.max_fft_size.min(len.max(2)).ilog2().max(lo);
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        (0..self.bounds.resolutions.max(1))
            .map(|_| {
                let exp = if hi > lo { rng.random_range(lo..hi) } else { lo };
                let fft_size = 1usize << exp;
                let ratio = self.bounds.min_hop_ratio
                    + rng.random::<f64>() * (self.bounds.max_hop_ratio - self.bounds.min_hop_ratio);
                let hop_size = ((fft_size as f64 * ratio) as usize).max(1);
                let window = Window::ALL[rng.random_range(0..Window::ALL.len())];
                let res = StftResolution {
                    fft_size,
                    hop_size,
                    win_length: fft_size,
                };
                (res, window)
            })
            .collect()
    }

    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        let len = input.dims3()?.2;
        let draws = self.draw(len);
        let count = draws.len();
        let mut total: Option<Tensor> = None;
        for (res, window) in draws {
            tracing::trace!(?res, ?window, "random resolution");
            let value =
                StftLoss::new(res, self.w_phs, window, &self.device)?.forward(input, target)?;
            total = Some(match total {
                Some(acc) => (acc + value)?,
                None => value,
            });
        }
        match total {
            Some(total) => total / count as f64,
            None => candle_core::bail!("no resolutions"),
        }
    }
}
