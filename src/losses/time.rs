//! Time-domain error measures on `[batch, channels, samples]` waveforms.
//!
//! Per-signal values are reduced along the sample axis, then averaged over
//! batch and channels.

use candle_core::{D, Result, Tensor};

use crate::audio::filters::high_pass;

/// Stability floor shared by the ratio measures.
pub const EPS: f64 = 1e-8;

/// Denominator floor of the pre-emphasized error-to-signal ratio.
pub const ESR_FLOOR: f64 = 1e-10;

fn log10(xs: &Tensor) -> Result<Tensor> {
    xs.log()?.affine(1.0 / std::f64::consts::LN_10, 0.0)
}

fn zero_mean(xs: &Tensor) -> Result<Tensor> {
    xs.broadcast_sub(&xs.mean_keepdim(D::Minus1)?)
}

/// Mean squared error.
pub fn mse(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    candle_nn::loss::mse(input, target)
}

/// Error-to-signal ratio after high-pass pre-emphasis of both operands.
///
/// The energy reference is the pre-emphasized `input`, as in the loss the
/// speaker models were originally trained with.
pub fn error_to_signal(input: &Tensor, target: &Tensor, coeff: f32) -> Result<Tensor> {
    let y = high_pass(input, coeff)?;
    let y_target = high_pass(target, coeff)?;
    let num = (&y - &y_target)?.sqr()?.sum(D::Minus1)?;
    let den = (y.sqr()?.sum(D::Minus1)? + ESR_FLOOR)?;
    (num / den)?.mean_all()
}

/// Plain error-to-signal ratio `Σ(t - p)² / (Σt² + eps)`.
pub fn esr(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let num = (target - input)?.sqr()?.sum(D::Minus1)?;
    let den = (target.sqr()?.sum(D::Minus1)? + EPS)?;
    (num / den)?.mean_all()
}

/// DC offset error `mean(t - p)² / (mean(t²) + eps)`.
pub fn dc(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let num = (target - input)?.mean(D::Minus1)?.sqr()?;
    let den = (target.sqr()?.mean(D::Minus1)? + EPS)?;
    (num / den)?.mean_all()
}

/// Log-cosh error `mean(log(cosh(p - t) + eps))`.
pub fn log_cosh(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let diff = (input - target)?;
    let cosh = ((diff.exp()? + diff.neg()?.exp()?)? * 0.5)?;
    (cosh + EPS)?.log()?.mean_all()
}

/// Negative signal-to-noise ratio in dB on zero-mean signals.
pub fn snr(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let input = zero_mean(input)?;
    let target = zero_mean(target)?;
    let res = (&input - &target)?;
    let ratio = (target.sqr()?.sum(D::Minus1)? / (res.sqr()?.sum(D::Minus1)? + EPS)?)?;
    let db = (log10(&(ratio + EPS)?)? * 10.0)?;
    db.mean_all()?.neg()
}

/// Negative scale-dependent SDR in dB on zero-mean signals.
pub fn sd_sdr(input: &Tensor, target: &Tensor) -> Result<Tensor> {
    let input = zero_mean(input)?;
    let target = zero_mean(target)?;
    let alpha = ((&input * &target)?.sum_keepdim(D::Minus1)?
        / (target.sqr()?.sum_keepdim(D::Minus1)? + EPS)?)?;
    let scaled_target = target.broadcast_mul(&alpha)?;
    let res = (&input - &target)?;
    let ratio =
        (scaled_target.sqr()?.sum(D::Minus1)? / (res.sqr()?.sum(D::Minus1)? + EPS)?)?;
    let db = (log10(&(ratio + EPS)?)? * 10.0)?;
    db.mean_all()?.neg()
}
