//! Speaker-conditioned voice conversion in pure Rust.
//!
//! A candle-based port of a speaker-embedding-conditioned waveform autoencoder
//! together with its composite training losses. A pretrained 1d autoencoder
//! provides the latent bottleneck; a per-channel bidirectional LSTM injects a
//! speaker d-vector into it.
//!
//! ## Architecture
//!
//! ```text
//! waveform ─ encoder (frozen) ─ z ─┬─ LatentFusion(z, d-vector) ─ (+) ─ decoder ─ waveform'
//!                                  └──────────────────────────────┘
//!
//! (waveform', target, d-vector) ─ pre-emphasis ─ Losses ─ scalar
//! ```
//!
//! ## Modules
//!
//! - [`audio`]: STFT, mel filterbank, sinc resampler, pre-emphasis filters
//! - [`losses`]: time, spectral and embedding losses behind one dispatcher
//! - [`model`]: autoencoder, fusion, speaker embedder, speaker autoencoder
//! - [`task`]: training / validation / test steps
//! - [`config`]: JSON experiment configuration
//! - [`device`]: device selection and spectral fallback placement

pub mod audio;
pub mod config;
pub mod device;
pub mod losses;
pub mod model;
pub mod task;

mod error;

pub use error::{Error, Result};
