//! Model components.
//!
//! - [`autoencoder`]: pretrained 1d waveform autoencoder (tanh bottleneck)
//! - [`fusion`]: per-channel bidirectional LSTM speaker fusion
//! - [`embedder`]: frozen LSTM d-vector extractor
//! - [`speaker`]: the speaker-conditioned autoencoder

pub mod autoencoder;
pub mod embedder;
pub mod fusion;
pub mod speaker;

pub use embedder::SpeechEmbedder;
pub use speaker::{SpeakerAutoencoder, SpeakerParameters};
