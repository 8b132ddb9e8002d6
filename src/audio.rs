//! Signal processing on waveform tensors.
//!
//! Every transform here is built from differentiable tensor ops so that losses
//! computed on top of them backpropagate into the predicted waveform.

pub mod filters;
pub mod mel;
pub mod resample;
pub mod stft;

pub use filters::PreEmphasisFilter;
pub use mel::{Window, mel_filterbank};
pub use resample::SincResampler;
pub use stft::{Spectrum, Stft};
