//! Speaker-embedding loss: MSE between the d-vector of the predicted waveform
//! and the target speaker's d-vector.

use std::sync::Arc;

use candle_core::{Device, Result, Tensor};

use crate::audio::resample::SincResampler;
use crate::model::embedder::SpeechEmbedder;

#[derive(Debug, Clone)]
pub struct EmbeddingLoss {
    embedder: Arc<SpeechEmbedder>,
    resampler: SincResampler,
}

impl EmbeddingLoss {
    /// `source_rate` is the rate the prediction is resampled from before it
    /// reaches the embedder.
    pub fn new(embedder: Arc<SpeechEmbedder>, source_rate: u32, device: &Device) -> Result<Self> {
        let resampler = SincResampler::kaiser(source_rate, embedder.sample_rate(), device)?;
        Ok(Self {
            embedder,
            resampler,
        })
    }

    pub fn embedder(&self) -> &Arc<SpeechEmbedder> {
        &self.embedder
    }

    /// d-vectors `[batch, emb_dim]` of `[batch, 1, samples]` audio.
    pub fn embed(&self, waveform: &Tensor) -> Result<Tensor> {
        let wav = self.resampler.forward(waveform)?.squeeze(1)?;
        self.embedder.embed(&wav)
    }

    pub fn forward(&self, predicted: &Tensor, target_embedding: &Tensor) -> Result<Tensor> {
        let predicted = self.embed(predicted)?;
        candle_nn::loss::mse(&predicted, target_embedding)
    }
}
