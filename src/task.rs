//! Training, validation and test steps around [`SpeakerAutoencoder`].
//!
//! The task owns the model, its loss and optimizer. It does not iterate
//! datasets; callers feed [`Batch`]es and close epochs themselves.

use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::audio::filters::PreEmphasisFilter;
use crate::config::{ExperimentConfig, Stage};
use crate::error::{Error, Result};
use crate::losses::Losses;
use crate::model::speaker::{SpeakerAutoencoder, SpeakerParameters};

/// Speaker d-vectors `[B, emb_size]` supplied with a batch.
#[derive(Debug, Clone)]
pub enum SpeakerEmbeddings {
    None,
    /// One embedding used both as source and target speaker.
    Single(Tensor),
    Pair { own: Tensor, target: Tensor },
}

impl SpeakerEmbeddings {
    pub fn own(&self) -> Option<&Tensor> {
        match self {
            Self::None => None,
            Self::Single(emb) | Self::Pair { own: emb, .. } => Some(emb),
        }
    }

    pub fn target(&self) -> Option<&Tensor> {
        match self {
            Self::None => None,
            Self::Single(emb) | Self::Pair { target: emb, .. } => Some(emb),
        }
    }
}

/// One batch of paired audio.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Source speech `[B, C, T]`.
    pub input: Tensor,
    /// Expected output `[B, 1, T]`.
    pub target: Tensor,
    pub embeddings: SpeakerEmbeddings,
}

/// Running mean of per-step losses over one epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochLosses {
    values: Vec<f32>,
}

impl EpochLosses {
    pub fn push(&mut self, value: f32) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mean of the collected values, clearing them. `None` for an empty epoch.
    pub fn finish(&mut self) -> Option<f32> {
        if self.values.is_empty() {
            return None;
        }
        let mean = self.values.iter().sum::<f32>() / self.values.len() as f32;
        self.values.clear();
        Some(mean)
    }
}

pub struct SpeakerTask {
    model: SpeakerAutoencoder,
    params: SpeakerParameters,
    losses: Losses,
    high_pass: Option<PreEmphasisFilter>,
    a_weighting: Option<PreEmphasisFilter>,
    optimizer: AdamW,
    validation: EpochLosses,
    test: EpochLosses,
    cfg: ExperimentConfig,
    device: Device,
}

impl SpeakerTask {
    /// Assemble a task from a built model and loss.
    pub fn new(
        cfg: &ExperimentConfig,
        model: SpeakerAutoencoder,
        params: SpeakerParameters,
        losses: Losses,
        device: &Device,
    ) -> Result<Self> {
        let high_pass = cfg
            .training
            .loss_preemphasis_hp_filter
            .then(|| PreEmphasisFilter::high_pass(cfg.training.loss_preemphasis_hp_coeff));
        let a_weighting = if cfg.training.loss_preemphasis_aw_filter {
            Some(PreEmphasisFilter::a_weighting(cfg.dataset.sample_rate, device)?)
        } else {
            None
        };

        let trainable = params.trainable(cfg.model.freeze_encoder, cfg.model.freeze_decoder);
        tracing::info!(
            trainable = trainable.len(),
            lr = cfg.training.learning_rate,
            loss = %losses.kind(),
            "optimizer configured"
        );
        let optimizer = AdamW::new(
            trainable,
            ParamsAdamW {
                lr: cfg.training.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            params,
            losses,
            high_pass,
            a_weighting,
            optimizer,
            validation: EpochLosses::default(),
            test: EpochLosses::default(),
            cfg: cfg.clone(),
            device: device.clone(),
        })
    }

    /// Load the pretrained model and the training loss named in `cfg`.
    pub fn from_config(cfg: &ExperimentConfig, device: &Device) -> Result<Self> {
        cfg.validate()?;
        let (model, params) = SpeakerAutoencoder::load(&cfg.model, device)?;
        let losses = Losses::from_config(cfg, Stage::Train, device)?;
        Self::new(cfg, model, params, losses, device)
    }

    pub fn model(&self) -> &SpeakerAutoencoder {
        &self.model
    }

    pub fn parameters(&self) -> &SpeakerParameters {
        &self.params
    }

    pub fn losses(&self) -> &Losses {
        &self.losses
    }

    /// Replace the loss used by subsequent steps.
    pub fn set_losses(&mut self, losses: Losses) {
        tracing::info!(loss = %losses.kind(), "loss replaced");
        self.losses = losses;
    }

    /// Switch to the loss configured in the `testing` section.
    pub fn use_test_losses(&mut self) -> Result<()> {
        let losses = Losses::from_config(&self.cfg, Stage::Test, &self.device)?;
        self.set_losses(losses);
        Ok(())
    }

    /// Pre-emphasis (high-pass, then A-weighting) followed by the loss.
    pub fn objective(
        &self,
        predicted: &Tensor,
        target: &Tensor,
        embedding: &Tensor,
    ) -> Result<Tensor> {
        let (mut predicted, mut target) = (predicted.clone(), target.clone());
        for filter in [&self.high_pass, &self.a_weighting].into_iter().flatten() {
            (predicted, target) = filter.apply(&predicted, &target)?;
        }
        self.losses.forward(&predicted, &target, Some(embedding))
    }

    /// Forward with dropout, loss, one optimizer update. Returns the loss.
    ///
    /// Embedding-driven kinds condition on the target speaker; all others
    /// reconstruct with the speaker's own embedding.
    pub fn training_step(&mut self, batch: &Batch) -> Result<f32> {
        let embedding = if self.losses.kind().conditions_on_target() {
            batch.embeddings.target()
        } else {
            batch.embeddings.own()
        }
        .ok_or(Error::MissingEmbedding("speaker conditioning"))?;
        let predicted = self.model.forward_t(&batch.input, embedding, true)?;
        let loss = self.objective(&predicted, &batch.target, embedding)?;
        self.optimizer.backward_step(&loss)?;
        scalar(&loss)
    }

    fn evaluate(&self, batch: &Batch) -> Result<f32> {
        let embedding = batch
            .embeddings
            .target()
            .ok_or(Error::MissingEmbedding("speaker conditioning"))?;
        let predicted = self.model.forward_t(&batch.input, embedding, false)?;
        let loss = self.objective(&predicted, &batch.target, embedding)?;
        scalar(&loss)
    }

    pub fn validation_step(&mut self, batch: &Batch) -> Result<f32> {
        let loss = self.evaluate(batch)?;
        self.validation.push(loss);
        Ok(loss)
    }

    pub fn test_step(&mut self, batch: &Batch) -> Result<f32> {
        let loss = self.evaluate(batch)?;
        self.test.push(loss);
        Ok(loss)
    }

    /// Mean validation loss of the epoch.
    pub fn finish_validation_epoch(&mut self) -> Option<f32> {
        let mean = self.validation.finish();
        if let Some(mean) = mean {
            tracing::info!(val_loss_epoch = mean, "validation epoch");
        }
        mean
    }

    /// Mean test loss of the epoch.
    pub fn finish_test_epoch(&mut self) -> Option<f32> {
        let mean = self.test.finish();
        if let Some(mean) = mean {
            tracing::info!(test_loss_epoch = mean, "test epoch");
        }
        mean
    }
}

fn scalar(loss: &Tensor) -> Result<f32> {
    let value = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
    if !value.is_finite() {
        tracing::warn!(value, "non-finite loss");
    }
    Ok(value)
}

impl std::fmt::Debug for SpeakerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeakerTask")
            .field("losses", &self.losses)
            .field("validation_steps", &self.validation.len())
            .field("test_steps", &self.test.len())
            .finish()
    }
}
