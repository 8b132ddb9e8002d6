//! Experiment configuration.
//!
//! Mirrors the layered `dataset` / `model` / `training` / `testing` layout used
//! by the training scripts. Every field has a default so a partial JSON file is
//! enough to describe a run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which loss section of the configuration to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Train,
    Test,
}

/// Top-level configuration for a training or evaluation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub testing: TestingConfig,
}

impl ExperimentConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loss identifier and parameters for the given stage.
    pub fn loss_section(&self, stage: Stage) -> (&str, &LossParams) {
        match stage {
            Stage::Train => (&self.training.lossfn, &self.training.loss),
            Stage::Test => (&self.testing.lossfn, &self.testing.loss),
        }
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.dataset.sample_rate == 0 || self.dataset.block_size_speaker == 0 {
            return Err(Error::Config("sample rates must be non-zero".into()));
        }
        let coeff = self.training.loss_preemphasis_hp_coeff;
        if !(0.0..1.0).contains(&coeff) {
            return Err(Error::Config(format!(
                "loss_preemphasis_hp_coeff must be in [0, 1), got {coeff}"
            )));
        }
        let p = self.model.bottleneck_dropout;
        if !(0.0..1.0).contains(&p) {
            return Err(Error::Config(format!(
                "bottleneck_dropout must be in [0, 1), got {p}"
            )));
        }
        if self.model.latent_slice_size == 0 || self.model.lstm_layers == 0 {
            return Err(Error::Config(
                "latent_slice_size and lstm_layers must be non-zero".into(),
            ));
        }
        self.model.autoencoder.verify()?;

        let factor = self.model.autoencoder.downsampling_factor();
        let block = self.dataset.block_size;
        if block == 0 || block % factor != 0 {
            return Err(Error::Config(format!(
                "block_size {block} is not a multiple of the downsampling factor {factor}"
            )));
        }
        let latent_len = block / factor;
        if latent_len % self.model.latent_slice_size != 0 {
            return Err(Error::Config(format!(
                "latent length {latent_len} is not divisible by latent_slice_size {}",
                self.model.latent_slice_size
            )));
        }

        self.training.loss.verify()?;
        self.testing.loss.verify()?;
        Ok(())
    }
}

/// Dataset-side constants the core depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    /// Source "rate" handed to the embedding resampler: one speaker block maps
    /// onto one second at the extractor's rate.
    pub block_size_speaker: u32,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            block_size: 16384,
            block_size_speaker: 16384,
        }
    }
}

/// Speaker autoencoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub ae_path: Option<PathBuf>,
    pub embedder_path: Option<PathBuf>,
    pub emb_size: usize,
    pub latent_slice_size: usize,
    pub lstm_layers: usize,
    pub bottleneck_dropout: f32,
    pub freeze_encoder: bool,
    pub freeze_decoder: bool,
    pub autoencoder: AutoEncoderConfig,
    pub embedder: SpeechEmbedderConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            ae_path: None,
            embedder_path: None,
            emb_size: 256,
            latent_slice_size: 8,
            lstm_layers: 2,
            bottleneck_dropout: 0.1,
            freeze_encoder: true,
            freeze_decoder: false,
            autoencoder: AutoEncoderConfig::default(),
            embedder: SpeechEmbedderConfig::default(),
        }
    }
}

/// Pretrained 1d autoencoder configuration (autoencoder1d-AT-v1 layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoEncoderConfig {
    pub in_channels: usize,
    pub patch_size: usize,
    pub channels: usize,
    pub multipliers: Vec<usize>,
    pub factors: Vec<usize>,
    pub num_blocks: Vec<usize>,
    pub resnet_groups: usize,
    /// Width of an optional 1x1 bottleneck projection. `None` (the pretrained
    /// layout) feeds the last encoder stage straight into the tanh.
    pub bottleneck_channels: Option<usize>,
}

impl Default for AutoEncoderConfig {
    fn default() -> Self {
        Self {
            in_channels: 2,
            patch_size: 4,
            channels: 32,
            multipliers: vec![1, 2, 4, 8, 8, 8, 1],
            factors: vec![2, 2, 2, 1, 1, 1],
            num_blocks: vec![2, 2, 8, 8, 8, 8],
            resnet_groups: 8,
            bottleneck_channels: None,
        }
    }
}

impl AutoEncoderConfig {
    /// Waveform samples per latent frame.
    pub fn downsampling_factor(&self) -> usize {
        self.patch_size * self.factors.iter().product::<usize>()
    }

    /// Channel count of the bottleneck latent.
    pub fn latent_channels(&self) -> usize {
        self.bottleneck_channels
            .unwrap_or_else(|| self.channels * self.multipliers.last().copied().unwrap_or(1))
    }

    /// Check that the per-stage lists line up.
    pub fn verify(&self) -> Result<()> {
        let stages = self.factors.len();
        if self.multipliers.len() != stages + 1 || self.num_blocks.len() != stages {
            return Err(Error::Config(format!(
                "autoencoder expects multipliers = factors + 1 = num_blocks + 1, got {}/{}/{}",
                self.multipliers.len(),
                stages,
                self.num_blocks.len()
            )));
        }
        if self.patch_size == 0 || (self.channels * self.multipliers[0]) % self.patch_size != 0 {
            return Err(Error::Config(
                "first stage width must be divisible by patch_size".into(),
            ));
        }
        if self.bottleneck_channels == Some(0) {
            return Err(Error::Config("bottleneck_channels must be non-zero".into()));
        }
        if self.factors.iter().any(|&f| f == 0) {
            return Err(Error::Config("autoencoder factors must be non-zero".into()));
        }
        Ok(())
    }
}

/// Speaker-embedding extractor (d-vector LSTM) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechEmbedderConfig {
    pub sample_rate: u32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub num_mels: usize,
    pub lstm_hidden: usize,
    pub lstm_layers: usize,
    pub emb_dim: usize,
    /// Mel frames per LSTM window.
    pub window: usize,
    /// Mel frames between consecutive windows.
    pub stride: usize,
}

impl Default for SpeechEmbedderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            n_fft: 512,
            hop_length: 160,
            win_length: 400,
            num_mels: 40,
            lstm_hidden: 768,
            lstm_layers: 3,
            emb_dim: 256,
            window: 80,
            stride: 40,
        }
    }
}

/// Training-time settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub lossfn: String,
    pub loss: LossParams,
    pub loss_preemphasis_hp_filter: bool,
    pub loss_preemphasis_hp_coeff: f32,
    pub loss_preemphasis_aw_filter: bool,
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            batch_size: 8,
            lossfn: "MSELoss".to_string(),
            loss: LossParams::default(),
            loss_preemphasis_hp_filter: false,
            loss_preemphasis_hp_coeff: 0.95,
            loss_preemphasis_aw_filter: false,
            seed: None,
        }
    }
}

/// Evaluation-time settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    pub lossfn: String,
    pub loss: LossParams,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            lossfn: "MSELoss".to_string(),
            loss: LossParams::default(),
        }
    }
}

/// One STFT analysis setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StftResolution {
    pub fft_size: usize,
    pub hop_size: usize,
    pub win_length: usize,
}

const MEL_WIN_LENGTH: usize = 2048;

/// Per-loss numeric parameters. Unset values fall back to built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LossParams {
    pub fft_size: Option<usize>,
    pub win_length: Option<usize>,
    pub hop_size: Option<usize>,
    pub w_phs: Option<f64>,
    pub n_mels: Option<usize>,
    pub fft_sizes: Option<Vec<usize>>,
    pub hop_sizes: Option<Vec<usize>>,
    pub win_lengths: Option<Vec<usize>>,
    pub random_resolutions: Option<usize>,
    pub min_fft_size: Option<usize>,
    pub max_fft_size: Option<usize>,
    pub min_hop_ratio: Option<f64>,
    pub max_hop_ratio: Option<f64>,
}

impl LossParams {
    /// Single-resolution STFT setting (4096 / 1024 / 4096 when unset).
    pub fn stft(&self) -> StftResolution {
        let fft_size = self.fft_size.unwrap_or(4096);
        StftResolution {
            fft_size,
            hop_size: self.hop_size.unwrap_or(1024),
            win_length: self.win_length.unwrap_or(fft_size),
        }
    }

    /// Mel STFT setting. The window stays at 2048 samples (capped at the FFT
    /// size) whatever `win_length` says.
    pub fn mel_stft(&self) -> StftResolution {
        let fft_size = self.fft_size.unwrap_or(4096);
        StftResolution {
            fft_size,
            hop_size: self.hop_size.unwrap_or(1024),
            win_length: MEL_WIN_LENGTH.min(fft_size),
        }
    }

    /// Phase term weight.
    pub fn phase_weight(&self) -> f64 {
        self.w_phs.unwrap_or(0.2)
    }

    /// Phase term weight of the random-resolution loss, off unless set.
    pub fn random_phase_weight(&self) -> f64 {
        self.w_phs.unwrap_or(0.0)
    }

    pub fn mel_bands(&self) -> usize {
        self.n_mels.unwrap_or(128)
    }

    /// Multi-resolution settings, one per FFT size.
    pub fn resolutions(&self) -> Vec<StftResolution> {
        let fft_sizes = self
            .fft_sizes
            .clone()
            .unwrap_or_else(|| vec![512, 1024, 2048, 4096]);
        let hop_sizes = self
            .hop_sizes
            .clone()
            .unwrap_or_else(|| vec![50, 120, 240, 480]);
        let win_lengths = self.win_lengths.clone().unwrap_or_else(|| fft_sizes.clone());
        fft_sizes
            .into_iter()
            .zip(hop_sizes)
            .zip(win_lengths)
            .map(|((fft_size, hop_size), win_length)| StftResolution {
                fft_size,
                hop_size,
                win_length,
            })
            .collect()
    }

    pub fn verify(&self) -> Result<()> {
        let n = self.fft_sizes.as_ref().map(Vec::len);
        let h = self.hop_sizes.as_ref().map(Vec::len);
        let w = self.win_lengths.as_ref().map(Vec::len);
        let lens: Vec<usize> = [n, h, w].into_iter().flatten().collect();
        if lens.windows(2).any(|p| p[0] != p[1]) {
            return Err(Error::Config(
                "fft_sizes, hop_sizes and win_lengths must have the same length".into(),
            ));
        }
        if let (Some(lo), Some(hi)) = (self.min_fft_size, self.max_fft_size) {
            if lo > hi {
                return Err(Error::Config(format!(
                    "min_fft_size {lo} exceeds max_fft_size {hi}"
                )));
            }
        }
        for res in self.resolutions().iter().chain(std::iter::once(&self.stft())) {
            if res.hop_size == 0 || res.win_length > res.fft_size {
                return Err(Error::Config(format!(
                    "invalid STFT resolution {res:?}: hop must be > 0 and win_length <= fft_size"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = ExperimentConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.model.autoencoder.downsampling_factor(), 32);
        assert_eq!(cfg.model.autoencoder.latent_channels(), 32);
        assert_eq!(cfg.dataset.block_size / 32, 512);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: ExperimentConfig = serde_json::from_str(
            r#"{"training": {"lossfn": "STFTLoss", "loss": {"fft_size": 1024}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.training.lossfn, "STFTLoss");
        let res = cfg.training.loss.stft();
        assert_eq!(res.fft_size, 1024);
        assert_eq!(res.win_length, 1024);
        assert_eq!(res.hop_size, 1024);
        assert_eq!(cfg.testing.lossfn, "MSELoss");
        assert_eq!(cfg.model.latent_slice_size, 8);
    }

    #[test]
    fn mel_window_ignores_configured_win_length() {
        let params = LossParams {
            fft_size: Some(4096),
            win_length: Some(4096),
            ..Default::default()
        };
        assert_eq!(params.stft().win_length, 4096);
        let mel = params.mel_stft();
        assert_eq!((mel.fft_size, mel.hop_size, mel.win_length), (4096, 1024, 2048));

        let small = LossParams {
            fft_size: Some(1024),
            ..Default::default()
        };
        assert_eq!(small.mel_stft().win_length, 1024);
    }

    #[test]
    fn random_resolution_phase_term_is_opt_in() {
        let params = LossParams::default();
        assert_eq!(params.phase_weight(), 0.2);
        assert_eq!(params.random_phase_weight(), 0.0);
        let set = LossParams {
            w_phs: Some(0.5),
            ..Default::default()
        };
        assert_eq!(set.random_phase_weight(), 0.5);
    }

    #[test]
    fn default_multi_resolution() {
        let res = LossParams::default().resolutions();
        assert_eq!(res.len(), 4);
        assert_eq!(res[0].fft_size, 512);
        assert_eq!(res[0].hop_size, 50);
        assert_eq!(res[3].win_length, 4096);
    }

    #[test]
    fn rejects_mismatched_resolution_lists() {
        let params = LossParams {
            fft_sizes: Some(vec![512, 1024]),
            hop_sizes: Some(vec![128]),
            ..Default::default()
        };
        assert!(params.verify().is_err());
    }

    #[test]
    fn rejects_block_size_not_matching_slices() {
        let mut cfg = ExperimentConfig::default();
        cfg.model.latent_slice_size = 7;
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));

        let mut cfg = ExperimentConfig::default();
        cfg.dataset.block_size = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_coefficients() {
        let mut cfg = ExperimentConfig::default();
        cfg.training.loss_preemphasis_hp_coeff = 1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = ExperimentConfig::default();
        cfg.model.bottleneck_dropout = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loss_section_by_stage() {
        let mut cfg = ExperimentConfig::default();
        cfg.training.lossfn = "EMBLoss".into();
        cfg.testing.lossfn = "SNRLoss".into();
        assert_eq!(cfg.loss_section(Stage::Train).0, "EMBLoss");
        assert_eq!(cfg.loss_section(Stage::Test).0, "SNRLoss");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"dataset": {"sample_rate": 48000}}"#).unwrap();
        let cfg = ExperimentConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.dataset.sample_rate, 48000);
        assert_eq!(cfg.dataset.block_size, 16384);
    }
}
