//! Loss functions selectable by name.
//!
//! [`Losses`] resolves a [`LossKind`] identifier into a concrete strategy once,
//! at construction. Every strategy reduces `(predicted, target)` waveforms of
//! shape `[batch, channels, samples]` to a scalar tensor.
//!
//! | identifier                 | value                                   |
//! |----------------------------|-----------------------------------------|
//! | `error_to_signal`          | pre-emphasized ESR (coeff 0.95)         |
//! | `ESRLoss` `DCLoss` `LogCoshLoss` `SNRLoss` `SDSDRLoss` `MSELoss` | time-domain measures |
//! | `STFTLoss` `MelSTFTLoss`   | single-resolution spectral loss         |
//! | `MultiResolutionSTFTLoss`  | mean over fixed resolutions             |
//! | `RandomResolutionSTFTLoss` | mean over resolutions drawn per call    |
//! | `DC_SDSDR_SNR_Loss`        | `10000·DC + SDSDR + SNR`                |
//! | `ESR_DC_Loss`              | `1000·DC + ESR`                         |
//! | `EMBLoss`                  | `3000·EMB`                              |
//! | `EMB_MSE_Loss`             | `MSE + EMB`                             |
//! | `EMB_MR_Loss`              | `MR + 3000·EMB`                         |

pub mod embedding;
pub mod freq;
pub mod time;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::audio::filters::DEFAULT_COEFF;
use crate::config::{ExperimentConfig, LossParams, Stage};
use crate::device::SpectralPlacement;
use crate::error::{Error, Result};
use crate::model::embedder::SpeechEmbedder;

pub use embedding::EmbeddingLoss;
pub use freq::{MultiResolutionStftLoss, RandomResolution, RandomResolutionStftLoss, StftLoss};

/// Weight of the embedding term in `EMBLoss` and `EMB_MR_Loss`.
pub const EMBEDDING_SCALE: f64 = 3000.0;

/// Supported loss identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LossKind {
    ErrorToSignal,
    Esr,
    Dc,
    LogCosh,
    Snr,
    SdSdr,
    Mse,
    Stft,
    MelStft,
    MultiResolutionStft,
    RandomResolutionStft,
    DcSdsdrSnr,
    EsrDc,
    Embedding,
    EmbeddingMse,
    EmbeddingMultiResolution,
}

impl LossKind {
    pub const ALL: [LossKind; 16] = [
        Self::ErrorToSignal,
        Self::Esr,
        Self::Dc,
        Self::LogCosh,
        Self::Snr,
        Self::SdSdr,
        Self::Mse,
        Self::Stft,
        Self::MelStft,
        Self::MultiResolutionStft,
        Self::RandomResolutionStft,
        Self::DcSdsdrSnr,
        Self::EsrDc,
        Self::Embedding,
        Self::EmbeddingMse,
        Self::EmbeddingMultiResolution,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ErrorToSignal => "error_to_signal",
            Self::Esr => "ESRLoss",
            Self::Dc => "DCLoss",
            Self::LogCosh => "LogCoshLoss",
            Self::Snr => "SNRLoss",
            Self::SdSdr => "SDSDRLoss",
            Self::Mse => "MSELoss",
            Self::Stft => "STFTLoss",
            Self::MelStft => "MelSTFTLoss",
            Self::MultiResolutionStft => "MultiResolutionSTFTLoss",
            Self::RandomResolutionStft => "RandomResolutionSTFTLoss",
            Self::DcSdsdrSnr => "DC_SDSDR_SNR_Loss",
            Self::EsrDc => "ESR_DC_Loss",
            Self::Embedding => "EMBLoss",
            Self::EmbeddingMse => "EMB_MSE_Loss",
            Self::EmbeddingMultiResolution => "EMB_MR_Loss",
        }
    }

    /// Whether `forward` needs a target speaker embedding.
    pub fn needs_embedding(self) -> bool {
        matches!(
            self,
            Self::Embedding | Self::EmbeddingMse | Self::EmbeddingMultiResolution
        )
    }

    /// Kinds that train against the target speaker's embedding rather than the
    /// speaker's own.
    pub fn conditions_on_target(self) -> bool {
        matches!(self, Self::Embedding | Self::EmbeddingMultiResolution)
    }
}

impl FromStr for LossKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownLossKind(s.to_string()))
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Strategy {
    ErrorToSignal { coeff: f32 },
    Esr,
    Dc,
    LogCosh,
    Snr,
    SdSdr,
    Mse,
    Stft(StftLoss),
    MultiResolution(MultiResolutionStftLoss),
    RandomResolution(RandomResolutionStftLoss),
    DcSdsdrSnr,
    EsrDc,
    Embedding(EmbeddingLoss),
    EmbeddingMse(EmbeddingLoss),
    EmbeddingMultiResolution {
        embedding: EmbeddingLoss,
        spectral: MultiResolutionStftLoss,
    },
}

/// A loss resolved from its identifier.
pub struct Losses {
    kind: LossKind,
    strategy: Strategy,
    placement: SpectralPlacement,
}

impl fmt::Debug for Losses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Losses")
            .field("kind", &self.kind)
            .field("placement", &self.placement)
            .finish()
    }
}

impl Losses {
    /// Build the loss named `loss_type` from the `stage` section of `cfg`.
    ///
    /// Embedding kinds load the extractor at `model.embedder_path` through the
    /// shared cache.
    pub fn new(
        loss_type: &str,
        sample_rate: u32,
        cfg: &ExperimentConfig,
        stage: Stage,
        device: &Device,
    ) -> Result<Self> {
        let kind: LossKind = loss_type.parse()?;
        let embedder = if kind.needs_embedding() {
            let path = cfg.model.embedder_path.as_deref().ok_or_else(|| {
                Error::Config(format!("{kind} needs model.embedder_path"))
            })?;
            Some(SpeechEmbedder::load_shared(
                path,
                cfg.model.embedder.clone(),
                device,
            )?)
        } else {
            None
        };
        Self::with_embedder(kind, sample_rate, cfg, stage, device, embedder)
    }

    /// Build the loss configured for `stage`, at the dataset sample rate.
    pub fn from_config(cfg: &ExperimentConfig, stage: Stage, device: &Device) -> Result<Self> {
        let (name, _) = cfg.loss_section(stage);
        Self::new(name, cfg.dataset.sample_rate, cfg, stage, device)
    }

    /// Like [`Losses::new`] with an already loaded embedder.
    pub fn with_embedder(
        kind: LossKind,
        sample_rate: u32,
        cfg: &ExperimentConfig,
        stage: Stage,
        device: &Device,
        embedder: Option<Arc<SpeechEmbedder>>,
    ) -> Result<Self> {
        let placement = SpectralPlacement::new(device);
        let (_, params) = cfg.loss_section(stage);
        let compute = placement.compute();

        let embedding_loss = |embedder: Option<Arc<SpeechEmbedder>>| -> Result<EmbeddingLoss> {
            let embedder =
                embedder.ok_or_else(|| Error::Config(format!("{kind} needs a speaker embedder")))?;
            Ok(EmbeddingLoss::new(
                embedder,
                cfg.dataset.block_size_speaker,
                device,
            )?)
        };

        let strategy = match kind {
            LossKind::ErrorToSignal => Strategy::ErrorToSignal {
                coeff: DEFAULT_COEFF,
            },
            LossKind::Esr => Strategy::Esr,
            LossKind::Dc => Strategy::Dc,
            LossKind::LogCosh => Strategy::LogCosh,
            LossKind::Snr => Strategy::Snr,
            LossKind::SdSdr => Strategy::SdSdr,
            LossKind::Mse => Strategy::Mse,
            LossKind::Stft => Strategy::Stft(StftLoss::new(
                params.stft(),
                params.phase_weight(),
                crate::audio::Window::Hann,
                compute,
            )?),
            LossKind::MelStft => Strategy::Stft(StftLoss::mel(
                params.mel_stft(),
                params.mel_bands(),
                sample_rate,
                params.phase_weight(),
                compute,
            )?),
            LossKind::MultiResolutionStft => {
                Strategy::MultiResolution(MultiResolutionStftLoss::new(
                    &params.resolutions(),
                    params.phase_weight(),
                    compute,
                )?)
            }
            LossKind::RandomResolutionStft => {
                Strategy::RandomResolution(RandomResolutionStftLoss::new(
                    random_bounds(params),
                    params.random_phase_weight(),
                    cfg.training.seed,
                    compute,
                ))
            }
            LossKind::DcSdsdrSnr => Strategy::DcSdsdrSnr,
            LossKind::EsrDc => Strategy::EsrDc,
            LossKind::Embedding => Strategy::Embedding(embedding_loss(embedder)?),
            LossKind::EmbeddingMse => Strategy::EmbeddingMse(embedding_loss(embedder)?),
            LossKind::EmbeddingMultiResolution => Strategy::EmbeddingMultiResolution {
                embedding: embedding_loss(embedder)?,
                spectral: MultiResolutionStftLoss::new(
                    &params.resolutions(),
                    params.phase_weight(),
                    compute,
                )?,
            },
        };

        tracing::info!(loss = %kind, ?stage, sample_rate, "loss configured");
        Ok(Self {
            kind,
            strategy,
            placement,
        })
    }

    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// Scalar loss between `input` (prediction) and `target`.
    ///
    /// `embedding` is the target speaker's d-vector `[batch, emb_dim]`,
    /// required by the embedding kinds and ignored otherwise.
    pub fn forward(
        &self,
        input: &Tensor,
        target: &Tensor,
        embedding: Option<&Tensor>,
    ) -> Result<Tensor> {
        let target_embedding = || embedding.ok_or(Error::MissingEmbedding(self.kind.as_str()));
        let loss = match &self.strategy {
            Strategy::ErrorToSignal { coeff } => time::error_to_signal(input, target, *coeff)?,
            Strategy::Esr => time::esr(input, target)?,
            Strategy::Dc => time::dc(input, target)?,
            Strategy::LogCosh => time::log_cosh(input, target)?,
            Strategy::Snr => time::snr(input, target)?,
            Strategy::SdSdr => time::sd_sdr(input, target)?,
            Strategy::Mse => time::mse(input, target)?,
            Strategy::Stft(loss) => self.spectral(input, target, |x, y| loss.forward(x, y))?,
            Strategy::MultiResolution(loss) => {
                self.spectral(input, target, |x, y| loss.forward(x, y))?
            }
            Strategy::RandomResolution(loss) => {
                self.spectral(input, target, |x, y| loss.forward(x, y))?
            }
            Strategy::DcSdsdrSnr => {
                let dc = time::dc(input, target)?;
                let sdsdr = time::sd_sdr(input, target)?;
                let snr = time::snr(input, target)?;
                ((dc * 10000.0)? + sdsdr)?.add(&snr)?
            }
            Strategy::EsrDc => {
                let dc = time::dc(input, target)?;
                let esr = time::esr(input, target)?;
                ((dc * 1000.0)? + esr)?
            }
            Strategy::Embedding(loss) => {
                (loss.forward(input, target_embedding()?)? * EMBEDDING_SCALE)?
            }
            Strategy::EmbeddingMse(loss) => {
                let emb = loss.forward(input, target_embedding()?)?;
                (time::mse(input, target)? + emb)?
            }
            Strategy::EmbeddingMultiResolution {
                embedding: emb_loss,
                spectral,
            } => {
                let emb = emb_loss.forward(input, target_embedding()?)?;
                let mr = self.spectral(input, target, |x, y| spectral.forward(x, y))?;
                (mr + (emb * EMBEDDING_SCALE)?)?
            }
        };
        Ok(loss)
    }

    /// Run spectral work on the compute device, returning the result on the
    /// input's device.
    fn spectral(
        &self,
        input: &Tensor,
        target: &Tensor,
        f: impl FnOnce(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
    ) -> candle_core::Result<Tensor> {
        let origin = input.device().clone();
        let x = self.placement.to_compute(input)?;
        let y = self.placement.to_compute(target)?;
        self.placement.restore(&f(&x, &y)?, &origin)
    }
}

fn random_bounds(params: &LossParams) -> RandomResolution {
    let defaults = RandomResolution::default();
    RandomResolution {
        resolutions: params.random_resolutions.unwrap_or(defaults.resolutions),
        min_fft_size: params.min_fft_size.unwrap_or(defaults.min_fft_size),
        max_fft_size: params.max_fft_size.unwrap_or(defaults.max_fft_size),
        min_hop_ratio: params.min_hop_ratio.unwrap_or(defaults.min_hop_ratio),
        max_hop_ratio: params.max_hop_ratio.unwrap_or(defaults.max_hop_ratio),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeechEmbedderConfig;
    use candle_core::DType;
    use candle_nn::{VarBuilder, VarMap};

    fn scalar(t: Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    fn small_config() -> ExperimentConfig {
        let mut cfg = ExperimentConfig::default();
        cfg.training.loss.fft_size = Some(512);
        cfg.training.loss.hop_size = Some(128);
        cfg.training.loss.fft_sizes = Some(vec![256, 512]);
        cfg.training.loss.hop_sizes = Some(vec![64, 128]);
        cfg.model.embedder = SpeechEmbedderConfig {
            lstm_hidden: 16,
            lstm_layers: 1,
            emb_dim: 8,
            ..Default::default()
        };
        cfg
    }

    fn tiny_embedder(cfg: &ExperimentConfig) -> Arc<SpeechEmbedder> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Arc::new(SpeechEmbedder::new(cfg.model.embedder.clone(), vb).unwrap())
    }

    fn signals(len: usize) -> (Tensor, Tensor) {
        (
            Tensor::randn(0f32, 0.3, (2, 1, len), &Device::Cpu).unwrap(),
            Tensor::randn(0f32, 0.3, (2, 1, len), &Device::Cpu).unwrap(),
        )
    }

    #[test]
    fn identifiers_round_trip() {
        for kind in LossKind::ALL {
            assert_eq!(kind.as_str().parse::<LossKind>().unwrap(), kind);
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }

    #[test]
    fn unknown_identifier_fails_construction() {
        let cfg = ExperimentConfig::default();
        let err = Losses::new("bogus", 44100, &cfg, Stage::Train, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::UnknownLossKind(name) if name == "bogus"));
    }

    #[test]
    fn every_non_embedding_kind_yields_a_finite_scalar() {
        let cfg = small_config();
        let (a, b) = signals(4096);
        for kind in LossKind::ALL.into_iter().filter(|k| !k.needs_embedding()) {
            let losses = Losses::with_embedder(kind, 44100, &cfg, Stage::Train, &Device::Cpu, None)
                .unwrap();
            let value = losses.forward(&a, &b, None).unwrap();
            assert_eq!(value.rank(), 0, "{kind}");
            assert!(scalar(value).is_finite(), "{kind}");
        }
    }

    #[test]
    fn dc_sdsdr_snr_combines_with_fixed_weights() {
        let cfg = small_config();
        let (a, b) = signals(1024);
        let losses = Losses::new("DC_SDSDR_SNR_Loss", 44100, &cfg, Stage::Train, &Device::Cpu)
            .unwrap();
        let combined = scalar(losses.forward(&a, &b, None).unwrap());
        let dc = scalar(time::dc(&a, &b).unwrap());
        let sdsdr = scalar(time::sd_sdr(&a, &b).unwrap());
        let snr = scalar(time::snr(&a, &b).unwrap());
        let expected = (dc * 10000.0 + sdsdr) + snr;
        assert!((combined - expected).abs() <= 1e-6 * expected.abs().max(1.0));
    }

    #[test]
    fn esr_dc_combines_with_fixed_weights() {
        let cfg = small_config();
        let (a, b) = signals(1024);
        let losses = Losses::new("ESR_DC_Loss", 44100, &cfg, Stage::Train, &Device::Cpu).unwrap();
        let combined = scalar(losses.forward(&a, &b, None).unwrap());
        let dc = scalar(time::dc(&a, &b).unwrap());
        let esr = scalar(time::esr(&a, &b).unwrap());
        assert!((combined - (dc * 1000.0 + esr)).abs() <= 1e-5 * combined.abs().max(1.0));
    }

    #[test]
    fn embedding_loss_is_scaled_mse_of_embeddings() {
        let cfg = small_config();
        let embedder = tiny_embedder(&cfg);
        let losses = Losses::with_embedder(
            LossKind::Embedding,
            44100,
            &cfg,
            Stage::Train,
            &Device::Cpu,
            Some(embedder.clone()),
        )
        .unwrap();

        let (pred, target) = signals(16384);
        let target_emb = Tensor::randn(0f32, 0.1, (2, 8), &Device::Cpu).unwrap();
        let value = scalar(losses.forward(&pred, &target, Some(&target_emb)).unwrap());

        let direct = EmbeddingLoss::new(embedder, 16384, &Device::Cpu).unwrap();
        let pred_emb = direct.embed(&pred).unwrap();
        let mse = scalar(candle_nn::loss::mse(&pred_emb, &target_emb).unwrap());
        assert!((value - 3000.0 * mse).abs() <= 1e-4 * value.abs().max(1.0));
    }

    #[test]
    fn embedding_mse_adds_unscaled_embedding_term() {
        let cfg = small_config();
        let embedder = tiny_embedder(&cfg);
        let losses = Losses::with_embedder(
            LossKind::EmbeddingMse,
            44100,
            &cfg,
            Stage::Train,
            &Device::Cpu,
            Some(embedder.clone()),
        )
        .unwrap();

        let (pred, target) = signals(16384);
        let target_emb = Tensor::randn(0f32, 0.1, (2, 8), &Device::Cpu).unwrap();
        let value = scalar(losses.forward(&pred, &target, Some(&target_emb)).unwrap());

        let direct = EmbeddingLoss::new(embedder, 16384, &Device::Cpu).unwrap();
        let emb = scalar(direct.forward(&pred, &target_emb).unwrap());
        let mse = scalar(time::mse(&pred, &target).unwrap());
        assert!((value - (mse + emb)).abs() <= 1e-5 * value.abs().max(1.0));
    }

    #[test]
    fn embedding_multi_resolution_adds_scaled_embedding_term() {
        let cfg = small_config();
        let embedder = tiny_embedder(&cfg);
        let losses = Losses::with_embedder(
            LossKind::EmbeddingMultiResolution,
            44100,
            &cfg,
            Stage::Train,
            &Device::Cpu,
            Some(embedder.clone()),
        )
        .unwrap();

        let (pred, target) = signals(16384);
        let target_emb = Tensor::randn(0f32, 0.1, (2, 8), &Device::Cpu).unwrap();
        let value = scalar(losses.forward(&pred, &target, Some(&target_emb)).unwrap());

        let direct = EmbeddingLoss::new(embedder, 16384, &Device::Cpu).unwrap();
        let emb = scalar(direct.forward(&pred, &target_emb).unwrap());
        let params = &cfg.training.loss;
        let mr = MultiResolutionStftLoss::new(
            &params.resolutions(),
            params.phase_weight(),
            &Device::Cpu,
        )
        .unwrap();
        let mr = scalar(mr.forward(&pred, &target).unwrap());
        let expected = mr + 3000.0 * emb;
        assert!((value - expected).abs() <= 1e-4 * expected.abs().max(1.0));
    }

    #[test]
    fn random_resolution_has_no_phase_term_by_default() {
        let mut cfg = small_config();
        cfg.training.seed = Some(5);
        let (a, b) = signals(4096);
        let losses = Losses::with_embedder(
            LossKind::RandomResolutionStft,
            44100,
            &cfg,
            Stage::Train,
            &Device::Cpu,
            None,
        )
        .unwrap();
        let value = scalar(losses.forward(&a, &b, None).unwrap());

        let plain = RandomResolutionStftLoss::new(
            RandomResolution::default(),
            0.0,
            Some(5),
            &Device::Cpu,
        );
        let expected = scalar(plain.forward(&a, &b).unwrap());
        assert!((value - expected).abs() <= 1e-6 * expected.abs().max(1.0));
    }

    #[test]
    fn mel_stft_keeps_its_own_window_length() {
        let mut cfg = ExperimentConfig::default();
        cfg.training.loss.fft_size = Some(4096);
        cfg.training.loss.hop_size = Some(1024);
        cfg.training.loss.win_length = Some(4096);
        let (a, b) = signals(8192);
        let losses = Losses::new("MelSTFTLoss", 44100, &cfg, Stage::Train, &Device::Cpu).unwrap();
        let value = scalar(losses.forward(&a, &b, None).unwrap());

        let res = crate::config::StftResolution {
            fft_size: 4096,
            hop_size: 1024,
            win_length: 2048,
        };
        let mel = StftLoss::mel(res, 128, 44100, 0.2, &Device::Cpu).unwrap();
        let expected = scalar(mel.forward(&a, &b).unwrap());
        assert!((value - expected).abs() <= 1e-6 * expected.abs().max(1.0));
    }

    #[test]
    fn embedding_kinds_need_an_embedding() {
        let cfg = small_config();
        let (pred, target) = signals(16384);
        for kind in LossKind::ALL.into_iter().filter(|k| k.needs_embedding()) {
            let losses = Losses::with_embedder(
                kind,
                44100,
                &cfg,
                Stage::Train,
                &Device::Cpu,
                Some(tiny_embedder(&cfg)),
            )
            .unwrap();
            assert!(matches!(
                losses.forward(&pred, &target, None),
                Err(Error::MissingEmbedding(_))
            ));
        }
    }

    #[test]
    fn embedding_kind_without_checkpoint_is_a_config_error() {
        let cfg = small_config();
        let err = Losses::new("EMBLoss", 44100, &cfg, Stage::Train, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn target_conditioning_kinds() {
        assert!(LossKind::Embedding.conditions_on_target());
        assert!(LossKind::EmbeddingMultiResolution.conditions_on_target());
        assert!(!LossKind::EmbeddingMse.conditions_on_target());
        assert!(!LossKind::Mse.conditions_on_target());
    }
}
