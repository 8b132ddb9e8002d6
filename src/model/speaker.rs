//! Speaker-conditioned autoencoder.
//!
//! ```text
//! x ─ sum to mono ─ repeat to stereo ─ encode (no grad) ─ dropout ─┬─ fuse(z, dvec) ─ (+) ─ decode ─ sum to mono
//!                                                                  └──────────────────┘
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, ModuleT, Tensor, Var};
use candle_nn::{Dropout, VarBuilder, VarMap};

use super::autoencoder::AutoEncoder1d;
use super::fusion::LatentFusion;
use crate::config::ModelConfig;
use crate::error::{Error, Result};

const ENCODER_PREFIX: &str = "autoencoder.encoder.";
const DECODER_PREFIX: &str = "autoencoder.decoder.";

/// Parameter stores of the model: pretrained autoencoder and new fusion module.
pub struct SpeakerParameters {
    pub autoencoder: VarMap,
    pub fusion: VarMap,
}

impl Default for SpeakerParameters {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeakerParameters {
    pub fn new() -> Self {
        Self {
            autoencoder: VarMap::new(),
            fusion: VarMap::new(),
        }
    }

    /// Variables handed to the optimizer: the fusion module always, encoder and
    /// decoder unless frozen. Sorted by name.
    pub fn trainable(&self, freeze_encoder: bool, freeze_decoder: bool) -> Vec<Var> {
        let mut named: Vec<(String, Var)> = Vec::new();
        {
            let data = lock(&self.autoencoder);
            named.extend(
                data.iter()
                    .filter(|(name, _)| {
                        !(freeze_encoder && name.starts_with(ENCODER_PREFIX)
                            || freeze_decoder && name.starts_with(DECODER_PREFIX))
                    })
                    .map(|(name, var)| (name.clone(), var.clone())),
            );
        }
        named.extend(
            lock(&self.fusion)
                .iter()
                .map(|(name, var)| (format!("fusion.{name}"), var.clone())),
        );
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named.into_iter().map(|(_, var)| var).collect()
    }

    /// Overwrite the autoencoder variables from a pretrained checkpoint.
    ///
    /// `path` is a `.safetensors` file, a PyTorch pickle, or a directory holding
    /// `model.safetensors` or `pytorch_model.bin`.
    pub fn load_autoencoder(&self, path: &Path) -> Result<()> {
        let file = resolve_checkpoint(path)?;
        tracing::info!("Loading autoencoder weights from {:?}", file);
        let is_safetensors = file
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));
        let tensors: HashMap<String, Tensor> = if is_safetensors {
            candle_core::safetensors::load(&file, &Device::Cpu)
        } else {
            candle_core::pickle::read_all(&file).map(|all| all.into_iter().collect())
        }
        .map_err(|e| Error::Checkpoint(format!("{}: {e}", file.display())))?;

        let data = lock(&self.autoencoder);
        for (name, var) in data.iter() {
            let tensor = tensors.get(name).ok_or_else(|| {
                Error::Checkpoint(format!("{} has no tensor {name}", file.display()))
            })?;
            if tensor.dims() != var.dims() {
                return Err(Error::Checkpoint(format!(
                    "{name}: checkpoint shape {:?}, model shape {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
        }
        tracing::debug!(tensors = data.len(), "autoencoder weights loaded");
        Ok(())
    }
}

fn lock(varmap: &VarMap) -> std::sync::MutexGuard<'_, HashMap<String, Var>> {
    match varmap.data().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn resolve_checkpoint(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        for name in ["model.safetensors", "pytorch_model.bin"] {
            let candidate = path.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(Error::Checkpoint(format!(
        "no autoencoder checkpoint at {}",
        path.display()
    )))
}

/// Autoencoder whose bottleneck is conditioned on a speaker embedding.
#[derive(Debug, Clone)]
pub struct SpeakerAutoencoder {
    autoencoder: AutoEncoder1d,
    fusion: LatentFusion,
    dropout: Dropout,
    cfg: ModelConfig,
}

impl SpeakerAutoencoder {
    /// Build on freshly initialised parameters.
    pub fn new(cfg: &ModelConfig, params: &SpeakerParameters, device: &Device) -> Result<Self> {
        let ae_vb = VarBuilder::from_varmap(&params.autoencoder, DType::F32, device);
        let autoencoder = AutoEncoder1d::new(&cfg.autoencoder, ae_vb.pp("autoencoder"))?;

        let fusion_vb = VarBuilder::from_varmap(&params.fusion, DType::F32, device);
        let fusion = LatentFusion::new(
            cfg.autoencoder.latent_channels(),
            cfg.emb_size,
            cfg.latent_slice_size,
            cfg.lstm_layers,
            fusion_vb,
        )?;

        Ok(Self {
            autoencoder,
            fusion,
            dropout: Dropout::new(cfg.bottleneck_dropout),
            cfg: cfg.clone(),
        })
    }

    /// Build and load the pretrained autoencoder from `cfg.ae_path`.
    pub fn load(cfg: &ModelConfig, device: &Device) -> Result<(Self, SpeakerParameters)> {
        let path = cfg
            .ae_path
            .as_deref()
            .ok_or_else(|| Error::Config("model.ae_path is not set".into()))?;
        let params = SpeakerParameters::new();
        let model = Self::new(cfg, &params, device)?;
        params.load_autoencoder(path)?;
        tracing::info!(
            freeze_encoder = cfg.freeze_encoder,
            freeze_decoder = cfg.freeze_decoder,
            "speaker autoencoder ready"
        );
        Ok((model, params))
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    fn check_length(&self, len: usize) -> Result<()> {
        let factor = self.cfg.autoencoder.downsampling_factor();
        if len == 0 || len % factor != 0 {
            return Err(Error::Shape(format!(
                "input length {len} is not a multiple of the downsampling factor {factor}"
            )));
        }
        if (len / factor) % self.cfg.latent_slice_size != 0 {
            return Err(Error::Shape(format!(
                "latent length {} is not a multiple of latent_slice_size {}",
                len / factor,
                self.cfg.latent_slice_size
            )));
        }
        Ok(())
    }

    /// `x [B, C, T]` with `dvec [B, emb_size]` → mono prediction `[B, 1, T]`.
    ///
    /// `train` enables bottleneck dropout.
    pub fn forward_t(&self, x: &Tensor, dvec: &Tensor, train: bool) -> Result<Tensor> {
        let (_, _, len) = x.dims3()?;
        self.check_length(len)?;

        let stereo = x
            .sum_keepdim(1)?
            .repeat((1, self.cfg.autoencoder.in_channels, 1))?;
        let z = self.autoencoder.encode(&stereo)?.detach();
        let z = self.dropout.forward_t(&z, train)?;

        let fused = (self.fusion.fuse(&z, dvec)? + &z)?;
        let y = self.autoencoder.decode(&fused)?;
        Ok(y.sum_keepdim(1)?)
    }

    /// Inference over `x [B, C, T]` in consecutive `block_size` segments.
    ///
    /// Trailing samples that do not fill a whole segment are dropped.
    pub fn predict_segmented(
        &self,
        x: &Tensor,
        dvec: &Tensor,
        block_size: usize,
    ) -> Result<Tensor> {
        let (_, _, len) = x.dims3()?;
        let segments = if block_size == 0 { 0 } else { len / block_size };
        if segments == 0 {
            return Err(Error::Shape(format!(
                "input of {len} samples is shorter than one block of {block_size}"
            )));
        }
        let outputs = (0..segments)
            .map(|s| self.forward_t(&x.narrow(2, s * block_size, block_size)?, dvec, false))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&outputs, 2)?)
    }
}
