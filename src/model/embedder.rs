//! Frozen d-vector speaker-embedding extractor.
//!
//! A 3-layer LSTM over 40-band log-mel windows with a linear projection. The
//! utterance is cut into windows of `window` frames every `stride` frames, each
//! window is embedded and L2-normalised, and the window embeddings are averaged.
//!
//! Checkpoint layout (PyTorch `state_dict` names):
//!
//! ```text
//! lstm.weight_ih_l{k}  lstm.weight_hh_l{k}  lstm.bias_ih_l{k}  lstm.bias_hh_l{k}
//! proj.linear_layer.weight  proj.linear_layer.bias
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{LSTM, LSTMConfig, Linear, RNN, VarBuilder};

use crate::audio::mel::{Window, mel_filterbank};
use crate::audio::stft::Stft;
use crate::config::SpeechEmbedderConfig;
use crate::device::SpectralPlacement;
use crate::error::Error;

/// Offset inside the log of the mel features.
const LOG_OFFSET: f64 = 1e-6;

/// Norm floor of the per-window normalisation.
const NORM_FLOOR: f64 = 1e-12;

type CacheKey = (PathBuf, SpeechEmbedderConfig, String);

pub struct SpeechEmbedder {
    lstm: Vec<LSTM>,
    proj: Linear,
    stft: Stft,
    mel_basis: Tensor, // [n_fft/2 + 1, num_mels], on the compute device
    placement: SpectralPlacement,
    cfg: SpeechEmbedderConfig,
}

impl std::fmt::Debug for SpeechEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechEmbedder")
            .field("layers", &self.lstm.len())
            .field("cfg", &self.cfg)
            .finish()
    }
}

impl SpeechEmbedder {
    pub fn new(cfg: SpeechEmbedderConfig, vb: VarBuilder) -> Result<Self> {
        let lstm_vb = vb.pp("lstm");
        let lstm = (0..cfg.lstm_layers)
            .map(|layer_idx| {
                let in_dim = if layer_idx == 0 {
                    cfg.num_mels
                } else {
                    cfg.lstm_hidden
                };
                let lstm_cfg = LSTMConfig {
                    layer_idx,
                    ..Default::default()
                };
                candle_nn::lstm(in_dim, cfg.lstm_hidden, lstm_cfg, lstm_vb.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        let proj =
            candle_nn::linear(cfg.lstm_hidden, cfg.emb_dim, vb.pp("proj").pp("linear_layer"))?;

        let placement = SpectralPlacement::new(vb.device());
        let stft = Stft::new(
            cfg.n_fft,
            cfg.hop_length,
            cfg.win_length,
            Window::Hann,
            placement.compute(),
        )?;
        let mel_basis = mel_filterbank(
            cfg.n_fft,
            cfg.num_mels,
            cfg.sample_rate,
            0.0,
            cfg.sample_rate as f64 / 2.0,
            placement.compute(),
        )?;

        Ok(Self {
            lstm,
            proj,
            stft,
            mel_basis,
            placement,
            cfg,
        })
    }

    /// Load a checkpoint: `.safetensors`, otherwise a PyTorch pickle.
    pub fn load(path: &Path, cfg: SpeechEmbedderConfig, device: &Device) -> crate::Result<Self> {
        tracing::info!("Loading speaker embedder from {:?}", path);
        let is_safetensors = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));
        let vb = if is_safetensors {
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
        } else {
            VarBuilder::from_pth(path, DType::F32, device)
        }
        .map_err(|e| Error::Checkpoint(format!("embedder weights {}: {e}", path.display())))?;

        Self::new(cfg, vb)
            .map_err(|e| Error::Checkpoint(format!("embedder init {}: {e}", path.display())))
    }

    /// Load through the process-wide cache keyed by `(path, config, device)`.
    ///
    /// The conditioning side and the embedding loss end up holding the same
    /// read-only instance.
    pub fn load_shared(
        path: &Path,
        cfg: SpeechEmbedderConfig,
        device: &Device,
    ) -> crate::Result<Arc<Self>> {
        static SHARED: OnceLock<Mutex<HashMap<CacheKey, Arc<SpeechEmbedder>>>> = OnceLock::new();

        let key = (
            path.to_path_buf(),
            cfg.clone(),
            format!("{:?}", device.location()),
        );
        let cache = SHARED.get_or_init(Default::default);
        let mut cache = match cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(embedder) = cache.get(&key) {
            tracing::debug!("speaker embedder cache hit for {:?}", path);
            return Ok(embedder.clone());
        }
        let embedder = Arc::new(Self::load(path, cfg, device)?);
        cache.insert(key, embedder.clone());
        Ok(embedder)
    }

    pub fn sample_rate(&self) -> u32 {
        self.cfg.sample_rate
    }

    pub fn config(&self) -> &SpeechEmbedderConfig {
        &self.cfg
    }

    /// `log10(mel(|STFT|²) + 1e-6)` of `[batch, samples]` audio, as
    /// `[batch, frames, num_mels]` on the input's device.
    pub fn mel(&self, wav: &Tensor) -> Result<Tensor> {
        let origin = wav.device().clone();
        let wav = self.placement.to_compute(wav)?;
        let power = self.stft.forward(&wav)?.power()?;
        let mel = power.broadcast_matmul(&self.mel_basis)?;
        let log_mel = ((mel + LOG_OFFSET)?.log()? * (1.0 / std::f64::consts::LN_10))?;
        self.placement.restore(&log_mel, &origin)
    }

    /// Embed `[batch, frames, num_mels]` features into `[batch, emb_dim]`.
    pub fn batched_forward(&self, mel: &Tensor) -> Result<Tensor> {
        let (b, frames, n_mels) = mel.dims3()?;
        let window = self.cfg.window;
        let stride = self.cfg.stride.max(1);
        if frames < window {
            candle_core::bail!("speaker embedder needs at least {window} mel frames, got {frames}");
        }
        let num_windows = (frames - window) / stride + 1;

        let idx: Vec<u32> = (0..num_windows)
            .flat_map(|w| (w * stride..w * stride + window).map(|f| f as u32))
            .collect();
        let idx = Tensor::from_vec(idx, num_windows * window, mel.device())?;
        let mut xs = mel
            .index_select(&idx, 1)?
            .reshape((b * num_windows, window, n_mels))?;

        for layer in &self.lstm {
            let states = layer.seq(&xs)?;
            xs = layer.states_to_tensor(&states)?;
        }
        let last = xs.narrow(1, window - 1, 1)?.squeeze(1)?;
        let emb = self.proj.forward(&last)?;
        let norm = emb
            .sqr()?
            .sum_keepdim(1)?
            .sqrt()?
            .clamp(NORM_FLOOR, f64::MAX)?;
        emb.broadcast_div(&norm)?
            .reshape((b, num_windows, self.cfg.emb_dim))?
            .mean(1)
    }

    /// Embed `[batch, samples]` audio at [`Self::sample_rate`].
    pub fn embed(&self, wav: &Tensor) -> Result<Tensor> {
        self.batched_forward(&self.mel(wav)?)
    }
}
