//! Pretrained 1d waveform autoencoder (autoencoder1d-AT-v1 layout).
//!
//! Stereo waveform `[B, 2, T]` → latent `[B, 32, T/32]` → `[B, 2, T]` with the
//! default configuration. The encoder ends in a tanh bottleneck so latents lie
//! in `(-1, 1)`.
//!
//! Tensor names follow the HuggingFace checkpoint, rooted at `autoencoder.`:
//! `encoder.to_in.block.block1.groupnorm.weight`,
//! `encoder.downsamples.{i}.downsample.weight`,
//! `decoder.upsamples.{i}.blocks.{j}.block2.project.bias`, ...
//!
//! The pretrained checkpoint has no bottleneck projection: the last encoder
//! stage feeds the tanh directly and the decoder starts from the latent.
//! `bottleneck_channels` adds `encoder.to_out` / `decoder.to_in` 1x1 convs.

use candle_core::{Module, Result, Tensor};
use candle_nn::{
    Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, GroupNorm, VarBuilder,
};

use crate::config::AutoEncoderConfig;

const GROUPNORM_EPS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// GroupNorm → SiLU → Conv1d
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConvBlock1d {
    groupnorm: GroupNorm,
    project: Conv1d,
}

impl ConvBlock1d {
    pub fn new(in_ch: usize, out_ch: usize, num_groups: usize, vb: VarBuilder) -> Result<Self> {
        let groupnorm =
            candle_nn::group_norm(num_groups, in_ch, GROUPNORM_EPS, vb.pp("groupnorm"))?;
        let cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let project = candle_nn::conv1d(in_ch, out_ch, 3, cfg, vb.pp("project"))?;
        Ok(Self { groupnorm, project })
    }
}

impl Module for ConvBlock1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.groupnorm)?.silu()?.apply(&self.project)
    }
}

// ---------------------------------------------------------------------------
// Residual block: two conv blocks + (1x1 projected) skip
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResnetBlock1d {
    block1: ConvBlock1d,
    block2: ConvBlock1d,
    to_out: Option<Conv1d>,
}

impl ResnetBlock1d {
    pub fn new(in_ch: usize, out_ch: usize, num_groups: usize, vb: VarBuilder) -> Result<Self> {
        let block1 = ConvBlock1d::new(in_ch, out_ch, num_groups, vb.pp("block1"))?;
        let block2 = ConvBlock1d::new(out_ch, out_ch, num_groups, vb.pp("block2"))?;
        let to_out = if in_ch != out_ch {
            Some(candle_nn::conv1d(in_ch, out_ch, 1, Default::default(), vb.pp("to_out"))?)
        } else {
            None
        };
        Ok(Self {
            block1,
            block2,
            to_out,
        })
    }
}

impl Module for ResnetBlock1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = xs.apply(&self.block1)?.apply(&self.block2)?;
        match &self.to_out {
            Some(to_out) => h + xs.apply(to_out)?,
            None => h + xs,
        }
    }
}

// ---------------------------------------------------------------------------
// Patching: fold `patch_size` consecutive samples into channels
// ---------------------------------------------------------------------------

/// `b c (l p) -> b (c p) l`
fn patch(xs: &Tensor, p: usize) -> Result<Tensor> {
    let (b, c, len) = xs.dims3()?;
    xs.reshape((b, c, len / p, p))?
        .permute((0, 1, 3, 2))?
        .reshape((b, c * p, len / p))
}

/// `b (c p) l -> b c (l p)`
fn unpatch(xs: &Tensor, p: usize) -> Result<Tensor> {
    let (b, cp, len) = xs.dims3()?;
    xs.reshape((b, cp / p, p, len))?
        .permute((0, 1, 3, 2))?
        .reshape((b, cp / p, len * p))
}

#[derive(Debug, Clone)]
pub struct Patcher {
    block: ResnetBlock1d,
    patch_size: usize,
}

impl Patcher {
    pub fn new(in_ch: usize, out_ch: usize, patch_size: usize, vb: VarBuilder) -> Result<Self> {
        let block = ResnetBlock1d::new(in_ch, out_ch / patch_size, 1, vb.pp("block"))?;
        Ok(Self { block, patch_size })
    }
}

impl Module for Patcher {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        patch(&xs.apply(&self.block)?, self.patch_size)
    }
}

#[derive(Debug, Clone)]
pub struct Unpatcher {
    block: ResnetBlock1d,
    patch_size: usize,
}

impl Unpatcher {
    pub fn new(in_ch: usize, out_ch: usize, patch_size: usize, vb: VarBuilder) -> Result<Self> {
        let block = ResnetBlock1d::new(in_ch / patch_size, out_ch, 1, vb.pp("block"))?;
        Ok(Self { block, patch_size })
    }
}

impl Module for Unpatcher {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        unpatch(xs, self.patch_size)?.apply(&self.block)
    }
}

// ---------------------------------------------------------------------------
// Resampling stages
// ---------------------------------------------------------------------------

/// Strided conv, kernel `2f + 1`.
fn downsample1d(in_ch: usize, out_ch: usize, factor: usize, vb: VarBuilder) -> Result<Conv1d> {
    let cfg = Conv1dConfig {
        padding: factor,
        stride: factor,
        ..Default::default()
    };
    candle_nn::conv1d(in_ch, out_ch, 2 * factor + 1, cfg, vb)
}

#[derive(Debug, Clone)]
pub enum Upsample1d {
    Conv(Conv1d),
    Transposed(ConvTranspose1d),
}

impl Upsample1d {
    pub fn new(in_ch: usize, out_ch: usize, factor: usize, vb: VarBuilder) -> Result<Self> {
        if factor == 1 {
            let cfg = Conv1dConfig {
                padding: 1,
                ..Default::default()
            };
            return Ok(Self::Conv(candle_nn::conv1d(in_ch, out_ch, 3, cfg, vb)?));
        }
        let cfg = ConvTranspose1dConfig {
            padding: factor / 2 + factor % 2,
            output_padding: factor % 2,
            stride: factor,
            ..Default::default()
        };
        Ok(Self::Transposed(candle_nn::conv_transpose1d(
            in_ch,
            out_ch,
            2 * factor,
            cfg,
            vb,
        )?))
    }
}

impl Module for Upsample1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Conv(conv) => xs.apply(conv),
            Self::Transposed(conv) => xs.apply(conv),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownsampleBlock1d {
    downsample: Conv1d,
    blocks: Vec<ResnetBlock1d>,
}

impl DownsampleBlock1d {
    pub fn new(
        in_ch: usize,
        out_ch: usize,
        factor: usize,
        num_groups: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let downsample = downsample1d(in_ch, out_ch, factor, vb.pp("downsample"))?;
        let blocks = (0..num_layers)
            .map(|j| ResnetBlock1d::new(out_ch, out_ch, num_groups, vb.pp(format!("blocks.{j}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { downsample, blocks })
    }
}

impl Module for DownsampleBlock1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.apply(&self.downsample)?;
        for block in &self.blocks {
            h = h.apply(block)?;
        }
        Ok(h)
    }
}

#[derive(Debug, Clone)]
pub struct UpsampleBlock1d {
    blocks: Vec<ResnetBlock1d>,
    upsample: Upsample1d,
}

impl UpsampleBlock1d {
    pub fn new(
        in_ch: usize,
        out_ch: usize,
        factor: usize,
        num_groups: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let blocks = (0..num_layers)
            .map(|j| ResnetBlock1d::new(in_ch, in_ch, num_groups, vb.pp(format!("blocks.{j}"))))
            .collect::<Result<Vec<_>>>()?;
        let upsample = Upsample1d::new(in_ch, out_ch, factor, vb.pp("upsample"))?;
        Ok(Self { blocks, upsample })
    }
}

impl Module for UpsampleBlock1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.clone();
        for block in &self.blocks {
            h = h.apply(block)?;
        }
        h.apply(&self.upsample)
    }
}

// ---------------------------------------------------------------------------
// Encoder / decoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Encoder1d {
    to_in: Patcher,
    downsamples: Vec<DownsampleBlock1d>,
    to_out: Option<Conv1d>,
}

impl Encoder1d {
    pub fn new(cfg: &AutoEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let ch = |i: usize| cfg.channels * cfg.multipliers[i];
        let to_in = Patcher::new(cfg.in_channels, ch(0), cfg.patch_size, vb.pp("to_in"))?;
        let downsamples = (0..cfg.factors.len())
            .map(|i| {
                DownsampleBlock1d::new(
                    ch(i),
                    ch(i + 1),
                    cfg.factors[i],
                    cfg.resnet_groups,
                    cfg.num_blocks[i],
                    vb.pp(format!("downsamples.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let last = ch(cfg.factors.len());
        let to_out = cfg
            .bottleneck_channels
            .map(|out| candle_nn::conv1d(last, out, 1, Default::default(), vb.pp("to_out")))
            .transpose()?;
        Ok(Self {
            to_in,
            downsamples,
            to_out,
        })
    }
}

impl Module for Encoder1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = xs.apply(&self.to_in)?;
        for down in &self.downsamples {
            h = h.apply(down)?;
        }
        if let Some(to_out) = &self.to_out {
            h = h.apply(to_out)?;
        }
        h.tanh()
    }
}

#[derive(Debug, Clone)]
pub struct Decoder1d {
    to_in: Option<Conv1d>,
    upsamples: Vec<UpsampleBlock1d>,
    to_out: Unpatcher,
}

impl Decoder1d {
    /// Mirrors the encoder: multipliers, factors and block counts reversed.
    pub fn new(cfg: &AutoEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let multipliers: Vec<usize> = cfg.multipliers.iter().rev().copied().collect();
        let factors: Vec<usize> = cfg.factors.iter().rev().copied().collect();
        let num_blocks: Vec<usize> = cfg.num_blocks.iter().rev().copied().collect();
        let ch = |i: usize| cfg.channels * multipliers[i];

        let to_in = cfg
            .bottleneck_channels
            .map(|bottleneck| {
                candle_nn::conv1d(bottleneck, ch(0), 1, Default::default(), vb.pp("to_in"))
            })
            .transpose()?;
        let upsamples = (0..factors.len())
            .map(|i| {
                UpsampleBlock1d::new(
                    ch(i),
                    ch(i + 1),
                    factors[i],
                    cfg.resnet_groups,
                    num_blocks[i],
                    vb.pp(format!("upsamples.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let to_out = Unpatcher::new(
            ch(factors.len()),
            cfg.in_channels,
            cfg.patch_size,
            vb.pp("to_out"),
        )?;
        Ok(Self {
            to_in,
            upsamples,
            to_out,
        })
    }
}

impl Module for Decoder1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = match &self.to_in {
            Some(to_in) => xs.apply(to_in)?,
            None => xs.clone(),
        };
        for up in &self.upsamples {
            h = h.apply(up)?;
        }
        h.apply(&self.to_out)
    }
}

/// Encoder + decoder pair.
#[derive(Debug, Clone)]
pub struct AutoEncoder1d {
    encoder: Encoder1d,
    decoder: Decoder1d,
}

impl AutoEncoder1d {
    /// `vb` is rooted at the checkpoint's `autoencoder` prefix.
    pub fn new(cfg: &AutoEncoderConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = Encoder1d::new(cfg, vb.pp("encoder"))?;
        let decoder = Decoder1d::new(cfg, vb.pp("decoder"))?;
        Ok(Self { encoder, decoder })
    }

    /// `[B, in_channels, T]` → `[B, latent_channels, T / downsampling_factor]`.
    pub fn encode(&self, xs: &Tensor) -> Result<Tensor> {
        self.encoder.forward(xs)
    }

    /// `[B, latent_channels, L]` → `[B, in_channels, L * downsampling_factor]`.
    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        self.decoder.forward(z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn small_config() -> AutoEncoderConfig {
        AutoEncoderConfig {
            num_blocks: vec![1; 6],
            ..Default::default()
        }
    }

    #[test]
    fn patch_unpatch_inverse() {
        let x = Tensor::arange(0f32, 48., &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 16))
            .unwrap();
        let p = patch(&x, 4).unwrap();
        assert_eq!(p.dims(), &[1, 12, 4]);
        // channel 0, phase 1 holds samples 1, 5, 9, 13
        let row: Vec<f32> = p.i((0, 1)).unwrap().to_vec1().unwrap();
        assert_eq!(row, vec![1., 5., 9., 13.]);
        let back = unpatch(&p, 4).unwrap();
        let diff: f32 = (back - &x).unwrap().abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn upsample_doubles_length() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let up = Upsample1d::new(4, 4, 2, vb.clone()).unwrap();
        let x = Tensor::zeros((1, 4, 10), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(up.forward(&x).unwrap().dims(), &[1, 4, 20]);
        let same = Upsample1d::new(4, 8, 1, vb).unwrap();
        assert_eq!(same.forward(&x).unwrap().dims(), &[1, 8, 10]);
    }

    #[test]
    fn encode_decode_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = small_config();
        let ae = AutoEncoder1d::new(&cfg, vb.pp("autoencoder")).unwrap();

        let x = Tensor::randn(0f32, 0.1, (2, 2, 1024), &Device::Cpu).unwrap();
        let z = ae.encode(&x).unwrap();
        assert_eq!(z.dims(), &[2, 32, 32]);
        let max: f32 = z.abs().unwrap().max_all().unwrap().to_scalar().unwrap();
        assert!(max < 1.0);

        let y = ae.decode(&z).unwrap();
        assert_eq!(y.dims(), &[2, 2, 1024]);
    }

    #[test]
    fn checkpoint_names_follow_the_pretrained_layout() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        AutoEncoder1d::new(&small_config(), vb.pp("autoencoder")).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "autoencoder.encoder.to_in.block.block1.groupnorm.weight",
            "autoencoder.encoder.to_in.block.to_out.weight",
            "autoencoder.encoder.downsamples.0.downsample.weight",
            "autoencoder.encoder.downsamples.5.blocks.0.block2.project.bias",
            "autoencoder.decoder.upsamples.5.upsample.weight",
            "autoencoder.decoder.to_out.block.block1.project.weight",
        ] {
            assert!(data.contains_key(name), "{name}");
        }
        assert!(!data.keys().any(|k| k.starts_with("autoencoder.encoder.to_out.")));
        assert!(!data.keys().any(|k| k.starts_with("autoencoder.decoder.to_in.")));
    }

    #[test]
    fn bottleneck_projection_sets_latent_width() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = AutoEncoderConfig {
            bottleneck_channels: Some(16),
            ..small_config()
        };
        let ae = AutoEncoder1d::new(&cfg, vb.pp("autoencoder")).unwrap();
        {
            let data = varmap.data().lock().unwrap();
            assert!(data.contains_key("autoencoder.encoder.to_out.weight"));
            assert!(data.contains_key("autoencoder.decoder.to_in.weight"));
        }

        let x = Tensor::randn(0f32, 0.1, (1, 2, 1024), &Device::Cpu).unwrap();
        let z = ae.encode(&x).unwrap();
        assert_eq!(z.dims(), &[1, 16, 32]);
        assert_eq!(ae.decode(&z).unwrap().dims(), &[1, 2, 1024]);
    }
}
