//! Speaker-embedding fusion into the latent bottleneck.
//!
//! Each latent channel is cut into consecutive slices of `latent_slice_size`
//! frames. Every slice is concatenated with the speaker embedding and the
//! resulting sequence runs through that channel's bidirectional LSTM. A linear
//! projection plus tanh maps each step back to one slice. Channels never share
//! parameters.

use candle_core::{D, Result, Tensor};
use candle_nn::rnn::Direction;
use candle_nn::{LSTM, LSTMConfig, Linear, Module, RNN, VarBuilder};

#[derive(Debug, Clone)]
struct BiLstmLayer {
    fwd: LSTM,
    bwd: LSTM,
}

impl BiLstmLayer {
    fn new(in_dim: usize, hidden: usize, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = |direction| LSTMConfig {
            layer_idx,
            direction,
            ..Default::default()
        };
        Ok(Self {
            fwd: candle_nn::lstm(in_dim, hidden, cfg(Direction::Forward), vb.clone())?,
            bwd: candle_nn::lstm(in_dim, hidden, cfg(Direction::Backward), vb)?,
        })
    }

    /// `[B, S, in]` → `[B, S, 2 * hidden]`, forward outputs first.
    fn forward(&self, xs: &Tensor, reversed_idx: &Tensor) -> Result<Tensor> {
        let fwd = self.fwd.states_to_tensor(&self.fwd.seq(xs)?)?;
        let rev = xs.index_select(reversed_idx, 1)?;
        let bwd = self
            .bwd
            .states_to_tensor(&self.bwd.seq(&rev)?)?
            .index_select(reversed_idx, 1)?;
        Tensor::cat(&[&fwd, &bwd], D::Minus1)
    }
}

#[derive(Debug, Clone)]
struct ChannelFusion {
    layers: Vec<BiLstmLayer>,
    projection: Linear,
}

/// Per-channel bidirectional LSTM fusion.
///
/// Parameter names: `lstms.{c}.weight_ih_l{k}[_reverse]` and
/// `projections.{c}.{weight,bias}`.
#[derive(Debug, Clone)]
pub struct LatentFusion {
    channels: Vec<ChannelFusion>,
    slice: usize,
    emb_size: usize,
}

impl LatentFusion {
    pub fn new(
        num_channels: usize,
        emb_size: usize,
        slice: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let channels = (0..num_channels)
            .map(|c| {
                let lstm_vb = vb.pp(format!("lstms.{c}"));
                let layers = (0..num_layers)
                    .map(|k| {
                        let in_dim = if k == 0 { emb_size + slice } else { 2 * slice };
                        BiLstmLayer::new(in_dim, slice, k, lstm_vb.clone())
                    })
                    .collect::<Result<Vec<_>>>()?;
                let projection =
                    candle_nn::linear(2 * slice, slice, vb.pp(format!("projections.{c}")))?;
                Ok(ChannelFusion { layers, projection })
            })
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(num_channels, emb_size, slice, num_layers, "latent fusion");
        Ok(Self {
            channels,
            slice,
            emb_size,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Fuse `latent [B, C, L]` with `embedding [B, E]` into `[B, C, L]`.
    ///
    /// Every sequence starts from a zero LSTM state.
    pub fn fuse(&self, latent: &Tensor, embedding: &Tensor) -> Result<Tensor> {
        let (b, c, len) = latent.dims3()?;
        if c != self.channels.len() {
            candle_core::bail!("latent has {c} channels, fusion expects {}", self.channels.len());
        }
        if len % self.slice != 0 {
            candle_core::bail!(
                "latent length {len} is not a multiple of the slice size {}",
                self.slice
            );
        }
        let (eb, e) = embedding.dims2()?;
        if eb != b || e != self.emb_size {
            candle_core::bail!(
                "embedding shape [{eb}, {e}] does not match batch {b} and size {}",
                self.emb_size
            );
        }

        let steps = len / self.slice;
        let reversed: Vec<u32> = (0..steps as u32).rev().collect();
        let reversed = Tensor::from_vec(reversed, steps, latent.device())?;
        let emb_seq = embedding
            .unsqueeze(1)?
            .broadcast_as((b, steps, e))?
            .contiguous()?;

        let mut fused = Vec::with_capacity(c);
        for (i, channel) in self.channels.iter().enumerate() {
            let slices = latent.narrow(1, i, 1)?.reshape((b, steps, self.slice))?;
            let mut h = Tensor::cat(&[&slices, &emb_seq], D::Minus1)?;
            for layer in &channel.layers {
                h = layer.forward(&h, &reversed)?;
            }
            let projected = channel.projection.forward(&h)?.tanh()?;
            fused.push(projected.reshape((b, len))?);
        }
        Tensor::stack(&fused, 1)
    }
}
