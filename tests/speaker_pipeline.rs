//! End-to-end: speaker autoencoder forward, loss, and gradient flow into the
//! fusion module at the default block size.

use candle_core::{Device, Tensor};
use speaker_vc::{
    Error,
    config::{AutoEncoderConfig, ExperimentConfig, Stage},
    losses::{LossKind, Losses},
    model::{SpeakerAutoencoder, SpeakerParameters},
};

fn config() -> ExperimentConfig {
    let mut cfg = ExperimentConfig::default();
    // Full-width layout with one resnet block per stage.
    cfg.model.autoencoder = AutoEncoderConfig {
        num_blocks: vec![1; 6],
        ..Default::default()
    };
    cfg
}

#[test]
fn block_round_trip_produces_mono_prediction_and_fusion_gradients() {
    let cfg = config();
    let dev = Device::Cpu;
    assert_eq!(cfg.dataset.block_size, 16384);
    assert_eq!(cfg.model.autoencoder.latent_channels(), 32);
    assert_eq!(cfg.dataset.block_size / cfg.model.autoencoder.downsampling_factor(), 512);

    let params = SpeakerParameters::new();
    let model = SpeakerAutoencoder::new(&cfg.model, &params, &dev).unwrap();

    let x = Tensor::randn(0f32, 0.1, (2, 1, 16384), &dev).unwrap();
    let target = Tensor::randn(0f32, 0.1, (2, 1, 16384), &dev).unwrap();
    let dvec = Tensor::randn(0f32, 1.0, (2, 256), &dev).unwrap();

    let y = model.forward_t(&x, &dvec, true).unwrap();
    assert_eq!(y.dims(), &[2, 1, 16384]);

    let losses = Losses::from_config(&cfg, Stage::Train, &dev).unwrap();
    assert_eq!(losses.kind(), LossKind::Mse);
    let loss = losses.forward(&y, &target, None).unwrap();
    assert_eq!(loss.rank(), 0);
    assert!(loss.to_scalar::<f32>().unwrap().is_finite());

    let grads = loss.backward().unwrap();
    let fusion_vars = params.fusion.all_vars();
    assert!(!fusion_vars.is_empty());
    assert!(
        fusion_vars.iter().any(|v| grads.get(v.as_tensor()).is_some()),
        "no gradient reached the fusion module"
    );
}

#[test]
fn unknown_loss_identifier_is_rejected() {
    let cfg = config();
    let err = Losses::new("bogus", 44100, &cfg, Stage::Train, &Device::Cpu).unwrap_err();
    assert!(matches!(err, Error::UnknownLossKind(_)));
}

#[test]
fn off_grid_block_is_rejected_before_encoding() {
    let cfg = config();
    let dev = Device::Cpu;
    let model = SpeakerAutoencoder::new(&cfg.model, &SpeakerParameters::new(), &dev).unwrap();
    let x = Tensor::zeros((1, 1, 16384 + 32 * 3), candle_core::DType::F32, &dev).unwrap();
    let dvec = Tensor::zeros((1, 256), candle_core::DType::F32, &dev).unwrap();
    assert!(matches!(model.forward_t(&x, &dvec, false), Err(Error::Shape(_))));
}
