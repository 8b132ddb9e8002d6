//! Device selection and backend capability profile.
//!
//! Spectral losses and the embedder's mel front-end operate on complex STFT
//! frames. Backends without complex-FFT support get those steps executed on the
//! CPU for the duration of a call, after which results move back.

use candle_core::{Device, Tensor};

/// Return the preferred device: CUDA if available, then Metal, otherwise CPU.
pub fn preferred_device(ordinal: usize) -> Device {
    if let Ok(device) = Device::cuda_if_available(ordinal) {
        if device.is_cuda() {
            return device;
        }
    }
    Device::metal_if_available(ordinal).unwrap_or(Device::Cpu)
}

/// What a compute backend can do, resolved once per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Whether complex-valued STFT work may run on the backend itself.
    pub complex_fft: bool,
}

impl BackendCapabilities {
    pub fn probe(device: &Device) -> Self {
        Self {
            complex_fft: !device.is_metal(),
        }
    }
}

/// Placement of spectral work for one backend.
///
/// Holds the device spectral tensors (DFT bases, filterbanks) live on. Operands
/// arriving from elsewhere are moved there for the call.
#[derive(Debug, Clone)]
pub struct SpectralPlacement {
    home: Device,
    compute: Device,
}

impl SpectralPlacement {
    pub fn new(device: &Device) -> Self {
        let caps = BackendCapabilities::probe(device);
        let compute = if caps.complex_fft {
            device.clone()
        } else {
            tracing::info!(
                ?device,
                "backend lacks complex FFT support, spectral work falls back to CPU"
            );
            Device::Cpu
        };
        Self {
            home: device.clone(),
            compute,
        }
    }

    /// Device the model runs on.
    pub fn home(&self) -> &Device {
        &self.home
    }

    /// Device spectral tensors are built on.
    pub fn compute(&self) -> &Device {
        &self.compute
    }

    pub fn is_fallback(&self) -> bool {
        !self.home.same_device(&self.compute)
    }

    /// Move an operand onto the compute device if it is not already there.
    pub fn to_compute(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        if xs.device().same_device(&self.compute) {
            Ok(xs.clone())
        } else {
            xs.to_device(&self.compute)
        }
    }

    /// Move a result back to the device the operand came from.
    pub fn restore(&self, xs: &Tensor, origin: &Device) -> candle_core::Result<Tensor> {
        if xs.device().same_device(origin) {
            Ok(xs.clone())
        } else {
            xs.to_device(origin)
        }
    }
}
