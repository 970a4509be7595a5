//! Region-conditioned attention for diffusion denoisers.
//!
//! This crate bundles the workspace: [`attention`] kernels and mask math,
//! [`conditioning`] payloads, the patchable [`model`] and the [`couple`]
//! region pipeline. Most callers only need the re-exports below.

pub use attention;
pub use conditioning;
pub use couple;
pub use model;

pub use conditioning::{Conditioning, SpatialMask};
pub use couple::{
    build_from_region_list, build_from_split, install, node_definitions, ComfyCouple, ComfyCoupleMask,
    ComfyCoupleRegion, CoupleError, CoupleSettings, LeftoverMaskPolicy, Orientation, PatchMode, Region,
    SplitParams,
};
pub use model::{Model, ModelConfig, ModelPatcher};

use candle_core::{Device, Result};

/// Picks the accelerator masks and models should live on.
///
/// `CANDLE_FORCE_CPU` pins the CPU backend. Otherwise Metal (when built with
/// the `metal` feature and a preflight attention call succeeds), then CUDA,
/// then CPU are tried in order.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    {
        use std::panic::AssertUnwindSafe;

        let metal_device = std::panic::catch_unwind(AssertUnwindSafe(|| Device::new_metal(0)));
        match metal_device {
            Ok(Ok(device)) => match metal_preflight(&device) {
                Ok(()) => {
                    log::info!("Metal device selected: {:?}", device);
                    return Ok(device);
                }
                Err(err) => log::warn!("Metal preflight failed ({err}), falling back"),
            },
            _ => log::debug!("Metal unavailable, falling back"),
        }
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected: {:?}", device);
            Ok(device)
        }
        Ok(_) | Err(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Runs the operations the coupling path relies on: a packed attention call
/// and an area mask resize.
#[cfg(feature = "metal")]
fn metal_preflight(device: &Device) -> Result<()> {
    use attention::interop::attend_packed;
    use attention::masks::{resize_mask, MaskResample};
    use attention::reference::ExactAttention;
    use candle_core::Tensor;

    let x = Tensor::randn(0f32, 1.0, (1, 16, 8), device)?;
    attend_packed(&ExactAttention::new(), &x, &x, &x, 2, &attention::Config::default())
        .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    let mask = Tensor::ones((32, 32), candle_core::DType::F32, device)?;
    resize_mask(&mask, 4, 4, MaskResample::Area).map_err(|e| candle_core::Error::Msg(e.to_string()))?;
    Ok(())
}
