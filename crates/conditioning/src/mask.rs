//! Image-space masks.
//!
//! Masks are `[height, width]` `f32` tensors. Construction helpers mirror the
//! host's solid-mask and mask-composite nodes: compositing adds the source
//! into the destination at an offset, clips to the destination bounds and
//! clamps the result to `[0, 1]`.

use candle_core::{DType, Device, Error, Result, Tensor};

/// A 2D mask in image coordinates.
#[derive(Debug, Clone)]
pub struct SpatialMask {
    data: Tensor,
}

impl SpatialMask {
    /// Wraps a `[height, width]` or `[1, height, width]` tensor, casting to `f32`.
    pub fn new(tensor: Tensor) -> Result<Self> {
        let tensor = match tensor.dims() {
            [_, _] => tensor,
            [1, _, _] => tensor.squeeze(0)?,
            dims => {
                return Err(Error::Msg(format!(
                    "mask expected [height, width] or [1, height, width], got {:?}",
                    dims
                )))
            }
        };
        Ok(Self {
            data: tensor.to_dtype(DType::F32)?,
        })
    }

    /// A mask filled with `value`.
    pub fn solid(value: f32, width: usize, height: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            data: Tensor::full(value, (height, width), device)?,
        })
    }

    /// `(height, width)` of the mask.
    pub fn dims(&self) -> (usize, usize) {
        let dims = self.data.dims();
        (dims[0], dims[1])
    }

    pub fn width(&self) -> usize {
        self.dims().1
    }

    pub fn height(&self) -> usize {
        self.dims().0
    }

    /// Underlying `[height, width]` tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    pub fn device(&self) -> &Device {
        self.data.device()
    }

    /// Adds `source` at `(x, y)`, clipping to bounds and clamping to `[0, 1]`.
    pub fn composite_add(&self, source: &SpatialMask, x: usize, y: usize) -> Result<Self> {
        let (height, width) = self.dims();
        let (src_h, src_w) = source.dims();
        let visible_w = src_w.min(width.saturating_sub(x));
        let visible_h = src_h.min(height.saturating_sub(y));
        if visible_w == 0 || visible_h == 0 {
            return Ok(self.clone());
        }

        let dest_region = self.data.narrow(0, y, visible_h)?.narrow(1, x, visible_w)?;
        let src_region = source.data.narrow(0, 0, visible_h)?.narrow(1, 0, visible_w)?;
        let summed = dest_region.add(&src_region)?.contiguous()?;
        let data = self
            .data
            .slice_assign(&[y..y + visible_h, x..x + visible_w], &summed)?
            .clamp(0f32, 1f32)?;
        Ok(Self { data })
    }

    /// Elementwise `self - other`; no clamping is applied.
    pub fn subtract(&self, other: &SpatialMask) -> Result<Self> {
        if self.dims() != other.dims() {
            return Err(Error::Msg(format!(
                "cannot subtract mask {:?} from mask {:?}",
                other.dims(),
                self.dims()
            )));
        }
        Ok(Self {
            data: self.data.sub(&other.data)?,
        })
    }

    /// Clamps every value into `[0, 1]`.
    pub fn clamp_unit(&self) -> Result<Self> {
        Ok(Self {
            data: self.data.clamp(0f32, 1f32)?,
        })
    }

    /// Row-major copy of the mask values.
    pub fn to_vec2(&self) -> Result<Vec<Vec<f32>>> {
        self.data.to_vec2::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_add_places_source_at_offset() -> Result<()> {
        let device = Device::Cpu;
        let base = SpatialMask::solid(0.0, 4, 3, &device)?;
        let patch = SpatialMask::solid(1.0, 2, 3, &device)?;
        let out = base.composite_add(&patch, 2, 0)?;
        assert_eq!(out.dims(), (3, 4));
        for row in out.to_vec2()? {
            assert_eq!(row, vec![0.0, 0.0, 1.0, 1.0]);
        }
        Ok(())
    }

    #[test]
    fn composite_add_clips_and_clamps() -> Result<()> {
        let device = Device::Cpu;
        let base = SpatialMask::solid(0.5, 3, 2, &device)?;
        let patch = SpatialMask::solid(1.0, 4, 4, &device)?;
        let out = base.composite_add(&patch, 1, 1)?;
        assert_eq!(out.to_vec2()?, vec![vec![0.5, 0.5, 0.5], vec![0.5, 1.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn empty_source_leaves_destination_untouched() -> Result<()> {
        let device = Device::Cpu;
        let base = SpatialMask::solid(0.0, 4, 4, &device)?;
        let empty = SpatialMask::solid(1.0, 0, 4, &device)?;
        let out = base.composite_add(&empty, 0, 0)?;
        assert!(out.to_vec2()?.iter().flatten().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn subtract_keeps_negative_values() -> Result<()> {
        let device = Device::Cpu;
        let a = SpatialMask::solid(0.25, 2, 2, &device)?;
        let b = SpatialMask::solid(1.0, 2, 2, &device)?;
        let diff = a.subtract(&b)?;
        assert!(diff.to_vec2()?.iter().flatten().all(|v| *v == -0.75));
        assert!(diff.clamp_unit()?.to_vec2()?.iter().flatten().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn new_accepts_batched_single_mask() -> Result<()> {
        let device = Device::Cpu;
        let mask = SpatialMask::new(Tensor::ones((1, 5, 7), DType::F64, &device)?)?;
        assert_eq!(mask.dims(), (5, 7));
        assert_eq!(mask.tensor().dtype(), DType::F32);
        assert!(SpatialMask::new(Tensor::ones((2, 5, 7), DType::F32, &device)?).is_err());
        Ok(())
    }
}
