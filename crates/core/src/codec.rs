//! RGBA ↔ float tensor conversion at the model boundary.
//!
//! Encoding produces a channel-first `(1, 3, h, w)` tensor normalized to
//! [0, 1]. Decoding auto-detects channel-first vs channel-last output,
//! denormalizes with saturation, and forces alpha opaque.

use ndarray::{Array4, ArrayD};

use crate::error::{Result, UpscaleError};
use crate::pixels::PixelBuffer;

/// Color channels carried through the model (alpha is dropped).
pub const CHANNELS: usize = 3;

/// Tensor axis ordering of a model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `(N, C, H, W)`
    ChannelFirst,
    /// `(N, H, W, C)`
    ChannelLast,
}

/// Encode an RGBA region as a `(1, 3, h, w)` float tensor.
///
/// Plane 0 holds all R values in row-major order, then G, then B, each
/// divided by 255. Alpha is dropped.
pub fn encode_tile(region: &PixelBuffer) -> Array4<f32> {
    let w = region.width() as usize;
    let h = region.height() as usize;
    let hw = w * h;
    let rgba = region.as_raw();

    let mut planes = vec![0.0_f32; CHANNELS * hw];
    for i in 0..hw {
        let src = i * 4;
        planes[i] = rgba[src] as f32 / 255.0;
        planes[hw + i] = rgba[src + 1] as f32 / 255.0;
        planes[2 * hw + i] = rgba[src + 2] as f32 / 255.0;
    }

    Array4::from_shape_vec((1, CHANNELS, h, w), planes)
        .expect("plane vector length matches (1, 3, h, w)")
}

/// Classify a model output shape.
///
/// Channel-first is checked before channel-last, so a tensor whose height
/// is also 3 (e.g. `(1, 3, 3, 3)`) always decodes as channel-first. The
/// tie is inherently ambiguous; this precedence is a known limitation,
/// not a guaranteed-correct heuristic.
pub fn detect_layout(dims: &[usize]) -> Result<(TensorLayout, usize, usize)> {
    if dims.len() != 4 {
        return Err(UpscaleError::UnexpectedTensorShape {
            dims: dims.to_vec(),
        });
    }

    if dims[1] == CHANNELS {
        Ok((TensorLayout::ChannelFirst, dims[2], dims[3]))
    } else if dims[3] == CHANNELS {
        Ok((TensorLayout::ChannelLast, dims[1], dims[2]))
    } else {
        Err(UpscaleError::UnsupportedLayout {
            dims: dims.to_vec(),
        })
    }
}

/// Decode a model output tensor to opaque RGBA pixels.
///
/// Values are multiplied by 255 and saturated to [0, 255]; the model may
/// overshoot the nominal [0, 1] range. Alpha of every pixel is 255.
pub fn decode_tensor(tensor: &ArrayD<f32>) -> Result<PixelBuffer> {
    let (layout, h, w) = detect_layout(tensor.shape())?;

    let owned_contig;
    let values = if let Some(slice) = tensor.as_slice() {
        slice
    } else {
        owned_contig = tensor.as_standard_layout().into_owned();
        owned_contig.as_slice().expect("standard layout is contiguous")
    };

    let hw = h * w;
    let mut rgba = vec![0_u8; hw * 4];

    match layout {
        TensorLayout::ChannelFirst => {
            for i in 0..hw {
                let dst = i * 4;
                rgba[dst] = saturate(values[i]);
                rgba[dst + 1] = saturate(values[hw + i]);
                rgba[dst + 2] = saturate(values[2 * hw + i]);
                rgba[dst + 3] = 255;
            }
        }
        TensorLayout::ChannelLast => {
            for i in 0..hw {
                let src = i * CHANNELS;
                let dst = i * 4;
                rgba[dst] = saturate(values[src]);
                rgba[dst + 1] = saturate(values[src + 1]);
                rgba[dst + 2] = saturate(values[src + 2]);
                rgba[dst + 3] = 255;
            }
        }
    }

    Ok(PixelBuffer::from_rgba(w as u32, h as u32, rgba))
}

fn saturate(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}
