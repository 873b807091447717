//! Small tensor operations shared by the forward paths.

use candle_core::{Tensor, D};

use crate::error::VqClipResult;

/// Divide each row by its Euclidean norm.
///
/// No epsilon is added, so an all-zero row yields NaN just as the
/// reference CLIP normalization does.
pub fn l2_normalize(x: &Tensor) -> VqClipResult<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    Ok(x.broadcast_div(&norm)?)
}

/// Read a 0-dim (or single-element) tensor as `f32`.
pub(crate) fn tensor_to_f32(t: &Tensor) -> VqClipResult<f32> {
    Ok(t.flatten_all()?
        .to_dtype(candle_core::DType::F32)?
        .get(0)?
        .to_scalar::<f32>()?)
}
