//! End-to-end forward behaviour of the composed model.
//!
//! | Property | Test |
//! |----------|------|
//! | Matched pairs, both adapters, loss | `test_paired_batch_both_adapters_end_to_end` |
//! | Symmetric logits | `test_logits_are_transposes` |
//! | Normalization | `test_unquantized_embeddings_are_unit_norm` |
//! | Flat parity | `test_flat_output_matches_structured` |
//! | Loss absence | `test_loss_absent_without_request` |

mod common;

use candle_core::{Device, Tensor, D};
use vq_clip::{FlatItem, ForwardOptions, TextInputs, VqClipError, VqClipModel};

use common::*;

// =============================================================================
// END-TO-END
// =============================================================================

#[test]
fn test_vision_only_model_end_to_end() {
    let model = VqClipModel::new(composite(true, false), &Device::Cpu).unwrap();
    let (ids, mask) = token_batch();
    let pixels = pixel_batch(2);

    let result = model
        .forward(
            &TextInputs::new(&ids).with_attention_mask(&mask),
            &pixels,
            &ForwardOptions::new().with_loss().with_perplexity(),
        )
        .unwrap()
        .into_structured()
        .unwrap();

    assert_eq!(result.logits_per_text.dims(), &[2, 2]);
    assert_eq!(result.logits_per_image.dims(), &[2, 2]);
    assert_eq!(result.text_embeds.dims(), &[2, PROJECTION_DIM]);
    assert_eq!(result.image_embeds.dims(), &[2, PROJECTION_DIM]);

    let codes: Vec<u32> = result
        .image_codes
        .as_ref()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(codes.len(), 2);
    assert!(codes.iter().all(|&c| c < 8));
    assert!(result.text_codes.is_none());

    let components = result.loss_components().unwrap();
    let contrastive = components.contrastive.unwrap();
    let total = components.total.unwrap();
    assert!((total - (contrastive + components.quantization)).abs() < 1e-5);
    let perplexity = components.perplexity.unwrap();
    assert!((1.0 - 1e-4..=2.0 + 1e-4).contains(&perplexity));
}

#[test]
fn test_paired_batch_both_adapters_end_to_end() {
    let model = VqClipModel::new(composite(true, true), &Device::Cpu).unwrap();
    assert!(model.vision_adapter().is_active());
    assert!(model.text_adapter().is_active());

    let ids = Tensor::new(
        &[[1u32, 5, 39, 0], [2, 8, 9, 39], [3, 39, 0, 0]],
        &Device::Cpu,
    )
    .unwrap();
    let mask = Tensor::new(
        &[[1u32, 1, 1, 0], [1, 1, 1, 1], [1, 1, 0, 0]],
        &Device::Cpu,
    )
    .unwrap();
    let pixels = pixel_batch(3);

    let result = model
        .forward(
            &TextInputs::new(&ids).with_attention_mask(&mask),
            &pixels,
            &ForwardOptions::new().with_loss().with_perplexity(),
        )
        .unwrap()
        .into_structured()
        .unwrap();

    assert_eq!(result.logits_per_text.dims(), &[3, 3]);
    assert_eq!(result.logits_per_image.dims(), &[3, 3]);
    assert_close(
        &result.logits_per_image,
        &result.logits_per_text.t().unwrap().contiguous().unwrap(),
        0.0,
    );

    let text_codes: Vec<u32> = to_codes(result.text_codes.as_ref().unwrap());
    let image_codes: Vec<u32> = to_codes(result.image_codes.as_ref().unwrap());
    assert_eq!(result.text_codes.as_ref().unwrap().dims(), &[3, 1]);
    assert_eq!(result.image_codes.as_ref().unwrap().dims(), &[3, 1]);
    assert!(text_codes.iter().all(|&c| c < 4));
    assert!(image_codes.iter().all(|&c| c < 8));

    let components = result.loss_components().unwrap();
    let contrastive = components.contrastive.unwrap();
    let total = components.total.unwrap();
    assert!(contrastive.is_finite());
    assert!(total.is_finite());
    assert!(components.quantization >= 0.0);
    assert!(components.quantization.is_finite());
    assert!((total - (contrastive + components.quantization)).abs() < 1e-5);

    // Each adapter sees 3 assignments, so each perplexity is in [1, 3].
    let perplexity = components.perplexity.unwrap();
    assert!((1.0 - 1e-4..=3.0 + 1e-4).contains(&perplexity));
}

fn to_codes(codes: &Tensor) -> Vec<u32> {
    codes.flatten_all().unwrap().to_vec1().unwrap()
}

#[test]
fn test_logits_are_transposes() {
    let model = VqClipModel::new(composite(true, true), &Device::Cpu).unwrap();
    let (ids, _) = token_batch();
    let pixels = pixel_batch(3);

    let result = model
        .forward(&TextInputs::new(&ids), &pixels, &ForwardOptions::new())
        .unwrap()
        .into_structured()
        .unwrap();

    assert_eq!(result.logits_per_text.dims(), &[2, 3]);
    assert_eq!(result.logits_per_image.dims(), &[3, 2]);
    assert_close(
        &result.logits_per_image,
        &result.logits_per_text.t().unwrap().contiguous().unwrap(),
        0.0,
    );
}

#[test]
fn test_logits_are_scaled_similarities() {
    let model = VqClipModel::new(composite(false, false), &Device::Cpu).unwrap();
    let (ids, _) = token_batch();
    let pixels = pixel_batch(2);

    let result = model
        .forward(&TextInputs::new(&ids), &pixels, &ForwardOptions::new())
        .unwrap()
        .into_structured()
        .unwrap();

    let scale = 2.6592f64.exp();
    let expected = (result
        .text_embeds
        .matmul(&result.image_embeds.t().unwrap())
        .unwrap()
        * scale)
        .unwrap();
    assert_close(&result.logits_per_text, &expected, 1e-3);
}

// =============================================================================
// NORMALIZATION
// =============================================================================

fn row_norms(t: &Tensor) -> Vec<f32> {
    t.sqr()
        .unwrap()
        .sum(D::Minus1)
        .unwrap()
        .sqrt()
        .unwrap()
        .to_vec1()
        .unwrap()
}

#[test]
fn test_unquantized_embeddings_are_unit_norm() {
    let model = VqClipModel::new(composite(false, false), &Device::Cpu).unwrap();
    let (ids, mask) = token_batch();
    let pixels = pixel_batch(2);

    let result = model
        .forward(
            &TextInputs::new(&ids).with_attention_mask(&mask),
            &pixels,
            &ForwardOptions::new(),
        )
        .unwrap()
        .into_structured()
        .unwrap();

    for norm in row_norms(&result.text_embeds)
        .into_iter()
        .chain(row_norms(&result.image_embeds))
    {
        assert!((norm - 1.0).abs() < 1e-5, "norm {}", norm);
    }
}

#[test]
fn test_feature_getters_match_forward() {
    let model = VqClipModel::new(composite(true, false), &Device::Cpu).unwrap();
    let (ids, _) = token_batch();
    let pixels = pixel_batch(2);
    let text = TextInputs::new(&ids);

    let result = model
        .forward(&text, &pixels, &ForwardOptions::new())
        .unwrap()
        .into_structured()
        .unwrap();

    let text_features = model.get_text_features(&text).unwrap();
    let image_features = model.get_image_features(&pixels).unwrap();
    assert_close(&text_features, &result.text_embeds, 1e-5);
    assert_close(&image_features, &result.image_embeds, 1e-5);

    // Text is unquantized here, so it stays on the unit sphere.
    for norm in row_norms(&text_features) {
        assert!((norm - 1.0).abs() < 1e-5);
    }
}

// =============================================================================
// RESULT SHAPES
// =============================================================================

#[test]
fn test_flat_output_matches_structured() {
    let model = VqClipModel::new(composite(true, true), &Device::Cpu).unwrap();
    let (ids, _) = token_batch();
    let pixels = pixel_batch(2);
    let text = TextInputs::new(&ids);

    let structured = model
        .forward(&text, &pixels, &ForwardOptions::new().with_loss())
        .unwrap()
        .into_structured()
        .unwrap();
    let flat = model
        .forward(&text, &pixels, &ForwardOptions::new().with_loss().return_dict(false))
        .unwrap()
        .into_flat()
        .unwrap()
        .into_items();

    assert_eq!(flat.len(), 7);
    let tensors: Vec<&Tensor> = flat
        .iter()
        .take(5)
        .map(|item| match item {
            FlatItem::Tensor(t) => t,
            FlatItem::Tower(_) => panic!("expected tensor"),
        })
        .collect();
    // Flat loss is the contrastive term, not the total.
    assert_close(tensors[0], structured.contrastive_loss.as_ref().unwrap(), 1e-6);
    assert_close(tensors[1], &structured.logits_per_image, 1e-6);
    assert_close(tensors[2], &structured.logits_per_text, 1e-6);
    assert_close(tensors[3], &structured.text_embeds, 1e-6);
    assert_close(tensors[4], &structured.image_embeds, 1e-6);
    match (&flat[5], &flat[6]) {
        (FlatItem::Tower(text_out), FlatItem::Tower(vision_out)) => {
            assert_close(
                &text_out.pooled_output,
                &structured.text_model_output.pooled_output,
                1e-6,
            );
            assert_close(
                &vision_out.pooled_output,
                &structured.vision_model_output.pooled_output,
                1e-6,
            );
        }
        _ => panic!("expected tower outputs in the last two positions"),
    }
}

#[test]
fn test_flat_output_without_loss_has_six_items() {
    let model = VqClipModel::new(composite(false, false), &Device::Cpu).unwrap();
    let (ids, _) = token_batch();
    let items = model
        .forward(
            &TextInputs::new(&ids),
            &pixel_batch(2),
            &ForwardOptions::new().return_dict(false),
        )
        .unwrap()
        .into_flat()
        .unwrap()
        .into_items();
    assert_eq!(items.len(), 6);
}

#[test]
fn test_loss_absent_without_request() {
    let model = VqClipModel::new(composite(true, true), &Device::Cpu).unwrap();
    let (ids, _) = token_batch();
    let result = model
        .forward(&TextInputs::new(&ids), &pixel_batch(2), &ForwardOptions::new())
        .unwrap()
        .into_structured()
        .unwrap();

    assert!(result.loss.is_none());
    assert!(result.contrastive_loss.is_none());
    assert!(result.perplexity.is_none());
    assert_eq!(result.quantization_loss.dims(), &[] as &[usize]);
}

#[test]
fn test_no_adapter_quantization_loss_is_zero() {
    let model = VqClipModel::new(composite(false, false), &Device::Cpu).unwrap();
    let (ids, _) = token_batch();
    let result = model
        .forward(
            &TextInputs::new(&ids),
            &pixel_batch(2),
            &ForwardOptions::new().with_loss().with_perplexity(),
        )
        .unwrap()
        .into_structured()
        .unwrap();

    assert_eq!(scalar(&result.quantization_loss), 0.0);
    assert!(result.perplexity.is_none());
    assert_close(
        result.loss.as_ref().unwrap(),
        result.contrastive_loss.as_ref().unwrap(),
        0.0,
    );
}

#[test]
fn test_diagnostics_collected_on_request() {
    let model = VqClipModel::new(composite(false, false), &Device::Cpu).unwrap();
    let (ids, _) = token_batch();
    let result = model
        .forward(
            &TextInputs::new(&ids),
            &pixel_batch(1),
            &ForwardOptions::new()
                .output_attentions(true)
                .output_hidden_states(true),
        )
        .unwrap()
        .into_structured()
        .unwrap();

    // Embedding output plus two layers.
    assert_eq!(result.text_model_output.hidden_states.as_ref().unwrap().len(), 3);
    assert_eq!(result.vision_model_output.attentions.as_ref().unwrap().len(), 2);
}

#[test]
fn test_unpaired_batch_rejected_only_for_loss() {
    let model = VqClipModel::new(composite(true, false), &Device::Cpu).unwrap();
    let (ids, _) = token_batch();
    let pixels = pixel_batch(3);

    assert!(model
        .forward(&TextInputs::new(&ids), &pixels, &ForwardOptions::new())
        .is_ok());
    let err = model
        .forward(&TextInputs::new(&ids), &pixels, &ForwardOptions::new().with_loss())
        .unwrap_err();
    assert!(matches!(err, VqClipError::InvalidInput(_)));
}
