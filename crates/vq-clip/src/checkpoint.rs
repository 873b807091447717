//! Checkpoint directory layout and safetensors plumbing.
//!
//! A checkpoint directory holds `config.json` (composite config) and
//! `model.safetensors` (flat dotted-name -> tensor mapping).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::PoisonError;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use tracing::debug;

use crate::config::CompositeConfig;
use crate::error::{VqClipError, VqClipResult};

/// Composite config file inside a checkpoint directory.
pub const CONFIG_FILE: &str = "config.json";

/// Tensor container inside a checkpoint directory.
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Name prefix of backbone tensors in a composite checkpoint.
pub const BACKBONE_PREFIX: &str = "clip_model";

/// Join a container prefix and a parameter name.
pub(crate) fn qualified(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Every variable keyed by `prefix.name`.
///
/// The tensors share storage with the variables, so a later `Var::set`
/// shows through. Use [`copy_all`] for values that must stay fixed.
pub(crate) fn snapshot(vars: &VarMap, prefix: &str) -> BTreeMap<String, Tensor> {
    let data = vars.data().lock().unwrap_or_else(PoisonError::into_inner);
    data.iter()
        .map(|(name, var)| (qualified(prefix, name), var.as_tensor().clone()))
        .collect()
}

/// Detached copies of every variable, keyed by `prefix.name`.
pub(crate) fn copy_all(vars: &VarMap, prefix: &str) -> VqClipResult<BTreeMap<String, Tensor>> {
    snapshot(vars, prefix)
        .into_iter()
        .map(|(name, tensor)| Ok((name, tensor.copy()?)))
        .collect()
}

/// Overwrite every variable in `vars` with `tensors[prefix.name]`.
///
/// Strict: every variable must have a counterpart of identical shape. All
/// lookups are validated before the first write, so a failure leaves `vars`
/// untouched. Tensors under `prefix` that match no variable are ignored.
///
/// # Errors
/// - `LoadError` naming the first missing or mis-shaped tensor
pub(crate) fn assign_strict(
    vars: &VarMap,
    tensors: &HashMap<String, Tensor>,
    prefix: &str,
    path: &Path,
) -> VqClipResult<usize> {
    let data = vars.data().lock().unwrap_or_else(PoisonError::into_inner);

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut staged: Vec<(&Var, Tensor)> = Vec::with_capacity(names.len());
    for name in names {
        let var = &data[name];
        let key = qualified(prefix, name);
        let tensor = tensors
            .get(&key)
            .ok_or_else(|| VqClipError::load(path, format!("missing tensor '{}'", key)))?;
        if tensor.dims() != var.dims() {
            return Err(VqClipError::load(
                path,
                format!(
                    "tensor '{}' has shape {:?}, expected {:?}",
                    key,
                    tensor.dims(),
                    var.dims()
                ),
            ));
        }
        let tensor = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
        staged.push((var, tensor));
    }

    for (var, tensor) in &staged {
        var.set(tensor)?;
    }

    let scope = if prefix.is_empty() {
        String::new()
    } else {
        format!("{}.", prefix)
    };
    let unused = tensors
        .keys()
        .filter(|k| k.starts_with(&scope))
        .count()
        .saturating_sub(staged.len());
    if unused > 0 {
        debug!(path = %path.display(), prefix, unused, "ignoring unmatched tensors");
    }
    Ok(staged.len())
}

/// Read a safetensors container onto `device`.
pub(crate) fn read_tensors(path: &Path, device: &Device) -> VqClipResult<HashMap<String, Tensor>> {
    if !path.is_file() {
        return Err(VqClipError::load(path, "no such file"));
    }
    candle_core::safetensors::load(path, device).map_err(|e| VqClipError::load(path, e))
}

/// Write a safetensors container.
pub(crate) fn write_tensors(tensors: &HashMap<String, Tensor>, path: &Path) -> VqClipResult<()> {
    candle_core::safetensors::save(tensors, path).map_err(|e| VqClipError::save(path, e))
}

/// Contents of a checkpoint directory, without building a model.
#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub config: CompositeConfig,
    /// Tensor name -> shape.
    pub tensors: BTreeMap<String, Vec<usize>>,
}

impl CheckpointSummary {
    /// # Errors
    /// - `LoadError` if `config.json` or `model.safetensors` is missing
    /// - `ConfigError` if `config.json` is malformed
    pub fn read(dir: impl AsRef<Path>) -> VqClipResult<Self> {
        let dir = dir.as_ref();
        let config = CompositeConfig::from_file(dir.join(CONFIG_FILE))?;
        let tensors = read_tensors(&dir.join(WEIGHTS_FILE), &Device::Cpu)?
            .into_iter()
            .map(|(name, t)| (name, t.dims().to_vec()))
            .collect();
        Ok(Self { config, tensors })
    }

    pub fn backbone_tensor_count(&self) -> usize {
        let scope = format!("{}.", BACKBONE_PREFIX);
        self.tensors.keys().filter(|k| k.starts_with(&scope)).count()
    }

    pub fn adapter_tensor_count(&self) -> usize {
        self.tensors.len() - self.backbone_tensor_count()
    }

    /// True if the container holds no backbone tensors.
    pub fn is_adapter_only(&self) -> bool {
        self.backbone_tensor_count() == 0
    }

    /// Total scalar parameter count across all tensors.
    pub fn parameter_count(&self) -> usize {
        self.tensors
            .values()
            .map(|shape| shape.iter().product::<usize>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn two_vars() -> VarMap {
        let vars = VarMap::new();
        let vb = VarBuilder::from_varmap(&vars, DType::F32, &Device::Cpu);
        vb.pp("layer").get_with_hints((2, 2), "weight", Init::Const(0.0)).unwrap();
        vb.pp("layer").get_with_hints(2, "bias", Init::Const(0.0)).unwrap();
        vars
    }

    #[test]
    fn test_snapshot_applies_prefix() {
        let names: Vec<String> = snapshot(&two_vars(), "clip_model").into_keys().collect();
        assert_eq!(names, vec!["clip_model.layer.bias", "clip_model.layer.weight"]);
    }

    #[test]
    fn test_assign_overwrites_all_vars() {
        let vars = two_vars();
        let mut tensors = HashMap::new();
        tensors.insert(
            "p.layer.weight".to_string(),
            Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "p.layer.bias".to_string(),
            Tensor::ones(2, DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "other.thing".to_string(),
            Tensor::ones(1, DType::F32, &Device::Cpu).unwrap(),
        );

        let n = assign_strict(&vars, &tensors, "p", Path::new("x")).unwrap();
        assert_eq!(n, 2);
        let bias: Vec<f32> = snapshot(&vars, "")["layer.bias"].to_vec1().unwrap();
        assert_eq!(bias, vec![1.0, 1.0]);
    }

    #[test]
    fn test_copies_do_not_follow_later_writes() {
        let vars = two_vars();
        let before = copy_all(&vars, "").unwrap();
        let view = snapshot(&vars, "");

        let mut tensors = HashMap::new();
        tensors.insert(
            "layer.weight".to_string(),
            Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "layer.bias".to_string(),
            Tensor::ones(2, DType::F32, &Device::Cpu).unwrap(),
        );
        assign_strict(&vars, &tensors, "", Path::new("ckpt")).unwrap();

        let copied: Vec<f32> = before["layer.bias"].to_vec1().unwrap();
        let live: Vec<f32> = view["layer.bias"].to_vec1().unwrap();
        assert_eq!(copied, vec![0.0, 0.0]);
        assert_eq!(live, vec![1.0, 1.0]);
    }

    #[test]
    fn test_assign_missing_tensor_leaves_vars_untouched() {
        let vars = two_vars();
        let mut tensors = HashMap::new();
        tensors.insert(
            "layer.weight".to_string(),
            Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
        );

        let err = assign_strict(&vars, &tensors, "", Path::new("ckpt")).unwrap_err();
        assert!(err.to_string().contains("layer.bias"));
        let weight: Vec<Vec<f32>> = snapshot(&vars, "")["layer.weight"].to_vec2().unwrap();
        assert_eq!(weight, vec![vec![0.0, 0.0], vec![0.0, 0.0]]);
    }

    #[test]
    fn test_assign_rejects_shape_mismatch() {
        let vars = two_vars();
        let mut tensors = HashMap::new();
        tensors.insert(
            "layer.weight".to_string(),
            Tensor::ones((3, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "layer.bias".to_string(),
            Tensor::ones(2, DType::F32, &Device::Cpu).unwrap(),
        );
        let err = assign_strict(&vars, &tensors, "", Path::new("ckpt")).unwrap_err();
        assert!(matches!(err, VqClipError::LoadError { .. }));
    }

    #[test]
    fn test_summary_counts_groups() {
        let dir = tempfile::tempdir().unwrap();
        CompositeConfig::default()
            .save(dir.path().join(CONFIG_FILE))
            .unwrap();
        let mut tensors = HashMap::new();
        tensors.insert(
            "clip_model.logit_scale".to_string(),
            Tensor::zeros((), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "vision_vq_adapter.codebook".to_string(),
            Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        write_tensors(&tensors, &dir.path().join(WEIGHTS_FILE)).unwrap();

        let summary = CheckpointSummary::read(dir.path()).unwrap();
        assert_eq!(summary.backbone_tensor_count(), 1);
        assert_eq!(summary.adapter_tensor_count(), 1);
        assert!(!summary.is_adapter_only());
        assert_eq!(summary.parameter_count(), 13);
        assert_eq!(summary.tensors["vision_vq_adapter.codebook"], vec![4, 3]);
    }

    #[test]
    fn test_read_missing_container_is_load_error() {
        let err = read_tensors(Path::new("/nonexistent/model.safetensors"), &Device::Cpu).unwrap_err();
        assert!(matches!(err, VqClipError::LoadError { .. }));
    }
}
