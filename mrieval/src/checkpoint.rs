//! Checkpoint manifests and model-variant resolution.
//!
//! A checkpoint manifest records the hyper-parameters a model was trained with
//! and the names and shapes of its stored parameters. The stored key set is
//! matched against each known model shape in order; the first one that claims
//! every key wins.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name looked up when a checkpoint path points at a directory.
pub const MANIFEST_NAME: &str = "checkpoint.json";

const SENS_NET_PREFIX: &str = "varnet.sens_net.";
const CASCADES_PREFIX: &str = "varnet.cascades.";
const POLICY_SEGMENT: &str = "policy";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed checkpoint manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint matches no known model variant ({})", format_rejections(.rejections))]
    NoMatchingVariant {
        rejections: Vec<(ModelVariant, String)>,
    },
}

fn format_rejections(rejections: &[(ModelVariant, String)]) -> String {
    rejections
        .iter()
        .map(|(variant, reason)| format!("{variant}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Model families a checkpoint can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// VarNet with a learned adaptive sampling policy.
    AdaptiveVarNet,
    /// Plain VarNet, no policy.
    VarNet,
}

impl ModelVariant {
    /// Variants in the order they are tried.
    pub const RESOLUTION_ORDER: [ModelVariant; 2] =
        [ModelVariant::AdaptiveVarNet, ModelVariant::VarNet];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdaptiveVarNet => "adaptive_varnet",
            Self::VarNet => "varnet",
        }
    }

    pub fn has_policy(&self) -> bool {
        matches!(self, Self::AdaptiveVarNet)
    }

    /// Check the stored parameters and hyper-parameters against this variant.
    fn accepts(&self, ckpt: &Checkpoint) -> Result<(), String> {
        let keys = || ckpt.state_dict.keys();

        if !keys().any(|k| k.starts_with(SENS_NET_PREFIX)) {
            return Err(format!("missing `{SENS_NET_PREFIX}*` parameters"));
        }
        if !keys().any(|k| k.starts_with(CASCADES_PREFIX)) {
            return Err(format!("missing `{CASCADES_PREFIX}*` parameters"));
        }

        let policy_keys = keys().filter(|k| is_policy_key(k)).count();
        match self {
            Self::AdaptiveVarNet => {
                if policy_keys == 0 {
                    return Err("no sampling-policy parameters".into());
                }
                if ckpt.budget().is_none() {
                    return Err("hyper-parameter `budget` missing or not a positive integer".into());
                }
            }
            Self::VarNet => {
                if policy_keys > 0 {
                    return Err(format!("{policy_keys} unexpected sampling-policy parameters"));
                }
            }
        }

        let unexpected: Vec<&str> = keys()
            .filter(|k| !k.starts_with(SENS_NET_PREFIX) && !k.starts_with(CASCADES_PREFIX))
            .map(String::as_str)
            .collect();
        if let Some(first) = unexpected.first() {
            return Err(format!(
                "{} unexpected parameters (first: `{first}`)",
                unexpected.len()
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_policy_key(key: &str) -> bool {
    key.split('.').any(|segment| segment == POLICY_SEGMENT)
}

/// Shape entry of one stored parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub shape: Vec<usize>,
}

impl ParamInfo {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// A parsed checkpoint manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub hyper_parameters: serde_json::Map<String, serde_json::Value>,
    pub state_dict: BTreeMap<String, ParamInfo>,
}

impl Checkpoint {
    /// Load a manifest from a file, or from `checkpoint.json` inside a directory.
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        let manifest = manifest_path(path);
        let text = fs::read_to_string(&manifest).map_err(|source| CheckpointError::Io {
            path: manifest.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| CheckpointError::Parse {
            path: manifest,
            source,
        })
    }

    /// Acquisition budget of the sampling policy, if the checkpoint records one.
    pub fn budget(&self) -> Option<usize> {
        self.hyper_parameters
            .get("budget")
            .and_then(|v| v.as_u64())
            .filter(|&b| b > 0)
            .map(|b| b as usize)
    }

    /// Total number of stored scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.state_dict.values().map(ParamInfo::numel).sum()
    }

    /// Match the stored parameters against the known variants, in order.
    pub fn resolve_variant(&self) -> Result<ModelVariant, CheckpointError> {
        let mut rejections = Vec::new();
        for variant in ModelVariant::RESOLUTION_ORDER {
            eprintln!("Trying to load as {variant}...");
            match variant.accepts(self) {
                Ok(()) => {
                    eprintln!("... Success!");
                    return Ok(variant);
                }
                Err(reason) => {
                    log::debug!("checkpoint rejected as {variant}: {reason}");
                    rejections.push((variant, reason));
                }
            }
        }
        Err(CheckpointError::NoMatchingVariant { rejections })
    }
}

/// Resolve the manifest file for a checkpoint path.
pub fn manifest_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(MANIFEST_NAME)
    } else {
        path.to_path_buf()
    }
}

/// Directory holding the checkpoint's manifest (and, by default, its outputs).
pub fn checkpoint_dir(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checkpoint(value: serde_json::Value) -> Checkpoint {
        serde_json::from_value(value).unwrap()
    }

    fn adaptive() -> Checkpoint {
        checkpoint(json!({
            "hyper_parameters": { "budget": 22, "num_cascades": 2 },
            "state_dict": {
                "varnet.sens_net.norm_unet.unet.down_sample_layers.0.layers.0.weight": { "shape": [8, 2, 3, 3] },
                "varnet.cascades.0.model.unet.final_conv.weight": { "shape": [2, 8, 1, 1] },
                "varnet.cascades.0.policy.fc_out.0.weight": { "shape": [128, 256] },
                "varnet.cascades.0.dc_weight": { "shape": [1] }
            }
        }))
    }

    fn plain() -> Checkpoint {
        checkpoint(json!({
            "hyper_parameters": { "num_cascades": 12 },
            "state_dict": {
                "varnet.sens_net.norm_unet.unet.final_conv.weight": { "shape": [2, 8, 1, 1] },
                "varnet.cascades.0.dc_weight": { "shape": [1] }
            }
        }))
    }

    #[test]
    fn resolves_adaptive_varnet() {
        let ckpt = adaptive();
        assert_eq!(ckpt.resolve_variant().unwrap(), ModelVariant::AdaptiveVarNet);
        assert_eq!(ckpt.budget(), Some(22));
        assert_eq!(ckpt.num_parameters(), 8 * 2 * 9 + 16 + 128 * 256 + 1);
    }

    #[test]
    fn falls_back_to_varnet() {
        let ckpt = plain();
        assert_eq!(ckpt.resolve_variant().unwrap(), ModelVariant::VarNet);
        assert_eq!(ckpt.budget(), None);
    }

    #[test]
    fn policy_without_budget_matches_nothing() {
        let mut ckpt = adaptive();
        ckpt.hyper_parameters.remove("budget");
        match ckpt.resolve_variant() {
            Err(CheckpointError::NoMatchingVariant { rejections }) => {
                assert_eq!(rejections.len(), 2);
                assert_eq!(rejections[0].0, ModelVariant::AdaptiveVarNet);
                assert!(rejections[0].1.contains("budget"));
                assert!(rejections[1].1.contains("sampling-policy"));
            }
            other => panic!("expected NoMatchingVariant, got {other:?}"),
        }
    }

    #[test]
    fn foreign_keys_match_nothing() {
        let mut ckpt = plain();
        ckpt.state_dict.insert(
            "unet.down_sample_layers.0.weight".into(),
            ParamInfo { shape: vec![4] },
        );
        let err = ckpt.resolve_variant().unwrap_err();
        assert!(matches!(err, CheckpointError::NoMatchingVariant { .. }));
        assert!(err.to_string().contains("unexpected parameters"));
    }

    #[test]
    fn loads_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let text = serde_json::to_string(&plain()).unwrap();
        std::fs::write(dir.path().join(MANIFEST_NAME), text).unwrap();

        let ckpt = Checkpoint::load(dir.path()).unwrap();
        assert_eq!(ckpt.state_dict.len(), 2);
        assert_eq!(checkpoint_dir(dir.path()), dir.path());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Checkpoint::load(Path::new("/nonexistent/ckpt.json")).unwrap_err();
        assert!(matches!(err, CheckpointError::Io { .. }));
    }
}
