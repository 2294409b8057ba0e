//! Quantization settings. [`QuantizationSetting`] is the complete tree consumed by the dispatching
//! and quantization pipeline; [`SimpleQuantizationSetting`] carries the few knobs users usually
//! care about and converts into the complete tree.

mod simple;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fs::File, io::BufReader, path::Path};
use tracing::warn;

use crate::{
    dispatch::{DispatchPrecedence, DispatchingOverride},
    error::{DispatchError, Result},
};
pub use simple::SimpleQuantizationSetting;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationQuantizationSetting {
    /// Calibration algorithm, the quantizer picks its own when unset.
    pub calib_algorithm: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSetting {
    pub fuse_conv_relu: bool,
    pub fuse_conv_add: bool,
    /// Forces the quantization of the inputs and outputs of an alignment operation to overlap.
    pub force_alignment_overlap: bool,
    pub align_quantization: bool,
}

impl Default for FusionSetting {
    fn default() -> Self {
        Self {
            fuse_conv_relu: true,
            fuse_conv_add: false,
            force_alignment_overlap: false,
            align_quantization: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EqualizationSetting {
    pub iterations: usize,
    pub value_threshold: f32,
    pub opt_level: usize,
}

impl Default for EqualizationSetting {
    fn default() -> Self {
        Self {
            iterations: 10,
            value_threshold: 0.5,
            opt_level: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedOptimizationSetting {
    pub steps: usize,
    pub lr: f32,
    pub limit: f32,
    /// Variables the fine tuning looks at, the graph outputs when empty.
    pub interested_outputs: Vec<String>,
}

impl Default for AdvancedOptimizationSetting {
    fn default() -> Self {
        Self {
            steps: 5000,
            lr: 1e-3,
            limit: 2.0,
            interested_outputs: vec![],
        }
    }
}

/// Complete setting tree of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationSetting {
    /// Name of the [`crate::dispatch::DispatcherKind`] to use.
    pub dispatcher: String,
    pub dispatching_precedence: DispatchPrecedence,
    /// Platforms forced by the user, applied over the automatic dispatch.
    pub dispatching_table: DispatchingOverride,
    pub quantize_activation_setting: ActivationQuantizationSetting,
    pub fusion_setting: FusionSetting,
    pub equalization: bool,
    pub equalization_setting: EqualizationSetting,
    pub advanced_optimization: bool,
    pub advanced_optimization_setting: AdvancedOptimizationSetting,
}

impl Default for QuantizationSetting {
    fn default() -> Self {
        Self {
            dispatcher: "conservative".to_string(),
            dispatching_precedence: DispatchPrecedence::default(),
            dispatching_table: DispatchingOverride::default(),
            quantize_activation_setting: ActivationQuantizationSetting::default(),
            fusion_setting: FusionSetting::default(),
            equalization: false,
            equalization_setting: EqualizationSetting::default(),
            advanced_optimization: false,
            advanced_optimization_setting: AdvancedOptimizationSetting::default(),
        }
    }
}

impl QuantizationSetting {
    /// Reads a setting tree from a JSON file, missing entries take their default value.
    /// Unknown entries are skipped and their dotted paths returned along with the setting.
    pub fn from_file(path: &Path) -> Result<(Self, Vec<String>)> {
        if !path.is_file() {
            return Err(DispatchError::Settings(format!(
                "setting file {} does not exist",
                path.display()
            )));
        }
        let file = File::open(path)?;
        let document: Value = serde_json::from_reader(BufReader::new(file))?;
        let Value::Object(entries) = &document else {
            return Err(DispatchError::Settings(format!(
                "setting file {} does not hold a JSON object",
                path.display()
            )));
        };
        let Value::Object(reference) = serde_json::to_value(Self::default())? else {
            return Err(DispatchError::Settings(
                "default setting is not a JSON object".to_string(),
            ));
        };
        let mut unknown = vec![];
        collect_unknown_keys(entries, &reference, "", &mut unknown);
        unknown.sort();
        for key in &unknown {
            warn!("unknown entry {} in setting file {}, ignored", key, path.display());
        }
        Ok((serde_json::from_value(document)?, unknown))
    }

    /// Writes the setting tree as pretty JSON. Returns a warning when an existing file is
    /// overwritten.
    pub fn to_json(&self, path: &Path) -> Result<Option<String>> {
        let warning = crate::io::check_output_path(path)?;
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(warning)
    }
}

/// Pushes the paths of `entries` absent from `reference`. Empty reference objects are free-form
/// maps, like the dispatching table, and are not descended into.
fn collect_unknown_keys(
    entries: &Map<String, Value>,
    reference: &Map<String, Value>,
    prefix: &str,
    unknown: &mut Vec<String>,
) {
    for (key, value) in entries {
        let path = format!("{prefix}{key}");
        match (reference.get(key), value) {
            (None, _) => unknown.push(path),
            (Some(Value::Object(inner)), Value::Object(nested)) if !inner.is_empty() => {
                collect_unknown_keys(nested, inner, &format!("{path}."), unknown)
            }
            _ => {}
        }
    }
}
