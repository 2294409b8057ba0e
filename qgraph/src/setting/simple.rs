use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{ser::PrettyFormatter, Value};
use tracing::warn;

use super::QuantizationSetting;
use crate::{
    error::{DispatchError, Result},
    platform::TargetPlatform,
};

const DEFAULT_FINETUNE_STEPS: usize = 5000;
const DEFAULT_FINETUNE_LR: f32 = 3e-4;
const DEFAULT_CALIBRATION: &str = "percentile";

/// The handful of knobs most users tune, see [`Self::convert_to_full_setting`] for how they map
/// onto the complete [`QuantizationSetting`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleQuantizationSetting {
    pub platform: TargetPlatform,
    #[serde(default = "default_finetune_steps")]
    pub finetune_steps: usize,
    #[serde(default = "default_finetune_lr")]
    pub finetune_lr: f32,
    /// Variables the fine tuning looks at.
    #[serde(default, deserialize_with = "one_or_many")]
    pub interested_outputs: Option<Vec<String>>,
    #[serde(default = "default_calibration")]
    pub calibration: String,
    #[serde(default = "default_equalization")]
    pub equalization: bool,
    /// Operations kept in fp32 whatever the dispatcher decides.
    #[serde(default, deserialize_with = "one_or_many")]
    pub non_quantable_op: Option<Vec<String>>,
}

fn default_finetune_steps() -> usize {
    DEFAULT_FINETUNE_STEPS
}

fn default_finetune_lr() -> f32 {
    DEFAULT_FINETUNE_LR
}

fn default_calibration() -> String {
    DEFAULT_CALIBRATION.to_string()
}

fn default_equalization() -> bool {
    true
}

/// Accepts either a single string or a list of strings.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<String>>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(
        Option::<OneOrMany>::deserialize(deserializer)?.map(|value| match value {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }),
    )
}

/// Names of the entries of a serialized [`SimpleQuantizationSetting`], platform excluded.
const KNOWN_KEYS: [&str; 6] = [
    "finetune_steps",
    "finetune_lr",
    "interested_outputs",
    "calibration",
    "equalization",
    "non_quantable_op",
];

impl SimpleQuantizationSetting {
    pub fn new(platform: TargetPlatform) -> Self {
        Self {
            platform,
            finetune_steps: DEFAULT_FINETUNE_STEPS,
            finetune_lr: DEFAULT_FINETUNE_LR,
            interested_outputs: None,
            calibration: default_calibration(),
            equalization: true,
            non_quantable_op: None,
        }
    }

    pub fn convert_to_full_setting(&self) -> QuantizationSetting {
        let mut setting = QuantizationSetting::default();
        setting.quantize_activation_setting.calib_algorithm = Some(self.calibration.clone());

        setting.fusion_setting.fuse_conv_add = matches!(
            self.platform,
            TargetPlatform::PplCudaInt4 | TargetPlatform::PplCudaInt8
        );
        if matches!(
            self.platform,
            TargetPlatform::MetaxInt8C | TargetPlatform::MetaxInt8T
        ) {
            setting.fusion_setting.force_alignment_overlap = true;
        }

        if self.finetune_steps > 0 {
            setting.advanced_optimization = true;
            let advanced = &mut setting.advanced_optimization_setting;
            advanced.steps = self.finetune_steps;
            advanced.lr = self.finetune_lr;
            advanced.limit = 2.0;
            advanced.interested_outputs = self.interested_outputs.clone().unwrap_or_default();
        }

        if self.equalization {
            setting.equalization = true;
            let equalization = &mut setting.equalization_setting;
            equalization.iterations = 3;
            equalization.opt_level = 1;
            equalization.value_threshold = 0.0;
        }

        for op in self.non_quantable_op.iter().flatten() {
            setting.dispatching_table.append(op.as_str(), TargetPlatform::Fp32);
        }
        setting
    }

    /// Writes the setting as an indented JSON object with sorted keys. Returns a warning when an
    /// existing file is overwritten.
    pub fn to_json(&self, path: &Path) -> Result<Option<String>> {
        let warning = crate::io::check_output_path(path)?;
        // going through a `Value` sorts the keys
        let value = serde_json::to_value(self)?;
        let mut buffer = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
        value.serialize(&mut serializer)?;
        std::fs::write(path, buffer)?;
        Ok(warning)
    }

    /// Reads a setting written by [`Self::to_json`]. A missing or unknown platform is an error,
    /// unknown entries are skipped and their names returned along with the setting.
    pub fn from_file(path: &Path) -> Result<(Self, Vec<String>)> {
        if !path.is_file() {
            return Err(DispatchError::Settings(format!(
                "setting file {} does not exist",
                path.display()
            )));
        }
        let loaded: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let Value::Object(mut entries) = loaded else {
            return Err(DispatchError::Settings(format!(
                "setting file {} does not contain a JSON object",
                path.display()
            )));
        };

        match entries.get("platform") {
            Some(Value::String(name)) if TargetPlatform::from_name(name).is_some() => {}
            Some(Value::String(name)) => {
                return Err(DispatchError::Settings(format!("unknown platform \"{name}\"")));
            }
            Some(other) => {
                return Err(DispatchError::Settings(format!(
                    "platform must be given by name, found {other}"
                )));
            }
            None => {
                return Err(DispatchError::Settings(
                    "setting does not specify a platform".to_string(),
                ));
            }
        }

        let unknown = entries
            .keys()
            .filter(|key| *key != "platform" && !KNOWN_KEYS.contains(&key.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        for key in &unknown {
            warn!("unknown entry {} in setting file {}, ignored", key, path.display());
            entries.remove(key);
        }
        let setting = serde_json::from_value(Value::Object(entries))
            .map_err(|e| DispatchError::Settings(e.to_string()))?;
        Ok((setting, unknown))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(TargetPlatform::PplCudaInt8, true, false)]
    #[case(TargetPlatform::PplCudaInt4, true, false)]
    #[case(TargetPlatform::MetaxInt8C, false, true)]
    #[case(TargetPlatform::MetaxInt8T, false, true)]
    #[case(TargetPlatform::TrtInt8, false, false)]
    fn test_platform_fusion(
        #[case] platform: TargetPlatform,
        #[case] fuse_conv_add: bool,
        #[case] force_alignment_overlap: bool,
    ) {
        let setting = SimpleQuantizationSetting::new(platform).convert_to_full_setting();
        assert_eq!(setting.fusion_setting.fuse_conv_add, fuse_conv_add);
        assert_eq!(
            setting.fusion_setting.force_alignment_overlap,
            force_alignment_overlap
        );
    }

    #[test]
    fn test_convert_to_full_setting() {
        let mut simple = SimpleQuantizationSetting::new(TargetPlatform::PplDspInt8);
        simple.interested_outputs = Some(vec!["logits".to_string()]);
        simple.non_quantable_op = Some(vec!["conv_1".to_string(), "softmax".to_string()]);
        let setting = simple.convert_to_full_setting();

        assert_eq!(
            setting.quantize_activation_setting.calib_algorithm.as_deref(),
            Some("percentile")
        );
        assert!(setting.advanced_optimization);
        assert_eq!(setting.advanced_optimization_setting.steps, 5000);
        assert_eq!(setting.advanced_optimization_setting.lr, 3e-4);
        assert_eq!(setting.advanced_optimization_setting.limit, 2.0);
        assert_eq!(
            setting.advanced_optimization_setting.interested_outputs,
            vec!["logits".to_string()]
        );
        assert!(setting.equalization);
        assert_eq!(setting.equalization_setting.iterations, 3);
        assert_eq!(setting.equalization_setting.opt_level, 1);
        assert_eq!(setting.equalization_setting.value_threshold, 0.0);
        assert_eq!(setting.dispatching_table.get("conv_1"), Some(&7));
        assert_eq!(setting.dispatching_table.get("softmax"), Some(&7));
    }

    #[test]
    fn test_no_finetune_no_equalization() {
        let mut simple = SimpleQuantizationSetting::new(TargetPlatform::TrtInt8);
        simple.finetune_steps = 0;
        simple.equalization = false;
        let setting = simple.convert_to_full_setting();
        assert!(!setting.advanced_optimization);
        assert!(!setting.equalization);
        assert_eq!(setting.equalization_setting, Default::default());
        assert!(setting.dispatching_table.is_empty());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("simple.json");
        let mut simple = SimpleQuantizationSetting::new(TargetPlatform::NxpInt8);
        simple.finetune_steps = 100;
        simple.non_quantable_op = Some(vec!["head".to_string()]);

        assert_eq!(simple.to_json(&path).unwrap(), None);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("    \"platform\": \"NXP_INT8\""));
        let calibration = text.find("\"calibration\"").unwrap();
        let platform = text.find("\"platform\"").unwrap();
        assert!(calibration < platform);

        let (back, unknown) = SimpleQuantizationSetting::from_file(&path).unwrap();
        assert_eq!(back, simple);
        assert!(unknown.is_empty());
        assert!(simple.to_json(&path).unwrap().is_some());
        assert!(matches!(
            simple.to_json(dir.path()),
            Err(DispatchError::PathIsDirectory(_))
        ));
    }

    #[rstest]
    #[case(r#"{"finetune_steps": 10}"#)]
    #[case(r#"{"platform": "NOT_A_PLATFORM"}"#)]
    #[case(r#"{"platform": 7}"#)]
    #[case(r#"["PPL_CUDA_INT8"]"#)]
    fn test_from_file_rejects(#[case] document: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, document).unwrap();
        assert!(matches!(
            SimpleQuantizationSetting::from_file(&path),
            Err(DispatchError::Settings(_))
        ));
    }

    #[test]
    fn test_from_file_is_lenient() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lenient.json");
        std::fs::write(
            &path,
            r#"{"platform": "PPL_CUDA_INT8", "non_quantable_op": "conv_3", "verbose": 1}"#,
        )
        .unwrap();
        let (setting, unknown) = SimpleQuantizationSetting::from_file(&path).unwrap();
        assert_eq!(setting.platform, TargetPlatform::PplCudaInt8);
        assert_eq!(setting.non_quantable_op, Some(vec!["conv_3".to_string()]));
        assert_eq!(setting.finetune_steps, 5000);
        assert_eq!(unknown, vec!["verbose".to_string()]);
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SimpleQuantizationSetting::from_file(&dir.path().join("nope.json")).is_err());
    }
}
