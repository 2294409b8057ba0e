//! Registry of the quantizers known for each quantized [`TargetPlatform`], and the interfaces of
//! the quantization machinery living outside of this crate.

use std::collections::{BTreeMap, BTreeSet};

use once_cell::sync::Lazy;

use crate::{
    error::{DispatchError, Result},
    ir::Graph,
    platform::TargetPlatform,
    setting::QuantizationSetting,
};

/// What the dispatcher needs to know about a quantizer.
pub trait Quantizer: Send + Sync {
    fn platform(&self) -> TargetPlatform;
    /// Operation types this quantizer is able to quantize.
    fn quant_operation_types(&self) -> &BTreeSet<String>;
}

/// Built-in [`Quantizer`] description of a platform.
#[derive(Debug, Clone)]
pub struct PlatformQuantizer {
    platform: TargetPlatform,
    quant_types: BTreeSet<String>,
}

impl PlatformQuantizer {
    fn new(platform: TargetPlatform, quant_types: &[&str]) -> Self {
        Self {
            platform,
            quant_types: quant_types.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl Quantizer for PlatformQuantizer {
    fn platform(&self) -> TargetPlatform {
        self.platform
    }

    fn quant_operation_types(&self) -> &BTreeSet<String> {
        &self.quant_types
    }
}

const PPL_QUANT_TYPES: &[&str] = &[
    "Conv",
    "ConvTranspose",
    "Gemm",
    "MatMul",
    "Relu",
    "PRelu",
    "Clip",
    "Pad",
    "Resize",
    "MaxPool",
    "AveragePool",
    "GlobalMaxPool",
    "GlobalAveragePool",
    "Softmax",
    "Mul",
    "Add",
    "Max",
    "Sub",
    "Div",
    "LeakyRelu",
    "Concat",
    "Sigmoid",
    "ReduceMean",
    "Transpose",
    "Slice",
    "Flatten",
    "HardSwish",
    "HardSigmoid",
];

const TRT_QUANT_TYPES: &[&str] = &[
    "Conv",
    "ConvTranspose",
    "Gemm",
    "MatMul",
    "AveragePool",
    "GlobalAveragePool",
];

const DSP_QUANT_TYPES: &[&str] = &[
    "Conv",
    "ConvTranspose",
    "Gemm",
    "Relu",
    "PRelu",
    "Clip",
    "Pad",
    "Resize",
    "MaxPool",
    "AveragePool",
    "GlobalMaxPool",
    "GlobalAveragePool",
    "Mul",
    "Add",
    "Max",
    "Sub",
    "Div",
    "LeakyRelu",
    "Concat",
    "Sigmoid",
    "Slice",
    "ReduceMean",
    "Split",
    "Transpose",
];

const NXP_QUANT_TYPES: &[&str] = &[
    "Conv",
    "ConvTranspose",
    "Gemm",
    "Relu",
    "PRelu",
    "Clip",
    "Pad",
    "MaxPool",
    "AveragePool",
    "GlobalAveragePool",
    "Add",
    "Concat",
    "Sigmoid",
];

const ORT_QUANT_TYPES: &[&str] = &[
    "Conv",
    "Gemm",
    "MatMul",
    "Relu",
    "Clip",
    "Add",
    "Mul",
    "MaxPool",
    "AveragePool",
    "GlobalAveragePool",
    "Concat",
    "Sigmoid",
    "LeakyRelu",
];

const ACADEMIC_QUANT_TYPES: &[&str] = &["Conv", "ConvTranspose", "Gemm", "Relu", "Clip", "Add"];

/// Quantizer of every quantized platform, built once.
pub static QUANTIZER_COLLECTION: Lazy<BTreeMap<TargetPlatform, PlatformQuantizer>> =
    Lazy::new(|| {
        use TargetPlatform::*;
        [
            (TrtInt8, TRT_QUANT_TYPES),
            (PplCudaInt8, PPL_QUANT_TYPES),
            (PplCudaInt4, PPL_QUANT_TYPES),
            (PplCudaMix, PPL_QUANT_TYPES),
            (PplDspInt8, DSP_QUANT_TYPES),
            (SnpeInt8, DSP_QUANT_TYPES),
            (PplDspTiInt8, DSP_QUANT_TYPES),
            (NxpInt8, NXP_QUANT_TYPES),
            (OrtOosInt8, ORT_QUANT_TYPES),
            (MetaxInt8C, PPL_QUANT_TYPES),
            (MetaxInt8T, PPL_QUANT_TYPES),
            (AcademicInt4, ACADEMIC_QUANT_TYPES),
            (AcademicInt8, ACADEMIC_QUANT_TYPES),
            (AcademicMix, ACADEMIC_QUANT_TYPES),
        ]
        .into_iter()
        .map(|(platform, types)| (platform, PlatformQuantizer::new(platform, types)))
        .collect()
    });

/// Looks up the quantizer registered for `platform`.
pub fn quantizer_for(platform: TargetPlatform) -> Result<&'static PlatformQuantizer> {
    QUANTIZER_COLLECTION
        .get(&platform)
        .ok_or(DispatchError::UnsupportedPlatform(platform))
}

/// Source of calibration batches, provided by the caller.
pub trait CalibrationSource {
    fn num_batches(&self) -> usize;
}

/// Calibrates and quantizes a dispatched graph. Implemented outside of this crate.
pub trait QuantizationBackend {
    fn quantize(
        &self,
        graph: &mut Graph,
        quantizer: &dyn Quantizer,
        setting: &QuantizationSetting,
        calibration: &dyn CalibrationSource,
        calibration_steps: usize,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_every_quantized_platform_is_registered() {
        for platform in TargetPlatform::ALL {
            let registered = quantizer_for(*platform).is_ok();
            // the extension platform is quantized by user code only
            let expected =
                platform.is_quantized_platform() && *platform != TargetPlatform::Extension;
            assert_eq!(registered, expected, "{platform}");
        }
    }

    #[test]
    fn test_quantizer_lookup() {
        let quantizer = quantizer_for(TargetPlatform::PplCudaInt8).unwrap();
        assert_eq!(quantizer.platform(), TargetPlatform::PplCudaInt8);
        assert!(quantizer.quant_operation_types().contains("Conv"));
        assert!(!quantizer.quant_operation_types().contains("Shape"));
        assert!(matches!(
            quantizer_for(TargetPlatform::Fp32),
            Err(DispatchError::UnsupportedPlatform(TargetPlatform::Fp32))
        ));
    }
}
