//! Module defining [`TargetPlatform`], the closed set of execution backends an operation can be
//! dispatched to, and [`NetworkFramework`], the exchange formats a graph can be loaded from.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::DispatchError;

macro_rules! target_platforms {
    ($(($var:ident, $name:literal, $code:literal)),* $(,)?) => {
        /// A backend an operation is executed on. Every variant carries a stable integer code,
        /// used by dispatching overrides, and a name, used by serialized settings.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum TargetPlatform {
            $(
                #[serde(rename = $name)]
                $var
            ),*
        }

        impl TargetPlatform {
            pub const ALL: &'static [TargetPlatform] = &[$(TargetPlatform::$var),*];

            /// Integer code of the platform
            pub fn code(&self) -> i64 {
                match self {
                    $(TargetPlatform::$var => $code),*
                }
            }

            /// Name of the platform as written in settings documents
            pub fn name(&self) -> &'static str {
                match self {
                    $(TargetPlatform::$var => $name),*
                }
            }

            /// Decodes a platform from its integer code.
            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some(TargetPlatform::$var),)*
                    _ => None,
                }
            }

            /// Decodes a platform from its name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(TargetPlatform::$var),)*
                    _ => None,
                }
            }
        }
    };
}

target_platforms!(
    (Unspecified, "UNSPECIFIED", 0),
    (ShapeOrIndex, "SHAPE_OR_INDEX", 1),
    (Boundary, "BOUNDARY", 2),
    (Onnx, "ONNX", 3),
    (Caffe, "CAFFE", 4),
    (Native, "NATIVE", 5),
    (OnnxRuntime, "ONNXRUNTIME", 6),
    (Fp32, "FP32", 7),
    (Extension, "EXTENSION", 8),
    (TrtInt8, "TRT_INT8", 101),
    (PplCudaInt8, "PPL_CUDA_INT8", 201),
    (PplCudaInt4, "PPL_CUDA_INT4", 202),
    (PplCudaMix, "PPL_CUDA_MIX", 204),
    (PplDspInt8, "PPL_DSP_INT8", 301),
    (SnpeInt8, "SNPE_INT8", 302),
    (PplDspTiInt8, "PPL_DSP_TI_INT8", 303),
    (NxpInt8, "NXP_INT8", 501),
    (OrtOosInt8, "ORT_OOS_INT8", 601),
    (MetaxInt8C, "METAX_INT8_C", 701),
    (MetaxInt8T, "METAX_INT8_T", 702),
    (AcademicInt4, "ACADEMIC_INT4", 10081),
    (AcademicInt8, "ACADEMIC_INT8", 10082),
    (AcademicMix, "ACADEMIC_MIX", 10083),
);

impl TargetPlatform {
    /// Returns true for the platforms a quantizer can target.
    pub fn is_quantized_platform(&self) -> bool {
        matches!(
            self,
            TargetPlatform::TrtInt8
                | TargetPlatform::PplCudaInt8
                | TargetPlatform::PplCudaInt4
                | TargetPlatform::PplCudaMix
                | TargetPlatform::PplDspInt8
                | TargetPlatform::SnpeInt8
                | TargetPlatform::PplDspTiInt8
                | TargetPlatform::NxpInt8
                | TargetPlatform::OrtOosInt8
                | TargetPlatform::MetaxInt8C
                | TargetPlatform::MetaxInt8T
                | TargetPlatform::AcademicInt4
                | TargetPlatform::AcademicInt8
                | TargetPlatform::AcademicMix
                | TargetPlatform::Extension
        )
    }
}

impl Default for TargetPlatform {
    fn default() -> Self {
        TargetPlatform::Unspecified
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for TargetPlatform {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetPlatform::from_name(s)
            .or_else(|| TargetPlatform::from_name(&s.to_ascii_uppercase()))
            .ok_or_else(|| DispatchError::Settings(format!("unknown platform \"{s}\"")))
    }
}

impl TryFrom<i64> for TargetPlatform {
    type Error = i64;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        TargetPlatform::from_code(code).ok_or(code)
    }
}

/// Exchange formats a graph can be imported from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkFramework {
    Onnx,
    Caffe,
    Native,
}

impl fmt::Display for NetworkFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkFramework::Onnx => "ONNX",
            NetworkFramework::Caffe => "CAFFE",
            NetworkFramework::Native => "NATIVE",
        };
        write!(f, "{name}")
    }
}
