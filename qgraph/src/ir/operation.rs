use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::tensor::Tensor;
use crate::platform::TargetPlatform;

/// Type tag given to the relay operations inserted between two platforms.
pub const DEVICE_SWITCH_TYPE: &str = "DeviceSwitch";
pub(crate) const SWITCH_SOURCE_ATTR: &str = "source_platform";
pub(crate) const SWITCH_TARGET_ATTR: &str = "target_platform";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    String(String),
    Tensor(Tensor),
}

impl Attribute {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Attribute::Float(f) => Some(*f),
            Attribute::Int(i) => Some(*i as f32),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Attribute::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A node of the [`super::Graph`]. Inputs and outputs are variable names; the links are kept
/// consistent by the graph methods, never by editing these lists directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub(crate) name: String,
    pub(crate) op_type: String,
    #[serde(default)]
    pub(crate) attributes: BTreeMap<String, Attribute>,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
    #[serde(default)]
    pub(crate) platform: TargetPlatform,
}

impl Operation {
    pub(crate) fn new(
        name: String,
        op_type: String,
        attributes: BTreeMap<String, Attribute>,
    ) -> Self {
        Self {
            name,
            op_type,
            attributes,
            inputs: vec![],
            outputs: vec![],
            platform: TargetPlatform::Unspecified,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn attributes(&self) -> &BTreeMap<String, Attribute> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&Attribute> {
        self.attributes.get(key)
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn platform(&self) -> TargetPlatform {
        self.platform
    }

    pub fn is_device_switch(&self) -> bool {
        self.op_type == DEVICE_SWITCH_TYPE
    }

    /// Source and destination platforms relayed by a device switch.
    pub fn device_switch(&self) -> Option<(TargetPlatform, TargetPlatform)> {
        if !self.is_device_switch() {
            return None;
        }
        let decode = |key| {
            self.attribute(key)
                .and_then(Attribute::as_int)
                .and_then(TargetPlatform::from_code)
        };
        Some((decode(SWITCH_SOURCE_ATTR)?, decode(SWITCH_TARGET_ATTR)?))
    }
}
