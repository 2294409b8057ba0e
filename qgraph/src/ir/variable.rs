use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::tensor::Tensor;

/// An edge carrier of the [`super::Graph`]: either an activation produced by an operation, or a
/// parameter owning its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub(crate) name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) value: Option<Tensor>,
    #[serde(default)]
    pub(crate) is_parameter: bool,
    // links are rebuilt from the operations when a graph is loaded
    #[serde(skip)]
    pub(crate) source_op: Option<String>,
    // one entry per consuming input slot, kept sorted
    #[serde(skip)]
    pub(crate) dest_ops: Vec<String>,
}

impl Variable {
    pub(crate) fn new(name: String, value: Option<Tensor>, is_parameter: bool) -> Self {
        Self {
            name,
            value,
            is_parameter,
            source_op: None,
            dest_ops: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    pub fn is_parameter(&self) -> bool {
        self.is_parameter
    }

    pub fn source_op(&self) -> Option<&str> {
        self.source_op.as_deref()
    }

    pub fn dest_ops(&self) -> &[String] {
        &self.dest_ops
    }

    /// Consumers of the variable, each listed once, in name order.
    pub fn unique_dest_ops(&self) -> Vec<&str> {
        self.dest_ops.iter().map(String::as_str).unique().collect_vec()
    }

    pub(crate) fn link_consumer(&mut self, op: &str) {
        let at = self.dest_ops.partition_point(|d| d.as_str() <= op);
        self.dest_ops.insert(at, op.to_string());
    }
}
