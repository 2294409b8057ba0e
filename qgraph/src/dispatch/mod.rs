//! Module assigning a [`TargetPlatform`] to every operation of a [`Graph`].
//!
//! A [`GraphDispatcher`] proposes a [`DispatchingTable`] from the structure of the graph only.
//! User overrides are then merged on top of it by [`reconcile`] and the result is written to the
//! operations by [`commit`].

mod dispatchers;
mod overrides;

use derive_more::{Deref, From};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use crate::{
    error::{DispatchError, Result},
    ir::Graph,
    platform::TargetPlatform,
};
pub use dispatchers::{AggressiveDispatcher, ConservativeDispatcher, PointwiseDispatcher};
pub use overrides::{commit, reconcile, DispatchingOverride};

/// Operation types whose result is a shape or an index, always executed on the shape platform.
pub static SOI_OPERATION_TYPES: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    BTreeSet::from([
        "Shape",
        "Size",
        "Reshape",
        "Squeeze",
        "Unsqueeze",
        "Gather",
        "GatherElements",
        "GatherND",
        "NonZero",
        "ConstantOfShape",
        "Range",
        "ArgMax",
        "ArgMin",
    ])
});

/// Operation types producing shape values out of numeric tensors.
pub static SHAPE_SOURCE_TYPES: Lazy<BTreeSet<&'static str>> =
    Lazy::new(|| BTreeSet::from(["Shape", "Size", "NonZero"]));

/// Operation name to platform, one entry per operation of the dispatched graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, From, Serialize, Deserialize)]
pub struct DispatchingTable(BTreeMap<String, TargetPlatform>);

impl DispatchingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, op: impl Into<String>, platform: TargetPlatform) -> Option<TargetPlatform> {
        self.0.insert(op.into(), platform)
    }

    /// Fails on the first operation of `graph` missing from the table.
    pub fn check_coverage(&self, graph: &Graph) -> Result<()> {
        match graph.operations().keys().find(|op| !self.0.contains_key(*op)) {
            Some(missing) => Err(DispatchError::MissingDispatch(missing.clone())),
            None => Ok(()),
        }
    }
}

impl FromIterator<(String, TargetPlatform)> for DispatchingTable {
    fn from_iter<I: IntoIterator<Item = (String, TargetPlatform)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Which classification wins when an operation is both a shape/index kind and a quantizable kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPrecedence {
    #[default]
    ShapeOrIndexFirst,
    QuantizationFirst,
}

/// Proposes a platform for every operation of a graph.
pub trait GraphDispatcher {
    fn dispatch(
        &self,
        graph: &Graph,
        quant_types: &BTreeSet<String>,
        quant_platform: TargetPlatform,
        fp32_platform: TargetPlatform,
        soi_platform: TargetPlatform,
    ) -> Result<DispatchingTable>;
}

/// The dispatchers selectable by name from a quantization setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DispatcherKind {
    #[default]
    Conservative,
    Aggressive,
    Pointwise,
}

impl DispatcherKind {
    pub const ALL: [DispatcherKind; 3] = [
        DispatcherKind::Conservative,
        DispatcherKind::Aggressive,
        DispatcherKind::Pointwise,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DispatcherKind::Conservative => "conservative",
            DispatcherKind::Aggressive => "aggressive",
            DispatcherKind::Pointwise => "pointwise",
        }
    }

    pub fn dispatcher(&self, precedence: DispatchPrecedence) -> Box<dyn GraphDispatcher> {
        match self {
            DispatcherKind::Conservative => Box::new(ConservativeDispatcher::new(precedence)),
            DispatcherKind::Aggressive => Box::new(AggressiveDispatcher::new(precedence)),
            DispatcherKind::Pointwise => Box::new(PointwiseDispatcher::new(precedence)),
        }
    }
}

impl fmt::Display for DispatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DispatcherKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_ascii_lowercase();
        DispatcherKind::ALL
            .into_iter()
            .find(|kind| kind.name() == lowered)
            .ok_or_else(|| DispatchError::UnknownDispatcher(s.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::GraphFixture;

    #[test]
    fn test_dispatcher_kind_from_name() {
        assert_eq!(
            "conservative".parse::<DispatcherKind>().unwrap(),
            DispatcherKind::Conservative
        );
        assert_eq!(
            "Pointwise".parse::<DispatcherKind>().unwrap(),
            DispatcherKind::Pointwise
        );
        let err = "greedy".parse::<DispatcherKind>().unwrap_err();
        assert!(matches!(err, DispatchError::UnknownDispatcher(ref n) if n == "greedy"));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_check_coverage() {
        let graph = GraphFixture::new("g")
            .input("x")
            .op("a", "Relu", &["x"], &["y"])
            .op("b", "Relu", &["y"], &["z"])
            .build();
        let mut table = DispatchingTable::new();
        table.insert("a", TargetPlatform::Fp32);
        assert!(matches!(
            table.check_coverage(&graph),
            Err(DispatchError::MissingDispatch(ref op)) if op == "b"
        ));
        table.insert("b", TargetPlatform::Fp32);
        table.check_coverage(&graph).unwrap();
    }
}
