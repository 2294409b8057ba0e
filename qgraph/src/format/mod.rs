//! Structural rewrites applied to a freshly parsed [`Graph`] before it is dispatched. Each
//! command leaves an already formatted graph untouched, so [`format_graph`] can safely run more
//! than once on the same graph.

mod batchnorm;
mod canonical;
mod constant;
mod isolated;
mod parameters;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::ir::Graph;
pub use canonical::DataType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraphCommand {
    /// Turn every `Constant` operation into a parameter variable.
    FormatConstantInput,
    /// Fold batch normalizations into the preceding convolution or gemm.
    FuseBn,
    /// Split parameters shared by several operations.
    FormatParameters,
    FormatCast,
    FormatSlice,
    FormatClip,
    /// Remove operations and variables that do not contribute to any graph output.
    DeleteIsolated,
}

impl fmt::Display for GraphCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Order in which [`format_graph`] runs the commands.
pub const FORMAT_SEQUENCE: [GraphCommand; 7] = [
    GraphCommand::FormatConstantInput,
    GraphCommand::FuseBn,
    GraphCommand::FormatParameters,
    GraphCommand::FormatCast,
    GraphCommand::FormatSlice,
    GraphCommand::FormatClip,
    GraphCommand::DeleteIsolated,
];

/// Applies [`GraphCommand`]s to the graph it borrows.
pub struct GraphFormatter<'a> {
    graph: &'a mut Graph,
}

impl<'a> GraphFormatter<'a> {
    pub fn new(graph: &'a mut Graph) -> Self {
        Self { graph }
    }

    /// Runs a single command, returns the number of rewritten nodes.
    pub fn process(&mut self, command: GraphCommand) -> Result<usize> {
        let rewritten = match command {
            GraphCommand::FormatConstantInput => constant::format_constant_input(self.graph),
            GraphCommand::FuseBn => batchnorm::fuse_bn(self.graph),
            GraphCommand::FormatParameters => parameters::format_parameter_variables(self.graph),
            GraphCommand::FormatCast => canonical::format_cast(self.graph),
            GraphCommand::FormatSlice => canonical::format_slice(self.graph),
            GraphCommand::FormatClip => canonical::format_clip(self.graph),
            GraphCommand::DeleteIsolated => isolated::delete_isolated(self.graph),
        }
        .with_context(|| format!("while processing {command}"))?;
        debug!(
            "format: {} rewrote {} node(s) of graph {}",
            command,
            rewritten,
            self.graph.name()
        );
        Ok(rewritten)
    }
}

/// Brings a parsed graph into the form expected by the dispatchers: no constant operation, no
/// foldable batch normalization, no shared parameter, canonical cast/slice/clip and no isolated
/// node.
pub fn format_graph(graph: &mut Graph) -> Result<()> {
    let mut formatter = GraphFormatter::new(graph);
    for command in FORMAT_SEQUENCE {
        formatter.process(command)?;
    }
    graph.validate().context("graph is inconsistent after formatting")
}
