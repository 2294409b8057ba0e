use std::collections::{BTreeSet, VecDeque};

use anyhow::Result;
use itertools::Itertools;
use tracing::warn;

use crate::ir::Graph;

/// Operations from which some graph output can be reached.
fn contributing_operations(graph: &Graph) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<&str> = graph
        .outputs()
        .iter()
        .filter_map(|v| graph.variable(v)?.source_op())
        .collect();
    while let Some(op) = queue.pop_front() {
        if seen.insert(op.to_string()) {
            queue.extend(graph.upstream_operations(op));
        }
    }
    seen
}

pub(super) fn delete_isolated(graph: &mut Graph) -> Result<usize> {
    let mut removed = 0;
    if graph.outputs().is_empty() {
        warn!(
            "graph {} declares no output, only unreferenced variables are removed",
            graph.name()
        );
    } else {
        let alive = contributing_operations(graph);
        let dead = graph
            .operations()
            .keys()
            .filter(|op| !alive.contains(*op))
            .cloned()
            .collect_vec();
        for op in dead {
            graph.remove_operation(&op)?;
            removed += 1;
        }
    }

    let unreferenced = graph
        .variables()
        .values()
        .filter(|v| v.source_op().is_none() && v.dest_ops().is_empty())
        .filter(|v| !graph.inputs().iter().any(|i| i == v.name()))
        .filter(|v| !graph.outputs().iter().any(|o| o == v.name()))
        .map(|v| v.name().to_string())
        .collect_vec();
    for var in unreferenced {
        graph.remove_variable(&var)?;
        removed += 1;
    }
    Ok(removed)
}
