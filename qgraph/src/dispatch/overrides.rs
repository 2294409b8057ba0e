use std::collections::BTreeMap;

use derive_more::{Deref, From};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::DispatchingTable;
use crate::{
    error::{DispatchError, Result},
    ir::Graph,
    platform::TargetPlatform,
};

/// Platforms forced by the user, as operation name to platform code. Codes are validated only
/// when the overrides are merged into a graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref, From, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchingOverride(BTreeMap<String, i64>);

impl DispatchingOverride {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `operation` to `platform`, replacing any previous entry.
    pub fn append(&mut self, operation: impl Into<String>, platform: TargetPlatform) {
        self.0.insert(operation.into(), platform.code());
    }

    /// Same as [`Self::append`] with a raw code, which may not decode to any platform.
    pub fn append_code(&mut self, operation: impl Into<String>, code: i64) {
        self.0.insert(operation.into(), code);
    }
}

/// Merges `overrides` into the automatic `table`. Entries naming an operation absent from the
/// graph are skipped. Any code that is not a platform makes the whole merge fail and leaves
/// `table` as it was.
pub fn reconcile(
    graph: &Graph,
    table: &DispatchingTable,
    overrides: &DispatchingOverride,
) -> Result<DispatchingTable> {
    let mut forced = Vec::with_capacity(overrides.len());
    for (operation, code) in overrides.iter() {
        if !graph.contains_operation(operation) {
            debug!(
                "dispatching override for {} ignored, no such operation in graph {}",
                operation,
                graph.name()
            );
            continue;
        }
        let platform =
            TargetPlatform::from_code(*code).ok_or_else(|| DispatchError::InvalidPlatformCode {
                operation: operation.clone(),
                code: *code,
            })?;
        forced.push((operation.clone(), platform));
    }

    let mut merged = table.clone();
    for (operation, platform) in forced {
        if let Some(previous) = merged.insert(operation.as_str(), platform) {
            if previous != platform {
                info!(
                    "operation {} dispatched to {} by user, instead of {}",
                    operation, platform, previous
                );
            }
        }
    }
    Ok(merged)
}

/// Writes the platforms of `table` into the operations of `graph`. Nothing is written unless
/// every operation has an entry.
pub fn commit(graph: &mut Graph, table: &DispatchingTable) -> Result<()> {
    table.check_coverage(graph)?;
    for (operation, platform) in table.iter() {
        if graph.contains_operation(operation) {
            graph.set_platform(operation, *platform)?;
        }
    }
    Ok(())
}
