//! Insertion of [`DEVICE_SWITCH_TYPE`] operations on the edges crossing two platforms, once every
//! operation of the graph has been dispatched.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use tracing::debug;

use crate::{
    error::Result,
    ir::{
        Attribute, Graph, Operation, Variable, DEVICE_SWITCH_TYPE, SWITCH_SOURCE_ATTR,
        SWITCH_TARGET_ATTR,
    },
    platform::TargetPlatform,
};

/// One relay to insert: `variable`, produced on `source`, read by `consumers` on `target`.
/// `relay` names the output of a switch already serving that pair.
#[derive(Debug)]
struct Crossing {
    variable: String,
    source: TargetPlatform,
    target: TargetPlatform,
    consumers: Vec<String>,
    relay: Option<String>,
}

/// Whether `switch` still matches the platforms of the operations around it: its source is the
/// producer of its input, its target is shared by every consumer, and the two differ.
fn is_valid_switch(graph: &Graph, switch: &Operation) -> bool {
    let Some((source, target)) = switch.device_switch() else {
        return false;
    };
    let producer = switch
        .inputs()
        .first()
        .and_then(|v| graph.variable(v))
        .and_then(|v| v.source_op())
        .and_then(|op| graph.operation(op));
    let Some(producer) = producer else {
        return false;
    };
    let consumers = switch
        .outputs()
        .first()
        .and_then(|v| graph.variable(v))
        .map(|v| v.unique_dest_ops())
        .unwrap_or_default();
    source != target
        && !producer.is_device_switch()
        && producer.platform() == source
        && !consumers.is_empty()
        && consumers.iter().all(|c| {
            graph
                .operation(c)
                .is_some_and(|op| !op.is_device_switch() && op.platform() == target)
        })
}

/// Splices out the switches left stale by a new dispatch: their consumers read the relayed
/// variable again. Returns the number of removed switches.
fn remove_stale_switches(graph: &mut Graph) -> Result<usize> {
    let stale = graph
        .operations()
        .values()
        .filter(|op| op.is_device_switch() && !is_valid_switch(graph, op))
        .filter(|op| {
            // a relay exposed as graph output has no consumer to hand back
            !op.outputs().iter().any(|o| graph.outputs().contains(o))
        })
        .map(|op| op.name().to_string())
        .collect_vec();
    for name in &stale {
        // read at splice time, a previous splice may have rewired the input
        let Some(op) = graph.operation(name) else {
            continue;
        };
        let (Some(input), Some(relay)) =
            (op.inputs().first().cloned(), op.outputs().first().cloned())
        else {
            continue;
        };
        let consumers = graph
            .variable(&relay)
            .map(|v| v.unique_dest_ops().into_iter().map(String::from).collect_vec())
            .unwrap_or_default();
        graph.remove_operation(name)?;
        for consumer in &consumers {
            graph.replace_input(consumer, &relay, &input)?;
        }
        graph.remove_variable(&relay)?;
        debug!("switch {} is stale, {} is read directly again", name, input);
    }
    Ok(stale.len())
}

/// Relays of the valid switches reading `var`, by destination platform.
fn existing_relays(graph: &Graph, var: &Variable) -> BTreeMap<TargetPlatform, String> {
    var.unique_dest_ops()
        .into_iter()
        .filter_map(|c| graph.operation(c))
        .filter(|op| is_valid_switch(graph, op))
        .filter_map(|op| Some((op.device_switch()?.1, op.outputs().first()?.clone())))
        .collect()
}

fn find_crossings(graph: &Graph) -> Vec<Crossing> {
    let mut crossings = vec![];
    for var in graph.variables().values() {
        let Some(producer) = var.source_op().and_then(|op| graph.operation(op)) else {
            continue;
        };
        if producer.is_device_switch() {
            continue;
        }
        let mut by_platform: BTreeMap<TargetPlatform, BTreeSet<String>> = BTreeMap::new();
        for consumer in var.unique_dest_ops() {
            let Some(op) = graph.operation(consumer) else {
                continue;
            };
            if !op.is_device_switch() && op.platform() != producer.platform() {
                by_platform
                    .entry(op.platform())
                    .or_default()
                    .insert(consumer.to_string());
            }
        }
        let mut relays = existing_relays(graph, var);
        crossings.extend(by_platform.into_iter().map(|(target, consumers)| Crossing {
            variable: var.name().to_string(),
            source: producer.platform(),
            target,
            consumers: consumers.into_iter().collect_vec(),
            relay: relays.remove(&target),
        }));
    }
    crossings
}

/// Inserts one device switch per (variable, destination platform) pair whose producer and
/// consumers sit on different platforms. Platforms of existing operations are left untouched.
/// Switches left over by an earlier dispatch are kept when they still match the platforms
/// around them and removed otherwise.
/// Returns the number of inserted switches; a graph switched already gets none.
pub fn insert_switchers(graph: &mut Graph) -> Result<usize> {
    let removed = remove_stale_switches(graph)?;
    if removed > 0 {
        debug!("removed {} stale switches", removed);
    }
    let mut inserted = 0;
    for crossing in find_crossings(graph) {
        if let Some(relay) = &crossing.relay {
            for consumer in &crossing.consumers {
                graph.replace_input(consumer, &crossing.variable, relay)?;
            }
            continue;
        }
        let name = graph.unique_name(&format!("{}.switch", crossing.variable));
        let attributes = BTreeMap::from([
            (
                SWITCH_SOURCE_ATTR.to_string(),
                Attribute::Int(crossing.source.code()),
            ),
            (
                SWITCH_TARGET_ATTR.to_string(),
                Attribute::Int(crossing.target.code()),
            ),
        ]);
        let consumers = crossing.consumers.iter().map(String::as_str).collect_vec();
        graph.insert_op_on_var(
            &name,
            DEVICE_SWITCH_TYPE,
            attributes,
            &crossing.variable,
            &consumers,
        )?;
        graph.set_platform(&name, TargetPlatform::Boundary)?;
        debug!(
            "switch {} relays {} from {} to {}",
            name, crossing.variable, crossing.source, crossing.target
        );
        inserted += 1;
    }
    Ok(inserted)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::GraphFixture;

    /// `a (INT8) -> b (INT8), c (FP32), d (FP32)` and `c -> e (SOI)`
    fn dispatched_graph() -> Graph {
        let mut graph = GraphFixture::new("g")
            .input("x")
            .op("a", "Conv", &["x"], &["a.out"])
            .op("b", "Relu", &["a.out"], &["b.out"])
            .op("c", "Softmax", &["a.out"], &["c.out"])
            .op("d", "Add", &["a.out", "a.out"], &["d.out"])
            .op("e", "Shape", &["c.out"], &["e.out"])
            .output("b.out")
            .output("d.out")
            .output("e.out")
            .build();
        for (op, platform) in [
            ("a", TargetPlatform::PplCudaInt8),
            ("b", TargetPlatform::PplCudaInt8),
            ("c", TargetPlatform::Fp32),
            ("d", TargetPlatform::Fp32),
            ("e", TargetPlatform::ShapeOrIndex),
        ] {
            graph.set_platform(op, platform).unwrap();
        }
        graph
    }

    /// Every edge either stays on one platform or goes through a switch matching both ends.
    fn assert_boundaries_complete(graph: &Graph) {
        for op in graph.operations().values() {
            for input in op.inputs() {
                let Some(producer) = graph
                    .variable(input)
                    .and_then(|v| v.source_op())
                    .and_then(|p| graph.operation(p))
                else {
                    continue;
                };
                if op.is_device_switch() {
                    let (source, target) = op.device_switch().unwrap();
                    assert_eq!(source, producer.platform());
                    assert_ne!(source, target, "{} relays within one platform", op.name());
                } else if producer.is_device_switch() {
                    let (_, target) = producer.device_switch().unwrap();
                    assert_eq!(target, op.platform());
                } else {
                    assert_eq!(producer.platform(), op.platform(), "{} -> {}", producer.name(), op.name());
                }
            }
        }
    }

    #[test]
    fn test_insert_switchers() {
        let mut graph = dispatched_graph();
        assert_eq!(insert_switchers(&mut graph).unwrap(), 2);
        graph.validate().unwrap();
        assert_boundaries_complete(&graph);

        let switches = graph
            .operations()
            .values()
            .filter(|op| op.is_device_switch())
            .collect_vec();
        assert!(switches
            .iter()
            .all(|op| op.platform() == TargetPlatform::Boundary));
        let fp32_switch = switches
            .iter()
            .find(|op| op.device_switch() == Some((TargetPlatform::PplCudaInt8, TargetPlatform::Fp32)))
            .unwrap();
        // c and d share the same relay
        assert_eq!(graph.downstream_operations(fp32_switch.name()), vec!["c", "d"]);
        assert_eq!(graph.operation("b").unwrap().inputs(), &["a.out"]);
        assert_eq!(graph.operation("a").unwrap().platform(), TargetPlatform::PplCudaInt8);
    }

    #[test]
    fn test_insert_switchers_twice_inserts_nothing() {
        let mut graph = dispatched_graph();
        insert_switchers(&mut graph).unwrap();
        let once = graph.clone();
        assert_eq!(insert_switchers(&mut graph).unwrap(), 0);
        assert_eq!(graph, once);
    }

    #[test]
    fn test_single_platform_graph_is_untouched() {
        let mut graph = crate::testing::conv_chain(3);
        let names = graph.operations().keys().cloned().collect_vec();
        for op in &names {
            graph.set_platform(op, TargetPlatform::Fp32).unwrap();
        }
        assert_eq!(insert_switchers(&mut graph).unwrap(), 0);
        assert_eq!(graph.operations().len(), names.len());
    }

    #[test]
    fn test_stale_switches_are_replaced() {
        let mut graph = dispatched_graph();
        assert_eq!(insert_switchers(&mut graph).unwrap(), 2);
        // c joins a on INT8, e joins c
        graph.set_platform("c", TargetPlatform::PplCudaInt8).unwrap();
        graph.set_platform("e", TargetPlatform::PplCudaInt8).unwrap();

        assert_eq!(insert_switchers(&mut graph).unwrap(), 1);
        graph.validate().unwrap();
        assert_boundaries_complete(&graph);
        let switches = graph
            .operations()
            .values()
            .filter(|op| op.is_device_switch())
            .collect_vec();
        assert_eq!(switches.len(), 1);
        assert_eq!(graph.downstream_operations(switches[0].name()), vec!["d"]);
        assert_eq!(graph.operation("c").unwrap().inputs(), &["a.out"]);
        assert_eq!(graph.operation("e").unwrap().inputs(), &["c.out"]);
    }

    #[test]
    fn test_valid_switch_is_reused() {
        let mut graph = dispatched_graph();
        insert_switchers(&mut graph).unwrap();
        graph.create_variable("f.out", None).unwrap();
        graph
            .create_operation(
                "f",
                "Relu",
                Default::default(),
                vec!["a.out".into()],
                vec!["f.out".into()],
            )
            .unwrap();
        graph.set_platform("f", TargetPlatform::Fp32).unwrap();

        assert_eq!(insert_switchers(&mut graph).unwrap(), 0);
        graph.validate().unwrap();
        assert_boundaries_complete(&graph);
        let relay = &graph.operation("c").unwrap().inputs()[0];
        assert_eq!(&graph.operation("f").unwrap().inputs()[0], relay);
    }
}
