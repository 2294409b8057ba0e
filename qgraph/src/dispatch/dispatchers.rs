use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use super::{
    DispatchPrecedence, DispatchingTable, GraphDispatcher, SHAPE_SOURCE_TYPES, SOI_OPERATION_TYPES,
};
use crate::{
    error::Result,
    ir::{Graph, Operation},
    platform::TargetPlatform,
};

/// Platforms a dispatcher picks from.
#[derive(Debug, Clone, Copy)]
struct Targets {
    quant: TargetPlatform,
    fp32: TargetPlatform,
    soi: TargetPlatform,
}

impl Targets {
    fn pick(&self, soi: bool, quant: bool, precedence: DispatchPrecedence) -> TargetPlatform {
        match (soi, quant, precedence) {
            (true, true, DispatchPrecedence::ShapeOrIndexFirst) => self.soi,
            (true, true, DispatchPrecedence::QuantizationFirst) => self.quant,
            (true, false, _) => self.soi,
            (false, true, _) => self.quant,
            (false, false, _) => self.fp32,
        }
    }
}

/// Variables carrying shape values: outputs of a shape source, or of an operation whose
/// non-parameter inputs all carry shape values.
fn shape_derived_variables(graph: &Graph) -> Result<BTreeSet<String>> {
    let mut derived = BTreeSet::new();
    for name in graph.topological_sort()? {
        let Some(op) = graph.operation(name) else {
            continue;
        };
        let mut activations = op
            .inputs()
            .iter()
            .filter(|v| graph.variable(v).is_some_and(|v| !v.is_parameter()))
            .peekable();
        let from_shapes =
            activations.peek().is_some() && activations.all(|v| derived.contains(v.as_str()));
        if SHAPE_SOURCE_TYPES.contains(op.op_type()) || from_shapes {
            derived.extend(op.outputs().iter().cloned());
        }
    }
    Ok(derived)
}

/// Operations reachable from a graph input through non-parameter, non shape-derived variables.
fn main_numeric_path(graph: &Graph, shape_vars: &BTreeSet<String>) -> BTreeSet<String> {
    let mut reached = BTreeSet::new();
    let mut queue: VecDeque<&str> = graph.inputs().iter().map(String::as_str).collect();
    let mut visited = BTreeSet::new();
    while let Some(var) = queue.pop_front() {
        if !visited.insert(var) || shape_vars.contains(var) {
            continue;
        }
        let Some(variable) = graph.variable(var) else {
            continue;
        };
        if variable.is_parameter() {
            continue;
        }
        for op in variable.unique_dest_ops() {
            if reached.insert(op.to_string()) {
                if let Some(operation) = graph.operation(op) {
                    queue.extend(operation.outputs().iter().map(String::as_str));
                }
            }
        }
    }
    reached
}

/// Shared driver: switch operations always belong to the boundary, the rest is left to `classify`.
fn dispatch_with<F>(graph: &Graph, mut classify: F) -> DispatchingTable
where
    F: FnMut(&Operation) -> TargetPlatform,
{
    graph
        .operations()
        .values()
        .map(|op| {
            let platform = if op.is_device_switch() {
                TargetPlatform::Boundary
            } else {
                classify(op)
            };
            debug!("dispatch: {} ({}) -> {}", op.name(), op.op_type(), platform);
            (op.name().to_string(), platform)
        })
        .collect()
}

/// Classifies every operation by its type only.
#[derive(Debug, Clone, Default)]
pub struct PointwiseDispatcher {
    precedence: DispatchPrecedence,
}

impl PointwiseDispatcher {
    pub fn new(precedence: DispatchPrecedence) -> Self {
        Self { precedence }
    }
}

impl GraphDispatcher for PointwiseDispatcher {
    fn dispatch(
        &self,
        graph: &Graph,
        quant_types: &BTreeSet<String>,
        quant_platform: TargetPlatform,
        fp32_platform: TargetPlatform,
        soi_platform: TargetPlatform,
    ) -> Result<DispatchingTable> {
        let targets = Targets {
            quant: quant_platform,
            fp32: fp32_platform,
            soi: soi_platform,
        };
        Ok(dispatch_with(graph, |op| {
            targets.pick(
                SOI_OPERATION_TYPES.contains(op.op_type()),
                quant_types.contains(op.op_type()),
                self.precedence,
            )
        }))
    }
}

/// Traces shape values through the graph and only quantizes operations of the main numeric path.
/// Quantizable operations off that path fall back to fp32.
#[derive(Debug, Clone, Default)]
pub struct ConservativeDispatcher {
    precedence: DispatchPrecedence,
}

impl ConservativeDispatcher {
    pub fn new(precedence: DispatchPrecedence) -> Self {
        Self { precedence }
    }
}

impl GraphDispatcher for ConservativeDispatcher {
    fn dispatch(
        &self,
        graph: &Graph,
        quant_types: &BTreeSet<String>,
        quant_platform: TargetPlatform,
        fp32_platform: TargetPlatform,
        soi_platform: TargetPlatform,
    ) -> Result<DispatchingTable> {
        let targets = Targets {
            quant: quant_platform,
            fp32: fp32_platform,
            soi: soi_platform,
        };
        let shape_vars = shape_derived_variables(graph)?;
        let main_path = main_numeric_path(graph, &shape_vars);
        Ok(dispatch_with(graph, |op| {
            let soi = SOI_OPERATION_TYPES.contains(op.op_type())
                || op.outputs().iter().any(|v| shape_vars.contains(v));
            let quant = quant_types.contains(op.op_type()) && main_path.contains(op.name());
            targets.pick(soi, quant, self.precedence)
        }))
    }
}

/// Traces shape values like [`ConservativeDispatcher`], but quantizes every quantizable operation
/// wherever it sits.
#[derive(Debug, Clone, Default)]
pub struct AggressiveDispatcher {
    precedence: DispatchPrecedence,
}

impl AggressiveDispatcher {
    pub fn new(precedence: DispatchPrecedence) -> Self {
        Self { precedence }
    }
}

impl GraphDispatcher for AggressiveDispatcher {
    fn dispatch(
        &self,
        graph: &Graph,
        quant_types: &BTreeSet<String>,
        quant_platform: TargetPlatform,
        fp32_platform: TargetPlatform,
        soi_platform: TargetPlatform,
    ) -> Result<DispatchingTable> {
        let targets = Targets {
            quant: quant_platform,
            fp32: fp32_platform,
            soi: soi_platform,
        };
        let shape_vars = shape_derived_variables(graph)?;
        Ok(dispatch_with(graph, |op| {
            let soi = SOI_OPERATION_TYPES.contains(op.op_type())
                || op.outputs().iter().any(|v| shape_vars.contains(v));
            targets.pick(soi, quant_types.contains(op.op_type()), self.precedence)
        }))
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;
    use rstest::rstest;

    use super::*;
    use crate::{ir::Tensor, testing::GraphFixture};

    const Q: TargetPlatform = TargetPlatform::Unspecified;
    const F: TargetPlatform = TargetPlatform::Fp32;
    const S: TargetPlatform = TargetPlatform::ShapeOrIndex;

    fn quant_types(types: &[&str]) -> BTreeSet<String> {
        types.iter().map(|t| t.to_string()).collect()
    }

    /// `x -> conv -> relu -> out`, plus `x -> shape -> mul -> reshape(relu.out)` on the side and a
    /// quantizable `Mul` fed only by parameters.
    fn mixed_graph() -> Graph {
        GraphFixture::new("mixed")
            .input("x")
            .param("w", Tensor::zeros_f32(vec![2, 2, 1, 1]))
            .param("two", Tensor::vector_i64(vec![2]))
            .param("p1", Tensor::scalar_f32(1.0))
            .param("p2", Tensor::scalar_f32(2.0))
            .op("conv", "Conv", &["x", "w"], &["conv.out"])
            .op("relu", "Relu", &["conv.out"], &["relu.out"])
            .op("shape", "Shape", &["x"], &["shape.out"])
            .op("shape_mul", "Mul", &["shape.out", "two"], &["new_shape"])
            .op("reshape", "Reshape", &["relu.out", "new_shape"], &["out"])
            .op("const_mul", "Mul", &["p1", "p2"], &["const.out"])
            .output("out")
            .output("const.out")
            .build()
    }

    fn dispatch(dispatcher: &dyn GraphDispatcher, graph: &Graph) -> Vec<(String, TargetPlatform)> {
        dispatcher
            .dispatch(graph, &quant_types(&["Conv", "Relu", "Mul"]), Q, F, S)
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect_vec()
    }

    fn expected(entries: &[(&str, TargetPlatform)]) -> Vec<(String, TargetPlatform)> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .sorted()
            .collect_vec()
    }

    #[test]
    fn test_shape_derived_variables() {
        let graph = mixed_graph();
        let derived = shape_derived_variables(&graph).unwrap();
        assert_eq!(
            derived.into_iter().collect_vec(),
            vec!["new_shape".to_string(), "shape.out".to_string()]
        );
    }

    #[test]
    fn test_conservative_dispatch() {
        let graph = mixed_graph();
        assert_eq!(
            dispatch(&ConservativeDispatcher::default(), &graph),
            expected(&[
                ("conv", Q),
                ("relu", Q),
                ("shape", S),
                ("shape_mul", S),
                ("reshape", S),
                ("const_mul", F),
            ])
        );
    }

    #[test]
    fn test_aggressive_dispatch() {
        let graph = mixed_graph();
        assert_eq!(
            dispatch(&AggressiveDispatcher::default(), &graph),
            expected(&[
                ("conv", Q),
                ("relu", Q),
                ("shape", S),
                ("shape_mul", S),
                ("reshape", S),
                ("const_mul", Q),
            ])
        );
    }

    #[test]
    fn test_pointwise_dispatch() {
        let graph = mixed_graph();
        assert_eq!(
            dispatch(&PointwiseDispatcher::default(), &graph),
            expected(&[
                ("conv", Q),
                ("relu", Q),
                ("shape", S),
                ("shape_mul", Q),
                ("reshape", S),
                ("const_mul", Q),
            ])
        );
    }

    #[rstest]
    #[case(DispatchPrecedence::ShapeOrIndexFirst, S)]
    #[case(DispatchPrecedence::QuantizationFirst, Q)]
    fn test_precedence(#[case] precedence: DispatchPrecedence, #[case] gather: TargetPlatform) {
        let graph = GraphFixture::new("g")
            .input("x")
            .param("idx", Tensor::vector_i64(vec![0]))
            .op("gather", "Gather", &["x", "idx"], &["y"])
            .output("y")
            .build();
        let table = ConservativeDispatcher::new(precedence)
            .dispatch(&graph, &quant_types(&["Gather"]), Q, F, S)
            .unwrap();
        assert_eq!(table.get("gather"), Some(&gather));
    }

    #[test]
    fn test_switches_stay_on_the_boundary() {
        let graph = GraphFixture::new("g")
            .input("x")
            .op("switch", crate::ir::DEVICE_SWITCH_TYPE, &["x"], &["y"])
            .build();
        for dispatcher in [
            &PointwiseDispatcher::default() as &dyn GraphDispatcher,
            &ConservativeDispatcher::default(),
            &AggressiveDispatcher::default(),
        ] {
            assert_eq!(
                dispatch(dispatcher, &graph),
                vec![("switch".to_string(), TargetPlatform::Boundary)]
            );
        }
    }

    #[test]
    fn test_every_operation_is_dispatched() {
        let graph = crate::testing::conv_chain(8);
        let table = ConservativeDispatcher::default()
            .dispatch(&graph, &quant_types(&["Conv", "Relu"]), Q, F, S)
            .unwrap();
        table.check_coverage(&graph).unwrap();
        assert_eq!(table.len(), graph.operations().len());
    }
}
