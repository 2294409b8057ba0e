use anyhow::Result;
use itertools::Itertools;

use crate::ir::Graph;

/// Gives every consumer of a shared parameter its own copy. The consumer first in name order
/// keeps the original variable.
pub(super) fn format_parameter_variables(graph: &mut Graph) -> Result<usize> {
    let shared = graph
        .variables()
        .values()
        .filter(|v| v.is_parameter() && v.source_op().is_none())
        .filter_map(|v| {
            let consumers = v.unique_dest_ops();
            (consumers.len() > 1).then(|| {
                (
                    v.name().to_string(),
                    v.value().cloned(),
                    consumers[1..].iter().map(|s| s.to_string()).collect_vec(),
                )
            })
        })
        .collect_vec();

    let mut copies = 0;
    for (name, value, consumers) in shared {
        for consumer in consumers {
            let copy = graph.unique_name(&name);
            graph.create_variable(copy.as_str(), value.clone())?;
            graph.replace_input(&consumer, &name, &copy)?;
            copies += 1;
        }
    }
    Ok(copies)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ir::Tensor, testing::GraphFixture};

    #[test]
    fn test_shared_parameter_is_split() {
        let w = Tensor::from_f32(vec![2], vec![1.0, 2.0]).unwrap();
        let mut graph = GraphFixture::new("g")
            .input("x")
            .param("w", w.clone())
            .op("a", "Mul", &["x", "w"], &["a_out"])
            .op("b", "Add", &["a_out", "w"], &["b_out"])
            .op("c", "Mul", &["b_out", "w"], &["y"])
            .output("y")
            .build();
        assert_eq!(format_parameter_variables(&mut graph).unwrap(), 2);
        graph.validate().unwrap();

        let owners = ["a", "b", "c"]
            .iter()
            .map(|op| graph.operation(op).unwrap().inputs()[1].clone())
            .collect_vec();
        assert!(owners.iter().all_unique());
        for owner in &owners {
            let var = graph.variable(owner).unwrap();
            assert_eq!(var.value(), Some(&w));
            assert_eq!(var.unique_dest_ops().len(), 1);
        }
        assert_eq!(format_parameter_variables(&mut graph).unwrap(), 0);
    }

    #[test]
    fn test_same_operation_reading_twice_is_not_split() {
        let mut graph = GraphFixture::new("g")
            .param("w", Tensor::scalar_f32(1.0))
            .op("sq", "Mul", &["w", "w"], &["y"])
            .output("y")
            .build();
        assert_eq!(format_parameter_variables(&mut graph).unwrap(), 0);
    }

    #[test]
    fn test_activations_are_not_split() {
        let mut graph = GraphFixture::new("g")
            .input("x")
            .op("a", "Relu", &["x"], &["a_out"])
            .op("b", "Relu", &["x"], &["b_out"])
            .build();
        assert_eq!(format_parameter_variables(&mut graph).unwrap(), 0);
        assert_eq!(graph.variable("x").unwrap().unique_dest_ops().len(), 2);
    }
}
