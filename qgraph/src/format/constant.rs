use anyhow::{anyhow, ensure, Result};
use itertools::Itertools;

use crate::ir::{Attribute, Graph, Tensor};

const CONSTANT_TYPE: &str = "Constant";

/// Value carried by a constant operation, whichever attribute holds it.
fn constant_value(attribute: &Attribute) -> Result<Tensor> {
    Ok(match attribute {
        Attribute::Tensor(t) => t.clone(),
        Attribute::Float(f) => Tensor::scalar_f32(*f),
        Attribute::Int(i) => Tensor::from_i64(vec![], vec![*i])?,
        Attribute::Floats(v) => Tensor::from_f32(vec![v.len()], v.clone())?,
        Attribute::Ints(v) => Tensor::vector_i64(v.clone()),
        Attribute::String(s) => {
            return Err(anyhow!("string constants ({}) are not supported", s));
        }
    })
}

pub(super) fn format_constant_input(graph: &mut Graph) -> Result<usize> {
    let constants = graph
        .operations()
        .values()
        .filter(|op| op.op_type() == CONSTANT_TYPE)
        .map(|op| op.name().to_string())
        .collect_vec();

    for name in &constants {
        let op = graph
            .operation(name)
            .ok_or(anyhow!("constant {} vanished", name))?;
        ensure!(
            op.inputs().is_empty() && op.outputs().len() == 1,
            "constant {} must have no input and exactly one output",
            name
        );
        let attribute = ["value", "value_float", "value_floats", "value_int", "value_ints"]
            .iter()
            .find_map(|key| op.attribute(key))
            .ok_or(anyhow!("constant {} does not carry any value", name))?;
        let value = constant_value(attribute)?;
        let output = op.outputs()[0].clone();

        graph.remove_operation(name)?;
        graph.set_value(&output, value)?;
    }
    Ok(constants.len())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::GraphFixture;

    #[test]
    fn test_constant_becomes_parameter() {
        let mut graph = GraphFixture::new("g")
            .input("x")
            .op_with(
                "shape_const",
                "Constant",
                &[],
                &["shape"],
                vec![("value_ints", Attribute::Ints(vec![1, -1]))],
            )
            .op("reshape", "Reshape", &["x", "shape"], &["y"])
            .output("y")
            .build();
        assert_eq!(format_constant_input(&mut graph).unwrap(), 1);
        let shape = graph.variable("shape").unwrap();
        assert!(shape.is_parameter());
        assert!(shape.source_op().is_none());
        assert_eq!(shape.value(), Some(&Tensor::vector_i64(vec![1, -1])));
        assert_eq!(shape.dest_ops(), &["reshape".to_string()]);
        assert!(graph.operation("shape_const").is_none());
        graph.validate().unwrap();

        assert_eq!(format_constant_input(&mut graph).unwrap(), 0);
    }

    #[test]
    fn test_constant_without_value_fails() {
        let mut graph = GraphFixture::new("g")
            .op("c", "Constant", &[], &["c_out"])
            .build();
        assert!(format_constant_input(&mut graph).is_err());
    }
}
