//! Helpers to build small graphs in tests and benches.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::ir::{Attribute, Graph, Tensor};

/// Builder creating variables on first use, so that operations can be declared in any order.
pub struct GraphFixture {
    graph: Graph,
}

impl GraphFixture {
    pub fn new(name: &str) -> Self {
        Self {
            graph: Graph::new(name),
        }
    }

    fn ensure_var(&mut self, name: &str) {
        if self.graph.variable(name).is_none() {
            self.graph.create_variable(name, None).unwrap();
        }
    }

    pub fn input(mut self, name: &str) -> Self {
        self.ensure_var(name);
        self.graph.mark_input(name).unwrap();
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.ensure_var(name);
        self.graph.mark_output(name).unwrap();
        self
    }

    pub fn param(mut self, name: &str, value: Tensor) -> Self {
        self.graph.create_variable(name, Some(value)).unwrap();
        self
    }

    pub fn op(self, name: &str, op_type: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        self.op_with(name, op_type, inputs, outputs, vec![])
    }

    pub fn op_with(
        mut self,
        name: &str,
        op_type: &str,
        inputs: &[&str],
        outputs: &[&str],
        attributes: Vec<(&str, Attribute)>,
    ) -> Self {
        for var in inputs.iter().chain(outputs.iter()) {
            self.ensure_var(var);
        }
        let attributes: BTreeMap<String, Attribute> = attributes
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.graph
            .create_operation(
                name,
                op_type,
                attributes,
                inputs.iter().map(|s| s.to_string()).collect_vec(),
                outputs.iter().map(|s| s.to_string()).collect_vec(),
            )
            .unwrap();
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// A float tensor of the given shape filled with `1, 2, 3, ...`
pub fn iota_f32(shape: Vec<usize>) -> Tensor {
    let len = shape.iter().product::<usize>();
    Tensor::from_f32(shape, (1..=len).map(|x| x as f32).collect()).unwrap()
}

/// A chain of `len` convolution/relu blocks followed by a reshape, used to exercise the whole
/// pipeline on something bigger than a handful of nodes.
pub fn conv_chain(len: usize) -> Graph {
    let mut fixture = GraphFixture::new("conv_chain").input("input");
    let mut prev = "input".to_string();
    for i in 0..len {
        let w = format!("conv_{i}.weight");
        let b = format!("conv_{i}.bias");
        let conv_out = format!("conv_{i}.out");
        let relu_out = format!("relu_{i}.out");
        fixture = fixture
            .param(&w, iota_f32(vec![4, 4, 3, 3]))
            .param(&b, Tensor::zeros_f32(vec![4]))
            .op(&format!("conv_{i}"), "Conv", &[&prev, &w, &b], &[&conv_out])
            .op(&format!("relu_{i}"), "Relu", &[&conv_out], &[&relu_out]);
        prev = relu_out;
    }
    fixture
        .op("shape", "Shape", &[&prev], &["shape.out"])
        .op("reshape", "Reshape", &[&prev, "shape.out"], &["output"])
        .output("output")
        .build()
}
