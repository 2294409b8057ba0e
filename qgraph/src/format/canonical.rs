//! Canonical forms of `Cast`, `Slice` and `Clip`, which exchange formats express in several
//! ways depending on the opset: the cast target becomes a [`DataType`] name, slice and clip
//! bounds become parameter inputs.

use anyhow::{anyhow, bail, ensure, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ir::{Attribute, Graph, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float32,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    String,
    Bool,
    Float16,
    Float64,
    Uint32,
    Uint64,
    Bfloat16,
}

impl DataType {
    /// Decodes the element type codes of the onnx protobuf.
    pub fn from_onnx(code: i64) -> Option<Self> {
        Some(match code {
            1 => DataType::Float32,
            2 => DataType::Uint8,
            3 => DataType::Int8,
            4 => DataType::Uint16,
            5 => DataType::Int16,
            6 => DataType::Int32,
            7 => DataType::Int64,
            8 => DataType::String,
            9 => DataType::Bool,
            10 => DataType::Float16,
            11 => DataType::Float64,
            12 => DataType::Uint32,
            13 => DataType::Uint64,
            16 => DataType::Bfloat16,
            _ => return None,
        })
    }

    /// Accepts canonical names and the usual aliases, case insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "float32" | "float" | "fp32" => DataType::Float32,
            "uint8" => DataType::Uint8,
            "int8" => DataType::Int8,
            "uint16" => DataType::Uint16,
            "int16" => DataType::Int16,
            "int32" | "int" => DataType::Int32,
            "int64" | "long" => DataType::Int64,
            "string" => DataType::String,
            "bool" => DataType::Bool,
            "float16" | "half" | "fp16" => DataType::Float16,
            "float64" | "double" => DataType::Float64,
            "uint32" => DataType::Uint32,
            "uint64" => DataType::Uint64,
            "bfloat16" | "bf16" => DataType::Bfloat16,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Float32 => "float32",
            DataType::Uint8 => "uint8",
            DataType::Int8 => "int8",
            DataType::Uint16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::String => "string",
            DataType::Bool => "bool",
            DataType::Float16 => "float16",
            DataType::Float64 => "float64",
            DataType::Uint32 => "uint32",
            DataType::Uint64 => "uint64",
            DataType::Bfloat16 => "bfloat16",
        }
    }
}

fn operations_of_type(graph: &Graph, op_type: &str) -> Vec<String> {
    graph
        .operations()
        .values()
        .filter(|op| op.op_type() == op_type)
        .map(|op| op.name().to_string())
        .collect_vec()
}

/// Creates a parameter variable named after `op` and appends it to its inputs.
fn append_parameter(graph: &mut Graph, op: &str, suffix: &str, value: Tensor) -> Result<()> {
    let name = graph.unique_name(&format!("{op}.{suffix}"));
    graph.create_variable(name.as_str(), Some(value))?;
    graph.append_parameter_input(op, &name)
}

pub(super) fn format_cast(graph: &mut Graph) -> Result<usize> {
    let mut rewritten = 0;
    for name in operations_of_type(graph, "Cast") {
        let op = graph
            .operation(&name)
            .ok_or(anyhow!("cast {} vanished", name))?;
        let target = match op.attribute("to") {
            Some(Attribute::Int(code)) => DataType::from_onnx(*code)
                .ok_or(anyhow!("cast {} targets unknown data type code {}", name, code))?,
            Some(Attribute::String(s)) => DataType::from_name(s)
                .ok_or(anyhow!("cast {} targets unknown data type {}", name, s))?,
            Some(other) => bail!("cast {} has a malformed target {:?}", name, other),
            None => bail!("cast {} has no target data type", name),
        };
        let canonical = Attribute::String(target.name().to_string());
        if op.attribute("to") != Some(&canonical) {
            graph.set_attribute(&name, "to", canonical)?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

pub(super) fn format_slice(graph: &mut Graph) -> Result<usize> {
    let mut rewritten = 0;
    for name in operations_of_type(graph, "Slice") {
        let op = graph
            .operation(&name)
            .ok_or(anyhow!("slice {} vanished", name))?;
        let num_inputs = op.inputs().len();
        let legacy = op.attribute("starts").is_some() || op.attribute("ends").is_some();

        if legacy {
            ensure!(
                num_inputs == 1,
                "slice {} mixes attribute and input bounds",
                name
            );
            let ints = |key: &str| op.attribute(key).and_then(Attribute::as_ints).map(<[i64]>::to_vec);
            let starts = ints("starts").ok_or(anyhow!("slice {} has no starts", name))?;
            let ends = ints("ends").ok_or(anyhow!("slice {} has no ends", name))?;
            ensure!(
                starts.len() == ends.len(),
                "slice {} has {} starts but {} ends",
                name,
                starts.len(),
                ends.len()
            );
            let axes = ints("axes").unwrap_or_else(|| (0..starts.len() as i64).collect());
            ensure!(
                axes.len() == starts.len(),
                "slice {} has {} starts but {} axes",
                name,
                starts.len(),
                axes.len()
            );
            let steps = vec![1; starts.len()];
            for key in ["starts", "ends", "axes"] {
                graph.remove_attribute(&name, key)?;
            }
            append_parameter(graph, &name, "starts", Tensor::vector_i64(starts))?;
            append_parameter(graph, &name, "ends", Tensor::vector_i64(ends))?;
            append_parameter(graph, &name, "axes", Tensor::vector_i64(axes))?;
            append_parameter(graph, &name, "steps", Tensor::vector_i64(steps))?;
            rewritten += 1;
        } else if num_inputs == 3 || num_inputs == 4 {
            // optional axes and steps are filled from the length of starts, when it is known
            let Some(rank) = graph
                .variable(&op.inputs()[1])
                .and_then(|v| v.value())
                .map(Tensor::len)
            else {
                continue;
            };
            if num_inputs == 3 {
                append_parameter(graph, &name, "axes", Tensor::vector_i64((0..rank as i64).collect()))?;
            }
            append_parameter(graph, &name, "steps", Tensor::vector_i64(vec![1; rank]))?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

pub(super) fn format_clip(graph: &mut Graph) -> Result<usize> {
    let mut rewritten = 0;
    for name in operations_of_type(graph, "Clip") {
        let op = graph
            .operation(&name)
            .ok_or(anyhow!("clip {} vanished", name))?;
        let num_inputs = op.inputs().len();
        let legacy = op.attribute("min").is_some() || op.attribute("max").is_some();
        if num_inputs >= 3 && !legacy {
            continue;
        }
        ensure!(
            !legacy || num_inputs == 1,
            "clip {} mixes attribute and input bounds",
            name
        );
        let bound = |key: &str| op.attribute(key).and_then(Attribute::as_float);
        let min = bound("min").unwrap_or(f32::MIN);
        let max = bound("max").unwrap_or(f32::MAX);

        graph.remove_attribute(&name, "min")?;
        graph.remove_attribute(&name, "max")?;
        if num_inputs == 1 {
            append_parameter(graph, &name, "min", Tensor::scalar_f32(min))?;
        }
        append_parameter(graph, &name, "max", Tensor::scalar_f32(max))?;
        rewritten += 1;
    }
    Ok(rewritten)
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;
    use crate::testing::GraphFixture;

    #[rstest]
    #[case(Attribute::Int(1), "float32")]
    #[case(Attribute::Int(7), "int64")]
    #[case(Attribute::String("FLOAT".to_string()), "float32")]
    #[case(Attribute::String("half".to_string()), "float16")]
    #[case(Attribute::String("int64".to_string()), "int64")]
    fn test_format_cast(#[case] to: Attribute, #[case] expected: &str) {
        let mut graph = GraphFixture::new("g")
            .input("x")
            .op_with("cast", "Cast", &["x"], &["y"], vec![("to", to)])
            .build();
        format_cast(&mut graph).unwrap();
        assert_eq!(
            graph.operation("cast").unwrap().attribute("to"),
            Some(&Attribute::String(expected.to_string()))
        );
        assert_eq!(format_cast(&mut graph).unwrap(), 0);
    }

    #[test]
    fn test_format_cast_rejects_unknown_type() {
        let mut graph = GraphFixture::new("g")
            .input("x")
            .op_with("cast", "Cast", &["x"], &["y"], vec![("to", Attribute::Int(42))])
            .build();
        assert!(format_cast(&mut graph).is_err());
    }

    #[test]
    fn test_format_legacy_slice() {
        let mut graph = GraphFixture::new("g")
            .input("x")
            .op_with(
                "slice",
                "Slice",
                &["x"],
                &["y"],
                vec![
                    ("starts", Attribute::Ints(vec![0, 1])),
                    ("ends", Attribute::Ints(vec![2, 3])),
                ],
            )
            .build();
        assert_eq!(format_slice(&mut graph).unwrap(), 1);
        graph.validate().unwrap();
        let op = graph.operation("slice").unwrap();
        assert!(op.attributes().is_empty());
        let values = op.inputs()[1..]
            .iter()
            .map(|v| graph.variable(v).unwrap().value().unwrap().clone())
            .collect_vec();
        assert_eq!(
            values,
            vec![
                Tensor::vector_i64(vec![0, 1]),
                Tensor::vector_i64(vec![2, 3]),
                Tensor::vector_i64(vec![0, 1]),
                Tensor::vector_i64(vec![1, 1]),
            ]
        );
        assert_eq!(format_slice(&mut graph).unwrap(), 0);
    }

    #[test]
    fn test_format_legacy_slice_rejects_mismatched_axes() {
        let mut graph = GraphFixture::new("g")
            .input("x")
            .op_with(
                "slice",
                "Slice",
                &["x"],
                &["y"],
                vec![
                    ("starts", Attribute::Ints(vec![0, 1])),
                    ("ends", Attribute::Ints(vec![2, 3])),
                    ("axes", Attribute::Ints(vec![0])),
                ],
            )
            .build();
        let before = graph.clone();
        assert!(format_slice(&mut graph).is_err());
        assert_eq!(graph, before);
    }

    #[test]
    fn test_format_slice_fills_optional_inputs() {
        let mut graph = GraphFixture::new("g")
            .input("x")
            .param("starts", Tensor::vector_i64(vec![1]))
            .param("ends", Tensor::vector_i64(vec![4]))
            .op("slice", "Slice", &["x", "starts", "ends"], &["y"])
            .build();
        assert_eq!(format_slice(&mut graph).unwrap(), 1);
        assert_eq!(graph.operation("slice").unwrap().inputs().len(), 5);
        assert_eq!(format_slice(&mut graph).unwrap(), 0);
    }

    #[test]
    fn test_format_clip() {
        let mut graph = GraphFixture::new("g")
            .input("x")
            .op_with("relu6", "Clip", &["x"], &["y"], vec![("max", Attribute::Float(6.0))])
            .param("lo", Tensor::scalar_f32(-1.0))
            .op("half_clip", "Clip", &["y", "lo"], &["z"])
            .build();
        assert_eq!(format_clip(&mut graph).unwrap(), 2);
        graph.validate().unwrap();

        let bounds = |op: &str| {
            graph.operation(op).unwrap().inputs()[1..]
                .iter()
                .map(|v| graph.variable(v).unwrap().value().unwrap().clone())
                .collect_vec()
        };
        assert_eq!(
            bounds("relu6"),
            vec![Tensor::scalar_f32(f32::MIN), Tensor::scalar_f32(6.0)]
        );
        assert_eq!(
            bounds("half_clip"),
            vec![Tensor::scalar_f32(-1.0), Tensor::scalar_f32(f32::MAX)]
        );
        assert!(graph.operation("relu6").unwrap().attributes().is_empty());
        assert_eq!(format_clip(&mut graph).unwrap(), 0);
    }
}
