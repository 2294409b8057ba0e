//! Folding of `BatchNormalization` into the linear operation feeding it:
//! alpha = scale / sqrt(var + eps), w' = w * alpha, b' = (b - mean) * alpha + beta.
//! A Gemm multiplies its bias by its own `beta`, so the BN shift is divided by it.

use anyhow::{anyhow, Result};
use itertools::Itertools;
use tracing::debug;

use crate::ir::{Attribute, Graph, Tensor};

const BATCHNORM_TYPE: &str = "BatchNormalization";
const DEFAULT_EPSILON: f32 = 1e-5;

/// Everything needed to rewrite one fusable pair.
struct Fusion {
    bn: String,
    parent: String,
    intermediate: String,
    output: String,
    weight: String,
    bias: Option<String>,
    fused_weight: Tensor,
    fused_bias: Tensor,
}

/// Value of a parameter input, `None` when the variable is not a parameter.
fn parameter_value<'a>(graph: &'a Graph, var: &str) -> Option<&'a Tensor> {
    graph
        .variable(var)
        .filter(|v| v.is_parameter() && v.source_op().is_none())
        .and_then(|v| v.value())
}

/// Index of the output channel axis of the weight of `parent`, and the factor `parent` applies
/// to its bias.
fn channel_axis(graph: &Graph, parent: &str) -> Option<(usize, f32)> {
    let op = graph.operation(parent)?;
    match op.op_type() {
        "Conv" => Some((0, 1.0)),
        "ConvTranspose" => {
            let group = op.attribute("group").and_then(Attribute::as_int).unwrap_or(1);
            (group == 1).then_some((1, 1.0))
        }
        "Gemm" => {
            let trans_b = op.attribute("transB").and_then(Attribute::as_int).unwrap_or(0);
            let beta = op.attribute("beta").and_then(Attribute::as_float).unwrap_or(1.0);
            // a zero beta drops the bias input entirely
            (beta != 0.0).then_some((if trans_b != 0 { 0 } else { 1 }, beta))
        }
        _ => None,
    }
}

/// Checks whether `bn` can be folded into its producer, and computes the folded parameters.
fn plan_fusion(graph: &Graph, bn: &str) -> Result<Option<Fusion>> {
    let op = graph.operation(bn).ok_or(anyhow!("unknown operation {}", bn))?;
    if op.inputs().len() != 5 || op.outputs().len() != 1 {
        return Ok(None);
    }
    let intermediate = &op.inputs()[0];
    let Some(parent) = graph.variable(intermediate).and_then(|v| v.source_op()) else {
        return Ok(None);
    };
    let Some((axis, bias_scale)) = channel_axis(graph, parent) else {
        return Ok(None);
    };
    let parent_op = graph
        .operation(parent)
        .ok_or(anyhow!("unknown operation {}", parent))?;
    // fan-out on the intermediate blocks the fusion
    let fan_out = graph
        .variable(intermediate)
        .map(|v| v.dest_ops().len())
        .unwrap_or_default();
    if parent_op.outputs().len() != 1
        || fan_out != 1
        || graph.outputs().contains(intermediate)
        || !(2..=3).contains(&parent_op.inputs().len())
    {
        return Ok(None);
    }

    let stats = op.inputs()[1..]
        .iter()
        .map(|v| parameter_value(graph, v).map(Tensor::to_f32_vec))
        .collect::<Option<Vec<_>>>();
    let Some(stats) = stats else {
        debug!("fuse bn: statistics of {} are not parameters, skipping", bn);
        return Ok(None);
    };
    let [scale, beta, mean, var] = <[Vec<f32>; 4]>::try_from(stats)
        .map_err(|_| anyhow!("batch normalization {} expects 4 statistics", bn))?;

    let weight_name = &parent_op.inputs()[1];
    let Some(weight) = parameter_value(graph, weight_name) else {
        return Ok(None);
    };
    let channels = match weight.shape().get(axis) {
        Some(c) => *c,
        None => return Ok(None),
    };
    if [&scale, &beta, &mean, &var].iter().any(|s| s.len() != channels) {
        debug!(
            "fuse bn: statistics of {} do not match the {} channels of {}, skipping",
            bn, channels, parent
        );
        return Ok(None);
    }
    let bias_name = parent_op.inputs().get(2);
    let bias = match bias_name {
        Some(name) => match parameter_value(graph, name) {
            Some(b) if b.len() == channels => b.to_f32_vec(),
            _ => return Ok(None),
        },
        None => vec![0.0; channels],
    };

    let epsilon = op
        .attribute("epsilon")
        .and_then(Attribute::as_float)
        .unwrap_or(DEFAULT_EPSILON);
    let alpha = scale
        .iter()
        .zip(var.iter())
        .map(|(s, v)| s / (v + epsilon).sqrt())
        .collect_vec();
    let fused_bias = (0..channels)
        .map(|c| bias[c] * alpha[c] + (beta[c] - mean[c] * alpha[c]) / bias_scale)
        .collect_vec();

    Ok(Some(Fusion {
        bn: bn.to_string(),
        parent: parent.to_string(),
        intermediate: intermediate.clone(),
        output: op.outputs()[0].clone(),
        weight: weight_name.clone(),
        bias: bias_name.cloned(),
        fused_weight: weight.scale_along_axis(axis, &alpha)?,
        fused_bias: Tensor::from_f32(vec![channels], fused_bias)?,
    }))
}

/// Removes a variable when nothing refers to it anymore.
fn remove_if_orphan(graph: &mut Graph, var: &str) -> Result<()> {
    let orphan = graph.variable(var).is_some_and(|v| {
        v.source_op().is_none()
            && v.dest_ops().is_empty()
            && !graph.inputs().iter().any(|i| i == var)
            && !graph.outputs().iter().any(|o| o == var)
    });
    if orphan {
        graph.remove_variable(var)?;
    }
    Ok(())
}

fn apply_fusion(graph: &mut Graph, fusion: Fusion) -> Result<()> {
    let stats = graph
        .operation(&fusion.bn)
        .map(|op| op.inputs()[1..].to_vec())
        .unwrap_or_default();
    graph.remove_operation(&fusion.bn)?;

    // fresh variables, the original weight may still be read by another operation
    let weight = graph.unique_name(&format!("{}.fused_weight", fusion.parent));
    graph.create_variable(weight.as_str(), Some(fusion.fused_weight))?;
    graph.replace_input(&fusion.parent, &fusion.weight, &weight)?;
    let bias = graph.unique_name(&format!("{}.fused_bias", fusion.parent));
    graph.create_variable(bias.as_str(), Some(fusion.fused_bias))?;
    match &fusion.bias {
        Some(old) => graph.replace_input(&fusion.parent, old, &bias)?,
        None => graph.append_parameter_input(&fusion.parent, &bias)?,
    }

    graph.replace_output(&fusion.parent, &fusion.intermediate, &fusion.output)?;
    graph.remove_variable(&fusion.intermediate)?;
    for var in stats
        .iter()
        .chain(std::iter::once(&fusion.weight))
        .chain(fusion.bias.iter())
    {
        remove_if_orphan(graph, var)?;
    }
    Ok(())
}

pub(super) fn fuse_bn(graph: &mut Graph) -> Result<usize> {
    let candidates = graph
        .operations()
        .values()
        .filter(|op| op.op_type() == BATCHNORM_TYPE)
        .map(|op| op.name().to_string())
        .collect_vec();
    let mut fused = 0;
    for bn in candidates {
        if let Some(fusion) = plan_fusion(graph, &bn)? {
            debug!("fuse bn: folding {} into {}", fusion.bn, fusion.parent);
            apply_fusion(graph, fusion)?;
            fused += 1;
        }
    }
    Ok(fused)
}
