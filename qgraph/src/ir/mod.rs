//! This module contains the definition of [`Graph`], the structure holding the operations and
//! variables of a network. Operations reference their variables by name; every variable keeps
//! track of the operation producing it and of the operations consuming it. All mutations go
//! through methods of [`Graph`] so that both sides of a link always agree.

mod operation;
mod tensor;
mod variable;

use anyhow::{anyhow, bail, ensure, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

pub use operation::{Attribute, Operation, DEVICE_SWITCH_TYPE};
pub(crate) use operation::{SWITCH_SOURCE_ATTR, SWITCH_TARGET_ATTR};
pub use tensor::{Tensor, TensorData};
pub use variable::Variable;

use crate::platform::TargetPlatform;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    name: String,
    operations: BTreeMap<String, Operation>,
    variables: BTreeMap<String, Variable>,
    /// Variables fed by the caller at execution time
    inputs: Vec<String>,
    /// Variables returned to the caller
    outputs: Vec<String>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &BTreeMap<String, Operation> {
        &self.operations
    }

    pub fn variables(&self) -> &BTreeMap<String, Variable> {
        &self.variables
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn contains_operation(&self, name: &str) -> bool {
        self.operations.contains_key(name)
    }

    /// Adds a variable without any link. A variable created with a value is a parameter.
    pub fn create_variable(&mut self, name: impl Into<String>, value: Option<Tensor>) -> Result<&Variable> {
        let name = name.into();
        ensure!(
            !self.variables.contains_key(&name),
            "variable {} already exists",
            name
        );
        let is_parameter = value.is_some();
        Ok(self
            .variables
            .entry(name.clone())
            .or_insert(Variable::new(name, value, is_parameter)))
    }

    /// Adds an operation and links it to its (already created) input and output variables.
    pub fn create_operation(
        &mut self,
        name: impl Into<String>,
        op_type: impl Into<String>,
        attributes: BTreeMap<String, Attribute>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Result<&mut Operation> {
        let name = name.into();
        ensure!(
            !self.operations.contains_key(&name),
            "operation {} already exists",
            name
        );
        for var in inputs.iter().chain(outputs.iter()) {
            ensure!(
                self.variables.contains_key(var),
                "operation {} references unknown variable {}",
                name,
                var
            );
        }
        for var in &outputs {
            if let Some(source) = &self.variables[var].source_op {
                bail!(
                    "variable {} is already produced by {}, can not be an output of {}",
                    var,
                    source,
                    name
                );
            }
            ensure!(
                !self.variables[var].is_parameter,
                "parameter variable {} can not be an output of {}",
                var,
                name
            );
        }
        ensure!(
            outputs.iter().all_unique(),
            "operation {} lists the same output twice",
            name
        );
        for var in &inputs {
            self.var_mut(var)?.link_consumer(&name);
        }
        for var in &outputs {
            self.var_mut(var)?.source_op = Some(name.clone());
        }
        let mut op = Operation::new(name.clone(), op_type.into(), attributes);
        op.inputs = inputs;
        op.outputs = outputs;
        Ok(self.operations.entry(name).or_insert(op))
    }

    pub fn mark_input(&mut self, var: &str) -> Result<()> {
        ensure!(self.variables.contains_key(var), "unknown graph input {}", var);
        if !self.inputs.iter().any(|v| v == var) {
            self.inputs.push(var.to_string());
        }
        Ok(())
    }

    pub fn mark_output(&mut self, var: &str) -> Result<()> {
        ensure!(self.variables.contains_key(var), "unknown graph output {}", var);
        if !self.outputs.iter().any(|v| v == var) {
            self.outputs.push(var.to_string());
        }
        Ok(())
    }

    /// Removes an operation and unlinks it from all its variables, which stay in the graph.
    pub fn remove_operation(&mut self, name: &str) -> Result<Operation> {
        let op = self
            .operations
            .remove(name)
            .ok_or(anyhow!("can not remove unknown operation {}", name))?;
        for var in op.inputs.iter().unique() {
            self.var_mut(var)?.dest_ops.retain(|d| d != name);
        }
        for var in &op.outputs {
            self.var_mut(var)?.source_op = None;
        }
        Ok(op)
    }

    /// Removes a variable no operation refers to anymore.
    pub fn remove_variable(&mut self, name: &str) -> Result<Variable> {
        let var = self
            .variables
            .get(name)
            .ok_or(anyhow!("can not remove unknown variable {}", name))?;
        ensure!(
            var.source_op.is_none() && var.dest_ops.is_empty(),
            "variable {} is still linked to operations",
            name
        );
        self.inputs.retain(|v| v != name);
        self.outputs.retain(|v| v != name);
        self.variables
            .remove(name)
            .context("variable vanished while removing it")
    }

    /// Rewires every input slot of `op` reading `old` to read `new` instead.
    pub fn replace_input(&mut self, op: &str, old: &str, new: &str) -> Result<()> {
        ensure!(self.variables.contains_key(new), "unknown variable {}", new);
        let operation = self.op_mut(op)?;
        let mut replaced = 0;
        for input in operation.inputs.iter_mut().filter(|i| *i == old) {
            *input = new.to_string();
            replaced += 1;
        }
        ensure!(replaced > 0, "operation {} does not read variable {}", op, old);
        self.var_mut(old)?.dest_ops.retain(|d| d != op);
        let new_var = self.var_mut(new)?;
        for _ in 0..replaced {
            new_var.link_consumer(op);
        }
        Ok(())
    }

    /// Makes `op` produce `new` in place of `old`. `new` must not have a producer.
    pub fn replace_output(&mut self, op: &str, old: &str, new: &str) -> Result<()> {
        let new_var = self
            .variables
            .get(new)
            .ok_or(anyhow!("unknown variable {}", new))?;
        ensure!(
            new_var.source_op.is_none(),
            "variable {} already has a producer",
            new
        );
        let operation = self.op_mut(op)?;
        let slot = operation
            .outputs
            .iter()
            .position(|o| o == old)
            .ok_or(anyhow!("operation {} does not produce variable {}", op, old))?;
        operation.outputs[slot] = new.to_string();
        self.var_mut(old)?.source_op = None;
        self.var_mut(new)?.source_op = Some(op.to_string());
        Ok(())
    }

    /// Appends a parameter input to `op`.
    pub fn append_parameter_input(&mut self, op: &str, var: &str) -> Result<()> {
        ensure!(self.variables.contains_key(var), "unknown variable {}", var);
        self.op_mut(op)?.inputs.push(var.to_string());
        self.var_mut(var)?.link_consumer(op);
        Ok(())
    }

    /// Drops the trailing inputs of `op` so that only `keep` remain.
    pub fn truncate_inputs(&mut self, op: &str, keep: usize) -> Result<()> {
        let operation = self.op_mut(op)?;
        if operation.inputs.len() <= keep {
            return Ok(());
        }
        let dropped = operation.inputs.split_off(keep);
        for var in dropped {
            let dests = &mut self.var_mut(&var)?.dest_ops;
            if let Some(pos) = dests.iter().position(|d| d == op) {
                dests.remove(pos);
            }
        }
        Ok(())
    }

    /// Creates operation `name` reading `var` and producing a fresh variable, then makes every
    /// operation of `consumers` read that variable instead of `var`. Returns the new variable.
    pub fn insert_op_on_var(
        &mut self,
        name: &str,
        op_type: &str,
        attributes: BTreeMap<String, Attribute>,
        var: &str,
        consumers: &[&str],
    ) -> Result<String> {
        let variable = self
            .variables
            .get(var)
            .ok_or(anyhow!("can not insert {} on unknown variable {}", name, var))?;
        for consumer in consumers {
            ensure!(
                variable.dest_ops.iter().any(|d| d == consumer),
                "operation {} does not read variable {}",
                consumer,
                var
            );
        }
        let relay = self.unique_name(&format!("{var}.{name}"));
        self.create_variable(relay.as_str(), None)?;
        self.create_operation(
            name,
            op_type,
            attributes,
            vec![var.to_string()],
            vec![relay.clone()],
        )?;
        for consumer in consumers {
            self.replace_input(consumer, var, &relay)?;
        }
        Ok(relay)
    }

    pub fn set_attribute(&mut self, op: &str, key: &str, value: Attribute) -> Result<()> {
        self.op_mut(op)?.attributes.insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove_attribute(&mut self, op: &str, key: &str) -> Result<Option<Attribute>> {
        Ok(self.op_mut(op)?.attributes.remove(key))
    }

    pub fn set_value(&mut self, var: &str, value: Tensor) -> Result<()> {
        let variable = self.var_mut(var)?;
        ensure!(
            variable.source_op.is_none(),
            "variable {} is produced by an operation and can not hold a value",
            var
        );
        variable.value = Some(value);
        variable.is_parameter = true;
        Ok(())
    }

    pub(crate) fn set_platform(&mut self, op: &str, platform: TargetPlatform) -> Result<()> {
        self.op_mut(op)?.platform = platform;
        Ok(())
    }

    /// Operations producing the inputs of `op`, each listed once.
    pub fn upstream_operations(&self, op: &str) -> Vec<&str> {
        self.operations
            .get(op)
            .map(|operation| {
                operation
                    .inputs
                    .iter()
                    .filter_map(|v| self.variables.get(v)?.source_op.as_deref())
                    .unique()
                    .collect_vec()
            })
            .unwrap_or_default()
    }

    /// Operations consuming the outputs of `op`, each listed once.
    pub fn downstream_operations(&self, op: &str) -> Vec<&str> {
        self.operations
            .get(op)
            .map(|operation| {
                operation
                    .outputs
                    .iter()
                    .filter_map(|v| self.variables.get(v))
                    .flat_map(|v| v.dest_ops.iter().map(String::as_str))
                    .unique()
                    .collect_vec()
            })
            .unwrap_or_default()
    }

    /// Returns a variable or operation name, derived from `base`, not used in the graph yet.
    pub fn unique_name(&self, base: &str) -> String {
        let mut k = 0usize;
        loop {
            let name = format!("{base}_{k}");
            if !self.variables.contains_key(&name) && !self.operations.contains_key(&name) {
                return name;
            }
            k += 1;
        }
    }

    /// Operations sorted so that producers come before their consumers.
    pub fn topological_sort(&self) -> Result<Vec<&str>> {
        let mut pending: HashMap<&str, usize> = self
            .operations
            .keys()
            .map(|name| (name.as_str(), self.upstream_operations(name).len()))
            .collect();
        let mut ready: VecDeque<&str> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(name, _)| *name)
            .sorted()
            .collect();
        let mut order = Vec::with_capacity(self.operations.len());
        while let Some(op) = ready.pop_front() {
            order.push(op);
            for next in self.downstream_operations(op) {
                let count = pending
                    .get_mut(next)
                    .ok_or(anyhow!("dangling consumer {} of {}", next, op))?;
                *count -= 1;
                if *count == 0 {
                    ready.push_back(next);
                }
            }
        }
        ensure!(
            order.len() == self.operations.len(),
            "graph {} contains a cycle",
            self.name
        );
        Ok(order)
    }

    /// Checks the consistency of the links between operations and variables.
    pub fn validate(&self) -> Result<()> {
        for (name, op) in &self.operations {
            ensure!(name == &op.name, "operation {} is stored under {}", op.name, name);
            for var in &op.inputs {
                let variable = self
                    .variables
                    .get(var)
                    .ok_or(anyhow!("operation {} reads unknown variable {}", name, var))?;
                ensure!(
                    variable.dest_ops.iter().filter(|d| *d == name).count()
                        == op.inputs.iter().filter(|i| *i == var).count(),
                    "variable {} does not list {} as consumer",
                    var,
                    name
                );
            }
            for var in &op.outputs {
                let variable = self
                    .variables
                    .get(var)
                    .ok_or(anyhow!("operation {} writes unknown variable {}", name, var))?;
                ensure!(
                    variable.source_op.as_deref() == Some(name.as_str()),
                    "variable {} does not list {} as producer",
                    var,
                    name
                );
            }
        }
        for (name, var) in &self.variables {
            ensure!(name == &var.name, "variable {} is stored under {}", var.name, name);
            if let Some(source) = &var.source_op {
                ensure!(
                    self.operations
                        .get(source)
                        .is_some_and(|op| op.outputs.contains(name)),
                    "variable {} has a dangling producer {}",
                    name,
                    source
                );
            }
            for dest in &var.dest_ops {
                ensure!(
                    self.operations
                        .get(dest)
                        .is_some_and(|op| op.inputs.contains(name)),
                    "variable {} has a dangling consumer {}",
                    name,
                    dest
                );
            }
        }
        for var in self.inputs.iter().chain(self.outputs.iter()) {
            ensure!(
                self.variables.contains_key(var),
                "graph interface refers to unknown variable {}",
                var
            );
        }
        Ok(())
    }

    fn op_mut(&mut self, name: &str) -> Result<&mut Operation> {
        self.operations
            .get_mut(name)
            .ok_or(anyhow!("unknown operation {}", name))
    }

    fn var_mut(&mut self, name: &str) -> Result<&mut Variable> {
        self.variables
            .get_mut(name)
            .ok_or(anyhow!("unknown variable {}", name))
    }
}

/// Serialized form of a [`Graph`]. Links are not stored, they are rebuilt from the operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct GraphDocument {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    variables: Vec<Variable>,
    operations: Vec<Operation>,
}

impl From<&Graph> for GraphDocument {
    fn from(graph: &Graph) -> Self {
        Self {
            name: graph.name.clone(),
            inputs: graph.inputs.clone(),
            outputs: graph.outputs.clone(),
            variables: graph.variables.values().cloned().collect(),
            operations: graph.operations.values().cloned().collect(),
        }
    }
}

impl TryFrom<GraphDocument> for Graph {
    type Error = anyhow::Error;

    fn try_from(doc: GraphDocument) -> Result<Self> {
        let mut graph = Graph::new(doc.name);
        for var in doc.variables {
            ensure!(
                !graph.variables.contains_key(&var.name),
                "variable {} declared twice",
                var.name
            );
            let is_parameter = var.is_parameter || var.value.is_some();
            graph.variables.insert(
                var.name.clone(),
                Variable::new(var.name, var.value, is_parameter),
            );
        }
        for op in doc.operations {
            let platform = op.platform;
            let name = op.name.clone();
            graph
                .create_operation(op.name, op.op_type, op.attributes, op.inputs, op.outputs)
                .with_context(|| format!("rebuilding operation {name}"))?
                .platform = platform;
        }
        for var in &doc.inputs {
            graph.mark_input(var)?;
        }
        for var in &doc.outputs {
            graph.mark_output(var)?;
        }
        Ok(graph)
    }
}

impl Serialize for Graph {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        GraphDocument::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Graph {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let doc = GraphDocument::deserialize(deserializer)?;
        Graph::try_from(doc).map_err(serde::de::Error::custom)
    }
}
