//! Lowers a [`Graph`] into a linear [`Program`] over numbered registers.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::debug;

use crate::error::Result;
use crate::graph::{Graph, NodeId, NodeKind};
use crate::op::Op;
use crate::tensor::{DType, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location(usize);

impl Location {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%r{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub node: NodeId,
    pub op: Op,
    pub operands: Vec<Location>,
    pub result: Location,
}

/// Register reserved for an input node, with the value bound in the graph
/// at compile time (if any).
#[derive(Debug, Clone, PartialEq)]
pub struct InputSlot {
    pub node: NodeId,
    pub name: Option<String>,
    pub location: Location,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub initial: Option<Tensor>,
}

/// Where the value (and symbolic gradient) of each readable node lives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocationMap {
    values: BTreeMap<NodeId, Location>,
    grads: BTreeMap<NodeId, Location>,
}

impl LocationMap {
    pub fn value_location(&self, node: NodeId) -> Option<Location> {
        self.values.get(&node).copied()
    }

    pub fn grad_location(&self, node: NodeId) -> Option<Location> {
        self.grads.get(&node).copied()
    }

    pub fn values(&self) -> impl Iterator<Item = (NodeId, Location)> + '_ {
        self.values.iter().map(|(&n, &l)| (n, l))
    }

    pub fn grads(&self) -> impl Iterator<Item = (NodeId, Location)> + '_ {
        self.grads.iter().map(|(&n, &l)| (n, l))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    instructions: Vec<Instruction>,
    inputs: Vec<InputSlot>,
    constants: Vec<(Location, Tensor)>,
    register_count: usize,
}

impl Program {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn input_for(&self, node: NodeId) -> Option<&InputSlot> {
        self.inputs.iter().find(|slot| slot.node == node)
    }

    pub fn constants(&self) -> &[(Location, Tensor)] {
        &self.constants
    }

    pub fn register_count(&self) -> usize {
        self.register_count
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; {} registers", self.register_count)?;
        for slot in &self.inputs {
            write!(f, "{} <- input node {}", slot.location, slot.node)?;
            if let Some(name) = &slot.name {
                write!(f, " ({})", name)?;
            }
            writeln!(f, " {}{:?}", slot.dtype, slot.shape)?;
        }
        for (loc, value) in &self.constants {
            writeln!(f, "{} <- const {}", loc, value)?;
        }
        for (i, inst) in self.instructions.iter().enumerate() {
            let operands: Vec<String> = inst.operands.iter().map(Location::to_string).collect();
            writeln!(
                f,
                "{:>4}: {} = {} {}    ; node {}",
                i,
                inst.result,
                inst.op,
                operands.join(", "),
                inst.node
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Recycle registers of intermediates after their last use.
    pub reuse_locations: bool,
    /// Keep every node and every gradient node readable after execution.
    pub track_intermediates: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            reuse_locations: true,
            track_intermediates: false,
        }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reuse_locations(mut self, enabled: bool) -> Self {
        self.reuse_locations = enabled;
        self
    }

    pub fn with_track_intermediates(mut self, enabled: bool) -> Self {
        self.track_intermediates = enabled;
        self
    }
}

pub fn compile(graph: &Graph) -> Result<(Program, LocationMap)> {
    compile_with(graph, &CompileOptions::default())
}

/// Registers of intermediates are recycled after their last use. Inputs,
/// constants, roots and the gradients requested from [`crate::grad`] keep
/// theirs for the whole program.
pub fn compile_with(graph: &Graph, options: &CompileOptions) -> Result<(Program, LocationMap)> {
    let mut roots = graph.roots();
    let grads: Vec<(NodeId, NodeId)> = if options.track_intermediates {
        graph.grad_nodes().collect()
    } else {
        graph.requested_grads().collect()
    };
    for &(_, g) in &grads {
        if !roots.contains(&g) {
            roots.push(g);
        }
    }
    let order = graph.topological_order(&roots)?;

    let mut tracked: BTreeSet<NodeId> = roots.iter().copied().collect();
    let mut last_use: BTreeMap<NodeId, usize> = BTreeMap::new();
    for (pos, &id) in order.iter().enumerate() {
        let node = graph.node(id)?;
        if options.track_intermediates || node.is_leaf() {
            tracked.insert(id);
        }
        for operand in node.operands() {
            last_use.insert(*operand, pos);
        }
    }

    let mut assigned: BTreeMap<NodeId, Location> = BTreeMap::new();
    let mut free: BTreeSet<usize> = BTreeSet::new();
    let mut register_count = 0usize;
    let mut instructions = Vec::new();
    let mut inputs = Vec::new();
    let mut constants = Vec::new();

    for (pos, &id) in order.iter().enumerate() {
        let node = graph.node(id)?;
        let op = match node.kind() {
            NodeKind::Input | NodeKind::Constant => {
                let loc = Location(register_count);
                register_count += 1;
                assigned.insert(id, loc);
                if node.is_input() {
                    inputs.push(InputSlot {
                        node: id,
                        name: node.name().map(str::to_string),
                        location: loc,
                        dtype: node.dtype(),
                        shape: node.shape().to_vec(),
                        initial: node.value().cloned(),
                    });
                } else if let Some(value) = node.value() {
                    constants.push((loc, value.clone()));
                }
                continue;
            }
            NodeKind::Operation(op) => op.clone(),
        };

        let operands: Vec<Location> = node.operands().iter().map(|o| assigned[o]).collect();

        if options.reuse_locations {
            for operand in node.operands() {
                if !tracked.contains(operand) && last_use.get(operand) == Some(&pos) {
                    free.insert(assigned[operand].0);
                }
            }
        }
        let recycled = if tracked.contains(&id) {
            None
        } else {
            free.pop_first()
        };
        let result = match recycled {
            Some(slot) => Location(slot),
            None => {
                register_count += 1;
                Location(register_count - 1)
            }
        };
        assigned.insert(id, result);

        instructions.push(Instruction {
            node: id,
            op,
            operands,
            result,
        });
    }

    let mut locations = LocationMap::default();
    for &id in &tracked {
        locations.values.insert(id, assigned[&id]);
    }
    for (node, g) in graph.grad_nodes() {
        if tracked.contains(&g) {
            locations.grads.insert(node, assigned[&g]);
        }
    }

    debug!(
        "compiled {} nodes into {} instructions over {} registers",
        order.len(),
        instructions.len(),
        register_count
    );

    Ok((
        Program {
            instructions,
            inputs,
            constants,
            register_count,
        },
        locations,
    ))
}
