//! Executes a compiled [`Program`] instruction by instruction.

use log::{debug, trace};

use crate::compiler::{LocationMap, Program};
use crate::error::{GraphError, Result};
use crate::graph::NodeId;
use crate::tensor::Tensor;

/// Register machine over the instructions of a [`Program`]. The machine owns
/// its program; the graph it was compiled from is no longer needed.
#[derive(Debug, Clone)]
pub struct TapeMachine {
    program: Program,
    locations: LocationMap,
    registers: Vec<Option<Tensor>>,
    executed: bool,
    runs: usize,
}

impl TapeMachine {
    pub fn new(program: Program, locations: LocationMap) -> Self {
        let mut machine = TapeMachine {
            registers: vec![None; program.register_count()],
            program,
            locations,
            executed: false,
            runs: 0,
        };
        machine.load_initial();
        machine
    }

    fn load_initial(&mut self) {
        for slot in self.program.inputs() {
            self.registers[slot.location.index()] = slot.initial.clone();
        }
        for (loc, value) in self.program.constants() {
            self.registers[loc.index()] = Some(value.clone());
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn locations(&self) -> &LocationMap {
        &self.locations
    }

    /// Number of successful `run_all` calls.
    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Writes a value into the register of an input node.
    pub fn bind(&mut self, node: NodeId, value: Tensor) -> Result<()> {
        let Some(slot) = self.program.input_for(node) else {
            return Err(match self.locations.value_location(node) {
                Some(_) => GraphError::NotAnInput { node },
                None => GraphError::UnknownNode { node },
            });
        };
        if slot.shape != value.shape() || slot.dtype != value.dtype() {
            return Err(GraphError::ShapeMismatch {
                node,
                expected: slot.shape.clone(),
                got: value.shape().to_vec(),
                expected_dtype: slot.dtype,
                got_dtype: value.dtype(),
            });
        }
        self.registers[slot.location.index()] = Some(value);
        self.executed = false;
        Ok(())
    }

    pub fn run_all(&mut self) -> Result<()> {
        self.executed = false;
        for slot in self.program.inputs() {
            if self.registers[slot.location.index()].is_none() {
                return Err(GraphError::UnboundInput { node: slot.node });
            }
        }

        for (index, inst) in self.program.instructions().iter().enumerate() {
            let operands = inst
                .operands
                .iter()
                .map(|loc| {
                    self.registers[loc.index()]
                        .as_ref()
                        .ok_or_else(|| GraphError::unbound_value(inst.node))
                })
                .collect::<Result<Vec<_>>>()?;
            let value = inst.op.forward(&operands).map_err(|source| GraphError::Runtime {
                index,
                op: inst.op.name(),
                node: inst.node,
                source,
            })?;
            trace!("{:>4}: {} = {} -> {:?}", index, inst.result, inst.op, value.shape());
            self.registers[inst.result.index()] = Some(value);
        }

        self.executed = true;
        self.runs += 1;
        debug!(
            "tape machine run {} finished {} instructions",
            self.runs,
            self.program.len()
        );
        Ok(())
    }

    pub fn value(&self, node: NodeId) -> Result<&Tensor> {
        let loc = self
            .locations
            .value_location(node)
            .ok_or_else(|| GraphError::unbound_value(node))?;
        let is_leaf = self.program.input_for(node).is_some()
            || self.program.constants().iter().any(|(l, _)| *l == loc);
        if !self.executed && !is_leaf {
            return Err(GraphError::unbound_value(node));
        }
        self.registers[loc.index()]
            .as_ref()
            .ok_or_else(|| GraphError::unbound_value(node))
    }

    pub fn grad(&self, node: NodeId) -> Result<&Tensor> {
        let loc = self
            .locations
            .grad_location(node)
            .ok_or_else(|| GraphError::unbound_grad(node))?;
        if !self.executed {
            return Err(GraphError::unbound_grad(node));
        }
        self.registers[loc.index()]
            .as_ref()
            .ok_or_else(|| GraphError::unbound_grad(node))
    }

    /// Clears every register and restores the inputs bound at compile time.
    pub fn reset(&mut self) {
        self.registers.iter_mut().for_each(|r| *r = None);
        self.load_initial();
        self.executed = false;
    }
}
