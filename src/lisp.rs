use log::{debug, trace};

use crate::error::{GraphError, Result};
use crate::grad::backprop;
use crate::graph::{Graph, NodeId, NodeKind};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineOptions {
    /// Run the reverse pass after evaluation. Every root must then be
    /// scalar-shaped.
    pub with_differentiation: bool,
}

impl MachineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_differentiation(mut self, enabled: bool) -> Self {
        self.with_differentiation = enabled;
        self
    }
}

/// Evaluates the graph in place, each reachable node once, optionally
/// followed by a reverse pass over the same nodes.
pub struct LispMachine<'g> {
    graph: &'g mut Graph,
    options: MachineOptions,
    order: Vec<NodeId>,
    evaluated: bool,
}

impl<'g> LispMachine<'g> {
    pub fn new(graph: &'g mut Graph, options: MachineOptions) -> Self {
        LispMachine {
            graph,
            options,
            order: Vec::new(),
            evaluated: false,
        }
    }

    pub fn graph(&self) -> &Graph {
        &*self.graph
    }

    pub fn options(&self) -> MachineOptions {
        self.options
    }

    /// Binds an input. Results of a previous run are invalidated.
    pub fn bind(&mut self, node: NodeId, value: Tensor) -> Result<()> {
        self.graph.bind(node, value)?;
        self.invalidate();
        Ok(())
    }

    pub fn run_all(&mut self) -> Result<()> {
        self.invalidate();
        let roots = self.graph.roots();
        if self.options.with_differentiation {
            for &root in &roots {
                let node = self.graph.node(root)?;
                if !node.is_scalar_shaped() {
                    return Err(GraphError::NotDifferentiable {
                        node: root,
                        reason: format!("output has shape {:?}, expected a scalar", node.shape()),
                    });
                }
            }
        }

        let order = self.graph.topological_order(&roots)?;
        for (index, &id) in order.iter().enumerate() {
            self.evaluate(index, id)?;
        }
        debug!("lisp machine evaluated {} nodes", order.len());

        if self.options.with_differentiation {
            backprop(self.graph, &order, &roots)?;
            debug!("lisp machine differentiated {} roots", roots.len());
        }

        self.order = order;
        self.evaluated = true;
        Ok(())
    }

    fn evaluate(&mut self, index: usize, id: NodeId) -> Result<()> {
        let node = self.graph.node(id)?;
        let op = match node.kind() {
            NodeKind::Input => {
                return match node.value() {
                    Some(_) => Ok(()),
                    None => Err(GraphError::UnboundInput { node: id }),
                };
            }
            NodeKind::Constant => return Ok(()),
            NodeKind::Operation(op) => op,
        };

        let inputs = node
            .operands()
            .iter()
            .map(|&o| self.graph.value(o).ok_or_else(|| GraphError::unbound_value(o)))
            .collect::<Result<Vec<_>>>()?;
        let value = op.forward(&inputs).map_err(|source| GraphError::Runtime {
            index,
            op: op.name(),
            node: id,
            source,
        })?;
        trace!("node {} = {} -> {:?}", id, op, value.shape());

        self.graph.dual_mut(id)?.value = Some(value);
        Ok(())
    }

    pub fn value(&self, node: NodeId) -> Result<&Tensor> {
        let n = self.graph.node(node)?;
        if !self.evaluated && !n.is_leaf() {
            return Err(GraphError::unbound_value(node));
        }
        n.value().ok_or_else(|| GraphError::unbound_value(node))
    }

    pub fn grad(&self, node: NodeId) -> Result<&Tensor> {
        let n = self.graph.node(node)?;
        if !self.evaluated || !self.options.with_differentiation {
            return Err(GraphError::unbound_grad(node));
        }
        n.grad().ok_or_else(|| GraphError::unbound_grad(node))
    }

    /// Nodes evaluated by the last successful run, in evaluation order.
    pub fn evaluated(&self) -> &[NodeId] {
        &self.order
    }

    /// Drops every computed value and gradient. Input bindings survive.
    pub fn reset(&mut self) {
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.graph.clear_computed();
        self.order.clear();
        self.evaluated = false;
    }
}
