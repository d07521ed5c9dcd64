//! Reverse-mode differentiation, symbolic and automatic.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{ComputeError, GraphError, Result};
use crate::graph::{Graph, NodeId, NodeKind};
use crate::op::{GradBuilder, Op};
use crate::tensor::Tensor;

/// Builds gradient expressions as graph nodes.
struct SymbolicBuilder<'g> {
    graph: &'g mut Graph,
}

impl GradBuilder for SymbolicBuilder<'_> {
    type Handle = NodeId;
    type Error = GraphError;

    fn apply(&mut self, op: Op, operands: &[NodeId]) -> Result<NodeId> {
        self.graph.apply(op, operands)
    }

    fn constant(&mut self, value: f64, like: &NodeId) -> Result<NodeId> {
        let dtype = self.graph.node(*like)?.dtype();
        Ok(self.graph.scalar(value, dtype))
    }

    fn shape(&self, handle: &NodeId) -> Vec<usize> {
        self.graph
            .node(*handle)
            .map(|n| n.shape().to_vec())
            .unwrap_or_default()
    }
}

/// Evaluates gradient rules eagerly on tensors.
pub(crate) struct NumericBuilder;

impl GradBuilder for NumericBuilder {
    type Handle = Tensor;
    type Error = ComputeError;

    fn apply(&mut self, op: Op, operands: &[Tensor]) -> std::result::Result<Tensor, ComputeError> {
        let refs: Vec<&Tensor> = operands.iter().collect();
        op.forward(&refs)
    }

    fn constant(&mut self, value: f64, like: &Tensor) -> std::result::Result<Tensor, ComputeError> {
        Ok(Tensor::scalar(value).with_dtype(like.dtype()))
    }

    fn shape(&self, handle: &Tensor) -> Vec<usize> {
        handle.shape().to_vec()
    }
}

/// Extends `graph` with nodes computing d`output`/d`wrt[i]` and returns them
/// in the order requested. Each gradient node is also recorded as the
/// gradient back-reference of its node (see [`Graph::grad_node`]).
///
/// Fails with `NotDifferentiable` if `output` does not hold exactly one
/// element and with `NoPath` if some `wrt` node is not an ancestor of
/// `output`; the graph is left untouched in both cases.
///
/// # Panics
/// Panics if a gradient rule produces a gradient whose shape differs from
/// its operand.
pub fn grad(graph: &mut Graph, output: NodeId, wrt: &[NodeId]) -> Result<Vec<NodeId>> {
    let out = graph.node(output)?;
    if !out.is_scalar_shaped() {
        return Err(GraphError::NotDifferentiable {
            node: output,
            reason: format!("output has shape {:?}, expected a scalar", out.shape()),
        });
    }
    let seed = Tensor::ones(out.shape().to_vec(), out.dtype());

    let order = graph.topological_order(&[output])?;
    let mut relevant = vec![false; graph.len()];
    for &id in &order {
        relevant[id.index()] = true;
    }
    for &w in wrt {
        graph.node(w)?;
        if !relevant[w.index()] {
            return Err(GraphError::NoPath { output, wrt: w });
        }
    }

    // Keep only ancestors of `output` that also depend on some `wrt` node.
    relevant.iter_mut().for_each(|r| *r = false);
    for &id in &order {
        let node = graph.node(id)?;
        relevant[id.index()] =
            wrt.contains(&id) || node.operands().iter().any(|o| relevant[o.index()]);
    }

    let first_new = graph.len();
    let built = build_gradients(graph, output, wrt, &order, &relevant, seed);
    graph.mark_derived_from(first_new);
    let result = built?;
    for &w in wrt {
        graph.add_grad_target(w);
    }

    debug!(
        "symbolic gradient of node {} w.r.t. {:?}: {} nodes added",
        output,
        wrt,
        graph.len() - first_new
    );
    Ok(result)
}

/// Appends the gradient expressions for `grad` to the graph. Nodes created
/// here are flagged as derived by the caller even when this fails midway.
fn build_gradients(
    graph: &mut Graph,
    output: NodeId,
    wrt: &[NodeId],
    order: &[NodeId],
    relevant: &[bool],
    seed: Tensor,
) -> Result<Vec<NodeId>> {
    let first_new = graph.len();
    let seed = graph.constant(seed);
    let mut pending: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    pending.insert(output, vec![seed]);

    for &id in order.iter().rev() {
        if !relevant[id.index()] {
            continue;
        }
        let Some(contributions) = pending.remove(&id) else {
            continue;
        };
        let total = match contributions.as_slice() {
            [single] => *single,
            many => graph.add_n(many)?,
        };
        graph.set_grad_node(id, total);

        let node = graph.node(id)?;
        let Some(op) = node.op().cloned() else {
            continue;
        };
        let operands = node.operands().to_vec();
        let wants: Vec<bool> = operands.iter().map(|o| relevant[o.index()]).collect();

        let mut builder = SymbolicBuilder { graph: &mut *graph };
        let grads = op.backward(&mut builder, &operands, &id, &total, &wants)?;

        for (operand, g) in operands.iter().zip(grads) {
            let Some(g) = g else { continue };
            assert_eq!(
                graph.node(g)?.shape(),
                graph.node(*operand)?.shape(),
                "{} produced a gradient of the wrong shape for node {}",
                op,
                operand
            );
            pending.entry(*operand).or_default().push(g);
        }
    }

    let mut result = Vec::with_capacity(wrt.len());
    for &w in wrt {
        let g = match graph.grad_node(w) {
            Some(g) if g.index() >= first_new => g,
            _ => {
                // Every path to `w` was cut (e.g. by a step function).
                let node = graph.node(w)?;
                let zeros = Tensor::zeros(node.shape().to_vec(), node.dtype());
                let g = graph.constant(zeros);
                graph.set_grad_node(w, g);
                g
            }
        };
        result.push(g);
    }
    Ok(result)
}

/// Accumulates gradients into the graph's gradient slots by walking `order`
/// (a forward evaluation order whose values are all present) in reverse.
/// Each of `seeds` is seeded with ones. Nodes that receive no contribution
/// end up with a zero gradient.
///
/// # Panics
/// Panics if a gradient rule produces a gradient whose shape differs from
/// its operand.
pub(crate) fn backprop(graph: &mut Graph, order: &[NodeId], seeds: &[NodeId]) -> Result<()> {
    let mut requires = vec![false; graph.len()];
    for &id in order {
        let node = graph.node(id)?;
        requires[id.index()] = match node.kind() {
            NodeKind::Input => true,
            NodeKind::Constant => false,
            NodeKind::Operation(_) => node.operands().iter().any(|o| requires[o.index()]),
        };
    }

    for &seed in seeds {
        let ones = graph
            .value(seed)
            .map(Tensor::ones_like)
            .ok_or_else(|| GraphError::unbound_value(seed))?;
        graph
            .dual_mut(seed)?
            .accumulate(ones)
            .map_err(|source| runtime_error(0, "seed", seed, source))?;
    }

    for (index, &id) in order.iter().enumerate().rev() {
        let node = graph.node(id)?;
        let (Some(op), Some(g)) = (node.op(), node.grad()) else {
            continue;
        };
        let operands = node.operands().to_vec();
        let wants: Vec<bool> = operands.iter().map(|o| requires[o.index()]).collect();
        if !wants.contains(&true) {
            continue;
        }
        let output = node
            .value()
            .cloned()
            .ok_or_else(|| GraphError::unbound_value(id))?;
        let (op, g) = (op.clone(), g.clone());
        let inputs = operands
            .iter()
            .map(|&o| graph.value(o).cloned().ok_or_else(|| GraphError::unbound_value(o)))
            .collect::<Result<Vec<_>>>()?;

        let grads = op
            .backward(&mut NumericBuilder, &inputs, &output, &g, &wants)
            .map_err(|source| runtime_error(index, op.name(), id, source))?;

        for ((operand, input), g) in operands.iter().zip(&inputs).zip(grads) {
            let Some(g) = g else { continue };
            assert_eq!(
                g.shape(),
                input.shape(),
                "{} produced a gradient of the wrong shape for node {}",
                op,
                operand
            );
            graph
                .dual_mut(*operand)?
                .accumulate(g)
                .map_err(|source| runtime_error(index, op.name(), id, source))?;
        }
    }

    for &id in order {
        let dual = graph.dual_mut(id)?;
        if dual.grad.is_none() {
            dual.grad = dual.value.as_ref().map(Tensor::zeros_like);
        }
    }
    Ok(())
}

fn runtime_error(index: usize, op: &'static str, node: NodeId, source: ComputeError) -> GraphError {
    GraphError::Runtime {
        index,
        op,
        node,
        source,
    }
}
