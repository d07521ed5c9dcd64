use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use log::trace;

use crate::error::{ComputeError, GraphError, Result};
use crate::op::{Axes, Op};
use crate::tensor::{DType, Tensor};

/// Index of a node inside its [`Graph`]. Ids are handed out in insertion
/// order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(id: usize) -> Self {
        NodeId(id)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Leaf whose value is supplied by the user.
    Input,
    /// Leaf with a value fixed at construction.
    Constant,
    Operation(Op),
}

/// A value slot paired with its gradient slot. Gradients start out as the
/// additive identity and only ever accumulate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DualValue {
    pub value: Option<Tensor>,
    pub grad: Option<Tensor>,
}

impl DualValue {
    pub fn accumulate(&mut self, delta: Tensor) -> std::result::Result<(), ComputeError> {
        self.grad = Some(match self.grad.take() {
            None => delta,
            Some(current) => Tensor::add_n(&[&current, &delta])?,
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: NodeId,
    name: Option<String>,
    kind: NodeKind,
    dtype: DType,
    shape: Vec<usize>,
    operands: Vec<NodeId>,
    bound: DualValue,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn op(&self) -> Option<&Op> {
        match &self.kind {
            NodeKind::Operation(op) => Some(op),
            _ => None,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn operands(&self) -> &[NodeId] {
        &self.operands
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.bound.value.as_ref()
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.bound.grad.as_ref()
    }

    pub fn is_leaf(&self) -> bool {
        self.operands.is_empty()
    }

    pub fn is_input(&self) -> bool {
        matches!(self.kind, NodeKind::Input)
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, NodeKind::Constant)
    }

    pub fn is_scalar_shaped(&self) -> bool {
        self.shape.iter().product::<usize>() == 1
    }

    fn label(&self) -> String {
        match (&self.kind, &self.name) {
            (_, Some(name)) => name.clone(),
            (NodeKind::Operation(op), None) => op.to_string(),
            (NodeKind::Input, None) => "input".to_string(),
            (NodeKind::Constant, None) => "const".to_string(),
        }
    }
}

/// Arena of nodes forming one expression DAG.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: Vec<Node>,
    consumers: Vec<Vec<NodeId>>,
    outputs: Vec<NodeId>,
    /// Node -> node holding its symbolic gradient. Never an operand edge.
    grad_of: BTreeMap<NodeId, NodeId>,
    /// Nodes whose gradient was asked for by name in a `grad` call.
    grad_targets: BTreeSet<NodeId>,
    /// Nodes created by symbolic differentiation.
    derived: BTreeSet<NodeId>,
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Fresh,
    Open,
    Done,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.index())
            .ok_or(GraphError::InvalidNode { node: id })
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.index())
            .ok_or(GraphError::InvalidNode { node: id })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    fn push(
        &mut self,
        kind: NodeKind,
        dtype: DType,
        shape: Vec<usize>,
        operands: Vec<NodeId>,
        value: Option<Tensor>,
    ) -> NodeId {
        let id = NodeId::new(self.nodes.len());
        for operand in &operands {
            self.consumers[operand.index()].push(id);
        }
        self.nodes.push(Node {
            id,
            name: None,
            kind,
            dtype,
            shape,
            operands,
            bound: DualValue {
                value,
                grad: None,
            },
        });
        self.consumers.push(Vec::new());
        id
    }

    pub fn input(&mut self, name: impl Into<String>, dtype: DType, shape: impl Into<Vec<usize>>) -> NodeId {
        let id = self.push(NodeKind::Input, dtype, shape.into(), Vec::new(), None);
        self.nodes[id.index()].name = Some(name.into());
        id
    }

    pub fn scalar_input(&mut self, name: impl Into<String>, dtype: DType) -> NodeId {
        self.input(name, dtype, Vec::new())
    }

    pub fn constant(&mut self, value: Tensor) -> NodeId {
        let (dtype, shape) = (value.dtype(), value.shape().to_vec());
        self.push(NodeKind::Constant, dtype, shape, Vec::new(), Some(value))
    }

    pub fn scalar(&mut self, value: f64, dtype: DType) -> NodeId {
        self.constant(Tensor::scalar(value).with_dtype(dtype))
    }

    /// Inserts a node computing `op` over `operands`, inferring its shape and
    /// element type. Structurally identical expressions are not shared.
    pub fn apply(&mut self, op: Op, operands: &[NodeId]) -> Result<NodeId> {
        let mut shapes = Vec::with_capacity(operands.len());
        let mut dtypes = Vec::with_capacity(operands.len());
        for &id in operands {
            let node = self.node(id)?;
            shapes.push(node.shape());
            dtypes.push(node.dtype());
        }
        let shape = op.infer_shape(&shapes)?;
        let dtype = op.infer_dtype(&dtypes)?;
        let id = self.push(NodeKind::Operation(op), dtype, shape, operands.to_vec(), None);
        trace!("node {} = {} {:?}", id, self.nodes[id.index()].label(), operands);
        Ok(id)
    }

    pub fn set_name(&mut self, id: NodeId, name: impl Into<String>) -> Result<()> {
        self.node_mut(id)?.name = Some(name.into());
        Ok(())
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| n.name.as_deref() == Some(name))
            .map(|n| n.id)
    }

    /// Binds a value to an input node.
    pub fn bind(&mut self, id: NodeId, value: Tensor) -> Result<()> {
        let node = self.node_mut(id)?;
        if !node.is_input() {
            return Err(GraphError::NotAnInput { node: id });
        }
        if node.shape() != value.shape() || node.dtype() != value.dtype() {
            return Err(GraphError::ShapeMismatch {
                node: id,
                expected: node.shape.clone(),
                got: value.shape().to_vec(),
                expected_dtype: node.dtype,
                got_dtype: value.dtype(),
            });
        }
        node.bound.value = Some(value);
        Ok(())
    }

    pub fn value(&self, id: NodeId) -> Option<&Tensor> {
        self.nodes.get(id.index()).and_then(Node::value)
    }

    pub fn gradient(&self, id: NodeId) -> Option<&Tensor> {
        self.nodes.get(id.index()).and_then(Node::grad)
    }

    pub(crate) fn dual_mut(&mut self, id: NodeId) -> Result<&mut DualValue> {
        Ok(&mut self.node_mut(id)?.bound)
    }

    /// Clears computed values and all gradients; input bindings and
    /// constants survive.
    pub(crate) fn clear_computed(&mut self) {
        for node in &mut self.nodes {
            if matches!(node.kind, NodeKind::Operation(_)) {
                node.bound.value = None;
            }
            node.bound.grad = None;
        }
    }

    pub fn mark_output(&mut self, id: NodeId) -> Result<()> {
        self.node(id)?;
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        Ok(())
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Declared outputs, or every root when none were declared.
    pub fn roots(&self) -> Vec<NodeId> {
        if !self.outputs.is_empty() {
            return self.outputs.clone();
        }
        self.nodes
            .iter()
            .map(Node::id)
            .filter(|&id| self.is_root(id))
            .collect()
    }

    pub fn consumers(&self, id: NodeId) -> &[NodeId] {
        self.consumers
            .get(id.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Not part of a gradient expression, and consumed by nothing except
    /// gradient expressions.
    pub fn is_root(&self, id: NodeId) -> bool {
        !self.derived.contains(&id)
            && self.consumers(id).iter().all(|c| self.derived.contains(c))
    }

    /// Built by [`crate::grad`] rather than by the user.
    pub fn is_derived(&self, id: NodeId) -> bool {
        self.derived.contains(&id)
    }

    pub(crate) fn mark_derived_from(&mut self, first: usize) {
        self.derived.extend((first..self.nodes.len()).map(NodeId::new));
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).is_some_and(Node::is_leaf)
    }

    pub fn is_input(&self, id: NodeId) -> bool {
        self.nodes.get(id.index()).is_some_and(Node::is_input)
    }

    /// The node holding the symbolic gradient of `id`, if one was built.
    pub fn grad_node(&self, id: NodeId) -> Option<NodeId> {
        self.grad_of.get(&id).copied()
    }

    pub(crate) fn set_grad_node(&mut self, id: NodeId, grad: NodeId) {
        self.grad_of.insert(id, grad);
    }

    pub fn grad_nodes(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.grad_of.iter().map(|(&n, &g)| (n, g))
    }

    pub(crate) fn add_grad_target(&mut self, id: NodeId) {
        self.grad_targets.insert(id);
    }

    /// Gradient nodes of the nodes passed as `wrt` to [`crate::grad`].
    pub fn requested_grads(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.grad_targets
            .iter()
            .filter_map(|n| self.grad_of.get(n).map(|&g| (*n, g)))
    }

    /// Every node reachable from `roots` over operand edges, each emitted
    /// after all of its operands (depth-first post-order). Gradient
    /// back-references are not followed.
    pub fn topological_order(&self, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut state = vec![Visit::Fresh; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack: Vec<(NodeId, usize)> = Vec::new();

        for &root in roots {
            self.node(root)?;
            if state[root.index()] != Visit::Fresh {
                continue;
            }
            state[root.index()] = Visit::Open;
            stack.push((root, 0));

            while let Some((id, next)) = stack.pop() {
                let operands = &self.nodes[id.index()].operands;
                if let Some(&operand) = operands.get(next) {
                    stack.push((id, next + 1));
                    match state[operand.index()] {
                        Visit::Fresh => {
                            state[operand.index()] = Visit::Open;
                            stack.push((operand, 0));
                        }
                        Visit::Open => return Err(GraphError::CyclicGraph { node: operand }),
                        Visit::Done => {}
                    }
                } else {
                    state[id.index()] = Visit::Done;
                    order.push(id);
                }
            }
        }
        Ok(order)
    }

    /// `id` together with everything it transitively depends on.
    pub fn ancestors(&self, id: NodeId) -> Result<HashSet<NodeId>> {
        Ok(self.topological_order(&[id])?.into_iter().collect())
    }

    fn unary(&mut self, op: Op, x: NodeId) -> Result<NodeId> {
        self.apply(op, &[x])
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Op::Add, &[a, b])
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Op::Sub, &[a, b])
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Op::Mul, &[a, b])
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Op::Div, &[a, b])
    }

    pub fn pow(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Op::Pow, &[a, b])
    }

    pub fn neg(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(Op::Neg, x)
    }

    pub fn exp(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(Op::Exp, x)
    }

    pub fn ln(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(Op::Ln, x)
    }

    pub fn sqrt(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(Op::Sqrt, x)
    }

    pub fn square(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(Op::Square, x)
    }

    pub fn sigmoid(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(Op::Sigmoid, x)
    }

    pub fn tanh(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(Op::Tanh, x)
    }

    pub fn relu(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(Op::Relu, x)
    }

    pub fn sum(&mut self, x: NodeId, axes: Axes, keep_dims: bool) -> Result<NodeId> {
        self.unary(Op::Sum { axes, keep_dims }, x)
    }

    pub fn mean(&mut self, x: NodeId, axes: Axes, keep_dims: bool) -> Result<NodeId> {
        self.unary(Op::Mean { axes, keep_dims }, x)
    }

    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.apply(Op::MatMul, &[a, b])
    }

    pub fn transpose(&mut self, x: NodeId) -> Result<NodeId> {
        self.unary(Op::Transpose, x)
    }

    pub fn reshape(&mut self, x: NodeId, shape: impl Into<Vec<usize>>) -> Result<NodeId> {
        self.unary(Op::Reshape(shape.into()), x)
    }

    pub fn broadcast_to(&mut self, x: NodeId, shape: impl Into<Vec<usize>>) -> Result<NodeId> {
        self.unary(Op::BroadcastTo(shape.into()), x)
    }

    pub fn add_n(&mut self, xs: &[NodeId]) -> Result<NodeId> {
        self.apply(Op::AddN, xs)
    }
}
