use thiserror::Error;

use crate::graph::NodeId;
use crate::tensor::DType;

/// Failure of a single kernel invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("{op}: {message}")]
    Shape { op: &'static str, message: String },

    #[error("{op}: numeric domain error: {message}")]
    Domain { op: &'static str, message: String },

    #[error("{op}: expected {expected} operands, got {got}")]
    Arity {
        op: &'static str,
        expected: usize,
        got: usize,
    },
}

impl ComputeError {
    pub fn shape(op: &'static str, message: impl Into<String>) -> Self {
        ComputeError::Shape {
            op,
            message: message.into(),
        }
    }

    pub fn domain(op: &'static str, message: impl Into<String>) -> Self {
        ComputeError::Domain {
            op,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("shape error in {op}: {message}")]
    Shape { op: &'static str, message: String },

    #[error("type error in {op}: operand types {types:?} are incompatible")]
    Type { op: &'static str, types: Vec<DType> },

    #[error("cannot bind value of shape {got:?} ({got_dtype:?}) to node {node} declared {expected:?} ({expected_dtype:?})")]
    ShapeMismatch {
        node: NodeId,
        expected: Vec<usize>,
        got: Vec<usize>,
        expected_dtype: DType,
        got_dtype: DType,
    },

    #[error("node {node} is not an input and cannot be bound")]
    NotAnInput { node: NodeId },

    #[error("node {node} is not differentiable: {reason}")]
    NotDifferentiable { node: NodeId, reason: String },

    #[error("node {wrt} is not an ancestor of node {output}")]
    NoPath { output: NodeId, wrt: NodeId },

    #[error("cycle detected through node {node}")]
    CyclicGraph { node: NodeId },

    #[error("input node {node} has no bound value")]
    UnboundInput { node: NodeId },

    #[error("node {node} has no location in the compiled program")]
    UnknownNode { node: NodeId },

    #[error("node {node} has no {what} available")]
    Unbound { node: NodeId, what: &'static str },

    #[error("instruction {index} ({op}) for node {node} failed: {source}")]
    Runtime {
        index: usize,
        op: &'static str,
        node: NodeId,
        #[source]
        source: ComputeError,
    },

    #[error("node {node} does not belong to this graph")]
    InvalidNode { node: NodeId },
}

impl GraphError {
    pub fn shape(op: &'static str, message: impl Into<String>) -> Self {
        GraphError::Shape {
            op,
            message: message.into(),
        }
    }

    pub fn unbound_value(node: NodeId) -> Self {
        GraphError::Unbound { node, what: "value" }
    }

    pub fn unbound_grad(node: NodeId) -> Self {
        GraphError::Unbound {
            node,
            what: "gradient",
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
