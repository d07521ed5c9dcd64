// gradgraph
// Expression graphs with symbolic and automatic differentiation

pub mod error;
pub mod tensor;
pub mod op;
pub mod graph;
pub mod grad;
pub mod compiler;
pub mod tape;
pub mod lisp;

pub use error::{ComputeError, GraphError, Result};
pub use tensor::{DType, Tensor};
pub use op::{Axes, GradBuilder, Op};
pub use graph::{DualValue, Graph, Node, NodeId, NodeKind};
pub use grad::grad;
pub use compiler::{compile, compile_with, CompileOptions, InputSlot, Instruction, Location, LocationMap, Program};
pub use tape::TapeMachine;
pub use lisp::{LispMachine, MachineOptions};
