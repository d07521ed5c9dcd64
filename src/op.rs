use std::fmt;

use crate::error::{ComputeError, GraphError};
use crate::tensor::{broadcast_shapes, reduced_shape, shape_product, DType, Tensor};

/// Axis selector for reductions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Axes {
    All,
    Only(Vec<usize>),
}

impl Axes {
    /// Sorted, deduplicated axes for a tensor of rank `rank`.
    pub fn resolve(&self, rank: usize) -> Result<Vec<usize>, String> {
        match self {
            Axes::All => Ok((0..rank).collect()),
            Axes::Only(axes) => {
                let mut out = axes.clone();
                out.sort_unstable();
                out.dedup();
                if let Some(&bad) = out.iter().find(|&&a| a >= rank) {
                    return Err(format!("axis {} out of range for rank {}", bad, rank));
                }
                Ok(out)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variadic { min: usize },
}

impl Arity {
    pub fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Fixed(k) => n == k,
            Arity::Variadic { min } => n >= min,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Exp,
    Ln,
    Sqrt,
    Square,
    Sigmoid,
    Tanh,
    Relu,
    /// Heaviside step: 1 where the operand is positive, else 0.
    Step,
    Sum { axes: Axes, keep_dims: bool },
    Mean { axes: Axes, keep_dims: bool },
    MatMul,
    Transpose,
    Reshape(Vec<usize>),
    BroadcastTo(Vec<usize>),
    /// Sums a broadcast result back down to a smaller compatible shape.
    SumTo(Vec<usize>),
    /// Elementwise sum of any number of equally shaped operands.
    AddN,
}

/// Target of the gradient rules: either a graph under construction
/// (handles are node ids) or a running interpreter (handles are tensors).
pub trait GradBuilder {
    type Handle: Clone;
    type Error;

    fn apply(&mut self, op: Op, operands: &[Self::Handle]) -> Result<Self::Handle, Self::Error>;

    /// Scalar constant with the dtype of `like`.
    fn constant(&mut self, value: f64, like: &Self::Handle) -> Result<Self::Handle, Self::Error>;

    fn shape(&self, handle: &Self::Handle) -> Vec<usize>;
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Pow => "pow",
            Op::Neg => "neg",
            Op::Exp => "exp",
            Op::Ln => "ln",
            Op::Sqrt => "sqrt",
            Op::Square => "square",
            Op::Sigmoid => "sigmoid",
            Op::Tanh => "tanh",
            Op::Relu => "relu",
            Op::Step => "step",
            Op::Sum { .. } => "sum",
            Op::Mean { .. } => "mean",
            Op::MatMul => "matmul",
            Op::Transpose => "transpose",
            Op::Reshape(_) => "reshape",
            Op::BroadcastTo(_) => "broadcast_to",
            Op::SumTo(_) => "sum_to",
            Op::AddN => "add_n",
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow | Op::MatMul => Arity::Fixed(2),
            Op::AddN => Arity::Variadic { min: 1 },
            _ => Arity::Fixed(1),
        }
    }

    pub fn is_elementwise_binary(&self) -> bool {
        matches!(self, Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow)
    }

    fn check_arity(&self, got: usize) -> Result<(), ComputeError> {
        if self.arity().accepts(got) {
            return Ok(());
        }
        let expected = match self.arity() {
            Arity::Fixed(k) => k,
            Arity::Variadic { min } => min,
        };
        Err(ComputeError::Arity {
            op: self.name(),
            expected,
            got,
        })
    }

    /// All operands must share one element type.
    pub fn infer_dtype(&self, dtypes: &[DType]) -> Result<DType, GraphError> {
        let first = dtypes.first().copied().ok_or_else(|| {
            GraphError::shape(self.name(), "operation needs at least one operand")
        })?;
        if dtypes.iter().any(|&d| d != first) {
            return Err(GraphError::Type {
                op: self.name(),
                types: dtypes.to_vec(),
            });
        }
        Ok(first)
    }

    pub fn infer_shape(&self, shapes: &[&[usize]]) -> Result<Vec<usize>, GraphError> {
        self.check_arity(shapes.len())
            .map_err(|e| GraphError::shape(self.name(), e.to_string()))?;
        let fail = |message: String| -> Result<Vec<usize>, GraphError> {
            Err(GraphError::shape(self.name(), message))
        };

        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow => {
                match broadcast_shapes(shapes[0], shapes[1]) {
                    Some(s) => Ok(s),
                    None => fail(format!(
                        "cannot broadcast {:?} with {:?}",
                        shapes[0], shapes[1]
                    )),
                }
            }
            Op::Neg
            | Op::Exp
            | Op::Ln
            | Op::Sqrt
            | Op::Square
            | Op::Sigmoid
            | Op::Tanh
            | Op::Relu
            | Op::Step => Ok(shapes[0].to_vec()),
            Op::Sum { axes, keep_dims } | Op::Mean { axes, keep_dims } => {
                match axes.resolve(shapes[0].len()) {
                    Ok(axes) => Ok(reduced_shape(shapes[0], &axes, *keep_dims)),
                    Err(message) => fail(message),
                }
            }
            Op::MatMul => {
                let (a, b) = (shapes[0], shapes[1]);
                if a.len() != 2 || b.len() != 2 {
                    return fail(format!("expected rank-2 operands, got {:?} and {:?}", a, b));
                }
                if a[1] != b[0] {
                    return fail(format!("inner dimensions differ: {:?} x {:?}", a, b));
                }
                Ok(vec![a[0], b[1]])
            }
            Op::Transpose => match shapes[0] {
                [m, n] => Ok(vec![*n, *m]),
                other => fail(format!("expected a rank-2 operand, got {:?}", other)),
            },
            Op::Reshape(target) => {
                if shape_product(target) != shape_product(shapes[0]) {
                    return fail(format!("cannot reshape {:?} into {:?}", shapes[0], target));
                }
                Ok(target.clone())
            }
            Op::BroadcastTo(target) => {
                if broadcast_shapes(shapes[0], target).as_ref() != Some(target) {
                    return fail(format!("cannot broadcast {:?} to {:?}", shapes[0], target));
                }
                Ok(target.clone())
            }
            Op::SumTo(target) => {
                if broadcast_shapes(target, shapes[0]).as_deref() != Some(shapes[0]) {
                    return fail(format!("cannot reduce {:?} to {:?}", shapes[0], target));
                }
                Ok(target.clone())
            }
            Op::AddN => {
                if let Some(bad) = shapes.iter().find(|s| **s != shapes[0]) {
                    return fail(format!("operand shapes differ: {:?} vs {:?}", shapes[0], bad));
                }
                Ok(shapes[0].to_vec())
            }
        }
    }

    pub fn forward(&self, inputs: &[&Tensor]) -> Result<Tensor, ComputeError> {
        self.check_arity(inputs.len())?;
        let name = self.name();
        match self {
            Op::Add => inputs[0].zip_broadcast(inputs[1], name, |a, b| a + b),
            Op::Sub => inputs[0].zip_broadcast(inputs[1], name, |a, b| a - b),
            Op::Mul => inputs[0].zip_broadcast(inputs[1], name, |a, b| a * b),
            Op::Div => inputs[0].zip_broadcast(inputs[1], name, |a, b| a / b),
            Op::Pow => inputs[0].zip_broadcast(inputs[1], name, f64::powf),
            Op::Neg => Ok(inputs[0].map(|x| -x)),
            Op::Exp => Ok(inputs[0].map(f64::exp)),
            Op::Ln => {
                reject_negative(name, inputs[0])?;
                Ok(inputs[0].map(f64::ln))
            }
            Op::Sqrt => {
                reject_negative(name, inputs[0])?;
                Ok(inputs[0].map(f64::sqrt))
            }
            Op::Square => Ok(inputs[0].map(|x| x * x)),
            Op::Sigmoid => Ok(inputs[0].map(|x| 1.0 / (1.0 + (-x).exp()))),
            Op::Tanh => Ok(inputs[0].map(f64::tanh)),
            Op::Relu => Ok(inputs[0].map(|x| if x > 0.0 { x } else { 0.0 })),
            Op::Step => Ok(inputs[0].map(|x| if x > 0.0 { 1.0 } else { 0.0 })),
            Op::Sum { axes, keep_dims } => {
                let axes = axes
                    .resolve(inputs[0].rank())
                    .map_err(|m| ComputeError::shape(name, m))?;
                inputs[0].reduce_sum(&axes, *keep_dims)
            }
            Op::Mean { axes, keep_dims } => {
                let axes = axes
                    .resolve(inputs[0].rank())
                    .map_err(|m| ComputeError::shape(name, m))?;
                let count = reduced_count(inputs[0].shape(), &axes) as f64;
                Ok(inputs[0].reduce_sum(&axes, *keep_dims)?.map(|s| s / count))
            }
            Op::MatMul => inputs[0].matmul(inputs[1]),
            Op::Transpose => inputs[0].transpose(),
            Op::Reshape(shape) => inputs[0].reshape(shape),
            Op::BroadcastTo(shape) => inputs[0].broadcast_to(shape),
            Op::SumTo(shape) => inputs[0].sum_to(shape),
            Op::AddN => Tensor::add_n(inputs),
        }
    }

    /// Chain rule for this op: maps the gradient of the result to one
    /// gradient per operand. Operands whose `wants` entry is false, and
    /// operands the op does not differentiate through, yield `None`.
    pub fn backward<B: GradBuilder>(
        &self,
        b: &mut B,
        inputs: &[B::Handle],
        output: &B::Handle,
        grad: &B::Handle,
        wants: &[bool],
    ) -> Result<Vec<Option<B::Handle>>, B::Error> {
        let mut grads: Vec<Option<B::Handle>> = vec![None; inputs.len()];
        let want = |i: usize| wants.get(i).copied().unwrap_or(false);
        let g = grad.clone();

        match self {
            Op::Add => {
                if want(0) {
                    grads[0] = Some(sum_like(b, g.clone(), &inputs[0])?);
                }
                if want(1) {
                    grads[1] = Some(sum_like(b, g, &inputs[1])?);
                }
            }
            Op::Sub => {
                if want(0) {
                    grads[0] = Some(sum_like(b, g.clone(), &inputs[0])?);
                }
                if want(1) {
                    let neg = b.apply(Op::Neg, &[g])?;
                    grads[1] = Some(sum_like(b, neg, &inputs[1])?);
                }
            }
            Op::Mul => {
                if want(0) {
                    let d = b.apply(Op::Mul, &[g.clone(), inputs[1].clone()])?;
                    grads[0] = Some(sum_like(b, d, &inputs[0])?);
                }
                if want(1) {
                    let d = b.apply(Op::Mul, &[g, inputs[0].clone()])?;
                    grads[1] = Some(sum_like(b, d, &inputs[1])?);
                }
            }
            Op::Div => {
                if want(0) {
                    let d = b.apply(Op::Div, &[g.clone(), inputs[1].clone()])?;
                    grads[0] = Some(sum_like(b, d, &inputs[0])?);
                }
                if want(1) {
                    // d(a/b)/db = -out / b
                    let go = b.apply(Op::Mul, &[g, output.clone()])?;
                    let q = b.apply(Op::Div, &[go, inputs[1].clone()])?;
                    let d = b.apply(Op::Neg, &[q])?;
                    grads[1] = Some(sum_like(b, d, &inputs[1])?);
                }
            }
            Op::Pow => {
                let (x, y) = (&inputs[0], &inputs[1]);
                if want(0) {
                    let one = b.constant(1.0, y)?;
                    let y_minus_one = b.apply(Op::Sub, &[y.clone(), one])?;
                    let p = b.apply(Op::Pow, &[x.clone(), y_minus_one])?;
                    let local = b.apply(Op::Mul, &[y.clone(), p])?;
                    let d = b.apply(Op::Mul, &[g.clone(), local])?;
                    grads[0] = Some(sum_like(b, d, x)?);
                }
                if want(1) {
                    // ln|x| = ln(x^2) / 2, defined for a negative base.
                    let sq = b.apply(Op::Square, &[x.clone()])?;
                    let ln_sq = b.apply(Op::Ln, &[sq])?;
                    let half = b.constant(0.5, x)?;
                    let ln_x = b.apply(Op::Mul, &[ln_sq, half])?;
                    let local = b.apply(Op::Mul, &[output.clone(), ln_x])?;
                    let d = b.apply(Op::Mul, &[g, local])?;
                    grads[1] = Some(sum_like(b, d, y)?);
                }
            }
            Op::Neg => {
                if want(0) {
                    grads[0] = Some(b.apply(Op::Neg, &[g])?);
                }
            }
            Op::Exp => {
                if want(0) {
                    grads[0] = Some(b.apply(Op::Mul, &[g, output.clone()])?);
                }
            }
            Op::Ln => {
                if want(0) {
                    grads[0] = Some(b.apply(Op::Div, &[g, inputs[0].clone()])?);
                }
            }
            Op::Sqrt => {
                if want(0) {
                    let half = b.constant(0.5, output)?;
                    let scaled = b.apply(Op::Mul, &[g, half])?;
                    grads[0] = Some(b.apply(Op::Div, &[scaled, output.clone()])?);
                }
            }
            Op::Square => {
                if want(0) {
                    let two = b.constant(2.0, &inputs[0])?;
                    let local = b.apply(Op::Mul, &[inputs[0].clone(), two])?;
                    grads[0] = Some(b.apply(Op::Mul, &[g, local])?);
                }
            }
            Op::Sigmoid => {
                if want(0) {
                    let one = b.constant(1.0, output)?;
                    let rest = b.apply(Op::Sub, &[one, output.clone()])?;
                    let local = b.apply(Op::Mul, &[output.clone(), rest])?;
                    grads[0] = Some(b.apply(Op::Mul, &[g, local])?);
                }
            }
            Op::Tanh => {
                if want(0) {
                    let one = b.constant(1.0, output)?;
                    let sq = b.apply(Op::Square, &[output.clone()])?;
                    let local = b.apply(Op::Sub, &[one, sq])?;
                    grads[0] = Some(b.apply(Op::Mul, &[g, local])?);
                }
            }
            Op::Relu => {
                if want(0) {
                    let mask = b.apply(Op::Step, &[inputs[0].clone()])?;
                    grads[0] = Some(b.apply(Op::Mul, &[g, mask])?);
                }
            }
            Op::Step => {}
            Op::Sum { axes, keep_dims } | Op::Mean { axes, keep_dims } => {
                if want(0) {
                    let in_shape = b.shape(&inputs[0]);
                    // Axes were validated when the node was built.
                    let axes = axes.resolve(in_shape.len()).unwrap_or_default();
                    let mut d = g;
                    if !keep_dims {
                        let kept = reduced_shape(&in_shape, &axes, true);
                        d = b.apply(Op::Reshape(kept), &[d])?;
                    }
                    d = b.apply(Op::BroadcastTo(in_shape.clone()), &[d])?;
                    if matches!(self, Op::Mean { .. }) {
                        let count = reduced_count(&in_shape, &axes) as f64;
                        let scale = b.constant(1.0 / count, &d)?;
                        d = b.apply(Op::Mul, &[d, scale])?;
                    }
                    grads[0] = Some(d);
                }
            }
            Op::MatMul => {
                if want(0) {
                    let bt = b.apply(Op::Transpose, &[inputs[1].clone()])?;
                    grads[0] = Some(b.apply(Op::MatMul, &[g.clone(), bt])?);
                }
                if want(1) {
                    let at = b.apply(Op::Transpose, &[inputs[0].clone()])?;
                    grads[1] = Some(b.apply(Op::MatMul, &[at, g])?);
                }
            }
            Op::Transpose => {
                if want(0) {
                    grads[0] = Some(b.apply(Op::Transpose, &[g])?);
                }
            }
            Op::Reshape(_) => {
                if want(0) {
                    let shape = b.shape(&inputs[0]);
                    grads[0] = Some(b.apply(Op::Reshape(shape), &[g])?);
                }
            }
            Op::BroadcastTo(_) => {
                if want(0) {
                    grads[0] = Some(sum_like(b, g, &inputs[0])?);
                }
            }
            Op::SumTo(_) => {
                if want(0) {
                    let shape = b.shape(&inputs[0]);
                    grads[0] = Some(b.apply(Op::BroadcastTo(shape), &[g])?);
                }
            }
            Op::AddN => {
                for (i, slot) in grads.iter_mut().enumerate() {
                    if want(i) {
                        *slot = Some(g.clone());
                    }
                }
            }
        }
        Ok(grads)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Sum { axes, keep_dims } | Op::Mean { axes, keep_dims } => {
                write!(f, "{}", self.name())?;
                if let Axes::Only(axes) = axes {
                    write!(f, "{:?}", axes)?;
                }
                if *keep_dims {
                    write!(f, " keepdims")?;
                }
                Ok(())
            }
            Op::Reshape(s) | Op::BroadcastTo(s) | Op::SumTo(s) => {
                write!(f, "{}{:?}", self.name(), s)
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// Reduces a gradient computed in the broadcast result shape back to the
/// shape of the operand it belongs to.
fn sum_like<B: GradBuilder>(
    b: &mut B,
    grad: B::Handle,
    operand: &B::Handle,
) -> Result<B::Handle, B::Error> {
    let target = b.shape(operand);
    if b.shape(&grad) == target {
        return Ok(grad);
    }
    b.apply(Op::SumTo(target), &[grad])
}

fn reduced_count(shape: &[usize], axes: &[usize]) -> usize {
    axes.iter().map(|&a| shape[a]).product()
}

fn reject_negative(op: &'static str, t: &Tensor) -> Result<(), ComputeError> {
    match t.data().iter().find(|v| **v < 0.0) {
        Some(v) => Err(ComputeError::domain(op, format!("negative operand {}", v))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grad::NumericBuilder as Eager;

    fn grads(op: &Op, inputs: &[Tensor]) -> Vec<Option<Tensor>> {
        let refs: Vec<&Tensor> = inputs.iter().collect();
        let out = op.forward(&refs).unwrap();
        let seed = out.ones_like();
        let wants = vec![true; inputs.len()];
        op.backward(&mut Eager, inputs, &out, &seed, &wants).unwrap()
    }

    /// Central difference of `sum(op(inputs))` with respect to one element.
    fn numeric(op: &Op, inputs: &[Tensor], which: usize, elem: usize) -> f64 {
        let h = 1e-6;
        let eval = |delta: f64| {
            let mut xs = inputs.to_vec();
            let mut data = xs[which].data().to_vec();
            data[elem] += delta;
            xs[which] = Tensor::new(xs[which].shape().to_vec(), data).unwrap();
            let refs: Vec<&Tensor> = xs.iter().collect();
            op.forward(&refs).unwrap().data().iter().sum::<f64>()
        };
        (eval(h) - eval(-h)) / (2.0 * h)
    }

    fn check_against_numeric(op: Op, inputs: Vec<Tensor>) {
        let analytic = grads(&op, &inputs);
        for (i, g) in analytic.iter().enumerate() {
            let g = g.as_ref().unwrap();
            assert_eq!(g.shape(), inputs[i].shape(), "{} grad {} shape", op, i);
            for e in 0..g.numel() {
                let n = numeric(&op, &inputs, i, e);
                assert!(
                    (g.data()[e] - n).abs() < 1e-4,
                    "{} operand {} elem {}: {} vs {}",
                    op,
                    i,
                    e,
                    g.data()[e],
                    n
                );
            }
        }
    }

    fn t(shape: &[usize], data: &[f64]) -> Tensor {
        Tensor::new(shape.to_vec(), data.to_vec()).unwrap()
    }

    #[test]
    fn test_broadcast_shape_inference() {
        assert_eq!(Op::Add.infer_shape(&[&[2, 3], &[3]]).unwrap(), vec![2, 3]);
        assert!(matches!(
            Op::Add.infer_shape(&[&[2, 3], &[4]]),
            Err(GraphError::Shape { op: "add", .. })
        ));
    }

    #[test]
    fn test_dtype_inference() {
        assert_eq!(Op::Mul.infer_dtype(&[DType::F32, DType::F32]).unwrap(), DType::F32);
        assert!(matches!(
            Op::Mul.infer_dtype(&[DType::F32, DType::F64]),
            Err(GraphError::Type { .. })
        ));
    }

    #[test]
    fn test_reduction_shapes() {
        let sum = Op::Sum {
            axes: Axes::Only(vec![1]),
            keep_dims: false,
        };
        assert_eq!(sum.infer_shape(&[&[2, 3, 4]]).unwrap(), vec![2, 4]);
        let mean = Op::Mean {
            axes: Axes::All,
            keep_dims: true,
        };
        assert_eq!(mean.infer_shape(&[&[2, 3]]).unwrap(), vec![1, 1]);
        let bad = Op::Sum {
            axes: Axes::Only(vec![3]),
            keep_dims: false,
        };
        assert!(bad.infer_shape(&[&[2, 3]]).is_err());
    }

    #[test]
    fn test_arity() {
        assert!(Op::Add.infer_shape(&[&[2]]).is_err());
        assert!(Op::AddN.infer_shape(&[&[2], &[2], &[2]]).is_ok());
        assert!(Op::AddN.infer_shape(&[]).is_err());
    }

    #[test]
    fn test_domain_errors() {
        let neg = Tensor::scalar(-1.0);
        assert!(matches!(Op::Ln.forward(&[&neg]), Err(ComputeError::Domain { op: "ln", .. })));
        assert!(matches!(Op::Sqrt.forward(&[&neg]), Err(ComputeError::Domain { .. })));
    }

    #[test]
    fn test_binary_gradients_with_broadcast() {
        let a = t(&[2, 3], &[0.5, 1.0, 1.5, 2.0, 2.5, 3.0]);
        let b = t(&[3], &[1.5, 0.7, 2.0]);
        for op in [Op::Add, Op::Sub, Op::Mul, Op::Div, Op::Pow] {
            check_against_numeric(op, vec![a.clone(), b.clone()]);
        }
    }

    #[test]
    fn test_pow_gradient_with_negative_base() {
        let x = Tensor::scalar(-3.0);
        let p = Tensor::scalar(2.0);
        let g = grads(&Op::Pow, &[x, p]);
        let dx = g[0].as_ref().unwrap().as_scalar().unwrap();
        let dp = g[1].as_ref().unwrap().as_scalar().unwrap();
        assert!((dx + 6.0).abs() < 1e-12);
        assert!((dp - 9.0 * 3.0f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_unary_gradients() {
        let x = t(&[4], &[0.3, 1.2, 2.0, 0.9]);
        for op in [
            Op::Neg,
            Op::Exp,
            Op::Ln,
            Op::Sqrt,
            Op::Square,
            Op::Sigmoid,
            Op::Tanh,
            Op::Relu,
        ] {
            check_against_numeric(op, vec![x.clone()]);
        }
    }

    #[test]
    fn test_structural_gradients() {
        let x = t(&[2, 3], &[1.0, -2.0, 3.0, 0.5, 0.25, -1.0]);
        check_against_numeric(
            Op::Sum {
                axes: Axes::Only(vec![0]),
                keep_dims: false,
            },
            vec![x.clone()],
        );
        check_against_numeric(
            Op::Mean {
                axes: Axes::All,
                keep_dims: true,
            },
            vec![x.clone()],
        );
        check_against_numeric(Op::Transpose, vec![x.clone()]);
        check_against_numeric(Op::Reshape(vec![3, 2]), vec![x.clone()]);
        check_against_numeric(Op::BroadcastTo(vec![4, 2, 3]), vec![x.clone()]);
        check_against_numeric(Op::SumTo(vec![3]), vec![x.clone()]);
        let w = t(&[3, 2], &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        check_against_numeric(Op::MatMul, vec![x.clone(), w]);
        check_against_numeric(Op::AddN, vec![x.clone(), x.clone(), x]);
    }

    #[test]
    fn test_step_has_no_gradient() {
        let g = grads(&Op::Step, &[Tensor::scalar(2.0)]);
        assert_eq!(g, vec![None]);
    }

    #[test]
    fn test_wants_mask_skips_operands() {
        let x = Tensor::scalar(3.0);
        let two = Tensor::scalar(2.0);
        let out = Op::Pow.forward(&[&x, &two]).unwrap();
        let g = Op::Pow
            .backward(&mut Eager, &[x, two], &out, &Tensor::scalar(1.0), &[true, false])
            .unwrap();
        assert_eq!(g[0].as_ref().and_then(Tensor::as_scalar), Some(6.0));
        assert!(g[1].is_none());
    }
}
