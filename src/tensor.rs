use std::fmt;

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use crate::error::ComputeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    F32,
    #[default]
    F64,
}

impl DType {
    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    #[inline]
    fn round(self, v: f64) -> f64 {
        match self {
            DType::F32 => v as f32 as f64,
            DType::F64 => v,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row-major values stored as `f64`; `F32` results are rounded through `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl Tensor {
    /// Builds an `f64` tensor, checking that `data` fills `shape`.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<f64>) -> Result<Self, ComputeError> {
        let shape = shape.into();
        let expected = shape_product(&shape);
        if expected != data.len() {
            return Err(ComputeError::shape(
                "tensor",
                format!(
                    "shape {:?} needs {} elements, got {}",
                    shape,
                    expected,
                    data.len()
                ),
            ));
        }
        Ok(Tensor {
            dtype: DType::F64,
            shape,
            data,
        })
    }

    pub fn scalar(value: f64) -> Self {
        Tensor {
            dtype: DType::F64,
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn from_vec(data: Vec<f64>) -> Self {
        Tensor {
            dtype: DType::F64,
            shape: vec![data.len()],
            data,
        }
    }

    pub fn full(shape: impl Into<Vec<usize>>, value: f64, dtype: DType) -> Self {
        let shape = shape.into();
        let size = shape_product(&shape);
        Tensor {
            dtype,
            shape,
            data: vec![dtype.round(value); size],
        }
    }

    pub fn zeros(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Tensor::full(shape, 0.0, dtype)
    }

    pub fn ones(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Tensor::full(shape, 1.0, dtype)
    }

    pub fn zeros_like(&self) -> Self {
        Tensor::zeros(self.shape.clone(), self.dtype)
    }

    pub fn ones_like(&self) -> Self {
        Tensor::ones(self.shape.clone(), self.dtype)
    }

    /// Samples every element from `U[low, high)`.
    pub fn random_uniform<R: Rng + ?Sized>(
        shape: impl Into<Vec<usize>>,
        low: f64,
        high: f64,
        rng: &mut R,
    ) -> Result<Self, ComputeError> {
        if !(low < high) || !(high - low).is_finite() {
            return Err(ComputeError::domain(
                "random_uniform",
                format!("invalid range [{}, {})", low, high),
            ));
        }
        let shape = shape.into();
        let dist = Uniform::new(low, high);
        let data = (0..shape_product(&shape)).map(|_| dist.sample(rng)).collect();
        Ok(Tensor {
            dtype: DType::F64,
            shape,
            data,
        })
    }

    /// Samples every element from `N(mean, std)`.
    pub fn random_normal<R: Rng + ?Sized>(
        shape: impl Into<Vec<usize>>,
        mean: f64,
        std: f64,
        rng: &mut R,
    ) -> Result<Self, ComputeError> {
        let normal = Normal::new(mean, std)
            .map_err(|e| ComputeError::domain("random_normal", e.to_string()))?;
        let shape = shape.into();
        let data = (0..shape_product(&shape)).map(|_| normal.sample(rng)).collect();
        Ok(Tensor {
            dtype: DType::F64,
            shape,
            data,
        })
    }

    /// Reinterprets the tensor with another element type, rounding as needed.
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        for v in &mut self.data {
            *v = dtype.round(*v);
        }
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// The single element of a one-element tensor.
    pub fn as_scalar(&self) -> Option<f64> {
        match self.data.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }

    pub fn approx_eq(&self, other: &Tensor, tol: f64) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs())))
    }

    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f64) -> f64,
    {
        let dtype = self.dtype;
        Tensor {
            dtype,
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| dtype.round(f(x))).collect(),
        }
    }

    /// Elementwise binary kernel under the broadcasting policy.
    pub fn zip_broadcast<F>(&self, other: &Tensor, op: &'static str, f: F) -> Result<Tensor, ComputeError>
    where
        F: Fn(f64, f64) -> f64,
    {
        let dtype = self.dtype;
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| dtype.round(f(a, b)))
                .collect();
            return Ok(Tensor {
                dtype,
                shape: self.shape.clone(),
                data,
            });
        }

        let out_shape = broadcast_shapes(&self.shape, &other.shape).ok_or_else(|| {
            ComputeError::shape(
                op,
                format!("cannot broadcast {:?} with {:?}", self.shape, other.shape),
            )
        })?;
        let a_strides = broadcast_strides(&self.shape, &out_shape);
        let b_strides = broadcast_strides(&other.shape, &out_shape);
        let mut data = Vec::with_capacity(shape_product(&out_shape));
        for lin in 0..shape_product(&out_shape) {
            let a = self.data[broadcast_offset(lin, &out_shape, &a_strides)];
            let b = other.data[broadcast_offset(lin, &out_shape, &b_strides)];
            data.push(dtype.round(f(a, b)));
        }
        Ok(Tensor {
            dtype,
            shape: out_shape,
            data,
        })
    }

    /// Stretches the tensor to `shape`.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Tensor, ComputeError> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        if broadcast_shapes(&self.shape, shape).as_deref() != Some(shape) {
            return Err(ComputeError::shape(
                "broadcast_to",
                format!("cannot broadcast {:?} to {:?}", self.shape, shape),
            ));
        }
        let strides = broadcast_strides(&self.shape, shape);
        let data = (0..shape_product(shape))
            .map(|lin| self.data[broadcast_offset(lin, shape, &strides)])
            .collect();
        Ok(Tensor {
            dtype: self.dtype,
            shape: shape.to_vec(),
            data,
        })
    }

    /// Sums the tensor down to `shape`, the adjoint of [`Tensor::broadcast_to`].
    pub fn sum_to(&self, shape: &[usize]) -> Result<Tensor, ComputeError> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        if broadcast_shapes(shape, &self.shape).as_deref() != Some(self.shape.as_slice()) {
            return Err(ComputeError::shape(
                "sum_to",
                format!("cannot reduce {:?} to {:?}", self.shape, shape),
            ));
        }
        let strides = broadcast_strides(shape, &self.shape);
        let mut data = vec![0.0; shape_product(shape)];
        for (lin, v) in self.data.iter().enumerate() {
            data[broadcast_offset(lin, &self.shape, &strides)] += v;
        }
        let dtype = self.dtype;
        Ok(Tensor {
            dtype,
            shape: shape.to_vec(),
            data: data.into_iter().map(|v| dtype.round(v)).collect(),
        })
    }

    /// Sums over `axes` (already validated, ascending).
    pub fn reduce_sum(&self, axes: &[usize], keep_dims: bool) -> Result<Tensor, ComputeError> {
        let kept = reduced_shape(&self.shape, axes, true);
        let summed = self.sum_to(&kept)?;
        if keep_dims {
            Ok(summed)
        } else {
            summed.reshape(&reduced_shape(&self.shape, axes, false))
        }
    }

    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor, ComputeError> {
        if shape_product(shape) != self.data.len() {
            return Err(ComputeError::shape(
                "reshape",
                format!("cannot reshape {:?} into {:?}", self.shape, shape),
            ));
        }
        Ok(Tensor {
            dtype: self.dtype,
            shape: shape.to_vec(),
            data: self.data.clone(),
        })
    }

    pub fn transpose(&self) -> Result<Tensor, ComputeError> {
        if self.shape.len() != 2 {
            return Err(ComputeError::shape(
                "transpose",
                format!("expected a rank-2 tensor, got {:?}", self.shape),
            ));
        }
        let (m, n) = (self.shape[0], self.shape[1]);
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                out[j * m + i] = self.data[i * n + j];
            }
        }
        Ok(Tensor {
            dtype: self.dtype,
            shape: vec![n, m],
            data: out,
        })
    }

    pub fn matmul(&self, other: &Tensor) -> Result<Tensor, ComputeError> {
        if self.shape.len() != 2 || other.shape.len() != 2 {
            return Err(ComputeError::shape(
                "matmul",
                format!("expected rank-2 tensors, got {:?} and {:?}", self.shape, other.shape),
            ));
        }
        let (m, k) = (self.shape[0], self.shape[1]);
        let (k2, n) = (other.shape[0], other.shape[1]);
        if k != k2 {
            return Err(ComputeError::shape(
                "matmul",
                format!("inner dimensions differ: {} vs {}", k, k2),
            ));
        }
        let dtype = self.dtype;
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut s = 0.0;
                for p in 0..k {
                    s += self.data[i * k + p] * other.data[p * n + j];
                }
                out[i * n + j] = dtype.round(s);
            }
        }
        Ok(Tensor {
            dtype,
            shape: vec![m, n],
            data: out,
        })
    }

    /// Elementwise sum of equally shaped tensors.
    pub fn add_n(tensors: &[&Tensor]) -> Result<Tensor, ComputeError> {
        let (first, rest) = tensors
            .split_first()
            .ok_or(ComputeError::Arity {
                op: "add_n",
                expected: 1,
                got: 0,
            })?;
        let mut acc = (*first).clone();
        for t in rest {
            if t.shape != acc.shape {
                return Err(ComputeError::shape(
                    "add_n",
                    format!("operand shapes differ: {:?} vs {:?}", acc.shape, t.shape),
                ));
            }
            for (a, b) in acc.data.iter_mut().zip(&t.data) {
                *a += b;
            }
        }
        let dtype = acc.dtype;
        for v in &mut acc.data {
            *v = dtype.round(*v);
        }
        Ok(acc)
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let ([], [v]) = (self.shape.as_slice(), self.data.as_slice()) {
            return write!(f, "{}", v);
        }
        let shown = if self.data.len() > 16 { &self.data[..16] } else { &self.data[..] };
        write!(f, "{}{:?} {:?}", self.dtype, self.shape, shown)?;
        if self.data.len() > 16 {
            write!(f, "...")?;
        }
        Ok(())
    }
}

pub fn shape_product(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Result shape of broadcasting `a` against `b`: trailing dimensions are
/// aligned and size-1 dimensions stretch. `None` when no broadcast exists.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let (mut ra, mut rb) = (a.iter().rev(), b.iter().rev());
    let mut out = Vec::with_capacity(rank);
    for _ in 0..rank {
        let da = ra.next().copied().unwrap_or(1);
        let db = rb.next().copied().unwrap_or(1);
        out.push(match (da, db) {
            _ if da == db => da,
            (1, d) | (d, 1) => d,
            _ => return None,
        });
    }
    out.reverse();
    Some(out)
}

/// Shape left after summing over `axes`.
pub fn reduced_shape(shape: &[usize], axes: &[usize], keep_dims: bool) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| match (axes.contains(&i), keep_dims) {
            (false, _) => Some(d),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect()
}

/// Strides of `in_shape` laid over `out_shape`; stretched axes get stride 0.
fn broadcast_strides(in_shape: &[usize], out_shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; out_shape.len()];
    let mut step = 1;
    for (slot, &dim) in strides.iter_mut().rev().zip(in_shape.iter().rev()) {
        if dim != 1 {
            *slot = step;
        }
        step *= dim;
    }
    strides
}

fn broadcast_offset(mut lin: usize, out_shape: &[usize], strides: &[usize]) -> usize {
    let mut offset = 0;
    for axis in (0..out_shape.len()).rev() {
        let dim = out_shape[axis];
        offset += (lin % dim) * strides[axis];
        lin /= dim;
    }
    offset
}
