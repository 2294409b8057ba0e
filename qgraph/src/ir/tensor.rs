//! Values owned by parameter variables and tensor attributes.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum TensorData {
    F32(Vec<f32>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dense tensor stored in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        ensure!(
            shape.iter().product::<usize>() == data.len(),
            "shape {:?} does not match {} elements",
            shape,
            data.len()
        );
        Ok(Self { shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::new(shape, TensorData::F32(data))
    }

    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Result<Self> {
        Self::new(shape, TensorData::I64(data))
    }

    /// 1-d tensor holding the given values
    pub fn vector_i64(data: Vec<i64>) -> Self {
        Self {
            shape: vec![data.len()],
            data: TensorData::I64(data),
        }
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self {
            shape: vec![],
            data: TensorData::F32(vec![value]),
        }
    }

    pub fn zeros_f32(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: TensorData::F32(vec![0.0; len]),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the values as `f32`, casting integer data.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::I64(v) => v.iter().map(|x| *x as f32).collect(),
        }
    }

    /// Multiplies every slice along `axis` by the matching entry of `factors`.
    /// The tensor is converted to `f32` data.
    pub fn scale_along_axis(&self, axis: usize, factors: &[f32]) -> Result<Tensor> {
        ensure!(
            axis < self.shape.len(),
            "axis {} out of range for shape {:?}",
            axis,
            self.shape
        );
        ensure!(
            self.shape[axis] == factors.len(),
            "dimension {} of shape {:?} does not match {} factors",
            axis,
            self.shape,
            factors.len()
        );
        // elements sharing an index on `axis` are `inner` contiguous values repeated every
        // `inner * shape[axis]` values
        let inner = self.shape[axis + 1..].iter().product::<usize>();
        let dim = self.shape[axis];
        let data = self
            .to_f32_vec()
            .into_iter()
            .enumerate()
            .map(|(i, x)| x * factors[(i / inner) % dim])
            .collect();
        Tensor::from_f32(self.shape.clone(), data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shape_mismatch() {
        assert!(Tensor::from_f32(vec![2, 2], vec![1.0, 2.0, 3.0]).is_err());
        assert!(Tensor::from_i64(vec![3], vec![1, 2, 3]).is_ok());
    }

    #[test]
    fn test_scale_along_axis() {
        let t = Tensor::from_f32(vec![2, 3], vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]).unwrap();
        let rows = t.scale_along_axis(0, &[2.0, 10.0]).unwrap();
        assert_eq!(rows.to_f32_vec(), vec![2.0, 2.0, 2.0, 20.0, 20.0, 20.0]);
        let cols = t.scale_along_axis(1, &[1.0, 0.0, -1.0]).unwrap();
        assert_eq!(cols.to_f32_vec(), vec![1.0, 0.0, -1.0, 2.0, 0.0, -2.0]);
        assert!(t.scale_along_axis(1, &[1.0]).is_err());
        assert!(t.scale_along_axis(2, &[1.0]).is_err());
    }
}
