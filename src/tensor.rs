//! Minimal row-major matrix used at the compute-kernel seam
//!
//! The collectives engine works on flat `f32` slices; the only structured
//! buffer the runtime itself needs is the 2D weight shard handed to the
//! compute-kernel collaborator, plus the handful of operations the
//! choreography and tests use on it.

use serde::{Deserialize, Serialize};

use crate::errors::{LatticeError, Result};

/// Row-major 2D matrix of `f32`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    /// Row-major data storage
    pub data: Vec<f32>,
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
}

impl Matrix {
    /// Create a matrix from row-major data.
    pub fn new(data: Vec<f32>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(LatticeError::Shape {
                context: "matrix construction",
                expected: rows * cols,
                actual: data.len(),
            });
        }
        Ok(Self { data, rows, cols })
    }

    /// Create a matrix filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    /// Element at (row, col).
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    /// Row as a slice.
    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.cols;
        &self.data[start..start + self.cols]
    }

    /// Copy of a contiguous row range, as its own matrix.
    pub fn row_slice(&self, start: usize, end: usize) -> Result<Matrix> {
        if end > self.rows || start > end {
            return Err(LatticeError::Shape {
                context: "matrix row slice",
                expected: self.rows,
                actual: end,
            });
        }
        Matrix::new(
            self.data[start * self.cols..end * self.cols].to_vec(),
            end - start,
            self.cols,
        )
    }

    /// Matrix-vector product: `A[m, n] @ v[n] -> [m]`.
    ///
    /// Each output element is a single left-to-right accumulation over one
    /// row, so sharding the rows does not change per-element rounding.
    pub fn matvec(&self, v: &[f32]) -> Result<Vec<f32>> {
        if self.cols != v.len() {
            return Err(LatticeError::Shape {
                context: "matvec",
                expected: self.cols,
                actual: v.len(),
            });
        }

        let mut out = vec![0.0; self.rows];
        for i in 0..self.rows {
            let row = &self.data[i * self.cols..(i + 1) * self.cols];
            let mut sum = 0.0;
            for (a, b) in row.iter().zip(v) {
                sum += a * b;
            }
            out[i] = sum;
        }
        Ok(out)
    }

    /// Transposed matrix-vector product: `A^T[n, m] @ v[m] -> [n]`.
    pub fn matvec_t(&self, v: &[f32]) -> Result<Vec<f32>> {
        if self.rows != v.len() {
            return Err(LatticeError::Shape {
                context: "matvec_t",
                expected: self.rows,
                actual: v.len(),
            });
        }

        let mut out = vec![0.0; self.cols];
        for i in 0..self.rows {
            let row = &self.data[i * self.cols..(i + 1) * self.cols];
            let vi = v[i];
            for (o, a) in out.iter_mut().zip(row) {
                *o += vi * a;
            }
        }
        Ok(out)
    }

    /// Outer product: `col[m] ⊗ row[n] -> [m, n]`.
    pub fn outer(col: &[f32], row: &[f32]) -> Matrix {
        let mut data = Vec::with_capacity(col.len() * row.len());
        for &c in col {
            for &r in row {
                data.push(c * r);
            }
        }
        Matrix {
            data,
            rows: col.len(),
            cols: row.len(),
        }
    }

    /// Element-wise in-place addition.
    pub fn add_assign(&mut self, other: &Matrix) -> Result<()> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(LatticeError::Shape {
                context: "matrix add",
                expected: self.data.len(),
                actual: other.data.len(),
            });
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    /// In-place `self -= scale * other`.
    pub fn sub_scaled(&mut self, other: &Matrix, scale: f32) -> Result<()> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(LatticeError::Shape {
                context: "matrix sub_scaled",
                expected: self.data.len(),
                actual: other.data.len(),
            });
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a -= scale * b;
        }
        Ok(())
    }

    /// Reset every element to zero.
    pub fn zero(&mut self) {
        self.data.iter_mut().for_each(|x| *x = 0.0);
    }
}
