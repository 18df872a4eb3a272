//! Host-side matrices.
//!
//! A [`Matrix`] owns a flattened `f32` buffer in column-major order:
//! element `(row, col)` of an `R`-row matrix lives at `col * R + row`.
//! This is the layout the multiply kernel indexes all three of its
//! buffers with, so host data can be uploaded and downloaded without any
//! reshuffling.

use rand::Rng;

use crate::error::OffloadError;
use crate::kernel::{self, KernelDims};

/// A dense single precision matrix stored column-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// A `rows` × `cols` matrix of zeros.
    ///
    /// Aborts if the buffer cannot be allocated; sizes that come from
    /// user input go through [`Matrix::try_zeros`].
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// A `rows` × `cols` matrix of zeros, reporting a failed allocation
    /// as [`OffloadError::Allocation`].
    pub fn try_zeros(rows: usize, cols: usize) -> Result<Self, OffloadError> {
        let mut data = reserve(rows, cols)?;
        data.resize(rows * cols, 0.0);
        Ok(Self { rows, cols, data })
    }

    /// The `n` × `n` identity.
    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    /// Wrap an existing column-major buffer.
    pub fn from_col_major(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, OffloadError> {
        if data.len() != rows * cols {
            return Err(OffloadError::BufferLength {
                what: "matrix",
                expected: rows * cols,
                actual: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Build a matrix from a list of rows, e.g. `&[&[1.0, 2.0], &[3.0, 4.0]]`.
    pub fn from_rows(rows: &[&[f32]]) -> Result<Self, OffloadError> {
        let cols = rows.first().map_or(0, |r| r.len());
        let mut m = Self::zeros(rows.len(), cols);
        for (r, values) in rows.iter().enumerate() {
            if values.len() != cols {
                return Err(OffloadError::BufferLength {
                    what: "matrix row",
                    expected: cols,
                    actual: values.len(),
                });
            }
            for (c, &v) in values.iter().enumerate() {
                m.set(r, c, v);
            }
        }
        Ok(m)
    }

    /// Fill a matrix with uniform draws from `[0, 1)` multiplied by
    /// `scale`.
    pub fn random<R: Rng>(rows: usize, cols: usize, scale: f32, rng: &mut R) -> Result<Self, OffloadError> {
        let mut data = reserve(rows, cols)?;
        data.extend((0..rows * cols).map(|_| rng.gen_range(0.0f32..1.0) * scale));
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The flattened column-major buffer.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[col * self.rows + row]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[col * self.rows + row] = value;
    }

    /// Check that `self * rhs` is defined.
    pub fn check_multipliable(&self, rhs: &Matrix) -> Result<(), OffloadError> {
        if self.cols != rhs.rows {
            return Err(OffloadError::ShapeMismatch {
                a_cols: self.cols,
                b_rows: rhs.rows,
            });
        }
        Ok(())
    }

    /// Compute `self * rhs` on the host with the kernel's exact
    /// per-cell formula and accumulation order.
    pub fn reference_product(&self, rhs: &Matrix) -> Result<Matrix, OffloadError> {
        self.check_multipliable(rhs)?;
        let dims = KernelDims::new(self.rows, rhs.cols, self.cols)?;
        let mut out = Matrix::try_zeros(self.rows, rhs.cols)?;
        for col in 0..rhs.cols {
            for row in 0..self.rows {
                let value = kernel::cell(&dims, &self.data, &rhs.data, row, col);
                out.set(row, col, value);
            }
        }
        Ok(out)
    }

    /// Largest per-cell error of `self` against `expected`, relative to
    /// `max(|expected|, 1)`.  Shapes must agree.
    pub fn max_relative_error(&self, expected: &Matrix) -> f32 {
        debug_assert_eq!((self.rows, self.cols), (expected.rows, expected.cols));
        self.data
            .iter()
            .zip(&expected.data)
            .map(|(&got, &want)| (got - want).abs() / want.abs().max(1.0))
            .fold(0.0, f32::max)
    }

    /// Count the cells whose relative error against `expected` is not
    /// below `tolerance`.
    pub fn mismatches(&self, expected: &Matrix, tolerance: f32) -> usize {
        self.data
            .iter()
            .zip(&expected.data)
            .filter(|&(&got, &want)| !((got - want).abs() < tolerance * want.abs().max(1.0)))
            .count()
    }
}

/// Empty storage with room for exactly `rows * cols` elements.
fn reserve(rows: usize, cols: usize) -> Result<Vec<f32>, OffloadError> {
    let bytes = (rows as u64)
        .saturating_mul(cols as u64)
        .saturating_mul(std::mem::size_of::<f32>() as u64);
    let failed = |reason: String| OffloadError::Allocation {
        what: "host matrix",
        bytes,
        reason,
    };
    let len = rows
        .checked_mul(cols)
        .ok_or_else(|| failed(format!("{rows}x{cols} elements overflow the address space")))?;
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| failed(e.to_string()))?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn layout_is_column_major() {
        let m = Matrix::from_rows(&[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]]).unwrap();
        assert_eq!(m.rows(), 3);
        assert_eq!(m.cols(), 2);
        assert_eq!(m.as_slice(), &[1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
        assert_eq!(m.get(2, 1), 6.0);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = Matrix::from_rows(&[&[1.0, 2.0], &[3.0]]).unwrap_err();
        assert!(matches!(err, OffloadError::BufferLength { .. }));
    }

    #[test]
    fn reference_product_matches_hand_computation() {
        // [1 2]   [5 6]   [19 22]
        // [3 4] * [7 8] = [43 50]
        let a = Matrix::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]).unwrap();
        let b = Matrix::from_rows(&[&[5.0, 6.0], &[7.0, 8.0]]).unwrap();
        let c = a.reference_product(&b).unwrap();
        assert_eq!(c, Matrix::from_rows(&[&[19.0, 22.0], &[43.0, 50.0]]).unwrap());
    }

    #[test]
    fn reference_product_rejects_mismatched_shapes() {
        let a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(2, 3);
        let err = a.reference_product(&b).unwrap_err();
        assert!(matches!(err, OffloadError::ShapeMismatch { a_cols: 3, b_rows: 2 }));
    }

    #[test]
    fn random_values_stay_in_scaled_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let m = Matrix::random(16, 16, 1.0 / 16.0, &mut rng).unwrap();
        assert_eq!(m.len(), 256);
        assert!(m.as_slice().iter().all(|&v| (0.0..1.0 / 16.0).contains(&v)));
    }

    #[test]
    fn oversized_matrices_report_allocation_failure() {
        let mut rng = StdRng::seed_from_u64(7);
        let err = Matrix::random(1 << 31, 1 << 31, 1.0, &mut rng).unwrap_err();
        assert!(matches!(err, OffloadError::Allocation { bytes: u64::MAX, .. }));
        let err = Matrix::try_zeros(usize::MAX, 2).unwrap_err();
        assert!(matches!(err, OffloadError::Allocation { .. }));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn try_zeros_matches_zeros() {
        assert_eq!(Matrix::try_zeros(3, 2).unwrap(), Matrix::zeros(3, 2));
    }

    #[test]
    fn mismatch_counting() {
        let want = Matrix::from_rows(&[&[1.0, 100.0]]).unwrap();
        let got = Matrix::from_rows(&[&[1.00001, 101.0]]).unwrap();
        assert_eq!(got.mismatches(&want, 1e-4), 1);
        assert!(got.max_relative_error(&want) > 0.009);
    }
}
