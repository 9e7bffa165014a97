use faer::linalg::solvers::{self, Solve};
pub use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt};
use faer::{MatMut, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Factorization failed")]
    FactorizationFailed,
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(solvers::LdltError),
    #[error("Solve produced non-finite values")]
    NonFiniteSolution,
}

pub enum FaerSymmetricFactor {
    Llt(FaerLlt<f64>),
    Ldlt(FaerLdlt<f64>),
}

impl FaerSymmetricFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Result<Array1<f64>, FaerLinalgError> {
        let mut out = rhs.to_owned();
        {
            let mut view = array1_to_col_mat_mut(&mut out);
            match self {
                FaerSymmetricFactor::Llt(f) => f.solve_in_place(view.as_mut()),
                FaerSymmetricFactor::Ldlt(f) => f.solve_in_place(view.as_mut()),
            }
        }
        if out.iter().all(|v| v.is_finite()) {
            Ok(out)
        } else {
            Err(FaerLinalgError::NonFiniteSolution)
        }
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, FaerLinalgError> {
        let mut out = rhs.as_standard_layout().to_owned();
        {
            let mut view = array2_to_mat_mut(&mut out);
            match self {
                FaerSymmetricFactor::Llt(f) => f.solve_in_place(view.as_mut()),
                FaerSymmetricFactor::Ldlt(f) => f.solve_in_place(view.as_mut()),
            }
        }
        if out.iter().all(|v| v.is_finite()) {
            Ok(out)
        } else {
            Err(FaerLinalgError::NonFiniteSolution)
        }
    }
}

/// Factorize a symmetric system with an LLT first attempt and LDLT fallback.
#[inline]
pub fn factorize_symmetric_with_fallback(
    matrix: MatRef<'_, f64>,
    side: Side,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    if let Ok(llt) = FaerLlt::new(matrix, side) {
        return Ok(FaerSymmetricFactor::Llt(llt));
    }
    log::debug!("LLT failed on a {}x{} system; retrying with LDLT", matrix.nrows(), matrix.ncols());
    let ldlt = FaerLdlt::new(matrix, side).map_err(FaerLinalgError::Ldlt)?;
    Ok(FaerSymmetricFactor::Ldlt(ldlt))
}

/// Convenience wrapper: factorize an ndarray matrix and keep the factor.
pub fn factorize_symmetric<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(FaerLinalgError::FactorizationFailed);
    }
    let view = FaerArrayView::new(matrix);
    factorize_symmetric_with_fallback(view.as_ref(), Side::Lower)
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];

    // SAFETY: shape and strides come straight from the live, uniquely borrowed Array2.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    // SAFETY: single column view over the uniquely borrowed Array1.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        // Negative or zero strides are materialized into a compact copy.
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides either come directly from a live ndarray
        // view with positive strides, or from the owned compact copy stored inside
        // this wrapper.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}
