//! B-spline bases and difference penalties for smooth additive terms.
//!
//! Knots are uniformly spaced and extend `degree` intervals past each end of the
//! training range (P-spline layout), so a basis is fully determined by
//! `(data_range, num_basis, degree)` and can be re-evaluated on any grid after
//! fitting. With equally spaced knots a difference penalty leaves polynomials
//! below its order unpenalized.

use ndarray::{Array, Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use thiserror::Error;

/// Rows above which basis evaluation is spread over the rayon pool.
const PARALLEL_EVAL_THRESHOLD: usize = 4096;

#[derive(Error, Debug)]
pub enum BasisError {
    #[error("Spline degree must be at least 1, but was {0}.")]
    InvalidDegree(usize),

    #[error("Data range is invalid: start ({0}) must be less than or equal to end ({1}).")]
    InvalidRange(f64, f64),

    #[error(
        "Data range has zero width (min equals max); {0} basis functions would share coincident knots."
    )]
    DegenerateRange(usize),

    #[error(
        "A degree {degree} spline needs more than {degree} basis functions, but {num_basis} were requested."
    )]
    TooFewBasisFunctions { degree: usize, num_basis: usize },

    #[error(
        "Penalty order ({order}) must be positive and less than the number of basis functions ({num_basis})."
    )]
    InvalidPenaltyOrder { order: usize, num_basis: usize },

    #[error(
        "Cannot apply sum-to-zero constraint: requires at least 2 basis functions, but only {found} were provided."
    )]
    InsufficientColumnsForConstraint { found: usize },

    #[error("Constraint vector is zero; the basis has no support on the data.")]
    DegenerateConstraint,

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// A uniformly knotted B-spline basis on a fixed range.
#[derive(Debug, Clone)]
pub struct BSplineBasis {
    knots: Array1<f64>,
    degree: usize,
    num_basis: usize,
    data_range: (f64, f64),
}

impl BSplineBasis {
    pub fn new(data_range: (f64, f64), num_basis: usize, degree: usize) -> Result<Self, BasisError> {
        if degree < 1 {
            return Err(BasisError::InvalidDegree(degree));
        }
        let (min_val, max_val) = data_range;
        if !min_val.is_finite() || !max_val.is_finite() || min_val > max_val {
            return Err(BasisError::InvalidRange(min_val, max_val));
        }
        if num_basis <= degree {
            return Err(BasisError::TooFewBasisFunctions { degree, num_basis });
        }
        let knots = generate_full_knot_vector(data_range, num_basis, degree)?;
        Ok(Self {
            knots,
            degree,
            num_basis,
            data_range,
        })
    }

    pub fn data_range(&self) -> (f64, f64) {
        self.data_range
    }

    pub fn knots(&self) -> ArrayView1<'_, f64> {
        self.knots.view()
    }

    /// Evaluates every basis function at every point: an `n x num_basis` matrix.
    pub fn evaluate(&self, x: ArrayView1<'_, f64>) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((x.len(), self.num_basis));
        let knots = self.knots.view();
        let degree = self.degree;
        if x.len() >= PARALLEL_EVAL_THRESHOLD {
            Zip::from(out.axis_iter_mut(Axis(0)))
                .and(&x)
                .par_for_each(|mut row, &xi| {
                    let mut scratch = BsplineScratch::new(degree);
                    let mut buffer = vec![0.0; row.len()];
                    evaluate_splines_at_point_into(xi, degree, knots, &mut buffer, &mut scratch);
                    row.assign(&ArrayView1::from(&buffer[..]));
                });
        } else {
            let mut scratch = BsplineScratch::new(degree);
            let mut buffer = vec![0.0; self.num_basis];
            for (mut row, &xi) in out.axis_iter_mut(Axis(0)).zip(x.iter()) {
                evaluate_splines_at_point_into(xi, degree, knots, &mut buffer, &mut scratch);
                row.assign(&ArrayView1::from(&buffer[..]));
            }
        }
        out
    }
}

#[derive(Clone, Debug)]
struct BsplineScratch {
    left: Vec<f64>,
    right: Vec<f64>,
    n: Vec<f64>,
}

impl BsplineScratch {
    fn new(degree: usize) -> Self {
        let len = degree + 1;
        Self {
            left: vec![0.0; len],
            right: vec![0.0; len],
            n: vec![0.0; len],
        }
    }
}

/// Generates `num_basis + degree + 1` equally spaced knots such that
/// `knots[degree] = min` and `knots[num_basis] = max`.
fn generate_full_knot_vector(
    data_range: (f64, f64),
    num_basis: usize,
    degree: usize,
) -> Result<Array1<f64>, BasisError> {
    let (min_val, max_val) = data_range;

    if min_val == max_val {
        return Err(BasisError::DegenerateRange(num_basis));
    }

    let h = (max_val - min_val) / (num_basis - degree) as f64;
    let total_knots = num_basis + degree + 1;
    Ok(Array::from_iter(
        (0..total_knots).map(|i| min_val + (i as f64 - degree as f64) * h),
    ))
}

/// Cox-de Boor evaluation (Piegl & Tiller, Algorithm A2.2) of all basis
/// functions at `x`. Points outside the knot domain use the boundary span,
/// which extrapolates the boundary polynomial.
fn evaluate_splines_at_point_into(
    x: f64,
    degree: usize,
    knots: ArrayView1<f64>,
    basis_values: &mut [f64],
    scratch: &mut BsplineScratch,
) {
    let num_knots = knots.len();
    let num_basis = num_knots - degree - 1;
    debug_assert_eq!(basis_values.len(), num_basis);

    scratch.n.fill(0.0);
    scratch.left.fill(0.0);
    scratch.right.fill(0.0);

    let mu = if x >= knots[num_basis] {
        num_basis - 1
    } else if x < knots[degree] {
        degree
    } else {
        let mut span = degree;
        while span < num_basis && x >= knots[span + 1] {
            span += 1;
        }
        span
    };

    let left = &mut scratch.left;
    let right = &mut scratch.right;
    let n = &mut scratch.n;

    n[0] = 1.0;

    for d in 1..=degree {
        left[d] = x - knots[mu + 1 - d];
        right[d] = knots[mu + d] - x;

        let mut saved = 0.0;
        for r in 0..d {
            let den = right[r + 1] + left[d - r];
            let temp = if den.abs() > 1e-12 { n[r] / den } else { 0.0 };
            n[r] = saved + right[r + 1] * temp;
            saved = left[d - r] * temp;
        }
        n[d] = saved;
    }

    basis_values.fill(0.0);
    let start_index = mu.saturating_sub(degree);
    for i in 0..=degree {
        let global_idx = start_index + i;
        if global_idx < num_basis {
            basis_values[global_idx] = n[i];
        }
    }
}

/// Difference penalty `S = D'D` where `D` is the `order`-th difference operator.
pub fn create_difference_penalty_matrix(
    num_basis_functions: usize,
    order: usize,
) -> Result<Array2<f64>, BasisError> {
    if order == 0 || order >= num_basis_functions {
        return Err(BasisError::InvalidPenaltyOrder {
            order,
            num_basis: num_basis_functions,
        });
    }

    let mut d = Array2::<f64>::eye(num_basis_functions);
    for _ in 1..=order {
        d = &d.slice(s![1.., ..]) - &d.slice(s![..-1, ..]);
    }

    Ok(d.t().dot(&d))
}

/// Builds `Z` (`k x (k-1)`) spanning the null space of `c' = 1' B`, so that
/// `B Z` sums to zero over the training rows.
///
/// Uses a single Householder reflection `H = I - 2 v v' / v'v` with
/// `v = c + sign(c_0) |c| e_0`; the trailing `k-1` columns of `H` are an
/// orthonormal basis orthogonal to `c`.
pub fn sum_to_zero_transform(basis_matrix: ArrayView2<'_, f64>) -> Result<Array2<f64>, BasisError> {
    let k = basis_matrix.ncols();
    if k < 2 {
        return Err(BasisError::InsufficientColumnsForConstraint { found: k });
    }
    let c = basis_matrix.sum_axis(Axis(0));
    let norm = c.dot(&c).sqrt();
    if norm <= f64::EPSILON {
        return Err(BasisError::DegenerateConstraint);
    }

    let mut v = c.clone();
    let sign = if c[0] >= 0.0 { 1.0 } else { -1.0 };
    v[0] += sign * norm;
    let vtv = v.dot(&v);

    let mut z = Array2::<f64>::zeros((k, k - 1));
    for j in 1..k {
        let scale = 2.0 * v[j] / vtv;
        for i in 0..k {
            let identity = if i == j { 1.0 } else { 0.0 };
            z[[i, j - 1]] = identity - scale * v[i];
        }
    }
    Ok(z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    #[test]
    fn basis_is_a_partition_of_unity() {
        let basis = BSplineBasis::new((0.0, 10.0), 9, 3).expect("basis");
        let x = Array1::linspace(0.0, 10.0, 57);
        let b = basis.evaluate(x.view());
        assert_eq!(b.dim(), (57, 9));
        for row in b.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
            assert!(row.iter().all(|&v| v >= -1e-14));
        }
    }

    #[test]
    fn knots_are_equally_spaced_around_the_range() {
        let basis = BSplineBasis::new((-1.0, 1.0), 6, 3).expect("basis");
        let knots = basis.knots();
        assert_eq!(knots.len(), 6 + 3 + 1);
        assert_abs_diff_eq!(knots[3], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(knots[6], 1.0, epsilon = 1e-12);
        let h = knots[1] - knots[0];
        for w in knots.windows(2) {
            assert_abs_diff_eq!(w[1] - w[0], h, epsilon = 1e-12);
        }
    }

    #[test]
    fn linear_functions_are_reproduced_by_equally_spaced_coefficients() {
        // Greville abscissae of a uniform basis are equally spaced, so
        // coefficients on a line reproduce that line exactly.
        let basis = BSplineBasis::new((0.0, 4.0), 8, 3).expect("basis");
        let knots = basis.knots();
        let greville = Array1::from_iter(
            (0..8).map(|j| (knots[j + 1] + knots[j + 2] + knots[j + 3]) / 3.0),
        );
        let x = Array1::linspace(0.0, 4.0, 25);
        let fitted = basis.evaluate(x.view()).dot(&greville);
        for (f, xi) in fitted.iter().zip(x.iter()) {
            assert_abs_diff_eq!(*f, *xi, epsilon = 1e-12);
        }
        let s = create_difference_penalty_matrix(8, 2).expect("penalty");
        assert_abs_diff_eq!(greville.dot(&s.dot(&greville)), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn too_few_basis_functions_is_rejected() {
        assert!(matches!(
            BSplineBasis::new((0.0, 1.0), 3, 3),
            Err(BasisError::TooFewBasisFunctions { .. })
        ));
        assert!(matches!(
            BSplineBasis::new((0.0, 0.0), 9, 3),
            Err(BasisError::DegenerateRange(9))
        ));
    }

    #[test]
    fn second_order_penalty_annihilates_linear_coefficients() {
        let s = create_difference_penalty_matrix(7, 2).expect("penalty");
        let linear = Array1::linspace(-3.0, 3.0, 7);
        let penalized = s.dot(&linear);
        for v in penalized.iter() {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-12);
        }
        assert!(matches!(
            create_difference_penalty_matrix(3, 3),
            Err(BasisError::InvalidPenaltyOrder { .. })
        ));
    }

    #[test]
    fn constrained_basis_sums_to_zero() {
        let basis = BSplineBasis::new((0.0, 1.0), 8, 3).expect("basis");
        let x = Array1::linspace(0.0, 1.0, 40);
        let b = basis.evaluate(x.view());
        let z = sum_to_zero_transform(b.view()).expect("constraint");
        assert_eq!(z.dim(), (8, 7));
        let constrained = b.dot(&z);
        for col in constrained.columns() {
            assert_abs_diff_eq!(col.sum(), 0.0, epsilon = 1e-10);
        }
        let ztz = z.t().dot(&z);
        for i in 0..7 {
            assert_abs_diff_eq!(ztz[[i, i]], 1.0, epsilon = 1e-12);
        }
    }
}
