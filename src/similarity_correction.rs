extern crate log;

use log::{debug, trace};

use crate::errors::{CorrectionError, Result};
use crate::matrix::{ReadMatrix, SimilarityMatrix};
use crate::stats_util::{calculate_median, reduce_columns};

/// upper limit on step halvings in a single iteration; past this we accept the step
const MAX_BACKTRACKS: usize = 64;

/// stores options for running the constrained least-squares solver
#[derive(Clone,Debug,PartialEq)]
pub struct SolverParameters {
    /// The solver stops once an iteration moves no coordinate by more than this amount
    pub tolerance: f64,
    /// Hard cap on iterations; when reached, the best point found so far is returned
    pub max_iterations: usize,
    /// The starting value for every abundance before the first projection
    pub initial_value: f64
}

impl Default for SolverParameters {
    fn default() -> Self {
        SolverParameters {
            tolerance: 1e-10,
            max_iterations: 10000,
            initial_value: 0.5
        }
    }
}

impl SolverParameters {
    /// Checks that the tolerance and initial value are usable.
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance >= 0.0) || !self.tolerance.is_finite() {
            return Err(CorrectionError::InvalidParameter(format!("solver tolerance must be finite and >= 0, found {}", self.tolerance)));
        }
        if !self.initial_value.is_finite() {
            return Err(CorrectionError::InvalidParameter(format!("solver initial value must be finite, found {}", self.initial_value)));
        }
        Ok(())
    }
}

/// Calculates corrected abundances given a similarity matrix and the observed reads per species.
/// Solves `min |S*c - r|^2` subject to `c_i >= 0` and `sum(c) <= 1` where `r = counts / total_reads`.
/// The solver is best-effort: if `params.max_iterations` is reached before convergence, the best point found is returned.
/// Ill-conditioned matrices (species with nearly identical similarity columns) converge slowly and may stop at the cap.
/// If the similarity matrix has non-finite entries (e.g. from a degenerate bootstrap resample), every abundance is NaN.
/// # Arguments
/// * `sim` - the `M x M` similarity matrix
/// * `counts` - the number of observed reads for each species, length `M`
/// * `total_reads` - the total number of reads in the sample, must be > 0
/// * `params` - solver tolerance and iteration cap
/// # Examples
/// ```rust
/// use simcorr::matrix::SimilarityMatrix;
/// use simcorr::similarity_correction::{SolverParameters, similarity_correction};
/// let sim = SimilarityMatrix::identity(2);
/// let abundances = similarity_correction(&sim, &[30.0, 50.0], 100.0, &SolverParameters::default()).unwrap();
/// assert!((abundances[0] - 0.3).abs() < 1e-6);
/// assert!((abundances[1] - 0.5).abs() < 1e-6);
/// ```
pub fn similarity_correction(sim: &SimilarityMatrix, counts: &[f64], total_reads: f64, params: &SolverParameters) -> Result<Vec<f64>> {
    let size: usize = sim.size();
    if counts.len() != size {
        return Err(CorrectionError::InvalidShape(format!(
            "similarity matrix has {} species but {} read counts were provided", size, counts.len()
        )));
    }
    check_total_reads(total_reads)?;
    if let Some(bad) = counts.iter().find(|c| !(**c >= 0.0) || !c.is_finite()) {
        return Err(CorrectionError::InvalidParameter(format!("read counts must be finite and >= 0, found {}", bad)));
    }
    params.validate()?;

    if !sim.is_finite() {
        debug!("Similarity matrix contains non-finite entries, abundances are undefined");
        return Ok(vec![f64::NAN; size]);
    }

    let observed: Vec<f64> = counts.iter().map(|c| c / total_reads).collect();
    Ok(minimize_residual(sim, &observed, params))
}

/// Calculates corrected abundances by splitting the reads into interleaved subsets, correcting each subset with the
/// same similarity matrix, and taking the per-species median of the subset results.
/// Subset `s` contains reads `s, s+subsets, s+2*subsets, ...` and is treated as having `ceil(total_reads / subsets)` reads.
/// # Arguments
/// * `sim` - the `M x M` similarity matrix
/// * `reads` - the `M x N` read mapping matrix
/// * `total_reads` - the total number of reads in the sample, must be > 0
/// * `subsets` - the number of subsets, must be >= 1; a value of 1 is the same as `similarity_correction(...)`
/// * `params` - solver tolerance and iteration cap
pub fn similarity_correction_smp(sim: &SimilarityMatrix, reads: &ReadMatrix, total_reads: f64, subsets: usize, params: &SolverParameters) -> Result<Vec<f64>> {
    if subsets == 0 {
        return Err(CorrectionError::InvalidParameter("subsets must be at least 1".to_string()));
    }
    if reads.species() != sim.size() {
        return Err(CorrectionError::InvalidShape(format!(
            "similarity matrix has {} species but the read matrix has {}", sim.size(), reads.species()
        )));
    }
    check_total_reads(total_reads)?;

    let subset_total: f64 = (total_reads / subsets as f64).ceil();
    let mut subset_abundances: Vec<Vec<f64>> = Vec::with_capacity(subsets);
    for s in 0..subsets {
        let counts: Vec<f64> = reads.strided_counts(s, subsets);
        subset_abundances.push(similarity_correction(sim, &counts, subset_total, params)?);
    }

    Ok(reduce_columns(&subset_abundances, sim.size(), calculate_median))
}

fn check_total_reads(total_reads: f64) -> Result<()> {
    if !(total_reads > 0.0) || !total_reads.is_finite() {
        return Err(CorrectionError::DegenerateInput(format!("total reads must be finite and > 0, found {}", total_reads)));
    }
    Ok(())
}

/// Euclidean projection onto the feasible region `{c : c_i >= 0, sum(c) <= 1}`, performed in place.
/// # Arguments
/// * `values` - the point to project
/// # Examples
/// ```rust
/// use simcorr::similarity_correction::project_feasible;
/// let mut inside = vec![0.2, -0.1, 0.3];
/// project_feasible(&mut inside);
/// assert_eq!(inside, vec![0.2, 0.0, 0.3]);
///
/// let mut outside = vec![0.5, 0.5, 0.5];
/// project_feasible(&mut outside);
/// let total: f64 = outside.iter().sum();
/// assert!((total - 1.0).abs() < 1e-12);
/// assert!((outside[0] - 1.0 / 3.0).abs() < 1e-12);
/// ```
pub fn project_feasible(values: &mut [f64]) {
    for v in values.iter_mut() {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
    let total: f64 = values.iter().sum();
    if total <= 1.0 {
        return;
    }

    //outside the cap, so project onto the simplex sum(c) == 1
    let mut sorted_values: Vec<f64> = values.to_vec();
    sorted_values.sort_unstable_by(|a, b| b.total_cmp(a));
    let mut cumulative: f64 = 0.0;
    let mut theta: f64 = 0.0;
    for (k, u) in sorted_values.iter().enumerate() {
        cumulative += u;
        let candidate: f64 = (cumulative - 1.0) / (k + 1) as f64;
        if u - candidate > 0.0 {
            theta = candidate;
        } else {
            break;
        }
    }
    for v in values.iter_mut() {
        *v = (*v - theta).max(0.0);
    }
}

/// Squared residual `|S*c - r|^2`
fn residual(sim: &SimilarityMatrix, c: &[f64], observed: &[f64]) -> f64 {
    sim.mul_vec(c).iter()
        .zip(observed.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum()
}

/// Squared residual and its gradient `2*S^T*(S*c - r)`
fn residual_and_gradient(sim: &SimilarityMatrix, c: &[f64], observed: &[f64]) -> (f64, Vec<f64>) {
    let diff: Vec<f64> = sim.mul_vec(c).iter()
        .zip(observed.iter())
        .map(|(a, b)| a - b)
        .collect();
    let value: f64 = diff.iter().map(|d| d * d).sum();
    let gradient: Vec<f64> = sim.transpose_mul_vec(&diff).iter().map(|g| 2.0 * g).collect();
    (value, gradient)
}

/// Accelerated projected gradient descent with backtracking and adaptive restart.
/// Every iterate is projected onto the feasible region, so the result is feasible up to rounding.
/// Convergence slows with the conditioning of `sim`; nearly collinear columns can hit `max_iterations` with a tiny
/// residual but abundances still off in the third decimal.
fn minimize_residual(sim: &SimilarityMatrix, observed: &[f64], params: &SolverParameters) -> Vec<f64> {
    let size: usize = sim.size();
    if size == 0 {
        return vec![];
    }

    let mut x: Vec<f64> = vec![params.initial_value; size];
    project_feasible(&mut x);
    let mut x_value: f64 = residual(sim, &x, observed);
    let mut best: Vec<f64> = x.clone();
    let mut best_value: f64 = x_value;

    let mut y: Vec<f64> = x.clone();
    let mut momentum: f64 = 1.0;

    //the largest column norm is a lower bound on the true Lipschitz constant, backtracking raises it as needed
    let mut lipschitz: f64 = (0..size)
        .map(|j| (0..size).map(|i| sim.get(i, j) * sim.get(i, j)).sum::<f64>())
        .fold(0.0, f64::max) * 2.0;
    if !(lipschitz > 0.0) {
        lipschitz = 1.0;
    }

    let mut x_next: Vec<f64> = vec![0.0; size];
    let mut converged: bool = false;
    let mut iteration: usize = 0;
    while iteration < params.max_iterations {
        iteration += 1;
        let (y_value, gradient) = residual_and_gradient(sim, &y, observed);

        let mut next_value: f64;
        let mut backtracks: usize = 0;
        loop {
            for ((xn, yi), gi) in x_next.iter_mut().zip(y.iter()).zip(gradient.iter()) {
                *xn = yi - gi / lipschitz;
            }
            project_feasible(&mut x_next);
            next_value = residual(sim, &x_next, observed);

            //sufficient decrease against the quadratic upper model at y
            let mut linear: f64 = 0.0;
            let mut quadratic: f64 = 0.0;
            for ((xn, yi), gi) in x_next.iter().zip(y.iter()).zip(gradient.iter()) {
                let d: f64 = xn - yi;
                linear += gi * d;
                quadratic += d * d;
            }
            let model: f64 = y_value + linear + 0.5 * lipschitz * quadratic;
            if next_value <= model + f64::EPSILON * y_value.abs().max(1e-300) || backtracks >= MAX_BACKTRACKS {
                break;
            }
            lipschitz *= 2.0;
            backtracks += 1;
        }

        let step_size: f64 = x_next.iter()
            .zip(y.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max);

        if next_value < best_value {
            best.copy_from_slice(&x_next);
            best_value = next_value;
        }

        if next_value > x_value {
            //objective went up, drop the momentum and restart from the new point
            momentum = 1.0;
            y.copy_from_slice(&x_next);
        } else {
            let momentum_next: f64 = (1.0 + (1.0 + 4.0 * momentum * momentum).sqrt()) / 2.0;
            let beta: f64 = (momentum - 1.0) / momentum_next;
            for ((yi, xn), xi) in y.iter_mut().zip(x_next.iter()).zip(x.iter()) {
                *yi = xn + beta * (xn - xi);
            }
            momentum = momentum_next;
        }
        std::mem::swap(&mut x, &mut x_next);
        x_value = next_value;

        trace!("iteration {}: residual {:e}, step {:e}", iteration, x_value, step_size);
        if step_size <= params.tolerance {
            converged = true;
            break;
        }
    }

    if converged {
        debug!("Solver converged after {} iterations, residual {:e}", iteration, best_value);
    } else {
        debug!("Solver reached the iteration cap ({}), returning best residual {:e}", params.max_iterations, best_value);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_near_feasible(abundances: &[f64], eps: f64) {
        for a in abundances.iter() {
            assert!(*a >= -eps, "negative abundance {}", a);
        }
        let total: f64 = abundances.iter().sum();
        assert!(total <= 1.0 + eps, "abundances sum to {}", total);
    }

    #[test]
    fn test_projection() {
        let mut inside = vec![0.1, 0.2, 0.3];
        project_feasible(&mut inside);
        assert_eq!(inside, vec![0.1, 0.2, 0.3]);

        let mut dominated = vec![2.0, 0.5, -1.0];
        project_feasible(&mut dominated);
        assert_eq!(dominated, vec![1.0, 0.0, 0.0]);

        let mut split = vec![0.8, 0.6];
        project_feasible(&mut split);
        assert!((split[0] - 0.6).abs() < 1e-12);
        assert!((split[1] - 0.4).abs() < 1e-12);

        let mut empty: Vec<f64> = vec![];
        project_feasible(&mut empty);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_identity_correction() {
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::identity(4);
        let counts = vec![10.0, 0.0, 25.0, 40.0];
        let abundances = similarity_correction(&sim, &counts, 100.0, &params).unwrap();
        for (a, c) in abundances.iter().zip(counts.iter()) {
            assert!((a - c / 100.0).abs() < 1e-6, "{} vs {}", a, c / 100.0);
        }
    }

    #[test]
    fn test_two_species() {
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::from_rows(&[vec![0.9, 0.1], vec![0.1, 0.9]]).unwrap();
        let counts = vec![90.0, 10.0];
        let abundances = similarity_correction(&sim, &counts, 100.0, &params).unwrap();
        assert_near_feasible(&abundances, 1e-9);

        //the exact solution of S*c = r is feasible, so the residual should vanish
        let observed: Vec<f64> = counts.iter().map(|c| c / 100.0).collect();
        assert!(residual(&sim, &abundances, &observed) < 1e-10);
        assert!((abundances[0] - 1.0).abs() < 1e-4);
        assert!(abundances[1].abs() < 1e-4);
    }

    #[test]
    fn test_cross_mapping() {
        //species 1 is absent, but picks up reads from species 0
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::from_rows(&[
            vec![0.8, 0.3, 0.0],
            vec![0.2, 0.7, 0.0],
            vec![0.0, 0.0, 1.0]
        ]).unwrap();
        let truth = vec![0.5, 0.0, 0.3];
        let observed: Vec<f64> = sim.mul_vec(&truth);
        let counts: Vec<f64> = observed.iter().map(|o| o * 1000.0).collect();
        let abundances = similarity_correction(&sim, &counts, 1000.0, &params).unwrap();
        assert_near_feasible(&abundances, 1e-9);
        for (a, t) in abundances.iter().zip(truth.iter()) {
            assert!((a - t).abs() < 1e-5, "{:?} vs {:?}", abundances, truth);
        }
    }

    #[test]
    fn test_infeasible_observation() {
        //observations imply more than 100% abundance, result must still respect the cap
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::from_rows(&[vec![0.5, 0.0], vec![0.0, 0.5]]).unwrap();
        let abundances = similarity_correction(&sim, &[80.0, 80.0], 100.0, &params).unwrap();
        assert_near_feasible(&abundances, 1e-9);
        assert!((abundances[0] - 0.5).abs() < 1e-6);
        assert!((abundances[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_deterministic() {
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::from_rows(&[
            vec![0.7, 0.2, 0.1],
            vec![0.2, 0.6, 0.3],
            vec![0.1, 0.2, 0.6]
        ]).unwrap();
        let counts = vec![41.0, 33.0, 12.0];
        let first = similarity_correction(&sim, &counts, 100.0, &params).unwrap();
        let second = similarity_correction(&sim, &counts, 100.0, &params).unwrap();
        assert_eq!(first, second);
        assert_near_feasible(&first, 1e-9);
    }

    #[test]
    fn test_iteration_cap() {
        //a single iteration is not enough, but we still get a feasible best effort
        let params = SolverParameters {
            max_iterations: 1,
            ..Default::default()
        };
        let sim = SimilarityMatrix::from_rows(&[vec![0.9, 0.1], vec![0.1, 0.9]]).unwrap();
        let abundances = similarity_correction(&sim, &[60.0, 40.0], 100.0, &params).unwrap();
        assert_eq!(abundances.len(), 2);
        assert_near_feasible(&abundances, 1e-9);

        //zero iterations returns the projected starting point
        let params = SolverParameters {
            max_iterations: 0,
            ..Default::default()
        };
        let abundances = similarity_correction(&sim, &[60.0, 40.0], 100.0, &params).unwrap();
        assert_eq!(abundances, vec![0.5, 0.5]);
    }

    #[test]
    fn test_ill_conditioned() {
        //two nearly identical species, the residual still vanishes even if the split converges slowly
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::from_rows(&[vec![1.0, 0.999], vec![0.999, 1.0]]).unwrap();
        let truth = vec![0.6, 0.3];
        let observed: Vec<f64> = sim.mul_vec(&truth);
        let counts: Vec<f64> = observed.iter().map(|o| o * 1000.0).collect();
        let abundances = similarity_correction(&sim, &counts, 1000.0, &params).unwrap();
        assert_near_feasible(&abundances, 1e-9);
        assert!(residual(&sim, &abundances, &observed) < 1e-8);
        assert!((abundances[0] + abundances[1] - 0.9).abs() < 1e-3);
    }

    #[test]
    fn test_invalid_inputs() {
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::identity(2);
        match similarity_correction(&sim, &[1.0, 2.0, 3.0], 10.0, &params) {
            Err(CorrectionError::InvalidShape(_)) => {},
            other => panic!("expected InvalidShape, got {:?}", other)
        };
        match similarity_correction(&sim, &[1.0, 2.0], 0.0, &params) {
            Err(CorrectionError::DegenerateInput(_)) => {},
            other => panic!("expected DegenerateInput, got {:?}", other)
        };
        match similarity_correction(&sim, &[-1.0, 2.0], 10.0, &params) {
            Err(CorrectionError::InvalidParameter(_)) => {},
            other => panic!("expected InvalidParameter, got {:?}", other)
        };
        let bad_params = SolverParameters {
            tolerance: f64::NAN,
            ..Default::default()
        };
        assert!(similarity_correction(&sim, &[1.0, 2.0], 10.0, &bad_params).is_err());
    }

    #[test]
    fn test_non_finite_matrix() {
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::from_rows(&[vec![1.0, f64::INFINITY], vec![0.0, f64::NAN]]).unwrap();
        let abundances = similarity_correction(&sim, &[5.0, 5.0], 10.0, &params).unwrap();
        assert_eq!(abundances.len(), 2);
        assert!(abundances.iter().all(|a| a.is_nan()));
    }

    #[test]
    fn test_smp_single_subset() {
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::from_rows(&[vec![0.8, 0.25], vec![0.2, 0.75]]).unwrap();
        let reads = ReadMatrix::from_rows(&[
            vec![1, 1, 0, 1, 1, 0, 1, 1, 1, 0],
            vec![0, 1, 1, 0, 0, 0, 0, 1, 0, 1]
        ]).unwrap();
        let direct = similarity_correction(&sim, &reads.species_counts(), 10.0, &params).unwrap();
        let stabilized = similarity_correction_smp(&sim, &reads, 10.0, 1, &params).unwrap();
        for (d, s) in direct.iter().zip(stabilized.iter()) {
            assert!((d - s).abs() < 1e-12);
        }
    }

    #[test]
    fn test_smp_median() {
        //identity matrix, so each subset abundance is just its read fraction
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::identity(1);
        //subsets of 3: reads {0,3,6}, {1,4,7}, {2,5,8}
        let reads = ReadMatrix::from_rows(&[
            vec![1, 1, 0, 1, 1, 0, 1, 0, 0]
        ]).unwrap();
        let abundances = similarity_correction_smp(&sim, &reads, 9.0, 3, &params).unwrap();
        //subset fractions are 3/3, 2/3, 0/3 -> median 2/3
        assert!((abundances[0] - 2.0 / 3.0).abs() < 1e-6);

        //two subsets: ceil(9/2) = 5 reads each, counts are {0,2,4,6,8} -> 3 and {1,3,5,7} -> 2
        let abundances = similarity_correction_smp(&sim, &reads, 9.0, 2, &params).unwrap();
        assert!((abundances[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_smp_invalid() {
        let params = SolverParameters::default();
        let sim = SimilarityMatrix::identity(2);
        let reads = ReadMatrix::from_rows(&[vec![1, 0]]).unwrap();
        match similarity_correction_smp(&sim, &reads, 2.0, 1, &params) {
            Err(CorrectionError::InvalidShape(_)) => {},
            other => panic!("expected InvalidShape, got {:?}", other)
        };
        let reads = ReadMatrix::from_rows(&[vec![1, 0], vec![0, 1]]).unwrap();
        match similarity_correction_smp(&sim, &reads, 2.0, 0, &params) {
            Err(CorrectionError::InvalidParameter(_)) => {},
            other => panic!("expected InvalidParameter, got {:?}", other)
        };
        match similarity_correction_smp(&sim, &reads, 0.0, 1, &params) {
            Err(CorrectionError::DegenerateInput(_)) => {},
            other => panic!("expected DegenerateInput, got {:?}", other)
        };
    }
}
