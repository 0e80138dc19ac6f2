
use rand::Rng;

use crate::matrix::{MappedReadsTensor, SimilarityMatrix};

/// Draws `len` indices uniformly with replacement from `[0, len)` and returns how many times each index was drawn.
/// Summing a matrix over the drawn indices is then a weighted sum with these multiplicities.
/// # Arguments
/// * `len` - the number of items to resample
/// * `rng` - the random source for this resample
/// # Examples
/// ```rust
/// use rand::SeedableRng;
/// use rand_xoshiro::Xoshiro256PlusPlus;
/// use simcorr::bootstrap_matrix::resample_multiplicity;
/// let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
/// let multiplicity = resample_multiplicity(10, &mut rng);
/// assert_eq!(multiplicity.len(), 10);
/// assert_eq!(multiplicity.iter().sum::<u32>(), 10);
/// ```
pub fn resample_multiplicity<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<u32> {
    let mut multiplicity: Vec<u32> = vec![0; len];
    if len == 0 {
        return multiplicity;
    }
    for _ in 0..len {
        multiplicity[rng.random_range(0..len)] += 1;
    }
    multiplicity
}

/// Normalizes an `M x M` count matrix into a similarity matrix via `S[i,j] = count[j,i] / count[i,i]`.
/// A zero `count[i,i]` leaves Inf/NaN entries in the result.
fn normalize_counts(species: usize, counts: &[u64]) -> SimilarityMatrix {
    let mut data: Vec<f64> = vec![0.0; species * species];
    for i in 0..species {
        let diagonal: f64 = counts[i * species + i] as f64;
        for j in 0..species {
            data[i * species + j] = counts[j * species + i] as f64 / diagonal;
        }
    }
    SimilarityMatrix::from_square(species, data)
}

/// Builds the similarity matrix from every simulated read in the tensor, i.e. the point estimate.
/// A tensor with no simulated reads gives an all-NaN matrix.
/// # Arguments
/// * `tensor` - the `M x M x R` mapped reads tensor
/// # Examples
/// ```rust
/// use simcorr::matrix::MappedReadsTensor;
/// use simcorr::bootstrap_matrix::similarity_matrix;
/// //count[0, 1] = 1 against count[1, 1] = 2, so S[1, 0] = 0.5
/// let tensor = MappedReadsTensor::new(2, 2, vec![
///     1, 1,   1, 0,
///     0, 0,   1, 1
/// ]).unwrap();
/// let sim = similarity_matrix(&tensor);
/// assert_eq!(sim.as_slice(), &[1.0, 0.0, 0.5, 1.0]);
/// ```
pub fn similarity_matrix(tensor: &MappedReadsTensor) -> SimilarityMatrix {
    let multiplicity: Vec<u32> = vec![1; tensor.reads()];
    normalize_counts(tensor.species(), &tensor.weighted_counts(&multiplicity))
}

/// Calculates a similarity matrix from a bootstrap resample of the simulated reads.
/// `R` read indices are drawn with replacement, the tensor is summed over them, and the sums are normalized the same
/// way as `similarity_matrix(...)`. If a species has no self-mapping reads in the resample, its row is non-finite.
/// # Arguments
/// * `tensor` - the `M x M x R` mapped reads tensor
/// * `rng` - the random source for this resample
pub fn bootstrap_similarity_matrix<R: Rng + ?Sized>(tensor: &MappedReadsTensor, rng: &mut R) -> SimilarityMatrix {
    let multiplicity: Vec<u32> = resample_multiplicity(tensor.reads(), rng);
    normalize_counts(tensor.species(), &tensor.weighted_counts(&multiplicity))
}

/// Returns `true` if any species had zero self-mapping reads when `sim` was built from a tensor.
/// Normalized diagonals are either exactly 1 or `0/0`.
pub fn has_zero_diagonal(sim: &SimilarityMatrix) -> bool {
    (0..sim.size()).any(|i| !sim.get(i, i).is_finite())
}
