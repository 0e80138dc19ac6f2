
use crate::errors::{CorrectionError, Result};

/// Dense, square similarity matrix stored in row-major order.
/// Entry `(i, j)` is the fraction of reads truly originating from species `j` that are observed mapping to species `i`.
#[derive(Clone,Debug,PartialEq)]
pub struct SimilarityMatrix {
    size: usize,
    data: Vec<f64>
}

impl SimilarityMatrix {
    /// Wraps a row-major buffer of `size*size` values.
    /// # Arguments
    /// * `size` - the number of species, `M`
    /// * `data` - the row-major values
    /// # Examples
    /// ```rust
    /// use simcorr::matrix::SimilarityMatrix;
    /// let sim = SimilarityMatrix::new(2, vec![0.9, 0.1, 0.1, 0.9]).unwrap();
    /// assert_eq!(sim.get(0, 1), 0.1);
    /// assert!(SimilarityMatrix::new(2, vec![1.0; 3]).is_err());
    /// ```
    pub fn new(size: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != size * size {
            return Err(CorrectionError::InvalidShape(format!(
                "similarity matrix of size {} requires {} values, found {}", size, size * size, data.len()
            )));
        }
        Ok(SimilarityMatrix {
            size,
            data
        })
    }

    /// Wraps a buffer that is known to hold `size*size` values.
    pub(crate) fn from_square(size: usize, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), size * size);
        SimilarityMatrix {
            size,
            data
        }
    }

    /// Builds a matrix from a list of rows, rejecting anything that is not square.
    /// # Arguments
    /// * `rows` - the matrix rows, each must have the same length as the number of rows
    /// # Examples
    /// ```rust
    /// use simcorr::matrix::SimilarityMatrix;
    /// let sim = SimilarityMatrix::from_rows(&[vec![1.0, 0.0], vec![0.5, 1.0]]).unwrap();
    /// assert_eq!(sim.get(1, 0), 0.5);
    /// assert!(SimilarityMatrix::from_rows(&[vec![1.0, 0.0]]).is_err());
    /// ```
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let size: usize = rows.len();
        let mut data: Vec<f64> = Vec::with_capacity(size * size);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != size {
                return Err(CorrectionError::InvalidShape(format!(
                    "similarity matrix is not square: row {} has {} columns, expected {}", i, row.len(), size
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(SimilarityMatrix {
            size,
            data
        })
    }

    /// The `M x M` identity, i.e. no cross-mapping at all
    pub fn identity(size: usize) -> Self {
        let mut data: Vec<f64> = vec![0.0; size * size];
        for i in 0..size {
            data[i * size + i] = 1.0;
        }
        SimilarityMatrix {
            size,
            data
        }
    }

    /// Number of species, `M`
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.size + j]
    }

    /// The raw row-major values
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Returns `true` if there are no NaN or infinite entries.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Computes `S*x`
    /// # Arguments
    /// * `x` - a vector of length `M`
    pub fn mul_vec(&self, x: &[f64]) -> Vec<f64> {
        self.data.chunks_exact(self.size.max(1))
            .take(self.size)
            .map(|row| row.iter().zip(x.iter()).map(|(a, b)| a * b).sum())
            .collect()
    }

    /// Computes `S^T*y`
    /// # Arguments
    /// * `y` - a vector of length `M`
    pub fn transpose_mul_vec(&self, y: &[f64]) -> Vec<f64> {
        let mut ret: Vec<f64> = vec![0.0; self.size];
        for (i, yi) in y.iter().enumerate().take(self.size) {
            let row = &self.data[i * self.size..(i + 1) * self.size];
            for (r, s) in ret.iter_mut().zip(row.iter()) {
                *r += s * yi;
            }
        }
        ret
    }
}

/// The per-read mapping indicators for a sample, `M` species by `N` reads, stored row-major.
/// Entry `(m, n)` is non-zero when read `n` mapped to species `m`.
#[derive(Clone,Debug,PartialEq)]
pub struct ReadMatrix {
    species: usize,
    reads: usize,
    data: Vec<u32>
}

impl ReadMatrix {
    /// Wraps a row-major buffer of `species*reads` counts.
    /// # Examples
    /// ```rust
    /// use simcorr::matrix::ReadMatrix;
    /// let reads = ReadMatrix::new(2, 3, vec![1, 1, 0, 0, 1, 1]).unwrap();
    /// assert_eq!(reads.species_counts(), vec![2.0, 2.0]);
    /// ```
    pub fn new(species: usize, reads: usize, data: Vec<u32>) -> Result<Self> {
        if data.len() != species * reads {
            return Err(CorrectionError::InvalidShape(format!(
                "read matrix of shape ({}, {}) requires {} values, found {}", species, reads, species * reads, data.len()
            )));
        }
        Ok(ReadMatrix {
            species,
            reads,
            data
        })
    }

    /// Builds the matrix from one row per species; all rows must have the same number of reads.
    pub fn from_rows(rows: &[Vec<u32>]) -> Result<Self> {
        let species: usize = rows.len();
        let reads: usize = rows.first().map_or(0, |r| r.len());
        let mut data: Vec<u32> = Vec::with_capacity(species * reads);
        for (m, row) in rows.iter().enumerate() {
            if row.len() != reads {
                return Err(CorrectionError::InvalidShape(format!(
                    "read matrix row {} has {} reads, expected {}", m, row.len(), reads
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(ReadMatrix {
            species,
            reads,
            data
        })
    }

    /// Number of species, `M`
    #[inline]
    pub fn species(&self) -> usize {
        self.species
    }

    /// Number of reads, `N`
    #[inline]
    pub fn reads(&self) -> usize {
        self.reads
    }

    #[inline]
    pub fn get(&self, m: usize, n: usize) -> u32 {
        self.data[m * self.reads + n]
    }

    /// Total matches per species across all reads.
    pub fn species_counts(&self) -> Vec<f64> {
        self.strided_counts(0, 1)
    }

    /// Per-species counts restricted to the reads at `offset, offset+step, offset+2*step, ...`.
    /// # Arguments
    /// * `offset` - the first read in the subset
    /// * `step` - the stride between reads, must be at least 1
    /// # Examples
    /// ```rust
    /// use simcorr::matrix::ReadMatrix;
    /// let reads = ReadMatrix::new(1, 5, vec![1, 2, 3, 4, 5]).unwrap();
    /// assert_eq!(reads.strided_counts(0, 2), vec![9.0]);
    /// assert_eq!(reads.strided_counts(1, 2), vec![6.0]);
    /// ```
    pub fn strided_counts(&self, offset: usize, step: usize) -> Vec<f64> {
        (0..self.species)
            .map(|m| {
                let row = &self.data[m * self.reads..(m + 1) * self.reads];
                row.iter()
                    .skip(offset)
                    .step_by(step)
                    .map(|&v| v as u64)
                    .sum::<u64>() as f64
            })
            .collect()
    }

    /// Per-species counts where read `n` contributes `multiplicity[n]` times.
    /// This is the column sum over a resample drawn with replacement.
    /// # Arguments
    /// * `multiplicity` - the number of times each read was drawn, length `N`
    pub fn weighted_counts(&self, multiplicity: &[u32]) -> Vec<f64> {
        (0..self.species)
            .map(|m| {
                let row = &self.data[m * self.reads..(m + 1) * self.reads];
                row.iter()
                    .zip(multiplicity.iter())
                    .map(|(&v, &w)| v as u64 * w as u64)
                    .sum::<u64>() as f64
            })
            .collect()
    }
}

/// Raw mapping results for the simulated reads used to measure similarity, `M x M x R` in C order.
/// Entry `(i, j, r)` is non-zero when simulated read `r` generated from species `j` mapped to species `i`.
#[derive(Clone,Debug,PartialEq)]
pub struct MappedReadsTensor {
    species: usize,
    reads: usize,
    data: Vec<u32>
}

impl MappedReadsTensor {
    /// Wraps a C-order buffer of `species*species*reads` counts.
    /// # Examples
    /// ```rust
    /// use simcorr::matrix::MappedReadsTensor;
    /// let tensor = MappedReadsTensor::new(1, 2, vec![1, 1]).unwrap();
    /// assert_eq!(tensor.get(0, 0, 1), 1);
    /// assert!(MappedReadsTensor::new(2, 2, vec![1, 1]).is_err());
    /// ```
    pub fn new(species: usize, reads: usize, data: Vec<u32>) -> Result<Self> {
        if data.len() != species * species * reads {
            return Err(CorrectionError::InvalidShape(format!(
                "mapped reads tensor of shape ({0}, {0}, {1}) requires {2} values, found {3}",
                species, reads, species * species * reads, data.len()
            )));
        }
        Ok(MappedReadsTensor {
            species,
            reads,
            data
        })
    }

    /// Number of species, `M`
    #[inline]
    pub fn species(&self) -> usize {
        self.species
    }

    /// Number of simulated reads per species, `R`
    #[inline]
    pub fn reads(&self) -> usize {
        self.reads
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, r: usize) -> u32 {
        self.data[(i * self.species + j) * self.reads + r]
    }

    /// Sums the tensor along the read axis with read `r` counted `multiplicity[r]` times.
    /// Returns the `M x M` count matrix in row-major order; all zeros when there are no simulated reads.
    /// # Arguments
    /// * `multiplicity` - the number of times each simulated read was drawn, length `R`
    pub fn weighted_counts(&self, multiplicity: &[u32]) -> Vec<u64> {
        if self.reads == 0 {
            return vec![0; self.species * self.species];
        }
        self.data.chunks_exact(self.reads)
            .take(self.species * self.species)
            .map(|reads| {
                reads.iter()
                    .zip(multiplicity.iter())
                    .map(|(&v, &w)| v as u64 * w as u64)
                    .sum()
            })
            .collect()
    }
}
