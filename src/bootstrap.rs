extern crate log;

use log::{debug, info, warn};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::{Arc, mpsc};
use threadpool::ThreadPool;

use crate::bootstrap_matrix::{bootstrap_similarity_matrix, has_zero_diagonal, resample_multiplicity};
use crate::errors::{CorrectionError, Result};
use crate::matrix::{MappedReadsTensor, ReadMatrix, SimilarityMatrix};
use crate::similarity_correction::{SolverParameters, similarity_correction};
use crate::stats_util::{calculate_mean, calculate_variance, reduce_columns};

/// stores options for running a bootstrap analysis
#[derive(Clone,Debug,PartialEq)]
pub struct BootstrapParameters {
    /// The number of bootstrap trials, `B`
    pub trials: usize,
    /// A species is treated as absent in a trial if its corrected abundance is below this value
    pub test_c: f64,
    /// Base seed; trial `b` draws from its own generator derived from `(seed, b)`
    pub seed: u64,
    /// How many times to redraw a bootstrap similarity matrix with a zero diagonal before accepting it; 0 keeps the first draw
    pub matrix_redraws: usize,
    /// Options for the solver run in every trial
    pub solver: SolverParameters
}

impl Default for BootstrapParameters {
    fn default() -> Self {
        BootstrapParameters {
            trials: 100,
            test_c: 0.01,
            seed: 0,
            matrix_redraws: 0,
            solver: Default::default()
        }
    }
}

/// the outputs of a single bootstrap trial
#[derive(Clone,Debug,PartialEq)]
pub struct TrialRecord {
    /// The 0-based trial index, used to restore trial order after pooled execution
    pub trial_index: usize,
    /// Per-species read counts in the resampled reads
    pub found: Vec<f64>,
    /// Per-species corrected abundances
    pub corr: Vec<f64>,
    /// Per-species flag, `true` if `corr < test_c`
    pub fails: Vec<bool>
}

/// summary statistics of a bootstrap analysis
#[derive(Clone,Debug,PartialEq)]
pub struct BootstrapResults {
    /// Fraction of trials in which each species fell below `test_c`
    pub p_values: Vec<f64>,
    /// Mean corrected abundance per species
    pub abundances: Vec<f64>,
    /// Population variance of the corrected abundance per species
    pub variances: Vec<f64>,
    /// The number of trials aggregated
    pub trials: usize,
    /// The number of trials with at least one non-finite abundance; if non-zero, the summaries are unreliable
    pub degenerate_trials: usize
}

impl BootstrapResults {
    /// Returns `true` when no trial was degenerate and every summary value is finite.
    pub fn is_reliable(&self) -> bool {
        self.degenerate_trials == 0 &&
            self.p_values.iter()
                .chain(self.abundances.iter())
                .chain(self.variances.iter())
                .all(|v| v.is_finite())
    }
}

/// Derives a well-distributed seed for one trial from the run seed using a SplitMix64 step.
/// Each trial owning a generator seeded this way keeps trials independent regardless of which worker runs them.
/// # Arguments
/// * `base_seed` - the seed for the whole run
/// * `trial_index` - the trial being seeded
/// # Examples
/// ```rust
/// use simcorr::bootstrap::trial_seed;
/// assert_eq!(trial_seed(42, 3), trial_seed(42, 3));
/// assert_ne!(trial_seed(42, 3), trial_seed(42, 4));
/// ```
#[inline]
pub fn trial_seed(base_seed: u64, trial_index: u64) -> u64 {
    let mut z = base_seed.wrapping_add(trial_index.wrapping_add(1).wrapping_mul(0x9e3779b97f4a7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

/// The read-only inputs shared by every trial of one bootstrap run
pub struct BootstrapJob {
    reads: Arc<ReadMatrix>,
    smat_raw: Arc<MappedReadsTensor>,
    params: BootstrapParameters
}

impl BootstrapJob {
    /// The number of trials, `B`
    pub fn trials(&self) -> usize {
        self.params.trials
    }

    /// Runs one bootstrap trial: resample the reads, bootstrap a similarity matrix, correct, and test against `test_c`.
    /// # Arguments
    /// * `trial_index` - the 0-based trial to run, selects the random stream
    pub fn run_trial(&self, trial_index: usize) -> Result<TrialRecord> {
        info!("...bootstrapping {} of {}", trial_index + 1, self.params.trials);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(trial_seed(self.params.seed, trial_index as u64));

        //select a bootstrap sample of the reads and count matches per species
        let total_reads: usize = self.reads.reads();
        let multiplicity: Vec<u32> = resample_multiplicity(total_reads, &mut rng);
        let found: Vec<f64> = self.reads.weighted_counts(&multiplicity);

        let sim: SimilarityMatrix = self.draw_similarity_matrix(&mut rng, trial_index);
        let corr: Vec<f64> = similarity_correction(&sim, &found, total_reads as f64, &self.params.solver)?;
        let fails: Vec<bool> = corr.iter().map(|&c| c < self.params.test_c).collect();

        Ok(TrialRecord {
            trial_index,
            found,
            corr,
            fails
        })
    }

    fn draw_similarity_matrix(&self, rng: &mut Xoshiro256PlusPlus, trial_index: usize) -> SimilarityMatrix {
        let mut sim: SimilarityMatrix = bootstrap_similarity_matrix(&self.smat_raw, rng);
        let mut attempt: usize = 0;
        while attempt < self.params.matrix_redraws && has_zero_diagonal(&sim) {
            attempt += 1;
            debug!("Trial {}: zero diagonal in bootstrap similarity matrix, redraw {} of {}", trial_index + 1, attempt, self.params.matrix_redraws);
            sim = bootstrap_similarity_matrix(&self.smat_raw, rng);
        }
        sim
    }
}

/// Schedules the independent trials of a `BootstrapJob`.
/// Implementations must return exactly one record per trial, in trial order.
pub trait TrialExecutor {
    fn execute(&self, job: Arc<BootstrapJob>) -> Result<Vec<TrialRecord>>;
}

/// Runs every trial on the calling thread, one after another.
#[derive(Clone,Copy,Debug,Default)]
pub struct SequentialExecutor;

impl TrialExecutor for SequentialExecutor {
    fn execute(&self, job: Arc<BootstrapJob>) -> Result<Vec<TrialRecord>> {
        (0..job.trials())
            .map(|trial_index| job.run_trial(trial_index))
            .collect()
    }
}

/// Runs trials on a fixed-size thread pool; each job reports its record over a channel.
#[derive(Clone,Copy,Debug)]
pub struct PooledExecutor {
    threads: usize
}

impl PooledExecutor {
    /// Creates an executor backed by `threads` workers.
    /// # Arguments
    /// * `threads` - the number of worker threads, must be at least 1
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(CorrectionError::InvalidParameter("number of worker threads must be at least 1".to_string()));
        }
        Ok(PooledExecutor {
            threads
        })
    }
}

impl TrialExecutor for PooledExecutor {
    fn execute(&self, job: Arc<BootstrapJob>) -> Result<Vec<TrialRecord>> {
        let trials: usize = job.trials();
        let pool = ThreadPool::new(self.threads);
        let (tx, rx) = mpsc::channel();

        for trial_index in 0..trials {
            let tx = tx.clone();
            let job = job.clone();
            pool.execute(move|| {
                let trial_result: Result<TrialRecord> = job.run_trial(trial_index);
                //the receiver stays alive until every sender is gone
                tx.send(trial_result).ok();
            });
        }
        //only the workers hold senders now, so a lost job ends the receive loop instead of hanging it
        drop(tx);

        let mut records: Vec<TrialRecord> = Vec::with_capacity(trials);
        let mut first_error: Option<CorrectionError> = None;
        let mut results_received: usize = 0;
        while results_received < trials {
            match rx.recv() {
                Ok(Ok(record)) => records.push(record),
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                },
                Err(_) => {
                    return Err(CorrectionError::WorkerFailure(format!(
                        "only {} of {} bootstrap trials reported back", results_received, trials
                    )));
                }
            };
            results_received += 1;
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        records.sort_unstable_by_key(|r| r.trial_index);
        Ok(records)
    }
}

/// Reduces trial records to per-species p-values, mean abundances, and variances.
/// The reduction does not depend on the order of `records` beyond floating point rounding.
/// # Arguments
/// * `records` - one record per trial
/// * `species` - the number of species, `M`
pub fn aggregate_trials(records: &[TrialRecord], species: usize) -> BootstrapResults {
    let corr: Vec<Vec<f64>> = records.iter().map(|r| r.corr.clone()).collect();
    let fails: Vec<Vec<f64>> = records.iter()
        .map(|r| r.fails.iter().map(|&f| if f { 1.0 } else { 0.0 }).collect())
        .collect();
    let degenerate_trials: usize = records.iter()
        .filter(|r| r.corr.iter().any(|c| !c.is_finite()))
        .count();

    BootstrapResults {
        p_values: reduce_columns(&fails, species, calculate_mean),
        abundances: reduce_columns(&corr, species, calculate_mean),
        variances: reduce_columns(&corr, species, calculate_variance),
        trials: records.len(),
        degenerate_trials
    }
}

/// Runs a full bootstrap analysis with the given executor.
/// Shapes and parameters are checked before any trial starts.
/// # Arguments
/// * `reads` - the `M x N` read mapping matrix
/// * `smat_raw` - the `M x M x R` mapped reads tensor used to bootstrap similarity matrices
/// * `params` - the bootstrap parameters
/// * `executor` - decides how the trials are scheduled
pub fn run_bootstrap(reads: Arc<ReadMatrix>, smat_raw: Arc<MappedReadsTensor>, params: &BootstrapParameters, executor: &dyn TrialExecutor) -> Result<BootstrapResults> {
    if params.trials == 0 {
        return Err(CorrectionError::InvalidParameter("number of bootstrap trials must be at least 1".to_string()));
    }
    if !(0.0..=1.0).contains(&params.test_c) {
        return Err(CorrectionError::InvalidParameter(format!("test_c must be within the range [0, 1], found {}", params.test_c)));
    }
    if reads.species() != smat_raw.species() {
        return Err(CorrectionError::InvalidShape(format!(
            "read matrix has {} species but the mapped reads tensor has {}", reads.species(), smat_raw.species()
        )));
    }
    if reads.reads() == 0 {
        return Err(CorrectionError::DegenerateInput("read matrix contains no reads".to_string()));
    }
    if smat_raw.reads() == 0 {
        return Err(CorrectionError::DegenerateInput("mapped reads tensor contains no simulated reads".to_string()));
    }
    params.solver.validate()?;

    let species: usize = reads.species();
    let job: Arc<BootstrapJob> = Arc::new(BootstrapJob {
        reads,
        smat_raw,
        params: params.clone()
    });
    let records: Vec<TrialRecord> = executor.execute(job)?;
    if records.len() != params.trials {
        return Err(CorrectionError::WorkerFailure(format!(
            "expected {} bootstrap trials, received {}", params.trials, records.len()
        )));
    }

    let results: BootstrapResults = aggregate_trials(&records, species);
    if results.degenerate_trials > 0 {
        warn!(
            "{} of {} bootstrap trials produced non-finite abundances, summary statistics are unreliable",
            results.degenerate_trials, results.trials
        );
    }
    Ok(results)
}

/// Similarity correction with a sequential bootstrap for error estimates.
/// # Arguments
/// * `reads` - the `M x N` read mapping matrix; `reads[m, n] != 0` if read `n` mapped to species `m`
/// * `smat_raw` - the `M x M x R` mapped reads tensor, species in the same order as `reads`
/// * `params` - the bootstrap parameters
pub fn bootstrap(reads: Arc<ReadMatrix>, smat_raw: Arc<MappedReadsTensor>, params: &BootstrapParameters) -> Result<BootstrapResults> {
    run_bootstrap(reads, smat_raw, params, &SequentialExecutor)
}

/// Similarity correction with the bootstrap trials distributed over `nprocs` worker threads.
/// For the same `params.seed`, the results are identical to `bootstrap(...)`.
/// # Arguments
/// * `reads` - the `M x N` read mapping matrix; `reads[m, n] != 0` if read `n` mapped to species `m`
/// * `smat_raw` - the `M x M x R` mapped reads tensor, species in the same order as `reads`
/// * `params` - the bootstrap parameters
/// * `nprocs` - the number of worker threads, must be at least 1
pub fn bootstrap_par(reads: Arc<ReadMatrix>, smat_raw: Arc<MappedReadsTensor>, params: &BootstrapParameters, nprocs: usize) -> Result<BootstrapResults> {
    let executor: PooledExecutor = PooledExecutor::new(nprocs)?;
    run_bootstrap(reads, smat_raw, params, &executor)
}
