extern crate clap;
extern crate env_logger;
extern crate exitcode;
extern crate log;

use clap::{Arg, App, value_t};
use log::{info, warn, error};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use simcorr::bootstrap::{BootstrapParameters, BootstrapResults, bootstrap, bootstrap_par};
use simcorr::bootstrap_matrix::similarity_matrix;
use simcorr::errors::CorrectionError;
use simcorr::matrix::{MappedReadsTensor, ReadMatrix, SimilarityMatrix};
use simcorr::npy_util::load_numpy_file;
use simcorr::similarity_correction::{SolverParameters, similarity_correction, similarity_correction_smp};

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

/// maps library failures onto process exit codes
fn exit_code(err: &CorrectionError) -> exitcode::ExitCode {
    match err {
        CorrectionError::Io { .. } => exitcode::NOINPUT,
        CorrectionError::NumpyFormat(_) |
        CorrectionError::InvalidShape(_) |
        CorrectionError::InvalidParameter(_) |
        CorrectionError::DegenerateInput(_) => exitcode::DATAERR,
        CorrectionError::WorkerFailure(_) => exitcode::SOFTWARE
    }
}

fn fail(context: &str, err: CorrectionError) -> ! {
    error!("{}: {}", context, err);
    std::process::exit(exit_code(&err));
}

/// Writes one TSV row per species; the bootstrap columns are only present when `stats` is provided.
fn write_results(writer: &mut dyn Write, abundances: &[f64], stats: Option<&BootstrapResults>) -> io::Result<()> {
    match stats {
        Some(results) => {
            writeln!(writer, "species\tabundance\tvariance\tp_value")?;
            for (i, abundance) in abundances.iter().enumerate() {
                writeln!(writer, "{}\t{}\t{}\t{}", i, abundance, results.variances[i], results.p_values[i])?;
            }
        },
        None => {
            writeln!(writer, "species\tabundance")?;
            for (i, abundance) in abundances.iter().enumerate() {
                writeln!(writer, "{}\t{}", i, abundance)?;
            }
        }
    };
    writer.flush()
}

/// Runs the bootstrap on a single thread or on a pool; a thread count of 0 is rejected before any work starts.
fn run_bootstrap_mode(reads: ReadMatrix, smat_raw: MappedReadsTensor, params: &BootstrapParameters, threads: usize) -> Result<BootstrapResults, CorrectionError> {
    if threads == 0 {
        return Err(CorrectionError::InvalidParameter("number of threads must be at least 1".to_string()));
    }
    let arc_reads: Arc<ReadMatrix> = Arc::new(reads);
    let arc_smat_raw: Arc<MappedReadsTensor> = Arc::new(smat_raw);
    if threads > 1 {
        bootstrap_par(arc_reads, arc_smat_raw, params, threads)
    } else {
        bootstrap(arc_reads, arc_smat_raw, params)
    }
}

fn main() {
    //initialize logging for our benefit later
    env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

    //this is the CLI block, params that get populated appear before
    let smat_raw_fn: String;
    let reads_fn: String;
    let mut mode: String = "bootstrap".to_string();
    let mut subsets: usize = 1;
    let mut trials: usize = 100;
    let mut test_c: f64 = 0.01;
    let mut threads: usize = 1;
    let mut redraws: usize = 0;
    let mut max_iterations: usize = 10000;
    let mut tolerance: f64 = 1e-10;

    let matches = App::new("simcorr")
        .version(VERSION.unwrap_or("?"))
        .about("Similarity-corrected abundance estimation for ambiguous read mappings")
        .arg(Arg::with_name("mode")
            .short("m")
            .long("mode")
            .takes_value(true)
            .possible_values(&["correct", "smp", "bootstrap"])
            .help("correction mode (default: bootstrap)"))
        .arg(Arg::with_name("similarity")
            .short("S")
            .long("similarity")
            .takes_value(true)
            .help("precomputed (M, M) similarity matrix for correct/smp modes (default: built from SMAT_RAW.NPY)"))
        .arg(Arg::with_name("subsets")
            .short("s")
            .long("subsets")
            .takes_value(true)
            .help("number of read subsets for smp mode (default: 1)"))
        .arg(Arg::with_name("trials")
            .short("B")
            .long("bootstrap")
            .takes_value(true)
            .help("number of bootstrap trials (default: 100)"))
        .arg(Arg::with_name("test_c")
            .short("c")
            .long("test_c")
            .takes_value(true)
            .help("treat a species as absent in a trial if its abundance is below this value (default: 0.01)"))
        .arg(Arg::with_name("threads")
            .short("t")
            .long("threads")
            .takes_value(true)
            .help("number of bootstrap threads (default: 1)"))
        .arg(Arg::with_name("seed")
            .short("r")
            .long("seed")
            .takes_value(true)
            .help("random seed for the bootstrap (default: random)"))
        .arg(Arg::with_name("redraws")
            .long("redraws")
            .takes_value(true)
            .help("redraw attempts for bootstrap similarity matrices with a zero diagonal (default: 0)"))
        .arg(Arg::with_name("max_iterations")
            .short("i")
            .long("max_iterations")
            .takes_value(true)
            .help("solver iteration cap (default: 10000)"))
        .arg(Arg::with_name("tolerance")
            .short("T")
            .long("tolerance")
            .takes_value(true)
            .help("solver convergence tolerance (default: 1e-10)"))
        .arg(Arg::with_name("output")
            .short("o")
            .long("output")
            .takes_value(true)
            .help("TSV file to write results to (default: stdout)"))
        .arg(Arg::with_name("SMAT_RAW.NPY")
            .help("The (M, M, R) mapped reads tensor from simulated reads")
            .required(true)
            .index(1))
        .arg(Arg::with_name("READS.NPY")
            .help("The (M, N) read mapping matrix of the sample")
            .required(true)
            .index(2))
        .get_matches();

    //pull out required values
    smat_raw_fn = matches.value_of("SMAT_RAW.NPY").unwrap().to_string();
    reads_fn = matches.value_of("READS.NPY").unwrap().to_string();

    //now check options
    mode = value_t!(matches.value_of("mode"), String).unwrap_or(mode);
    subsets = value_t!(matches.value_of("subsets"), usize).unwrap_or(subsets);
    trials = value_t!(matches.value_of("trials"), usize).unwrap_or(trials);
    test_c = value_t!(matches.value_of("test_c"), f64).unwrap_or(test_c);
    threads = value_t!(matches.value_of("threads"), usize).unwrap_or(threads);
    redraws = value_t!(matches.value_of("redraws"), usize).unwrap_or(redraws);
    max_iterations = value_t!(matches.value_of("max_iterations"), usize).unwrap_or(max_iterations);
    tolerance = value_t!(matches.value_of("tolerance"), f64).unwrap_or(tolerance);
    let seed: u64 = value_t!(matches.value_of("seed"), u64).unwrap_or_else(|_| rand::random::<u64>());

    info!("Input parameters (required):");
    info!("\tMapped reads tensor: \"{}\"", smat_raw_fn);
    let smat_raw: MappedReadsTensor = match load_numpy_file(&smat_raw_fn).and_then(|a| a.into_mapped_reads_tensor()) {
        Ok(tensor) => tensor,
        Err(e) => fail("Failed to load mapped reads tensor", e)
    };
    info!("\tRead matrix: \"{}\"", reads_fn);
    let reads: ReadMatrix = match load_numpy_file(&reads_fn).and_then(|a| a.into_read_matrix()) {
        Ok(reads) => reads,
        Err(e) => fail("Failed to load read matrix", e)
    };

    let mut writer: Box<dyn Write> = match matches.value_of("output") {
        Some(out_fn) => {
            info!("\tOutput: \"{}\"", out_fn);
            match File::create(out_fn) {
                Ok(file) => Box::new(BufWriter::new(file)),
                Err(e) => {
                    error!("Failed to create output file: {:?}", e);
                    std::process::exit(exitcode::CANTCREAT);
                }
            }
        },
        None => Box::new(BufWriter::new(io::stdout()))
    };

    let solver_params: SolverParameters = SolverParameters {
        tolerance,
        max_iterations,
        ..Default::default()
    };
    info!("Execution Parameters:");
    info!("\tmode: {}", mode);
    info!("\tspecies: {}", reads.species());
    info!("\treads: {}", reads.reads());
    info!("\tsolver iterations: {}", max_iterations);
    info!("\tsolver tolerance: {:e}", tolerance);

    let outcome: Result<(Vec<f64>, Option<BootstrapResults>), CorrectionError> = if mode == "bootstrap" {
        info!("\tbootstrap trials: {}", trials);
        info!("\ttest_c: {}", test_c);
        info!("\tthreads: {}", threads);
        info!("\tseed: {}", seed);
        info!("\tmatrix redraws: {}", redraws);
        let params: BootstrapParameters = BootstrapParameters {
            trials,
            test_c,
            seed,
            matrix_redraws: redraws,
            solver: solver_params
        };
        run_bootstrap_mode(reads, smat_raw, &params, threads)
            .map(|r| (r.abundances.clone(), Some(r)))
    } else {
        let sim: SimilarityMatrix = match matches.value_of("similarity") {
            Some(sim_fn) => {
                info!("\tsimilarity matrix: \"{}\"", sim_fn);
                match load_numpy_file(sim_fn).and_then(|a| a.into_similarity_matrix()) {
                    Ok(sim) => sim,
                    Err(e) => fail("Failed to load similarity matrix", e)
                }
            },
            None => similarity_matrix(&smat_raw)
        };
        if !sim.is_finite() {
            warn!("Similarity matrix contains non-finite entries; some species have no self-mapping reads");
        }
        let total_reads: f64 = reads.reads() as f64;
        if mode == "smp" {
            info!("\tsubsets: {}", subsets);
            similarity_correction_smp(&sim, &reads, total_reads, subsets, &solver_params)
        } else {
            similarity_correction(&sim, &reads.species_counts(), total_reads, &solver_params)
        }.map(|abundances| (abundances, None))
    };

    let (abundances, stats) = match outcome {
        Ok(outcome) => outcome,
        Err(e) => fail("Correction failed", e)
    };
    if let Some(results) = stats.as_ref() {
        if !results.is_reliable() {
            warn!("Bootstrap results contain non-finite values from {} degenerate trials", results.degenerate_trials);
        }
    }

    match write_results(&mut *writer, &abundances, stats.as_ref()) {
        Ok(()) => {},
        Err(e) => {
            error!("Failed while writing results: {:?}", e);
            std::process::exit(exitcode::IOERR);
        }
    };
    info!("Finished {} correction for {} species", mode, abundances.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_plain() {
        let mut buffer: Vec<u8> = vec![];
        write_results(&mut buffer, &[0.75, 0.25], None).unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), "species\tabundance\n0\t0.75\n1\t0.25\n");
    }

    #[test]
    fn test_write_bootstrap() {
        let results = BootstrapResults {
            p_values: vec![0.0, 1.0],
            abundances: vec![0.5, 0.0],
            variances: vec![0.25, 0.0],
            trials: 4,
            degenerate_trials: 0
        };
        let mut buffer: Vec<u8> = vec![];
        write_results(&mut buffer, &results.abundances, Some(&results)).unwrap();
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "species\tabundance\tvariance\tp_value\n0\t0.5\t0.25\t0\n1\t0\t0\t1\n"
        );
    }

    #[test]
    fn test_zero_threads() {
        let reads = ReadMatrix::from_rows(&[vec![1, 1], vec![0, 1]]).unwrap();
        let smat_raw = MappedReadsTensor::new(2, 2, vec![
            1, 1,   0, 0,
            0, 0,   1, 1
        ]).unwrap();
        let params = BootstrapParameters {
            trials: 2,
            ..Default::default()
        };
        let err = run_bootstrap_mode(reads.clone(), smat_raw.clone(), &params, 0).unwrap_err();
        assert_eq!(exit_code(&err), exitcode::DATAERR);

        let results = run_bootstrap_mode(reads, smat_raw, &params, 1).unwrap();
        assert_eq!(results.trials, 2);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&CorrectionError::DegenerateInput("".to_string())), exitcode::DATAERR);
        assert_eq!(exit_code(&CorrectionError::WorkerFailure("".to_string())), exitcode::SOFTWARE);
    }
}
