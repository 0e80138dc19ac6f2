
pub mod bootstrap;
pub mod bootstrap_matrix;
pub mod errors;
pub mod matrix;
pub mod npy_util;
pub mod similarity_correction;
pub mod stats_util;
