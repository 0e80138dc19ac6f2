
/// Returns the median of the array.
/// For an odd number of values, the middle value is returned.
/// For an even number of values, the average of the two middle values is returned.
/// If any value is NaN or the array is empty, this function returns NaN.
/// Runs in O(n*log(n)) time.
/// # Arguments
/// * `in_array` - the array of values
/// # Examples
/// ```rust
/// use simcorr::stats_util::calculate_median;
/// assert_eq!(calculate_median(&[0.5, 0.1, 0.3]), 0.3);
/// assert_eq!(calculate_median(&[0.4, 0.1, 0.2, 0.3]), 0.25);
/// assert!(calculate_median(&[0.4, f64::NAN]).is_nan());
/// ```
#[inline]
pub fn calculate_median(in_array: &[f64]) -> f64 {
    if in_array.is_empty() || in_array.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let mut sorted_values: Vec<f64> = in_array.to_vec();
    sorted_values.sort_unstable_by(|a, b| a.total_cmp(b));

    let count: usize = sorted_values.len();
    if count % 2 == 1 {
        sorted_values[count / 2]
    } else {
        (sorted_values[count / 2 - 1] + sorted_values[count / 2]) / 2.0
    }
}

/// Returns the arithmetic mean of the array, or NaN when empty.
/// # Arguments
/// * `in_array` - the array of values
/// # Examples
/// ```rust
/// use simcorr::stats_util::calculate_mean;
/// assert_eq!(calculate_mean(&[1.0, 2.0, 6.0]), 3.0);
/// ```
#[inline]
pub fn calculate_mean(in_array: &[f64]) -> f64 {
    in_array.iter().sum::<f64>() / in_array.len() as f64
}

/// Returns the population variance (divisor `n`) of the array, or NaN when empty.
/// # Arguments
/// * `in_array` - the array of values
/// # Examples
/// ```rust
/// use simcorr::stats_util::calculate_variance;
/// assert_eq!(calculate_variance(&[1.0, 3.0]), 1.0);
/// assert_eq!(calculate_variance(&[2.0, 2.0, 2.0]), 0.0);
/// ```
#[inline]
pub fn calculate_variance(in_array: &[f64]) -> f64 {
    let mean: f64 = calculate_mean(in_array);
    in_array.iter()
        .map(|v| (v - mean) * (v - mean))
        .sum::<f64>() / in_array.len() as f64
}

/// Applies `reducer` to each column of a list of equal-length rows and returns one value per column.
/// # Arguments
/// * `rows` - the rows, e.g. one abundance vector per subset or trial
/// * `columns` - the number of columns in every row
/// * `reducer` - the reduction to apply, e.g. `calculate_median`
/// # Examples
/// ```rust
/// use simcorr::stats_util::{calculate_median, reduce_columns};
/// let rows: Vec<Vec<f64>> = vec![vec![0.1, 0.9], vec![0.3, 0.5], vec![0.2, 0.0]];
/// assert_eq!(reduce_columns(&rows, 2, calculate_median), vec![0.2, 0.5]);
/// ```
pub fn reduce_columns<F>(rows: &[Vec<f64>], columns: usize, reducer: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64
{
    let mut column_values: Vec<f64> = Vec::with_capacity(rows.len());
    (0..columns)
        .map(|c| {
            column_values.clear();
            column_values.extend(rows.iter().map(|row| row[c]));
            reducer(&column_values)
        })
        .collect()
}
