extern crate log;

use log::info;
use std::convert::TryInto;
use std::fs;
use std::io::prelude::*;
use std::path::Path;

use crate::errors::{CorrectionError, Result};
use crate::matrix::{MappedReadsTensor, ReadMatrix, SimilarityMatrix};

const NUMPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
//numpy pads the header so the data starts on this boundary
const HEADER_ALIGNMENT: usize = 64;

/// A numeric array loaded from a `.npy` file, values widened to `f64`, C order.
#[derive(Clone,Debug,PartialEq)]
pub struct NumpyArray {
    /// the array dimensions
    pub shape: Vec<usize>,
    /// the flattened values in C order
    pub data: Vec<f64>
}

impl NumpyArray {
    /// Interprets a 2-D array as an `M x M` similarity matrix.
    pub fn into_similarity_matrix(self) -> Result<SimilarityMatrix> {
        if self.shape.len() != 2 || self.shape[0] != self.shape[1] {
            return Err(CorrectionError::InvalidShape(format!("similarity matrix must be square and 2-D, found shape {:?}", self.shape)));
        }
        SimilarityMatrix::new(self.shape[0], self.data)
    }

    /// Interprets a 2-D array as an `M x N` read mapping matrix; values must be non-negative integers.
    pub fn into_read_matrix(self) -> Result<ReadMatrix> {
        if self.shape.len() != 2 {
            return Err(CorrectionError::InvalidShape(format!("read matrix must be 2-D, found shape {:?}", self.shape)));
        }
        let counts: Vec<u32> = to_counts(&self.data)?;
        ReadMatrix::new(self.shape[0], self.shape[1], counts)
    }

    /// Interprets a 3-D array as an `M x M x R` mapped reads tensor; values must be non-negative integers.
    pub fn into_mapped_reads_tensor(self) -> Result<MappedReadsTensor> {
        if self.shape.len() != 3 || self.shape[0] != self.shape[1] {
            return Err(CorrectionError::InvalidShape(format!("mapped reads tensor must have shape (M, M, R), found shape {:?}", self.shape)));
        }
        if self.shape[2] == 0 {
            return Err(CorrectionError::DegenerateInput("mapped reads tensor contains no simulated reads".to_string()));
        }
        let counts: Vec<u32> = to_counts(&self.data)?;
        MappedReadsTensor::new(self.shape[0], self.shape[2], counts)
    }
}

fn to_counts(data: &[f64]) -> Result<Vec<u32>> {
    data.iter()
        .map(|&v| {
            if v >= 0.0 && v <= u32::MAX as f64 && v.fract() == 0.0 {
                Ok(v as u32)
            } else {
                Err(CorrectionError::NumpyFormat(format!("expected non-negative integer counts, found {}", v)))
            }
        })
        .collect()
}

/// Loads a `.npy` file into memory.
/// Supports format versions 1.0 through 3.0 with C-ordered, little-endian bool, integer, and float elements.
/// # Arguments
/// * `filename` - the name of the file to load
/// # Examples
/// ```rust
/// use tempfile::{Builder, NamedTempFile};
/// use simcorr::npy_util::{load_numpy_file, save_numpy_f64};
/// let file: NamedTempFile = Builder::new().suffix(".npy").tempfile().unwrap();
/// let filename: String = file.path().to_str().unwrap().to_string();
/// save_numpy_f64(&[0.9, 0.1, 0.1, 0.9], &[2, 2], &filename).unwrap();
/// let array = load_numpy_file(&filename).unwrap();
/// assert_eq!(array.shape, vec![2, 2]);
/// assert_eq!(array.data, vec![0.9, 0.1, 0.1, 0.9]);
/// ```
pub fn load_numpy_file(filename: &str) -> Result<NumpyArray> {
    let io_error = |source| CorrectionError::Io {
        path: Path::new(filename).to_path_buf(),
        source
    };
    let mut file = fs::File::open(filename).map_err(io_error)?;
    let mut contents: Vec<u8> = vec![];
    file.read_to_end(&mut contents).map_err(io_error)?;

    let array: NumpyArray = parse_numpy(&contents)?;
    info!("Loaded {:?} array with {} values from {:?}", array.shape, array.data.len(), filename);
    Ok(array)
}

/// Parses the full contents of a `.npy` file.
pub fn parse_numpy(contents: &[u8]) -> Result<NumpyArray> {
    //read the numpy header: https://numpy.org/doc/stable/reference/generated/numpy.lib.format.html
    if contents.len() < 10 || &contents[0..6] != NUMPY_MAGIC {
        return Err(CorrectionError::NumpyFormat("missing numpy magic string".to_string()));
    }
    let major_version: u8 = contents[6];
    let (header_len, header_start): (usize, usize) = match major_version {
        1 => (u16::from_le_bytes([contents[8], contents[9]]) as usize, 10),
        2 | 3 => {
            if contents.len() < 12 {
                return Err(CorrectionError::NumpyFormat("truncated numpy header".to_string()));
            }
            (u32::from_le_bytes([contents[8], contents[9], contents[10], contents[11]]) as usize, 12)
        },
        v => {
            return Err(CorrectionError::NumpyFormat(format!("unsupported numpy format version {}", v)));
        }
    };
    let body_start: usize = header_start + header_len;
    if contents.len() < body_start {
        return Err(CorrectionError::NumpyFormat("truncated numpy header".to_string()));
    }
    let header: String = String::from_utf8_lossy(&contents[header_start..body_start]).to_string();

    let descr: String = header_value(&header, "descr")?
        .trim_matches(|c: char| c == '\'' || c == '"')
        .to_string();
    let fortran_order: &str = header_value(&header, "fortran_order")?;
    if fortran_order != "False" {
        return Err(CorrectionError::NumpyFormat("only C-ordered arrays are supported".to_string()));
    }
    let shape: Vec<usize> = parse_shape(header_value(&header, "shape")?)?;

    let count: usize = shape.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| CorrectionError::NumpyFormat(format!("shape {:?} is too large", shape)))?;
    let data: Vec<f64> = decode_values(&descr, &contents[body_start..], count)?;
    Ok(NumpyArray {
        shape,
        data
    })
}

/// Pulls the raw text of one value out of the header dictionary, e.g. `'<f8'` for key `descr`.
fn header_value<'a>(header: &'a str, key: &str) -> Result<&'a str> {
    let missing = || CorrectionError::NumpyFormat(format!("numpy header is missing key {:?}", key));
    let key_start: usize = header.find(&format!("'{}'", key)).ok_or_else(missing)?;
    let after_key: &str = &header[key_start + key.len() + 2..];
    let colon: usize = after_key.find(':').ok_or_else(missing)?;
    let value: &str = after_key[colon + 1..].trim_start();

    let value_end: usize = if value.starts_with('(') {
        value.find(')').map(|i| i + 1).ok_or_else(missing)?
    } else if value.starts_with('\'') || value.starts_with('"') {
        value[1..].find(|c: char| c == '\'' || c == '"').map(|i| i + 2).ok_or_else(missing)?
    } else {
        value.find(|c: char| c == ',' || c == '}').ok_or_else(missing)?
    };
    Ok(value[..value_end].trim())
}

/// Parses a shape tuple like `(3, 3, 1000)` or `(5,)`.
fn parse_shape(shape_str: &str) -> Result<Vec<usize>> {
    shape_str.trim_matches(|c: char| c == '(' || c == ')')
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| CorrectionError::NumpyFormat(format!("invalid shape dimension {:?}", s)))
        })
        .collect()
}

fn decode_values(descr: &str, body: &[u8], count: usize) -> Result<Vec<f64>> {
    let element: &str = descr.get(1..).unwrap_or("");
    let item_size: usize = match element {
        "b1" | "u1" | "i1" => 1,
        "u2" | "i2" => 2,
        "u4" | "i4" | "f4" => 4,
        "u8" | "i8" | "f8" => 8,
        _ => {
            return Err(CorrectionError::NumpyFormat(format!("unsupported element type {:?}", descr)));
        }
    };
    if item_size > 1 && !descr.starts_with('<') {
        return Err(CorrectionError::NumpyFormat(format!("only little-endian arrays are supported, found {:?}", descr)));
    }
    let expected_len: usize = count.checked_mul(item_size)
        .ok_or_else(|| CorrectionError::NumpyFormat(format!("{} elements of {} bytes is too large", count, item_size)))?;
    if body.len() != expected_len {
        return Err(CorrectionError::NumpyFormat(format!(
            "expected {} bytes of array data, found {}", expected_len, body.len()
        )));
    }

    //every chunk below has exactly item_size bytes, so the conversions cannot fail
    let values: Vec<f64> = match element {
        "b1" | "u1" => body.iter().map(|&b| b as f64).collect(),
        "i1" => body.iter().map(|&b| b as i8 as f64).collect(),
        "u2" => body.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]) as f64).collect(),
        "i2" => body.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]]) as f64).collect(),
        "u4" => body.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap_or_default()) as f64).collect(),
        "i4" => body.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap_or_default()) as f64).collect(),
        "f4" => body.chunks_exact(4).map(|c| f32::from_le_bytes(c.try_into().unwrap_or_default()) as f64).collect(),
        "u8" => body.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap_or_default()) as f64).collect(),
        "i8" => body.chunks_exact(8).map(|c| i64::from_le_bytes(c.try_into().unwrap_or_default()) as f64).collect(),
        _ => body.chunks_exact(8).map(|c| f64::from_le_bytes(c.try_into().unwrap_or_default())).collect()
    };
    Ok(values)
}

/// Builds a version 1.0 header for the given element type and shape, padded to `HEADER_ALIGNMENT`.
fn build_header(descr: &str, shape: &[usize]) -> Vec<u8> {
    let shape_str: String = match shape.len() {
        1 => format!("({},)", shape[0]),
        _ => format!("({})", shape.iter().map(|s| s.to_string()).collect::<Vec<String>>().join(", "))
    };
    let mut dict: String = format!("{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}", descr, shape_str);
    let unpadded: usize = NUMPY_MAGIC.len() + 4 + dict.len() + 1;
    let padding: usize = (HEADER_ALIGNMENT - unpadded % HEADER_ALIGNMENT) % HEADER_ALIGNMENT;
    dict.push_str(&" ".repeat(padding));
    dict.push('\n');

    let mut header: Vec<u8> = Vec::with_capacity(NUMPY_MAGIC.len() + 4 + dict.len());
    header.extend_from_slice(NUMPY_MAGIC);
    header.extend_from_slice(&[1, 0]);
    header.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    header.extend_from_slice(dict.as_bytes());
    header
}

fn write_numpy(filename: &str, header: &[u8], body: &[u8]) -> Result<()> {
    let io_error = |source| CorrectionError::Io {
        path: Path::new(filename).to_path_buf(),
        source
    };
    let mut file = fs::File::create(filename).map_err(io_error)?;
    file.write_all(header).map_err(io_error)?;
    file.write_all(body).map_err(io_error)?;
    file.flush().map_err(io_error)
}

/// Saves `f64` values to a `.npy` file with the given shape.
/// # Arguments
/// * `data` - the values in C order
/// * `shape` - the array dimensions, the product must equal `data.len()`
/// * `filename` - the file to write
pub fn save_numpy_f64(data: &[f64], shape: &[usize], filename: &str) -> Result<()> {
    if shape.iter().product::<usize>() != data.len() {
        return Err(CorrectionError::InvalidShape(format!("shape {:?} does not hold {} values", shape, data.len())));
    }
    let body: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect();
    write_numpy(filename, &build_header("<f8", shape), &body)
}

/// Saves `u8` values to a `.npy` file with the given shape; the compact format for 0/1 mapping indicators.
/// # Arguments
/// * `data` - the values in C order
/// * `shape` - the array dimensions, the product must equal `data.len()`
/// * `filename` - the file to write
pub fn save_numpy_u8(data: &[u8], shape: &[usize], filename: &str) -> Result<()> {
    if shape.iter().product::<usize>() != data.len() {
        return Err(CorrectionError::InvalidShape(format!("shape {:?} does not hold {} values", shape, data.len())));
    }
    write_numpy(filename, &build_header("|u1", shape), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{Builder, NamedTempFile};

    fn temp_npy() -> (NamedTempFile, String) {
        let file: NamedTempFile = Builder::new().prefix("temp_data_").suffix(".npy").tempfile().unwrap();
        let filename: String = file.path().to_str().unwrap().to_string();
        (file, filename)
    }

    #[test]
    fn test_header_alignment() {
        for shape in [vec![3], vec![2, 2], vec![10, 10, 1000]].iter() {
            let header = build_header("<f8", shape);
            assert_eq!(header.len() % HEADER_ALIGNMENT, 0);
            assert_eq!(*header.last().unwrap(), b'\n');
        }
    }

    #[test]
    fn test_parse_header_values() {
        let header = "{'descr': '<i8', 'fortran_order': False, 'shape': (3, 4, 5), }";
        assert_eq!(header_value(header, "descr").unwrap(), "'<i8'");
        assert_eq!(header_value(header, "fortran_order").unwrap(), "False");
        assert_eq!(header_value(header, "shape").unwrap(), "(3, 4, 5)");
        assert!(header_value(header, "missing").is_err());

        assert_eq!(parse_shape("(3, 4, 5)").unwrap(), vec![3, 4, 5]);
        assert_eq!(parse_shape("(7,)").unwrap(), vec![7]);
        assert_eq!(parse_shape("()").unwrap(), Vec::<usize>::new());
        assert!(parse_shape("(a, 2)").is_err());
    }

    #[test]
    fn test_float_file() {
        let (_file, filename) = temp_npy();
        let data: Vec<f64> = vec![1.0, 0.5, 0.25, 0.0, 1.0, 0.125];
        save_numpy_f64(&data, &[2, 3], &filename).unwrap();
        let array = load_numpy_file(&filename).unwrap();
        assert_eq!(array.shape, vec![2, 3]);
        assert_eq!(array.data, data);

        //not square, so it is not a similarity matrix
        assert!(array.clone().into_similarity_matrix().is_err());
        //fractional values are not counts
        assert!(array.into_read_matrix().is_err());
    }

    #[test]
    fn test_tensor_file() {
        let (_file, filename) = temp_npy();
        let data: Vec<u8> = vec![
            1, 1, 0,   0, 1, 0,
            0, 0, 0,   1, 1, 1
        ];
        save_numpy_u8(&data, &[2, 2, 3], &filename).unwrap();
        let tensor = load_numpy_file(&filename).unwrap().into_mapped_reads_tensor().unwrap();
        assert_eq!(tensor.species(), 2);
        assert_eq!(tensor.reads(), 3);
        assert_eq!(tensor.get(0, 1, 1), 1);
        assert_eq!(tensor.get(1, 0, 2), 0);

        //a tensor is not a read matrix
        assert!(load_numpy_file(&filename).unwrap().into_read_matrix().is_err());
    }

    #[test]
    fn test_empty_tensor_file() {
        let (_file, filename) = temp_npy();
        save_numpy_u8(&[], &[2, 2, 0], &filename).unwrap();
        match load_numpy_file(&filename).unwrap().into_mapped_reads_tensor() {
            Err(CorrectionError::DegenerateInput(_)) => {},
            other => panic!("expected DegenerateInput, got {:?}", other)
        };
    }

    #[test]
    fn test_integer_types() {
        //hand-build a version 2.0 file of little-endian int32 values
        let dict = "{'descr': '<i4', 'fortran_order': False, 'shape': (2, 2), }\n";
        let mut contents: Vec<u8> = vec![];
        contents.extend_from_slice(NUMPY_MAGIC);
        contents.extend_from_slice(&[2, 0]);
        contents.extend_from_slice(&(dict.len() as u32).to_le_bytes());
        contents.extend_from_slice(dict.as_bytes());
        for v in [3i32, 0, 7, 1].iter() {
            contents.extend_from_slice(&v.to_le_bytes());
        }
        let reads = parse_numpy(&contents).unwrap().into_read_matrix().unwrap();
        assert_eq!(reads.species(), 2);
        assert_eq!(reads.reads(), 2);
        assert_eq!(reads.species_counts(), vec![3.0, 8.0]);
    }

    #[test]
    fn test_bad_files() {
        assert!(parse_numpy(b"not a numpy file").is_err());

        //fortran order is rejected
        let mut contents: Vec<u8> = build_header("<f8", &[1]);
        let flag: usize = contents.windows(5).position(|w| w == b"False").unwrap();
        contents[flag..flag + 5].copy_from_slice(b"True ");
        contents.extend_from_slice(&1.0f64.to_le_bytes());
        assert!(parse_numpy(&contents).is_err());

        //body length mismatch
        let mut contents: Vec<u8> = build_header("<f8", &[2]);
        contents.extend_from_slice(&1.0f64.to_le_bytes());
        assert!(parse_numpy(&contents).is_err());

        //big-endian is rejected
        let mut contents: Vec<u8> = build_header(">f8", &[1]);
        contents.extend_from_slice(&1.0f64.to_be_bytes());
        assert!(parse_numpy(&contents).is_err());

        //dimensions whose product overflows
        let contents: Vec<u8> = build_header("<f8", &[usize::MAX, 2]);
        match parse_numpy(&contents) {
            Err(CorrectionError::NumpyFormat(_)) => {},
            other => panic!("expected NumpyFormat, got {:?}", other)
        };

        //element count fits but the byte length does not
        let contents: Vec<u8> = build_header("<f8", &[usize::MAX / 4]);
        match parse_numpy(&contents) {
            Err(CorrectionError::NumpyFormat(_)) => {},
            other => panic!("expected NumpyFormat, got {:?}", other)
        };

        //missing files report the path
        match load_numpy_file("/definitely/not/a/real/file.npy") {
            Err(CorrectionError::Io { path, .. }) => assert!(path.ends_with("file.npy")),
            other => panic!("expected Io error, got {:?}", other)
        };
    }
}
