use faer::Mat;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{MrptError, Result};

//////////////////////
// Read primitives //
//////////////////////

pub(crate) fn read_i32<R: Read>(r: &mut R) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_ne_bytes(buf))
}

pub(crate) fn read_f32<R: Read>(r: &mut R) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_ne_bytes(buf))
}

pub(crate) fn read_f32_vec<R: Read>(r: &mut R, len: usize) -> std::io::Result<Vec<f32>> {
    let mut bytes = vec![0u8; len * 4];
    r.read_exact(&mut bytes)?;
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

pub(crate) fn read_i32_vec<R: Read>(r: &mut R, len: usize) -> std::io::Result<Vec<i32>> {
    let mut bytes = vec![0u8; len * 4];
    r.read_exact(&mut bytes)?;
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

//////////////////
// Matrix files //
//////////////////

/// Load a raw f32 matrix file into memory
///
/// The file must contain exactly `n * dim` native-endian f32 values in
/// row-major order, the layout produced by the usual ANN benchmark tooling.
///
/// ### Params
///
/// * `path` - Path to the binary file
/// * `n` - Number of rows (samples)
/// * `dim` - Number of columns (dimensions)
///
/// ### Returns
///
/// The matrix, or an error when the file is missing or has the wrong size
pub fn read_matrix(path: impl AsRef<Path>, n: usize, dim: usize) -> Result<Mat<f32>> {
    let file = File::open(path)?;
    let expected = n * dim * std::mem::size_of::<f32>();
    let actual = file.metadata()?.len() as usize;
    if actual != expected {
        return Err(MrptError::CorruptIndex(format!(
            "matrix file holds {actual} bytes, expected {expected} for {n}x{dim}"
        )));
    }

    let mut reader = BufReader::new(file);
    let flat = read_f32_vec(&mut reader, n * dim)?;

    Ok(Mat::from_fn(n, dim, |i, j| flat[i * dim + j]))
}

/// Memory-mapped view of a raw f32 matrix file
///
/// Maps the file instead of reading it, so large training sets are paged in
/// on demand. Rows are served as slices straight out of the mapping.
pub struct MmapMatrix {
    mmap: Mmap,
    n: usize,
    dim: usize,
}

impl MmapMatrix {
    /// Map an existing matrix file
    ///
    /// ### Params
    ///
    /// * `path` - Path to the binary file (n * dim * 4 bytes)
    /// * `n` - Number of rows
    /// * `dim` - Number of columns
    pub fn open(path: impl AsRef<Path>, n: usize, dim: usize) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        #[cfg(unix)]
        mmap.advise(memmap2::Advice::Random)?;

        let expected = n * dim * std::mem::size_of::<f32>();
        if mmap.len() != expected {
            return Err(MrptError::CorruptIndex(format!(
                "matrix file holds {} bytes, expected {expected} for {n}x{dim}",
                mmap.len()
            )));
        }

        Ok(Self { mmap, n, dim })
    }

    /// All values as one row-major slice
    pub fn as_slice(&self) -> &[f32] {
        bytemuck::cast_slice(&self.mmap)
    }

    /// A single row
    pub fn row(&self, i: usize) -> &[f32] {
        let start = i * self.dim;
        &self.as_slice()[start..start + self.dim]
    }

    /// Copy into an owned matrix
    pub fn to_mat(&self) -> Mat<f32> {
        let flat = self.as_slice();
        Mat::from_fn(self.n, self.dim, |i, j| flat[i * self.dim + j])
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_raw(values: &[f32]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytemuck::cast_slice(values)).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_read_matrix() {
        let file = write_raw(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mat = read_matrix(file.path(), 3, 2).unwrap();

        assert_eq!(mat.nrows(), 3);
        assert_eq!(mat.ncols(), 2);
        assert_eq!(mat[(0, 0)], 1.0);
        assert_eq!(mat[(2, 1)], 6.0);
    }

    #[test]
    fn test_read_matrix_wrong_size() {
        let file = write_raw(&[1.0, 2.0, 3.0]);
        assert!(read_matrix(file.path(), 2, 2).is_err());
    }

    #[test]
    fn test_mmap_matrix_rows() {
        let file = write_raw(&[1.0, 2.0, 3.0, 4.0]);
        let mat = MmapMatrix::open(file.path(), 2, 2).unwrap();

        assert_eq!(mat.row(0), &[1.0, 2.0]);
        assert_eq!(mat.row(1), &[3.0, 4.0]);
        assert_eq!(mat.to_mat()[(1, 0)], 3.0);
    }

    #[test]
    fn test_mmap_matrix_wrong_size() {
        let file = write_raw(&[1.0, 2.0, 3.0]);
        assert!(MmapMatrix::open(file.path(), 2, 2).is_err());
    }

    #[test]
    fn test_read_primitives() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7i32.to_ne_bytes());
        buf.extend_from_slice(&2.5f32.to_ne_bytes());

        let mut r = buf.as_slice();
        assert_eq!(read_i32(&mut r).unwrap(), 7);
        assert_eq!(read_f32(&mut r).unwrap(), 2.5);
    }
}
