//! Per-day feature files: `root/features/<symbol>/<variant>/<YYYYMMDD>.bin`.
//!
//! ```text
//! magic "FEAT" | count:u16 | count × (len:u8, utf-8 name) | rows × count × f32 (row-major)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::atomic_file::write_atomic;
use crate::error::FeatureFileError;
use crate::wire::{expect_magic, slice_at, u16_at};

pub const FEATURE_MAGIC: &[u8; 4] = b"FEAT";
pub const FEATURE_DIR: &str = "features";
const VALUE_BYTES: usize = 4;

pub fn feature_path(root: &Path, symbol: &str, variant: &str, date: NaiveDate) -> PathBuf {
    root.join(FEATURE_DIR)
        .join(symbol)
        .join(variant)
        .join(format!("{}.bin", date.format("%Y%m%d")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFile {
    names: Vec<String>,
    rows: usize,
    values: Vec<f32>,
}

impl FeatureFile {
    /// Interleaves equal-length series into row-major storage.
    pub fn from_series(names: Vec<String>, series: &[Vec<f64>]) -> Result<Self, FeatureFileError> {
        if names.len() != series.len() {
            return Err(FeatureFileError::NameCount {
                names: names.len(),
                series: series.len(),
            });
        }
        if names.len() > u16::MAX as usize {
            return Err(FeatureFileError::TooManyFeatures(names.len()));
        }
        for name in &names {
            if name.is_empty() || name.len() > u8::MAX as usize {
                return Err(FeatureFileError::BadName(name.clone()));
            }
        }
        let rows = series.first().map_or(0, Vec::len);
        for (name, s) in names.iter().zip(series) {
            if s.len() != rows {
                return Err(FeatureFileError::SeriesLength {
                    feature: name.clone(),
                    expected: rows,
                    found: s.len(),
                });
            }
        }

        let width = names.len();
        let mut values = vec![0f32; rows * width];
        for (k, s) in series.iter().enumerate() {
            for (i, v) in s.iter().enumerate() {
                values[i * width + k] = *v as f32;
            }
        }
        Ok(Self { names, rows, values })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Copies feature `k` into `out`, widened to f64.
    pub fn column_into(&self, k: usize, out: &mut Vec<f64>) -> bool {
        out.clear();
        let width = self.names.len();
        if k >= width {
            return false;
        }
        out.extend(self.values.iter().skip(k).step_by(width).map(|v| *v as f64));
        true
    }

    /// Like [`column_into`](Self::column_into); `out` is left empty when the
    /// file has no feature called `name`.
    pub fn column_by_name(&self, name: &str, out: &mut Vec<f64>) -> bool {
        match self.names.iter().position(|n| n == name) {
            Some(k) => self.column_into(k, out),
            None => {
                out.clear();
                false
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let header: usize = 6 + self.names.iter().map(|n| 1 + n.len()).sum::<usize>();
        let mut out = Vec::with_capacity(header + self.values.len() * VALUE_BYTES);
        out.extend_from_slice(FEATURE_MAGIC);
        out.extend_from_slice(&(self.names.len() as u16).to_le_bytes());
        for name in &self.names {
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FeatureFileError> {
        expect_magic(bytes, FEATURE_MAGIC)?;
        let count = u16_at(bytes, 4, "feature_count")? as usize;
        let mut pos = 6;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            let len = slice_at(bytes, pos, 1, "name_len")?[0] as usize;
            let raw = slice_at(bytes, pos + 1, len, "name")?;
            let name = std::str::from_utf8(raw).map_err(|_| FeatureFileError::NameEncoding)?;
            if name.is_empty() {
                return Err(FeatureFileError::BadName(String::new()));
            }
            names.push(name.to_string());
            pos += 1 + len;
        }

        let payload = &bytes[pos..];
        let row_bytes = count * VALUE_BYTES;
        if row_bytes == 0 {
            if !payload.is_empty() {
                return Err(FeatureFileError::RaggedRows {
                    payload: payload.len(),
                    row_bytes,
                });
            }
            return Ok(Self {
                names,
                rows: 0,
                values: Vec::new(),
            });
        }
        if payload.len() % row_bytes != 0 {
            return Err(FeatureFileError::RaggedRows {
                payload: payload.len(),
                row_bytes,
            });
        }
        let values = payload
            .chunks_exact(VALUE_BYTES)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self {
            names,
            rows: payload.len() / row_bytes,
            values,
        })
    }
}

pub fn write_feature_file(path: &Path, file: &FeatureFile) -> Result<(), FeatureFileError> {
    write_atomic(path, &file.encode()).map_err(|source| FeatureFileError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_feature_file(path: &Path) -> Result<FeatureFile, FeatureFileError> {
    let bytes = fs::read(path).map_err(|source| FeatureFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    FeatureFile::decode(&bytes)
}
