//! Per-period index over an append-only data file.
//!
//! Layout on disk is `root/<symbol>/<YYYY>/<MM>/{index.quantdev, data.quantdev}`.
//! The index is a 16-byte header (`QIDX`, version, row count) followed by
//! 26-byte rows `{day:u16, offset:u64, length:u64, checksum:u64}`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::atomic_file::write_atomic;
use crate::checksum::blob_checksum;
use crate::codec::{self, EncodeOptions};
use crate::columns::DayColumns;
use crate::error::{CodecError, CodecResult, StoreError, StoreResult};
use crate::wire::{expect_magic, slice_at, u16_at, u32_at, u64_at};

pub const INDEX_MAGIC: &[u8; 4] = b"QIDX";
pub const INDEX_VERSION: u32 = 1;
pub const INDEX_HEADER_LEN: usize = 16;
pub const INDEX_ROW_LEN: usize = 26;

pub const INDEX_FILE: &str = "index.quantdev";
pub const DATA_FILE: &str = "data.quantdev";

pub const DEFAULT_MAX_BLOB_BYTES: u64 = 512 * 1024 * 1024;

/// Top-level directories under the root that never hold a symbol.
const RESERVED_DIRS: [&str; 3] = ["features", "reports", "common"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub day: u8,
    pub offset: u64,
    pub length: u64,
    pub checksum: u64,
}

impl IndexEntry {
    fn read(row: &[u8]) -> CodecResult<Self> {
        let day = u16_at(row, 0, "day")?;
        if !(1..=31).contains(&day) {
            return Err(CodecError::Layout(format!("day-of-month {day} outside 1..=31")));
        }
        Ok(Self {
            day: day as u8,
            offset: u64_at(row, 2, "offset")?,
            length: u64_at(row, 10, "length")?,
            checksum: u64_at(row, 18, "checksum")?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.day as u16).to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
    }

    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// Parses a whole index file. Rows must exactly fill the declared count and
/// no day may repeat.
pub fn parse_index(bytes: &[u8]) -> CodecResult<Vec<IndexEntry>> {
    expect_magic(bytes, INDEX_MAGIC)?;
    let version = u32_at(bytes, 4, "version")?;
    if version != INDEX_VERSION {
        return Err(CodecError::UnsupportedVersion {
            expected: INDEX_VERSION,
            found: version,
        });
    }
    let count = u64_at(bytes, 8, "count")?;
    let rows_len = usize::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(INDEX_ROW_LEN))
        .ok_or(CodecError::Overflow("index row count"))?;
    let rows = slice_at(bytes, INDEX_HEADER_LEN, rows_len, "index rows")?;
    if bytes.len() != INDEX_HEADER_LEN + rows_len {
        return Err(CodecError::Layout(format!(
            "{} trailing bytes after {count} index rows",
            bytes.len() - INDEX_HEADER_LEN - rows_len
        )));
    }

    let mut seen = [false; 32];
    let mut entries = Vec::with_capacity(count as usize);
    for row in rows.chunks_exact(INDEX_ROW_LEN) {
        let entry = IndexEntry::read(row)?;
        if std::mem::replace(&mut seen[entry.day as usize], true) {
            return Err(CodecError::Layout(format!("day {} indexed twice", entry.day)));
        }
        entries.push(entry);
    }
    Ok(entries)
}

pub fn encode_index(entries: &[IndexEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(INDEX_HEADER_LEN + entries.len() * INDEX_ROW_LEN);
    out.extend_from_slice(INDEX_MAGIC);
    out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());
    for entry in entries {
        entry.write(&mut out);
    }
    out
}

/// A calendar month of one symbol's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn date(&self, day: u8) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, day as u32)
    }

    /// Number of calendar days in the month.
    pub fn days(&self) -> u32 {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1)
            .and_then(|next| next.pred_opt())
            .map_or(0, |last| last.day())
    }
}

/// One unit of work: a symbol's trading day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayTask {
    pub date: NaiveDate,
    pub symbol: String,
}

pub struct IndexStore {
    root: PathBuf,
    max_blob_bytes: u64,
    verify_checksums: bool,
    dir_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl IndexStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
            verify_checksums: true,
            dir_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_limits(mut self, max_blob_bytes: u64, verify_checksums: bool) -> Self {
        self.max_blob_bytes = max_blob_bytes;
        self.verify_checksums = verify_checksums;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn period_dir(&self, symbol: &str, period: Period) -> PathBuf {
        self.root
            .join(symbol)
            .join(format!("{:04}", period.year))
            .join(format!("{:02}", period.month))
    }

    fn dir_lock(&self, dir: &Path) -> Arc<Mutex<()>> {
        self.dir_locks
            .lock()
            .entry(dir.to_path_buf())
            .or_default()
            .clone()
    }

    /// Reads and validates the index of one period directory.
    pub fn read_index(&self, dir: &Path) -> StoreResult<Vec<IndexEntry>> {
        let path = dir.join(INDEX_FILE);
        let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        parse_index(&bytes).map_err(|e| StoreError::MalformedIndex {
            path,
            detail: e.to_string(),
        })
    }

    pub fn find_entry(&self, symbol: &str, date: NaiveDate) -> StoreResult<Option<IndexEntry>> {
        let dir = self.period_dir(symbol, Period::of(date));
        let entries = self.read_index(&dir)?;
        Ok(entries.into_iter().find(|e| e.day as u32 == date.day()))
    }

    /// Loads the blob for `date` into `buf`. `Ok(None)` means the day is not
    /// indexed. The entry is bounds-checked against the data file before any
    /// blob byte is read.
    pub fn read_day(
        &self,
        symbol: &str,
        date: NaiveDate,
        buf: &mut Vec<u8>,
    ) -> StoreResult<Option<IndexEntry>> {
        let Some(entry) = self.find_entry(symbol, date)? else {
            return Ok(None);
        };
        let path = self.period_dir(symbol, Period::of(date)).join(DATA_FILE);
        let mut file = File::open(&path).map_err(|e| StoreError::io(&path, e))?;
        let file_len = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();

        let out_of_bounds = StoreError::EntryOutOfBounds {
            day: entry.day,
            offset: entry.offset,
            length: entry.length,
            file_len,
        };
        match entry.end() {
            Some(end) if end <= file_len => {}
            _ => return Err(out_of_bounds),
        }
        if entry.length > self.max_blob_bytes {
            return Err(StoreError::BlobTooLarge {
                day: entry.day,
                length: entry.length,
                limit: self.max_blob_bytes,
            });
        }

        buf.clear();
        buf.resize(entry.length as usize, 0);
        file.seek(SeekFrom::Start(entry.offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| StoreError::io(&path, e))?;

        if self.verify_checksums {
            let actual = blob_checksum(buf);
            if actual != entry.checksum {
                return Err(StoreError::ChecksumMismatch {
                    day: entry.day,
                    expected: entry.checksum,
                    actual,
                });
            }
        }
        Ok(Some(entry))
    }

    /// Appends one day's blob and publishes its index row. The data file is
    /// synced before the index is replaced; a crash in between leaves unindexed
    /// trailing bytes and nothing else.
    pub fn append_day(&self, symbol: &str, date: NaiveDate, blob: &[u8]) -> StoreResult<IndexEntry> {
        let dir = self.period_dir(symbol, Period::of(date));
        let lock = self.dir_lock(&dir);
        let _guard = lock.lock();

        let mut entries = match self.read_index(&dir) {
            Ok(entries) => entries,
            Err(e) if e.is_absent() => Vec::new(),
            Err(e) => return Err(e),
        };
        let day = date.day() as u8;
        if entries.iter().any(|e| e.day == day) {
            return Err(StoreError::DuplicateDay(day));
        }

        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let data_path = dir.join(DATA_FILE);
        let mut data = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .map_err(|e| StoreError::io(&data_path, e))?;
        let offset = data
            .metadata()
            .map_err(|e| StoreError::io(&data_path, e))?
            .len();
        data.write_all(blob)
            .and_then(|_| data.sync_all())
            .map_err(|e| StoreError::io(&data_path, e))?;

        let entry = IndexEntry {
            day,
            offset,
            length: blob.len() as u64,
            checksum: blob_checksum(blob),
        };
        entries.push(entry);
        let index_path = dir.join(INDEX_FILE);
        write_atomic(&index_path, &encode_index(&entries)).map_err(|e| StoreError::io(&index_path, e))?;

        debug!(symbol, %date, offset, length = entry.length, "appended day");
        Ok(entry)
    }

    /// Encodes `cols` and appends the result.
    pub fn append_columns(
        &self,
        symbol: &str,
        date: NaiveDate,
        cols: &DayColumns,
        options: &EncodeOptions,
    ) -> StoreResult<IndexEntry> {
        let encoded = codec::encode_with(cols, options)?;
        self.append_day(symbol, date, &encoded.bytes)
    }

    pub fn symbols(&self) -> StoreResult<Vec<String>> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut out: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.') && !RESERVED_DIRS.contains(&name.as_str()))
            .collect();
        out.sort();
        Ok(out)
    }

    pub fn periods(&self, symbol: &str) -> Vec<Period> {
        let mut out = Vec::new();
        for year in numeric_dirs(&self.root.join(symbol), 4) {
            let year_dir = self.root.join(symbol).join(format!("{year:04}"));
            for month in numeric_dirs(&year_dir, 2) {
                if (1..=12).contains(&month) {
                    out.push(Period {
                        year: year as i32,
                        month,
                    });
                }
            }
        }
        out.sort();
        out
    }

    /// Every indexed day of `symbol`, in date order. Unreadable or malformed
    /// indexes are logged and contribute nothing.
    pub fn tasks(&self, symbol: &str) -> Vec<DayTask> {
        let mut out = Vec::new();
        for period in self.periods(symbol) {
            let dir = self.period_dir(symbol, period);
            let entries = match self.read_index(&dir) {
                Ok(entries) => entries,
                Err(e) if e.is_absent() => continue,
                Err(e) => {
                    warn!(symbol, dir = %dir.display(), error = %e, "skipping period");
                    continue;
                }
            };
            for entry in entries {
                match period.date(entry.day) {
                    Some(date) => out.push(DayTask {
                        date,
                        symbol: symbol.to_string(),
                    }),
                    None => warn!(symbol, ?period, day = entry.day, "index day not in calendar"),
                }
            }
        }
        out.sort();
        out
    }

    /// Tasks across `symbols`, sorted by date then symbol.
    pub fn all_tasks(&self, symbols: &[String]) -> Vec<DayTask> {
        let mut out: Vec<DayTask> = symbols.iter().flat_map(|s| self.tasks(s)).collect();
        out.sort();
        out
    }
}

fn numeric_dirs(dir: &Path, width: usize) -> Vec<u32> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.len() == width && name.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|name| name.parse().ok())
        .collect()
}
