//! Decoded, columnar representation of one day of trades plus the pool that
//! recycles it between tasks.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// One trade as handed to the encoder or appended by a decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeRow {
    pub time_ms: i64,
    pub price: f64,
    pub qty: f64,
    /// +1 for an aggressive buy, -1 for an aggressive sell.
    pub side: i8,
    pub matches: u16,
}

/// Structure-of-arrays view over a day's trades. All columns share one length.
#[derive(Debug, Default, Clone)]
pub struct DayColumns {
    times: Vec<i64>,
    prices: Vec<f64>,
    qtys: Vec<f64>,
    sides: Vec<i8>,
    matches: Vec<u16>,

    // Decoder scratch, kept here so a pooled instance never reallocates them.
    pub(crate) scratch_dict: Vec<f64>,
    pub(crate) scratch_offsets: Vec<u32>,
}

impl DayColumns {
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            times: Vec::with_capacity(rows),
            prices: Vec::with_capacity(rows),
            qtys: Vec::with_capacity(rows),
            sides: Vec::with_capacity(rows),
            matches: Vec::with_capacity(rows),
            scratch_dict: Vec::with_capacity(1024),
            scratch_offsets: Vec::with_capacity(128),
        }
    }

    pub fn from_rows(rows: &[TradeRow]) -> Self {
        let mut cols = Self::with_capacity(rows.len());
        for row in rows {
            cols.push(*row);
        }
        cols
    }

    /// Zeroes every length and keeps every allocation.
    pub fn reset(&mut self) {
        self.times.clear();
        self.prices.clear();
        self.qtys.clear();
        self.sides.clear();
        self.matches.clear();
        self.scratch_dict.clear();
        self.scratch_offsets.clear();
    }

    pub fn reserve(&mut self, rows: usize) {
        self.times.reserve(rows);
        self.prices.reserve(rows);
        self.qtys.reserve(rows);
        self.sides.reserve(rows);
        self.matches.reserve(rows);
    }

    #[inline]
    pub fn push(&mut self, row: TradeRow) {
        self.times.push(row.time_ms);
        self.prices.push(row.price);
        self.qtys.push(row.qty);
        self.sides.push(if row.side < 0 { -1 } else { 1 });
        self.matches.push(row.matches);
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn row(&self, i: usize) -> Option<TradeRow> {
        Some(TradeRow {
            time_ms: *self.times.get(i)?,
            price: self.prices[i],
            qty: self.qtys[i],
            side: self.sides[i],
            matches: self.matches[i],
        })
    }

    pub fn times(&self) -> &[i64] {
        &self.times
    }

    pub fn prices(&self) -> &[f64] {
        &self.prices
    }

    pub fn qtys(&self) -> &[f64] {
        &self.qtys
    }

    pub fn sides(&self) -> &[i8] {
        &self.sides
    }

    pub fn matches(&self) -> &[u16] {
        &self.matches
    }

    pub fn capacity(&self) -> usize {
        self.times.capacity()
    }
}

/// Bounded free-list of [`DayColumns`]. Checked-out columns are exclusively
/// owned by one task and go back to the list, reset, when the guard drops.
pub struct ColumnPool {
    free: Mutex<Vec<DayColumns>>,
    initial_rows: usize,
    max_idle: usize,
}

impl ColumnPool {
    pub fn new(initial_rows: usize, max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_idle)),
            initial_rows,
            max_idle,
        }
    }

    pub fn checkout(&self) -> PooledColumns<'_> {
        let cols = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| DayColumns::with_capacity(self.initial_rows));
        PooledColumns { cols, pool: self }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn give_back(&self, mut cols: DayColumns) {
        cols.reset();
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(cols);
        }
    }
}

/// Guard over a checked-out [`DayColumns`].
pub struct PooledColumns<'a> {
    cols: DayColumns,
    pool: &'a ColumnPool,
}

impl Deref for PooledColumns<'_> {
    type Target = DayColumns;

    fn deref(&self) -> &DayColumns {
        &self.cols
    }
}

impl DerefMut for PooledColumns<'_> {
    fn deref_mut(&mut self) -> &mut DayColumns {
        &mut self.cols
    }
}

impl Drop for PooledColumns<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.cols));
    }
}
