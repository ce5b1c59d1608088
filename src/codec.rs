//! Chunked trade-blob codec (`GNC2`).
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! header  magic[4] rows:u32 base_time:i64 base_price:i64 footer_offset:u64
//! chunk*  count:u16 base_time:i64 base_price:i64
//!         time_deltas:[i32; n] price_deltas:[i64; n] qty_ids:[u16; n]
//!         matches:[u16; n] (absent in legacy blobs) side_bits:[u8; ceil(n/8)]
//! footer  dict_len:u32 dict:[u64; dict_len] chunk_count:u32 offsets:[u32; chunk_count]
//! ```
//!
//! Prices and quantities are fixed-point with [`PX_SCALE`] / [`QTY_SCALE`].

use std::collections::HashMap;

use crate::block_view::{BLOCK_MAGIC, TradeBlockView};
use crate::checksum::blob_checksum;
use crate::columns::{DayColumns, TradeRow};
use crate::delta::{RunningSum, price_delta, time_delta, to_fixed};
use crate::error::{CodecError, CodecResult, EncodeError};
use crate::wire::{array_at, expect_magic, i64_at, offset_within, slice_at, u16_at, u32_at, u64_at};

pub const BLOB_MAGIC: &[u8; 4] = b"GNC2";
pub const BLOB_HEADER_LEN: usize = 32;
pub const CHUNK_HEADER_LEN: usize = 18;

pub const PX_SCALE: f64 = 100_000_000.0;
pub const QTY_SCALE: f64 = 100_000_000.0;

pub const DEFAULT_CHUNK_ROWS: usize = 32_768;
pub const MAX_CHUNK_ROWS: usize = u16::MAX as usize;
pub const MAX_DICT_ENTRIES: usize = 1 << 16;

// time(4) + price(8) + qty id(2) + matches(2)
const ROW_BYTES: usize = 16;
const LEGACY_ROW_BYTES: usize = 14;

#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub chunk_rows: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            chunk_rows: DEFAULT_CHUNK_ROWS,
        }
    }
}

/// Encoded day plus the truncated digest the index persists for it.
#[derive(Debug, Clone)]
pub struct EncodedBlob {
    pub bytes: Vec<u8>,
    pub checksum: u64,
    pub rows: usize,
    pub chunks: usize,
    pub dict_len: usize,
}

impl EncodedBlob {
    /// Saving relative to a plain 8-bytes-per-field row layout.
    pub fn compression_ratio(&self) -> f64 {
        let plain = self.rows * (8 + 8 + 8 + 1 + 2);
        if plain == 0 {
            return 0.0;
        }
        1.0 - (self.bytes.len() as f64 / plain as f64)
    }
}

/// Fixed-size blob header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobHeader {
    pub rows: u32,
    pub base_time: i64,
    pub base_price: i64,
    pub footer_offset: u64,
}

impl BlobHeader {
    pub fn parse(blob: &[u8]) -> CodecResult<Self> {
        expect_magic(blob, BLOB_MAGIC)?;
        Ok(Self {
            rows: u32_at(blob, 4, "rows")?,
            base_time: i64_at(blob, 8, "base_time")?,
            base_price: i64_at(blob, 16, "base_price")?,
            footer_offset: u64_at(blob, 24, "footer_offset")?,
        })
    }
}

pub fn encode(cols: &DayColumns) -> Result<EncodedBlob, EncodeError> {
    encode_with(cols, &EncodeOptions::default())
}

pub fn encode_with(cols: &DayColumns, options: &EncodeOptions) -> Result<EncodedBlob, EncodeError> {
    let chunk_rows = options.chunk_rows;
    if chunk_rows == 0 || chunk_rows > MAX_CHUNK_ROWS {
        return Err(EncodeError::ChunkSize(chunk_rows));
    }

    let rows = cols.len();
    let row_count = u32::try_from(rows).map_err(|_| EncodeError::TooManyRows { rows })?;

    let prices = cols
        .prices()
        .iter()
        .enumerate()
        .map(|(row, p)| to_fixed(*p, PX_SCALE, "price", row))
        .collect::<Result<Vec<i64>, _>>()?;
    let qtys = cols
        .qtys()
        .iter()
        .enumerate()
        .map(|(row, q)| {
            let fixed = to_fixed(*q, QTY_SCALE, "quantity", row)?;
            u64::try_from(fixed).map_err(|_| EncodeError::InvalidValue {
                field: "quantity",
                row,
                value: *q,
            })
        })
        .collect::<Result<Vec<u64>, _>>()?;
    let times = cols.times();

    let mut buf = Vec::with_capacity(BLOB_HEADER_LEN + rows * ROW_BYTES + rows / 8 + 64);
    buf.extend_from_slice(BLOB_MAGIC);
    buf.extend_from_slice(&row_count.to_le_bytes());
    buf.extend_from_slice(&times.first().copied().unwrap_or(0).to_le_bytes());
    buf.extend_from_slice(&prices.first().copied().unwrap_or(0).to_le_bytes());
    let footer_pos = buf.len();
    buf.extend_from_slice(&0u64.to_le_bytes());

    let mut dict = QtyDictionary::default();
    let mut chunk_offsets = Vec::with_capacity(rows.div_ceil(chunk_rows));

    let mut start = 0;
    while start < rows {
        let end = (start + chunk_rows).min(rows);
        let offset = u32::try_from(buf.len()).map_err(|_| EncodeError::OffsetOverflow(buf.len()))?;
        chunk_offsets.push(offset);
        encode_chunk(&mut buf, cols, times, &prices, &qtys, start, end, &mut dict)?;
        start = end;
    }

    let footer_offset = buf.len() as u64;
    buf.extend_from_slice(&(dict.log.len() as u32).to_le_bytes());
    for q in &dict.log {
        buf.extend_from_slice(&q.to_le_bytes());
    }
    buf.extend_from_slice(&(chunk_offsets.len() as u32).to_le_bytes());
    for off in &chunk_offsets {
        buf.extend_from_slice(&off.to_le_bytes());
    }
    buf[footer_pos..footer_pos + 8].copy_from_slice(&footer_offset.to_le_bytes());

    Ok(EncodedBlob {
        checksum: blob_checksum(&buf),
        rows,
        chunks: chunk_offsets.len(),
        dict_len: dict.log.len(),
        bytes: buf,
    })
}

#[derive(Default)]
struct QtyDictionary {
    ids: HashMap<u64, u16>,
    log: Vec<u64>,
}

impl QtyDictionary {
    fn id_for(&mut self, qty: u64) -> Result<u16, EncodeError> {
        if let Some(id) = self.ids.get(&qty) {
            return Ok(*id);
        }
        if self.log.len() >= MAX_DICT_ENTRIES {
            return Err(EncodeError::DictionaryOverflow {
                limit: MAX_DICT_ENTRIES,
            });
        }
        let id = self.log.len() as u16;
        self.ids.insert(qty, id);
        self.log.push(qty);
        Ok(id)
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_chunk(
    buf: &mut Vec<u8>,
    cols: &DayColumns,
    times: &[i64],
    prices: &[i64],
    qtys: &[u64],
    start: usize,
    end: usize,
    dict: &mut QtyDictionary,
) -> Result<(), EncodeError> {
    let n = end - start;
    let mut t_deltas = Vec::with_capacity(n);
    let mut p_deltas = Vec::with_capacity(n);
    let mut qty_ids = Vec::with_capacity(n);
    let mut side_bits = vec![0u8; n.div_ceil(8)];

    let (mut last_t, mut last_p) = (times[start], prices[start]);
    for (i, row) in (start..end).enumerate() {
        t_deltas.push(time_delta(last_t, times[row], row)?);
        p_deltas.push(price_delta(last_p, prices[row], row)?);
        last_t = times[row];
        last_p = prices[row];
        qty_ids.push(dict.id_for(qtys[row])?);
        if cols.sides()[row] > 0 {
            side_bits[i / 8] |= 1 << (i % 8);
        }
    }

    buf.extend_from_slice(&(n as u16).to_le_bytes());
    buf.extend_from_slice(&times[start].to_le_bytes());
    buf.extend_from_slice(&prices[start].to_le_bytes());
    for d in &t_deltas {
        buf.extend_from_slice(&d.to_le_bytes());
    }
    for d in &p_deltas {
        buf.extend_from_slice(&d.to_le_bytes());
    }
    for id in &qty_ids {
        buf.extend_from_slice(&id.to_le_bytes());
    }
    for m in &cols.matches()[start..end] {
        buf.extend_from_slice(&m.to_le_bytes());
    }
    buf.extend_from_slice(&side_bits);
    Ok(())
}

/// Decodes either blob schema into `cols`, picking the decoder by magic.
pub fn decode_day(blob: &[u8], cols: &mut DayColumns) -> CodecResult<usize> {
    let magic = array_at::<4>(blob, 0, "magic")?;
    if &magic == BLOCK_MAGIC {
        cols.reset();
        let view = TradeBlockView::parse(blob)?;
        view.fill_columns(cols);
        return Ok(cols.len());
    }
    decode_into(blob, cols)
}

/// Rebuilds a `GNC2` blob into `cols`. Every offset, length and count is
/// validated before it is used to index the buffer.
pub fn decode_into(blob: &[u8], cols: &mut DayColumns) -> CodecResult<usize> {
    cols.reset();
    let header = BlobHeader::parse(blob)?;
    let declared = header.rows as u64;

    let footer = offset_within(header.footer_offset, blob.len(), "footer")?;
    if footer < BLOB_HEADER_LEN {
        return Err(CodecError::OutOfBounds {
            what: "footer",
            offset: header.footer_offset,
            len: 0,
            buf_len: blob.len(),
        });
    }

    let dict_len = u32_at(blob, footer, "dict_len")? as usize;
    let dict_bytes = slice_at(blob, footer + 4, dict_len.saturating_mul(8), "dictionary")?;
    let mut dict = std::mem::take(&mut cols.scratch_dict);
    dict.clear();
    dict.extend(
        dict_bytes
            .chunks_exact(8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap_or_default()) as f64 / QTY_SCALE),
    );

    let table_pos = footer + 4 + dict_bytes.len();
    let chunk_count = u32_at(blob, table_pos, "chunk_count")? as usize;
    let table = slice_at(blob, table_pos + 4, chunk_count.saturating_mul(4), "chunk_offsets")?;
    let mut offsets = std::mem::take(&mut cols.scratch_offsets);
    offsets.clear();
    offsets.extend(
        table
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap_or_default())),
    );

    let result = decode_chunks(blob, footer, declared, &offsets, &dict, cols);
    cols.scratch_dict = dict;
    cols.scratch_offsets = offsets;
    result
}

fn decode_chunks(
    blob: &[u8],
    footer: usize,
    declared: u64,
    offsets: &[u32],
    dict: &[f64],
    cols: &mut DayColumns,
) -> CodecResult<usize> {
    // Every row costs at least LEGACY_ROW_BYTES, so this bounds the reservation
    // by what the buffer can actually hold.
    cols.reserve((declared as usize).min(blob.len() / LEGACY_ROW_BYTES));

    let mut decoded = 0u64;
    for (k, &off) in offsets.iter().enumerate() {
        let start = off as usize;
        let end = offsets.get(k + 1).map_or(footer, |next| *next as usize);
        if start < BLOB_HEADER_LEN || end <= start || end > footer {
            return Err(CodecError::Layout(format!(
                "chunk {k} spans [{start}, {end}) outside [{BLOB_HEADER_LEN}, {footer})"
            )));
        }
        let chunk = &blob[start..end];

        let n = u16_at(chunk, 0, "chunk_count")? as usize;
        if n == 0 {
            return Err(CodecError::Layout(format!("chunk {k} is empty")));
        }
        decoded += n as u64;
        if decoded > declared {
            return Err(CodecError::RowCountMismatch { declared, decoded });
        }
        decode_chunk(chunk, n, dict, cols)?;
    }

    if decoded != declared {
        return Err(CodecError::RowCountMismatch { declared, decoded });
    }
    Ok(cols.len())
}

fn decode_chunk(chunk: &[u8], n: usize, dict: &[f64], cols: &mut DayColumns) -> CodecResult<()> {
    let side_len = n.div_ceil(8);
    let has_matches = if chunk.len() == CHUNK_HEADER_LEN + n * ROW_BYTES + side_len {
        true
    } else if chunk.len() == CHUNK_HEADER_LEN + n * LEGACY_ROW_BYTES + side_len {
        false
    } else {
        return Err(CodecError::Layout(format!(
            "chunk of {} bytes matches no record size for {n} rows",
            chunk.len()
        )));
    };

    let mut time = RunningSum::new(i64_at(chunk, 2, "chunk_base_time")?, "time");
    let mut price = RunningSum::new(i64_at(chunk, 10, "chunk_base_price")?, "price");

    let mut pos = CHUNK_HEADER_LEN;
    let t_deltas = slice_at(chunk, pos, n * 4, "time_deltas")?;
    pos += n * 4;
    let p_deltas = slice_at(chunk, pos, n * 8, "price_deltas")?;
    pos += n * 8;
    let qty_ids = slice_at(chunk, pos, n * 2, "qty_ids")?;
    pos += n * 2;
    let matches = if has_matches {
        let m = slice_at(chunk, pos, n * 2, "matches")?;
        pos += n * 2;
        Some(m)
    } else {
        None
    };
    let side_bits = slice_at(chunk, pos, side_len, "side_bits")?;

    let mut t_iter = t_deltas.chunks_exact(4);
    let mut p_iter = p_deltas.chunks_exact(8);
    let mut q_iter = qty_ids.chunks_exact(2);
    let mut m_iter = matches.map(|m| m.chunks_exact(2));

    for i in 0..n {
        let (Some(t), Some(p), Some(q)) = (t_iter.next(), p_iter.next(), q_iter.next()) else {
            return Err(CodecError::Layout(format!("chunk column short at row {i}")));
        };
        let dt = i32::from_le_bytes([t[0], t[1], t[2], t[3]]) as i64;
        let dp = i64::from_le_bytes([p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]]);
        let qty_id = u16::from_le_bytes([q[0], q[1]]) as usize;
        let match_count = match m_iter.as_mut().and_then(|it| it.next()) {
            Some(m) => u16::from_le_bytes([m[0], m[1]]),
            None => 1,
        };
        let is_buy = side_bits[i / 8] & (1 << (i % 8)) != 0;

        cols.push(TradeRow {
            time_ms: time.step(dt)?,
            price: price.step(dp)? as f64 / PX_SCALE,
            // Out-of-range ids degrade to zero rather than failing the day.
            qty: dict.get(qty_id).copied().unwrap_or(0.0),
            side: if is_buy { 1 } else { -1 },
            matches: match_count,
        });
    }
    Ok(())
}
