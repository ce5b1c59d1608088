//! Cache-aligned `TBV1` trade blocks: one 64-byte header followed by
//! 64-byte-aligned little-endian columns. Reading goes through
//! [`TradeBlockView`], which borrows the buffer and never copies it.

use crate::columns::{DayColumns, TradeRow};
use crate::error::{CodecError, CodecResult, EncodeError};
use crate::wire::{expect_magic, u32_at, u64_at};

pub const BLOCK_MAGIC: &[u8; 4] = b"TBV1";
pub const BLOCK_VERSION: u32 = 1;
pub const BLOCK_HEADER_LEN: usize = 64;
pub const CACHE_LINE: usize = 64;

const COLUMN_NAMES: [&str; 7] = ["agg_id", "price", "qty", "first_id", "last_id", "time", "buyer_bits"];

/// Byte offsets of every column, already validated against the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockLayout {
    rows: usize,
    agg_id: usize,
    price: usize,
    qty: usize,
    first_id: usize,
    last_id: usize,
    time: usize,
    bits: usize,
}

impl BlockLayout {
    fn parse(buf: &[u8]) -> CodecResult<Self> {
        expect_magic(buf, BLOCK_MAGIC)?;
        let version = u32_at(buf, 4, "version")?;
        if version != BLOCK_VERSION {
            return Err(CodecError::UnsupportedVersion {
                expected: BLOCK_VERSION,
                found: version,
            });
        }
        if buf.len() < BLOCK_HEADER_LEN {
            return Err(CodecError::Truncated {
                field: "block_header",
                offset: 0,
                need: BLOCK_HEADER_LEN,
                len: buf.len(),
            });
        }

        let declared = u64_at(buf, 8, "rows")?;
        if declared == 0 {
            return Err(CodecError::Layout("trade block declares zero rows".into()));
        }
        let rows = usize::try_from(declared).map_err(|_| CodecError::Overflow("rows"))?;
        let col_bytes = rows.checked_mul(8).ok_or(CodecError::Overflow("column length"))?;
        let bit_words = rows.div_ceil(64);

        let mut offsets = [0usize; 7];
        for (k, &name) in COLUMN_NAMES.iter().enumerate() {
            let off = u32_at(buf, 16 + k * 4, name)? as usize;
            if off < BLOCK_HEADER_LEN {
                return Err(CodecError::OutOfBounds {
                    what: name,
                    offset: off as u64,
                    len: 0,
                    buf_len: buf.len(),
                });
            }
            if off % CACHE_LINE != 0 {
                return Err(CodecError::Misaligned {
                    what: name,
                    offset: off as u64,
                    align: CACHE_LINE as u64,
                });
            }
            let len = if k == 6 { bit_words * 8 } else { col_bytes };
            if off.checked_add(len).is_none_or(|end| end > buf.len()) {
                return Err(CodecError::OutOfBounds {
                    what: name,
                    offset: off as u64,
                    len: len as u64,
                    buf_len: buf.len(),
                });
            }
            offsets[k] = off;
        }

        let [agg_id, price, qty, first_id, last_id, time, bits] = offsets;
        Ok(Self {
            rows,
            agg_id,
            price,
            qty,
            first_id,
            last_id,
            time,
            bits,
        })
    }
}

/// Borrowed, validated view over a `TBV1` buffer.
#[derive(Debug, Clone, Copy)]
pub struct TradeBlockView<'a> {
    buf: &'a [u8],
    layout: BlockLayout,
}

impl<'a> TradeBlockView<'a> {
    pub fn parse(buf: &'a [u8]) -> CodecResult<Self> {
        let layout = BlockLayout::parse(buf)?;
        Ok(Self { buf, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.rows
    }

    /// Always false: empty blocks are rejected at parse time.
    pub fn is_empty(&self) -> bool {
        self.layout.rows == 0
    }

    #[inline]
    fn word(&self, column: usize, i: usize) -> Option<[u8; 8]> {
        if i >= self.layout.rows {
            return None;
        }
        let start = column + i * 8;
        let bytes = self.buf.get(start..start + 8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Some(out)
    }

    fn column(&self, off: usize) -> &'a [u8] {
        let len = self.layout.rows * 8;
        self.buf.get(off..off + len).unwrap_or_default()
    }

    pub fn agg_id(&self, i: usize) -> Option<u64> {
        self.word(self.layout.agg_id, i).map(u64::from_le_bytes)
    }

    pub fn price(&self, i: usize) -> Option<f64> {
        self.word(self.layout.price, i).map(f64::from_le_bytes)
    }

    pub fn qty(&self, i: usize) -> Option<f64> {
        self.word(self.layout.qty, i).map(f64::from_le_bytes)
    }

    pub fn first_id(&self, i: usize) -> Option<u64> {
        self.word(self.layout.first_id, i).map(u64::from_le_bytes)
    }

    pub fn last_id(&self, i: usize) -> Option<u64> {
        self.word(self.layout.last_id, i).map(u64::from_le_bytes)
    }

    pub fn time_ms(&self, i: usize) -> Option<i64> {
        self.word(self.layout.time, i).map(i64::from_le_bytes)
    }

    /// Out-of-range rows read as false.
    pub fn is_buyer_maker(&self, i: usize) -> bool {
        if i >= self.layout.rows {
            return false;
        }
        let start = self.layout.bits + (i / 64) * 8;
        match self.buf.get(start..start + 8) {
            Some(w) => {
                let word = u64::from_le_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]);
                word & (1u64 << (i % 64)) != 0
            }
            None => false,
        }
    }

    /// Copies the view into `cols`. A buyer-maker trade is an aggressive sell.
    pub fn fill_columns(&self, cols: &mut DayColumns) {
        cols.reset();
        cols.reserve(self.layout.rows);

        let le = |b: &[u8]| [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        let times = self.column(self.layout.time).chunks_exact(8);
        let prices = self.column(self.layout.price).chunks_exact(8);
        let qtys = self.column(self.layout.qty).chunks_exact(8);
        let firsts = self.column(self.layout.first_id).chunks_exact(8);
        let lasts = self.column(self.layout.last_id).chunks_exact(8);

        let rows = times.zip(prices).zip(qtys).zip(firsts.zip(lasts));
        for (i, (((t, p), q), (first, last))) in rows.enumerate() {
            let first = u64::from_le_bytes(le(first));
            let last = u64::from_le_bytes(le(last));
            let span = last.saturating_sub(first).saturating_add(1);
            cols.push(TradeRow {
                time_ms: i64::from_le_bytes(le(t)),
                price: f64::from_le_bytes(le(p)),
                qty: f64::from_le_bytes(le(q)),
                side: if self.is_buyer_maker(i) { -1 } else { 1 },
                matches: span.min(u16::MAX as u64) as u16,
            });
        }
    }
}

/// One row of a block as produced by the exchange feed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockRow {
    pub agg_id: u64,
    pub price: f64,
    pub qty: f64,
    pub first_id: u64,
    pub last_id: u64,
    pub time_ms: i64,
    pub buyer_maker: bool,
}

fn align_up(n: usize) -> usize {
    n.div_ceil(CACHE_LINE) * CACHE_LINE
}

/// Lays `rows` out as an aligned `TBV1` block.
pub fn write_block(rows: &[BlockRow]) -> Result<Vec<u8>, EncodeError> {
    if rows.is_empty() {
        return Err(EncodeError::EmptyBlock);
    }
    let n = rows.len();
    let col_bytes = align_up(n * 8);
    let bit_words = n.div_ceil(64);

    let mut offsets = [0u32; 7];
    let mut pos = BLOCK_HEADER_LEN;
    for (k, off) in offsets.iter_mut().enumerate() {
        *off = u32::try_from(pos).map_err(|_| EncodeError::OffsetOverflow(pos))?;
        pos += if k == 6 { align_up(bit_words * 8) } else { col_bytes };
    }

    let mut buf = vec![0u8; pos];
    buf[0..4].copy_from_slice(BLOCK_MAGIC);
    buf[4..8].copy_from_slice(&BLOCK_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&(n as u64).to_le_bytes());
    for (k, off) in offsets.iter().enumerate() {
        buf[16 + k * 4..20 + k * 4].copy_from_slice(&off.to_le_bytes());
    }

    let [agg, price, qty, first, last, time, bits] = offsets.map(|o| o as usize);
    for (i, row) in rows.iter().enumerate() {
        let at = i * 8;
        buf[agg + at..agg + at + 8].copy_from_slice(&row.agg_id.to_le_bytes());
        buf[price + at..price + at + 8].copy_from_slice(&row.price.to_le_bytes());
        buf[qty + at..qty + at + 8].copy_from_slice(&row.qty.to_le_bytes());
        buf[first + at..first + at + 8].copy_from_slice(&row.first_id.to_le_bytes());
        buf[last + at..last + at + 8].copy_from_slice(&row.last_id.to_le_bytes());
        buf[time + at..time + at + 8].copy_from_slice(&row.time_ms.to_le_bytes());
        if row.buyer_maker {
            buf[bits + (i / 64) * 8 + (i % 64) / 8] |= 1 << (i % 8);
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> Vec<BlockRow> {
        (0..n)
            .map(|i| BlockRow {
                agg_id: 1_000 + i as u64,
                price: 100.0 + i as f64 * 0.25,
                qty: 0.5 + (i % 4) as f64,
                first_id: 10 * i as u64,
                last_id: 10 * i as u64 + (i % 3) as u64,
                time_ms: 1_700_000_000_000 + i as i64 * 50,
                buyer_maker: i % 5 == 0,
            })
            .collect()
    }

    #[test]
    fn test_view_reads_columns() {
        let src = rows(130);
        let buf = write_block(&src).unwrap();
        let view = TradeBlockView::parse(&buf).unwrap();
        assert_eq!(view.len(), 130);
        for (i, row) in src.iter().enumerate() {
            assert_eq!(view.agg_id(i), Some(row.agg_id));
            assert_eq!(view.price(i), Some(row.price));
            assert_eq!(view.qty(i), Some(row.qty));
            assert_eq!(view.time_ms(i), Some(row.time_ms));
            assert_eq!(view.first_id(i), Some(row.first_id));
            assert_eq!(view.last_id(i), Some(row.last_id));
            assert_eq!(view.is_buyer_maker(i), row.buyer_maker);
        }
        assert_eq!(view.price(130), None);
        assert!(!view.is_buyer_maker(130));
    }

    #[test]
    fn test_fill_columns_maps_side_and_matches() {
        let src = rows(70);
        let buf = write_block(&src).unwrap();
        let mut cols = DayColumns::default();
        TradeBlockView::parse(&buf).unwrap().fill_columns(&mut cols);

        assert_eq!(cols.len(), 70);
        assert_eq!(cols.sides()[0], -1);
        assert_eq!(cols.sides()[1], 1);
        assert_eq!(cols.matches()[2], 3);
        assert_eq!(cols.times()[69], src[69].time_ms);
    }

    #[test]
    fn test_matches_saturate() {
        let mut src = rows(1);
        src[0].first_id = 0;
        src[0].last_id = u64::MAX;
        let buf = write_block(&src).unwrap();
        let mut cols = DayColumns::default();
        TradeBlockView::parse(&buf).unwrap().fill_columns(&mut cols);
        assert_eq!(cols.matches()[0], u16::MAX);
    }

    #[test]
    fn test_zero_rows_rejected() {
        assert_eq!(write_block(&[]), Err(EncodeError::EmptyBlock));
        let mut buf = write_block(&rows(1)).unwrap();
        buf[8..16].copy_from_slice(&0u64.to_le_bytes());
        assert!(matches!(TradeBlockView::parse(&buf), Err(CodecError::Layout(_))));
    }

    #[test]
    fn test_version_checked() {
        let mut buf = write_block(&rows(3)).unwrap();
        buf[4..8].copy_from_slice(&2u32.to_le_bytes());
        assert_eq!(
            TradeBlockView::parse(&buf).unwrap_err(),
            CodecError::UnsupportedVersion {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn test_misaligned_offset_rejected() {
        let mut buf = write_block(&rows(3)).unwrap();
        let off = u32_at(&buf, 20, "price").unwrap() + 8;
        buf[20..24].copy_from_slice(&off.to_le_bytes());
        assert!(matches!(
            TradeBlockView::parse(&buf),
            Err(CodecError::Misaligned { what: "price", .. })
        ));
    }

    #[test]
    fn test_offset_inside_header_rejected() {
        let mut buf = write_block(&rows(3)).unwrap();
        buf[16..20].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            TradeBlockView::parse(&buf),
            Err(CodecError::OutOfBounds { what: "agg_id", .. })
        ));
    }

    #[test]
    fn test_column_past_end_rejected() {
        let buf = write_block(&rows(8)).unwrap();
        // The bitset is the last column; shaving one word off breaks it.
        let short = &buf[..buf.len() - 64];
        assert!(matches!(
            TradeBlockView::parse(short),
            Err(CodecError::OutOfBounds { what: "buyer_bits", .. })
        ));

        let mut huge = buf.clone();
        huge[8..16].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(TradeBlockView::parse(&huge).is_err());
    }

    #[test]
    fn test_short_header_rejected() {
        let buf = write_block(&rows(2)).unwrap();
        for len in 0..BLOCK_HEADER_LEN {
            assert!(TradeBlockView::parse(&buf[..len]).is_err());
        }
    }
}
