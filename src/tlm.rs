//! The TLM marker manager (component N, §4.N): a main-header index of
//! tile-part lengths, recorded in code-stream order, that lets a reader
//! seek directly to a wanted tile-part instead of scanning SOT by SOT.

use crate::error::{CodecError, Result};
use crate::stream::Stream;

/// One `(tileIndex, tilePartLength)` record, in the order it appears
/// across however many TLM marker segments the header carried.
#[derive(Debug, Clone, Copy)]
pub struct TlmEntry {
    pub tile_index: u32,
    pub tile_part_length: u64,
}

/// `ST`: bytes used to encode the tile index per entry. `ST == 0` means
/// tile indices are absent from the wire format and tile-parts must
/// appear in stream order; the reader assigns a running counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileIndexWidth {
    Absent,
    OneByte,
    TwoBytes,
}

impl TileIndexWidth {
    fn from_st(st: u8) -> Result<Self> {
        match st {
            0 => Ok(TileIndexWidth::Absent),
            1 => Ok(TileIndexWidth::OneByte),
            2 => Ok(TileIndexWidth::TwoBytes),
            other => Err(CodecError::BadMarker(format!("invalid TLM ST {other}"))),
        }
    }

    fn byte_len(self) -> usize {
        match self {
            TileIndexWidth::Absent => 0,
            TileIndexWidth::OneByte => 1,
            TileIndexWidth::TwoBytes => 2,
        }
    }
}

/// `SP`: 0 = 16-bit tile-part lengths, 1 = 32-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    Bits16,
    Bits32,
}

impl LengthWidth {
    fn byte_len(self) -> usize {
        match self {
            LengthWidth::Bits16 => 2,
            LengthWidth::Bits32 => 4,
        }
    }
}

/// Cross-tile-part length index built from one or more TLM marker
/// segments. Every segment is indexed by its `Itlm` byte but this
/// manager only needs the concatenated entry order, per §4.N.
pub struct TlmManager {
    entries: Vec<TlmEntry>,
    cursor: usize,
    /// Set once the first segment's `(ST, SP)` is observed; a later
    /// segment with a different `ST` is a mixed-mode error (§9 Open
    /// Questions: this reimplementation's chosen policy is that `ST`
    /// and `SP` must be identical across every TLM segment of an image).
    st_sp: Option<(TileIndexWidth, LengthWidth)>,
    next_running_index: u32,
}

impl TlmManager {
    pub fn new() -> Self {
        TlmManager { entries: Vec::new(), cursor: 0, st_sp: None, next_running_index: 0 }
    }

    /// Parses one TLM marker segment's body (after `Ztlm`) and appends
    /// its entries. `body` excludes the marker id, length field and the
    /// `Ztlm` byte already consumed by the caller.
    pub fn parse_segment(&mut self, stsp_byte: u8, body: &[u8]) -> Result<()> {
        let st = TileIndexWidth::from_st((stsp_byte >> 4) & 0x3)?;
        let sp = if (stsp_byte >> 6) & 0x1 == 0 { LengthWidth::Bits16 } else { LengthWidth::Bits32 };

        match self.st_sp {
            None => self.st_sp = Some((st, sp)),
            Some((prev_st, prev_sp)) if prev_st != st || prev_sp != sp => {
                return Err(CodecError::BadMarker(
                    "TLM marker segments disagree on ST/SP (mixed-mode tile-part length encoding)".into(),
                ));
            }
            _ => {}
        }

        let record_len = st.byte_len() + sp.byte_len();
        if record_len == 0 || body.len() % record_len != 0 {
            return Err(CodecError::BadMarker("TLM segment length not a multiple of the record size".into()));
        }

        for chunk in body.chunks(record_len) {
            let tile_index = match st {
                TileIndexWidth::Absent => {
                    let idx = self.next_running_index;
                    self.next_running_index += 1;
                    idx
                }
                TileIndexWidth::OneByte => chunk[0] as u32,
                TileIndexWidth::TwoBytes => u16::from_be_bytes([chunk[0], chunk[1]]) as u32,
            };
            let len_bytes = &chunk[st.byte_len()..];
            let tile_part_length = match sp {
                LengthWidth::Bits16 => u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as u64,
                LengthWidth::Bits32 => {
                    u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as u64
                }
            };
            self.entries.push(TlmEntry { tile_index, tile_part_length });
        }
        Ok(())
    }

    /// Advances (or, if `peek`, merely inspects) the next entry.
    pub fn next(&mut self, peek: bool) -> Option<TlmEntry> {
        let entry = self.entries.get(self.cursor).copied();
        if !peek && entry.is_some() {
            self.cursor += 1;
        }
        entry
    }

    /// Advances `stream` past every tile-part not in `slated`, by
    /// summing and skipping their recorded lengths, until the next
    /// entry names a slated tile (or entries run out).
    pub fn seek_next_slated(&mut self, slated: &[u32], stream: &mut dyn Stream) -> Result<Option<TlmEntry>> {
        loop {
            let Some(entry) = self.next(true) else { return Ok(None) };
            if slated.contains(&entry.tile_index) {
                return Ok(Some(entry));
            }
            self.next(false);
            stream.skip(entry.tile_part_length as i64)?;
        }
    }

    /// Begins emission bookkeeping for a fresh TLM marker segment
    /// during compression; paired with `write_end` once all of this
    /// segment's tile-parts have been framed.
    pub fn write_begin(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    pub fn write_end(&self) -> &[TlmEntry] {
        &self.entries
    }

    pub fn record(&mut self, tile_index: u32, tile_part_length: u64) {
        self.entries.push(TlmEntry { tile_index, tile_part_length });
    }
}

impl Default for TlmManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStream {
        pos: u64,
    }
    impl Stream for FakeStream {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        fn write(&mut self, _buf: &[u8]) -> Result<usize> {
            Ok(0)
        }
        fn skip(&mut self, n: i64) -> Result<()> {
            self.pos += n as u64;
            Ok(())
        }
        fn seek(&mut self, pos: u64) -> Result<()> {
            self.pos = pos;
            Ok(())
        }
        fn tell(&mut self) -> Result<u64> {
            Ok(self.pos)
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn num_bytes_left(&mut self) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn parses_two_byte_index_and_32_bit_lengths() {
        let mut mgr = TlmManager::new();
        // ST=2 (two-byte index) at bits 4-5, SP=1 (32-bit length) at bit 6.
        let stsp = (2 << 4) | (1 << 6);
        let mut body = Vec::new();
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&100u32.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&200u32.to_be_bytes());
        mgr.parse_segment(stsp, &body).unwrap();

        let first = mgr.next(false).unwrap();
        assert_eq!(first.tile_index, 0);
        assert_eq!(first.tile_part_length, 100);
        let second = mgr.next(false).unwrap();
        assert_eq!(second.tile_index, 1);
        assert_eq!(second.tile_part_length, 200);
    }

    #[test]
    fn mixed_st_sp_across_segments_is_rejected() {
        let mut mgr = TlmManager::new();
        mgr.parse_segment(0 << 4, &[0, 0]).unwrap();
        let err = mgr.parse_segment(1 << 4, &[0, 0, 0]);
        assert!(err.is_err());
    }

    #[test]
    fn seek_next_slated_skips_unwanted_tile_parts() {
        let mut mgr = TlmManager::new();
        mgr.record(0, 50);
        mgr.record(1, 70);
        mgr.record(2, 30);
        let mut stream = FakeStream { pos: 0 };
        let found = mgr.seek_next_slated(&[2], &mut stream).unwrap().unwrap();
        assert_eq!(found.tile_index, 2);
        assert_eq!(stream.pos, 120);
    }
}
