//! Opaque source position and the delta-encoded pc→position table.
//!
//! The core never looks inside a [`Pos`] beyond carrying it for diagnostics
//! and encoding it into a [`PositionTable`]; scanning and parsing (which
//! produce positions) are external collaborators.

use serde::{Deserialize, Serialize};

/// A source position, opaque to everything except diagnostics formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pos {
    pub line: u32,
    pub col: u32,
}

impl Pos {
    #[must_use]
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

/// One entry of the delta-encoded position table.
///
/// Packed as 4 bits Δpc (unsigned), 5 bits Δline (signed), 6 bits Δcol
/// (signed), 1 bit continuation flag. A saturated delta sets the
/// continuation flag so the next entry keeps contributing to the same
/// logical row instead of silently losing precision.
const PC_BITS: u32 = 4;
const LINE_BITS: u32 = 5;
const COL_BITS: u32 = 6;

const PC_MAX: u32 = (1 << PC_BITS) - 1;
const LINE_MAX: i32 = (1 << (LINE_BITS - 1)) - 1;
const LINE_MIN: i32 = -(1 << (LINE_BITS - 1));
const COL_MAX: i32 = (1 << (COL_BITS - 1)) - 1;
const COL_MIN: i32 = -(1 << (COL_BITS - 1));

/// Builds a [`PositionTable`] from a sorted sequence of `(pc, pos)` pairs
/// recorded during compilation.
#[derive(Debug, Default, Clone)]
pub struct PositionTableBuilder {
    entries: Vec<u16>,
    last_pc: u32,
    last_line: i32,
    last_col: i32,
    started: bool,
}

impl PositionTableBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the position active at `pc`. Must be called with non-decreasing `pc`.
    pub fn record(&mut self, pc: u32, pos: Pos) {
        if !self.started {
            self.started = true;
            self.last_pc = 0;
            self.last_line = 0;
            self.last_col = 0;
        }
        let line = i64::from(pos.line);
        let col = i64::from(pos.col);
        let mut pc_remaining = pc - self.last_pc;
        let mut line_remaining = line - i64::from(self.last_line);
        let mut col_remaining = col - i64::from(self.last_col);

        // Emit as many entries as needed to cover deltas that saturate any field.
        loop {
            let dpc = pc_remaining.min(u64::from(PC_MAX));
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let dline = line_remaining.clamp(i64::from(LINE_MIN), i64::from(LINE_MAX)) as i32;
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let dcol = col_remaining.clamp(i64::from(COL_MIN), i64::from(COL_MAX)) as i32;

            pc_remaining -= dpc;
            line_remaining -= i64::from(dline);
            col_remaining -= i64::from(dcol);

            let more_to_go = pc_remaining != 0 || line_remaining != 0 || col_remaining != 0;
            let word = pack(dpc as u32, dline, dcol, more_to_go);
            self.entries.push(word);

            self.last_pc += dpc as u32;
            self.last_line += dline;
            self.last_col += dcol;

            if !more_to_go {
                break;
            }
        }
    }

    #[must_use]
    pub fn build(self) -> PositionTable {
        PositionTable { entries: self.entries }
    }
}

fn pack(dpc: u32, dline: i32, dcol: i32, cont: bool) -> u16 {
    let dpc_bits = dpc & PC_MAX;
    #[allow(clippy::cast_sign_loss)]
    let dline_bits = (dline as i16 as u16) & ((1 << LINE_BITS) - 1);
    #[allow(clippy::cast_sign_loss)]
    let dcol_bits = (dcol as i16 as u16) & ((1 << COL_BITS) - 1);
    let mut word = 0u16;
    word |= (dpc_bits as u16) << (16 - PC_BITS);
    word |= dline_bits << (COL_BITS + 1);
    word |= dcol_bits << 1;
    word |= u16::from(cont);
    word
}

fn unpack(word: u16) -> (u32, i32, i32, bool) {
    let dpc = u32::from(word >> (16 - PC_BITS));
    let dline_bits = (word >> (COL_BITS + 1)) & ((1 << LINE_BITS) - 1);
    let dcol_bits = (word >> 1) & ((1 << COL_BITS) - 1);
    let dline = sign_extend(dline_bits, LINE_BITS);
    let dcol = sign_extend(dcol_bits, COL_BITS);
    let cont = (word & 1) != 0;
    (dpc, dline, dcol, cont)
}

fn sign_extend(value: u16, bits: u32) -> i32 {
    let shift = 16 - bits;
    (((value << shift) as i16) >> shift) as i32
}

/// A decoded `(pc, pos)` table supporting "greatest pc not exceeding" lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionTable {
    entries: Vec<u16>,
}

impl PositionTable {
    /// Decodes the table into a sorted `(pc, pos)` sequence.
    ///
    /// A saturated delta spans several continuation rows; the logical pc
    /// for the position they jointly encode is the fully accumulated `pc`,
    /// which is only reached at the row whose `cont` bit is clear.
    #[must_use]
    pub fn decode(&self) -> Vec<(u32, Pos)> {
        let mut out = Vec::new();
        let mut pc = 0u32;
        let mut line = 0i32;
        let mut col = 0i32;
        for &word in &self.entries {
            let (dpc, dline, dcol, cont) = unpack(word);
            pc += dpc;
            line += dline;
            col += dcol;
            if !cont {
                #[allow(clippy::cast_sign_loss)]
                out.push((pc, Pos::new(line as u32, col as u32)));
            }
        }
        out
    }

    /// Looks up the position active at `pc`: the greatest recorded `(pc', pos')`
    /// with `pc' <= pc`, via binary search over the decoded table.
    #[must_use]
    pub fn lookup(&self, pc: u32) -> Option<Pos> {
        let decoded = self.decode();
        match decoded.binary_search_by(|(p, _)| p.cmp(&pc)) {
            Ok(i) => Some(decoded[i].1),
            Err(0) => None,
            Err(i) => Some(decoded[i - 1].1),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_simple() {
        let mut b = PositionTableBuilder::new();
        b.record(0, Pos::new(1, 0));
        b.record(2, Pos::new(1, 4));
        b.record(5, Pos::new(2, 0));
        let table = b.build();
        assert_eq!(table.lookup(0), Some(Pos::new(1, 0)));
        assert_eq!(table.lookup(1), Some(Pos::new(1, 0)));
        assert_eq!(table.lookup(2), Some(Pos::new(1, 4)));
        assert_eq!(table.lookup(4), Some(Pos::new(1, 4)));
        assert_eq!(table.lookup(5), Some(Pos::new(2, 0)));
        assert_eq!(table.lookup(100), Some(Pos::new(2, 0)));
    }

    #[test]
    fn lookup_before_first_entry_is_none() {
        let mut b = PositionTableBuilder::new();
        b.record(3, Pos::new(1, 0));
        let table = b.build();
        assert_eq!(table.lookup(0), None);
        assert_eq!(table.lookup(3), Some(Pos::new(1, 0)));
    }

    #[test]
    fn saturating_delta_emits_continuation_rows() {
        // Δpc field is 4 bits (max 15); a 40-pc jump must split into >1 row.
        let mut b = PositionTableBuilder::new();
        b.record(0, Pos::new(1, 0));
        b.record(40, Pos::new(1, 0));
        let table = b.build();
        assert!(table.entries.len() >= 3);
        assert_eq!(table.lookup(40), Some(Pos::new(1, 0)));
        // Every pc in between still resolves to the most recent logical position.
        assert_eq!(table.lookup(39), Some(Pos::new(1, 0)));
    }

    #[test]
    fn large_line_delta_round_trips() {
        let mut b = PositionTableBuilder::new();
        b.record(0, Pos::new(1, 0));
        b.record(1, Pos::new(500, 3));
        let table = b.build();
        assert_eq!(table.lookup(1), Some(Pos::new(500, 3)));
    }
}
