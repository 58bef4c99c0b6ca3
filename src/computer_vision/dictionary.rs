//! Square binary marker codes.
//!
//! A marker is a grid of `(bits + 2) x (bits + 2)` cells: a one-cell black border around a
//! `bits x bits` payload. Payload cells are read row by row from the top left; a white cell is
//! a 1 bit, the first cell is the most significant bit. Codes are chosen so that any two
//! markers, in any of their four rotations, differ in at least `min_distance` cells, and so that
//! no marker looks like a rotated version of itself.

use image::{GrayImage, Luma};

use crate::parameter_error::ParameterError;

/// Largest payload that fits into a u64 code.
pub const MAX_BITS_PER_SIDE: usize = 8;

/// Candidates examined by [MarkerDictionary::generate] before giving up.
const GENERATION_BUDGET: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerDictionary {
    bits: usize,
    codes: Vec<u64>,
    min_distance: u32,
    max_correction: u32,
}

/// Result of matching a sampled payload against the dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeMatch {
    pub id: u32,
    /// Number of quarter turns clockwise the printed pattern appears rotated by in the sample.
    pub rotation: usize,
    /// Cells that disagree with the stored code.
    pub distance: u32,
}

impl MarkerDictionary {
    /// Deterministic dictionary of `count` codes. The same arguments always produce the same
    /// codes, so printed markers stay valid across versions.
    pub fn generate(bits: usize, count: usize, min_distance: u32) -> Result<Self, ParameterError> {
        check_bits(bits)?;
        if min_distance == 0 {
            return Err(ParameterError::InvalidConfiguration(
                "marker code distance must be at least 1".into(),
            ));
        }
        let mask = payload_mask(bits);
        let all_white = mask;
        let mut codes: Vec<u64> = Vec::with_capacity(count);
        let mut state: u64 = 0x5EED_7065_7461_6C73;

        for _ in 0..GENERATION_BUDGET {
            if codes.len() == count {
                break;
            }
            let candidate = splitmix64(&mut state) & mask;

            // Uniform blobs must never decode as a marker.
            if hamming(candidate, 0) < min_distance || hamming(candidate, all_white) < min_distance {
                continue;
            }
            if self_distance(candidate, bits) < min_distance {
                continue;
            }
            if codes
                .iter()
                .all(|&code| rotation_aware_distance(code, candidate, bits) >= min_distance)
            {
                codes.push(candidate);
            }
        }

        if codes.len() < count {
            return Err(ParameterError::InvalidConfiguration(format!(
                "only {} of {} markers with {}x{} bits can be {} cells apart",
                codes.len(),
                count,
                bits,
                bits,
                min_distance
            )));
        }
        Ok(Self::with_codes(bits, codes, min_distance))
    }

    /// Dictionary from explicit codes, as printed elsewhere. Code `i` gets id `i`.
    pub fn from_codes(bits: usize, codes: Vec<u64>) -> Result<Self, ParameterError> {
        check_bits(bits)?;
        if codes.is_empty() {
            return Err(ParameterError::InvalidConfiguration("marker dictionary is empty".into()));
        }
        let mask = payload_mask(bits);
        if let Some(code) = codes.iter().find(|&&c| c & !mask != 0) {
            return Err(ParameterError::InvalidConfiguration(format!(
                "code {:#x} does not fit into {}x{} bits",
                code, bits, bits
            )));
        }

        let mut min_distance = (bits * bits) as u32;
        for (i, &a) in codes.iter().enumerate() {
            min_distance = min_distance.min(self_distance(a, bits));
            for &b in &codes[i + 1..] {
                min_distance = min_distance.min(rotation_aware_distance(a, b, bits));
            }
        }
        if min_distance == 0 {
            return Err(ParameterError::InvalidConfiguration(
                "marker codes are ambiguous under rotation".into(),
            ));
        }
        Ok(Self::with_codes(bits, codes, min_distance))
    }

    fn with_codes(bits: usize, codes: Vec<u64>, min_distance: u32) -> Self {
        MarkerDictionary {
            bits,
            codes,
            min_distance,
            max_correction: min_distance.saturating_sub(1) / 2,
        }
    }

    /// Limits the number of cells a decode may correct. Cannot exceed what the code distance
    /// guarantees to be unambiguous.
    pub fn with_max_correction(mut self, max_correction: u32) -> Self {
        self.max_correction = max_correction.min(self.min_distance.saturating_sub(1) / 2);
        self
    }

    pub fn bits_per_side(&self) -> usize {
        self.bits
    }

    /// Cells per side including the black border.
    pub fn cells_per_side(&self) -> usize {
        self.bits + 2
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn min_distance(&self) -> u32 {
        self.min_distance
    }

    pub fn max_correction(&self) -> u32 {
        self.max_correction
    }

    pub fn code(&self, id: u32) -> Option<u64> {
        self.codes.get(id as usize).copied()
    }

    /// Closest code in any rotation, if within the correction limit.
    pub fn identify(&self, observed: u64) -> Option<CodeMatch> {
        let mut best: Option<CodeMatch> = None;
        for (id, &code) in self.codes.iter().enumerate() {
            let mut rotated = code;
            for rotation in 0..4 {
                let distance = hamming(rotated, observed);
                if best.is_none_or(|b| distance < b.distance) {
                    best = Some(CodeMatch {
                        id: id as u32,
                        rotation,
                        distance,
                    });
                }
                rotated = rotate_clockwise(rotated, self.bits);
            }
        }
        best.filter(|m| m.distance <= self.max_correction)
    }

    /// Printable image of the marker: `cell_px` pixels per cell, surrounded by a white quiet
    /// zone of `quiet_zone_cells` cells.
    pub fn render_marker(&self, id: u32, cell_px: u32, quiet_zone_cells: u32) -> Option<GrayImage> {
        let code = self.code(id)?;
        if cell_px == 0 {
            return None;
        }
        let cells = self.cells_per_side() as u32;
        let side = (cells + 2 * quiet_zone_cells) * cell_px;
        Some(GrayImage::from_fn(side, side, |x, y| {
            let col = (x / cell_px) as i64 - quiet_zone_cells as i64;
            let row = (y / cell_px) as i64 - quiet_zone_cells as i64;
            let white = match self.cell(code, row, col) {
                Some(bit) => bit,
                None => true,
            };
            Luma([if white { 255 } else { 0 }])
        }))
    }

    /// Colour of the marker cell, border included. None outside the marker.
    pub fn cell(&self, code: u64, row: i64, col: i64) -> Option<bool> {
        let cells = self.cells_per_side() as i64;
        if row < 0 || col < 0 || row >= cells || col >= cells {
            return None;
        }
        if row == 0 || col == 0 || row == cells - 1 || col == cells - 1 {
            return Some(false);
        }
        Some(bit_at(code, self.bits, (row - 1) as usize, (col - 1) as usize))
    }
}

fn check_bits(bits: usize) -> Result<(), ParameterError> {
    if !(3..=MAX_BITS_PER_SIDE).contains(&bits) {
        return Err(ParameterError::OutOfRange {
            field: "bits_per_side".into(),
            value: bits as f64,
            min: 3.0,
            max: MAX_BITS_PER_SIDE as f64,
        });
    }
    Ok(())
}

fn payload_mask(bits: usize) -> u64 {
    let n = bits * bits;
    if n == 64 { u64::MAX } else { (1u64 << n) - 1 }
}

pub(crate) fn bit_at(code: u64, bits: usize, row: usize, col: usize) -> bool {
    let index = row * bits + col;
    (code >> (bits * bits - 1 - index)) & 1 == 1
}

/// Packs payload cells given row by row.
pub(crate) fn pack_bits(cells: impl IntoIterator<Item = bool>) -> u64 {
    cells
        .into_iter()
        .fold(0u64, |code, white| (code << 1) | white as u64)
}

/// The code as it reads after turning the printed marker a quarter turn clockwise.
pub fn rotate_clockwise(code: u64, bits: usize) -> u64 {
    let mut cells = Vec::with_capacity(bits * bits);
    for row in 0..bits {
        for col in 0..bits {
            cells.push(bit_at(code, bits, bits - 1 - col, row));
        }
    }
    pack_bits(cells)
}

fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn self_distance(code: u64, bits: usize) -> u32 {
    let mut rotated = code;
    let mut distance = u32::MAX;
    for _ in 1..4 {
        rotated = rotate_clockwise(rotated, bits);
        distance = distance.min(hamming(code, rotated));
    }
    distance
}

fn rotation_aware_distance(a: u64, b: u64, bits: usize) -> u32 {
    let mut rotated = b;
    let mut distance = u32::MAX;
    for _ in 0..4 {
        distance = distance.min(hamming(a, rotated));
        rotated = rotate_clockwise(rotated, bits);
    }
    distance
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 50 markers of 5x5 bits, 5 cells apart, correcting up to 2 cells.
    fn tongs_dictionary() -> MarkerDictionary {
        MarkerDictionary::generate(5, 50, 5).unwrap()
    }

    #[test]
    fn test_generate_is_deterministic() {
        let a = MarkerDictionary::generate(4, 12, 4).unwrap();
        let b = MarkerDictionary::generate(4, 12, 4).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_eq!(a.max_correction(), 1);
    }

    #[test]
    fn test_codes_keep_distance_under_rotation() {
        let dictionary = tongs_dictionary();
        assert_eq!(dictionary.len(), 50);
        for i in 0..dictionary.len() as u32 {
            let a = dictionary.code(i).unwrap();
            assert!(self_distance(a, 5) >= 5);
            for j in (i + 1)..dictionary.len() as u32 {
                let b = dictionary.code(j).unwrap();
                assert!(rotation_aware_distance(a, b, 5) >= 5, "{} vs {}", i, j);
            }
        }
    }

    #[test]
    fn test_four_rotations_return_to_start() {
        let code = 0b1100_0101_0011_1110;
        let mut rotated = code;
        for _ in 0..4 {
            rotated = rotate_clockwise(rotated, 4);
        }
        assert_eq!(rotated, code);
        // Top left cell moves to the top right.
        let one = rotate_clockwise(1 << 15, 4);
        assert!(bit_at(one, 4, 0, 3));
    }

    #[test]
    fn test_identify_rotated_and_corrupted() {
        let dictionary = tongs_dictionary();
        let code = dictionary.code(17).unwrap();
        let rotated = rotate_clockwise(rotate_clockwise(code, 5), 5);
        let corrupted = rotated ^ 0b1 ^ (1 << 12);

        let found = dictionary.identify(corrupted).unwrap();
        assert_eq!(found.id, 17);
        assert_eq!(found.rotation, 2);
        assert_eq!(found.distance, 2);

        assert!(dictionary.identify(0).is_none());
    }

    #[test]
    fn test_impossible_dictionary_is_an_error() {
        let err = MarkerDictionary::generate(3, 1000, 5).unwrap_err();
        assert!(matches!(err, ParameterError::InvalidConfiguration(_)));
        assert!(MarkerDictionary::generate(5, 50, 0).is_err());
        assert!(MarkerDictionary::generate(9, 50, 5).is_err());
    }

    #[test]
    fn test_from_codes_rejects_symmetric_code() {
        // All four corners set: identical under rotation.
        let symmetric = 0b1001_0000_0000_1001;
        assert!(MarkerDictionary::from_codes(4, vec![symmetric]).is_err());
        assert!(MarkerDictionary::from_codes(4, vec![1 << 20]).is_err());
    }

    #[test]
    fn test_render_marker_layout() {
        let dictionary = tongs_dictionary();
        let image = dictionary.render_marker(3, 10, 1).unwrap();
        assert_eq!(image.dimensions(), (90, 90));
        // Quiet zone is white, border is black.
        assert_eq!(image.get_pixel(5, 5)[0], 255);
        assert_eq!(image.get_pixel(15, 45)[0], 0);
        assert!(dictionary.render_marker(99, 10, 1).is_none());
    }
}
