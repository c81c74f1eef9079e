//! Chunk list thresholds and migration topology (spec §4.7 — component C7).
//!
//! Six usage bands in a fixed order, each with precomputed free-byte
//! thresholds. The arena owns one `VecDeque<ChunkId>` per band rather than
//! a literal doubly-linked list (spec §9: prefer interior indices over
//! ownership cycles); this module supplies the band topology and threshold
//! arithmetic that drives migration between those deques.

pub const NUM_BANDS: usize = 6;
pub const QINIT: usize = 0;
pub const Q000: usize = 1;
pub const Q025: usize = 2;
pub const Q050: usize = 3;
pub const Q075: usize = 4;
pub const Q100: usize = 5;

pub const BAND_NAMES: [&str; NUM_BANDS] = ["qInit", "q000", "q025", "q050", "q075", "q100"];

/// Usage bands `[min_usage, max_usage)`, taken verbatim from spec §4.7
/// including the deliberate overlap at the `q000`/`qInit` boundary (a chunk
/// at exactly 0% usage is eligible for destruction via `qInit`, not `q000`).
const USAGE_BANDS: [(u64, u64); NUM_BANDS] = [
    (0, 25),   // qInit
    (1, 50),   // q000
    (25, 75),  // q025
    (50, 100), // q050
    (75, 100), // q075
    (100, 100),// q100
];

#[derive(Debug, Clone, Copy)]
pub struct BandThresholds {
    pub free_min_threshold: usize,
    pub free_max_threshold: usize,
    pub max_capacity: usize,
}

/// Precomputes thresholds for all six bands given a chunk size.
pub fn band_thresholds(chunk_size: usize) -> [BandThresholds; NUM_BANDS] {
    let cs = chunk_size as u64;
    let mut out = [BandThresholds {
        free_min_threshold: 0,
        free_max_threshold: 0,
        max_capacity: 0,
    }; NUM_BANDS];
    for (i, &(min_usage, max_usage)) in USAGE_BANDS.iter().enumerate() {
        let free_min = cs - (max_usage * cs) / 100;
        let free_max = cs - (min_usage * cs) / 100;
        out[i] = BandThresholds {
            free_min_threshold: free_min as usize,
            free_max_threshold: free_max as usize,
            max_capacity: free_max as usize,
        };
    }
    out
}

/// Forward pointer, used when an allocation pushes a chunk's free bytes at
/// or below its band's `free_min_threshold`.
pub fn next_band(i: usize) -> Option<usize> {
    if i + 1 < NUM_BANDS {
        Some(i + 1)
    } else {
        None
    }
}

/// Backward pointer, used when a free pushes a chunk's free bytes above its
/// band's `free_max_threshold`. `q000`'s predecessor is `None` (not
/// `qInit`) so a chunk draining below `q000` is destroyed rather than
/// recycled into `qInit`; `qInit` is its own predecessor, a self-loop that
/// never actually fires because `qInit`'s `free_max_threshold` equals the
/// full chunk size (spec §9 open question: verified by construction below).
pub fn prev_band(i: usize) -> Option<usize> {
    match i {
        QINIT => Some(QINIT),
        Q000 => None,
        _ => Some(i - 1),
    }
}

/// Arena's fixed allocation search order for Normal sizes (spec §4.7):
/// `q050, q025, q000, qInit, q075`, skipping `q100` entirely.
pub const NORMAL_ALLOC_ORDER: [usize; 5] = [Q050, Q025, Q000, QINIT, Q075];
