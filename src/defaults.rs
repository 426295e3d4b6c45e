// Shared constants for query sizing and encoding.

/// Longest query the backtracker accepts; the scratch arenas and the
/// per-search mismatch/character buffers are sized against this.
pub const MAX_QUERY_LEN: usize = 64;

/// Phred+33 quality substituted when a read carries no quality string (Q40).
pub const DEFAULT_QUAL: u8 = 40 + 33;

/// Raw quality bounds accepted on input (phred+33, Q0..Q40).
pub const QUAL_MIN: u8 = 33;
pub const QUAL_MAX: u8 = 73;

/// Separator between the (pos, chr) pairs of one partial alignment in the
/// seedling byte stream.
pub const SEEDLING_SEP: u8 = 0xfe;

/// Terminator written after each complete partial alignment.
pub const SEEDLING_END: u8 = 0xff;
