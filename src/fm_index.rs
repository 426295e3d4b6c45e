// FM-index over a set of reference sequences.
//
// This module contains the index the backtracking search runs against:
// - cumulative character counts (fchr) for seeding depth-0 intervals
// - a prefix-lookup table (ftab) that skips the first several LF steps
// - occurrence counting at 64-row checkpoints with popcount
// - row resolution back to (reference, offset) coordinates for reporting
//
// The index is built in memory from already-encoded sequences; persistent
// index files are a separate concern and not handled here.

use crate::sink::{Hit, HitSink, ReadParams};
use crate::utils::code_to_base;
use bio::data_structures::suffix_array::suffix_array;

const CP_MASK: u32 = 63;
pub const CP_SHIFT: u32 = 6;

// one_hot_mask_array[i] has the top i bits set.
lazy_static::lazy_static! {
    static ref ONE_HOT_MASK_ARRAY: Vec<u64> = {
        let mut array = vec![0u64; 64];
        let base = 0x8000000000000000u64;
        array[1] = base;
        for i in 2..64 {
            array[i] = (array[i - 1] >> 1) | base;
        }
        array
    };
}

#[inline(always)]
fn popcount64(x: u64) -> u32 {
    x.count_ones()
}

/// Occurrence checkpoint: counts of each base before this 64-row block and
/// a one-hot encoding of the block's BWT rows for popcount queries.
#[derive(Debug, Clone, Copy)]
struct CpOcc {
    counts: [u32; 4],
    bits: [u64; 4],
}

/// Precomputed location of a row within the checkpoint structure, so that
/// repeated occurrence queries against the same row skip the decomposition.
#[derive(Debug, Clone, Copy, Default)]
pub struct SideLocus {
    block: u32,
    boff: u32,
}

impl SideLocus {
    #[inline]
    pub fn from_row(row: u32) -> Self {
        SideLocus {
            block: row >> CP_SHIFT,
            boff: row & CP_MASK,
        }
    }

    /// Initialize loci for both ends of an arrow pair.
    #[inline]
    pub fn init_pair(top: u32, bot: u32) -> (Self, Self) {
        (Self::from_row(top), Self::from_row(bot))
    }
}

pub struct FmIndex {
    /// fchr[c] = first row whose suffix starts with base c; fchr[4] caps the
    /// row space. Row 0 is the sentinel suffix.
    fchr: [u32; 5],
    ftab_chars: u32,
    ftab_tops: Vec<u32>,
    ftab_bots: Vec<u32>,
    cp_occ: Vec<CpOcc>,
    /// Row holding the sentinel in the BWT; skipped by occurrence counts.
    primary: u32,
    /// Full suffix array over the joined text (dev-scale index).
    sa: Vec<u32>,
    /// Joined start offset of each reference, plus a cap.
    ref_offs: Vec<u32>,
    ref_lens: Vec<u32>,
    names: Vec<String>,
    /// Orientation: false means the index was built over per-reference
    /// reversed text and reported offsets are flipped accordingly.
    fw: bool,
    len: u32,
}

impl FmIndex {
    /// Build from code sequences (0..=3; ambiguous codes are mapped to A and
    /// counted in a warning, the way old index builders did).
    pub fn build<S: AsRef<[u8]>>(seqs: &[S], names: Vec<String>, ftab_chars: u32, fw: bool) -> Self {
        debug_assert!(ftab_chars >= 1 && ftab_chars <= 12);
        debug_assert_eq!(seqs.len(), names.len());
        let mut joined: Vec<u8> = Vec::new();
        let mut ref_offs = Vec::with_capacity(seqs.len() + 1);
        let mut ref_lens = Vec::with_capacity(seqs.len());
        let mut n_amb = 0u64;
        let mut push = |joined: &mut Vec<u8>, c: u8| {
            if c < 4 {
                joined.push(c);
            } else {
                n_amb += 1;
                joined.push(0);
            }
        };
        for seq in seqs {
            let seq = seq.as_ref();
            ref_offs.push(joined.len() as u32);
            ref_lens.push(seq.len() as u32);
            if fw {
                for &c in seq {
                    push(&mut joined, c);
                }
            } else {
                for &c in seq.iter().rev() {
                    push(&mut joined, c);
                }
            }
        }
        ref_offs.push(joined.len() as u32);
        if n_amb > 0 {
            log::warn!("{} ambiguous reference bases treated as A in the search index", n_amb);
        }
        let n = joined.len() as u32;
        let n_rows = n + 1;

        let mut text: Vec<u8> = joined.iter().map(|&c| code_to_base(c)).collect();
        text.push(b'$');
        let sa: Vec<u32> = suffix_array(&text).iter().map(|&x| x as u32).collect();
        debug_assert_eq!(sa.len() as u32, n_rows);
        debug_assert_eq!(sa[0], n);

        let mut fchr = [0u32; 5];
        fchr[0] = 1;
        let mut counts = [0u32; 4];
        for &c in &joined {
            counts[c as usize] += 1;
        }
        for c in 0..4 {
            fchr[c + 1] = fchr[c] + counts[c];
        }
        debug_assert_eq!(fchr[4], n_rows);

        let mut bwt = vec![0u8; n_rows as usize];
        let mut primary = 0u32;
        for (r, &s) in sa.iter().enumerate() {
            if s == 0 {
                primary = r as u32;
            } else {
                bwt[r] = joined[(s - 1) as usize];
            }
        }

        let nblocks = (n_rows >> CP_SHIFT) as usize + 1;
        let mut cp_occ = Vec::with_capacity(nblocks);
        let mut running = [0u32; 4];
        for b in 0..nblocks as u32 {
            let mut entry = CpOcc {
                counts: running,
                bits: [0u64; 4],
            };
            for off in 0..=CP_MASK {
                let r = (b << CP_SHIFT) | off;
                if r >= n_rows {
                    break;
                }
                if r == primary {
                    continue;
                }
                let c = bwt[r as usize] as usize;
                entry.bits[c] |= 1u64 << (63 - off);
                running[c] += 1;
            }
            cp_occ.push(entry);
        }

        let mut this = FmIndex {
            fchr,
            ftab_chars,
            ftab_tops: Vec::new(),
            ftab_bots: Vec::new(),
            cp_occ,
            primary,
            sa,
            ref_offs,
            ref_lens,
            names,
            fw,
            len: n,
        };
        this.build_ftab();
        log::debug!(
            "built {} index: {} rows, {} references, ftab over {}-mers",
            if fw { "forward" } else { "mirror" },
            n_rows,
            this.names.len(),
            ftab_chars
        );
        this
    }

    /// Precompute the arrow pair of every `ftab_chars`-mer by backward search.
    fn build_ftab(&mut self) {
        let f = self.ftab_chars as usize;
        let nkeys = 1usize << (2 * f);
        let mut tops = vec![0u32; nkeys];
        let mut bots = vec![0u32; nkeys];
        for key in 0..nkeys {
            let last = (key & 3) as u8;
            let mut top = self.fchr[last as usize];
            let mut bot = self.fchr[last as usize + 1];
            for shift in 1..f {
                let c = ((key >> (2 * shift)) & 3) as u8;
                top = self.lf(&SideLocus::from_row(top), c);
                bot = self.lf(&SideLocus::from_row(bot), c);
            }
            tops[key] = top;
            bots[key] = bot;
        }
        self.ftab_tops = tops;
        self.ftab_bots = bots;
    }

    #[inline]
    fn occ(&self, locus: &SideLocus, c: u8) -> u32 {
        let cp = &self.cp_occ[locus.block as usize];
        let mask = ONE_HOT_MASK_ARRAY[locus.boff as usize];
        cp.counts[c as usize] + popcount64(cp.bits[c as usize] & mask)
    }

    /// One LF step: the row of base `c` prepended to the suffix at `locus`.
    #[inline]
    pub fn lf(&self, locus: &SideLocus, c: u8) -> u32 {
        self.fchr[c as usize] + self.occ(locus, c)
    }

    /// Four-way LF step for both ends of an arrow pair at once.
    pub fn lf_ex(&self, ltop: &SideLocus, lbot: &SideLocus, tops: &mut [u32], bots: &mut [u32]) {
        debug_assert!(tops.len() == 4 && bots.len() == 4);
        for c in 0..4u8 {
            tops[c as usize] = self.lf(ltop, c);
            bots[c as usize] = self.lf(lbot, c);
        }
    }

    pub fn fchr(&self) -> &[u32; 5] {
        &self.fchr
    }

    pub fn ftab_chars(&self) -> u32 {
        self.ftab_chars
    }

    #[inline]
    pub fn ftab_hi(&self, k: u32) -> u32 {
        self.ftab_tops[k as usize]
    }

    #[inline]
    pub fn ftab_lo(&self, k: u32) -> u32 {
        debug_assert!(k >= 1);
        self.ftab_bots[k as usize - 1]
    }

    pub fn is_fw(&self) -> bool {
        self.fw
    }

    pub fn ref_name(&self, tidx: u32) -> &str {
        &self.names[tidx as usize]
    }

    /// Find the reference containing joined position `pos` by binary search.
    fn pos_to_ref(&self, pos: u32) -> u32 {
        debug_assert!(pos < self.len);
        let nrefs = self.names.len();
        let mut left = 0usize;
        let mut right = nrefs;
        let mut mid = 0usize;
        while left < right {
            mid = (left + right) >> 1;
            if pos >= self.ref_offs[mid] {
                if mid == nrefs - 1 || pos < self.ref_offs[mid + 1] {
                    break;
                }
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        mid as u32
    }

    /// Resolve one candidate row of a match interval to reference
    /// coordinates and hand it to the sink. Returns false when the row's
    /// alignment would run off the end of its reference, so the caller can
    /// rotate on to the next row.
    #[allow(clippy::too_many_arguments)]
    pub fn report_chase_one(
        &self,
        qry: &[u8],
        _qual: Option<&[u8]>,
        name: &str,
        mms: &[u32],
        stack_depth: u32,
        row: u32,
        top: u32,
        bot: u32,
        qlen: usize,
        params: &ReadParams,
        sink: &mut HitSink,
    ) -> bool {
        debug_assert!(row >= top && row < bot);
        debug_assert_eq!(stack_depth as usize, mms.len());
        debug_assert_eq!(qry.len(), qlen);
        let g = self.sa[row as usize];
        let tidx = self.pos_to_ref(g);
        let j = g - self.ref_offs[tidx as usize];
        let rlen = self.ref_lens[tidx as usize];
        if j as usize + qlen > rlen as usize {
            // Straddles the boundary between two references.
            return false;
        }
        let toff = if self.fw { j } else { rlen - j - qlen as u32 };
        log::trace!(
            "chase: row {} -> ref {} off {} ({} mismatches, {}bp read)",
            row,
            tidx,
            toff,
            stack_depth,
            qry.len()
        );
        // Mismatch offsets are reported 5'-relative; flip when the 5' end of
        // the read is not on the left of the stored pattern.
        let five_prime_on_left = self.fw == params.fw;
        let mut mms5: Vec<u32> = mms
            .iter()
            .map(|&m| if five_prime_on_left { m } else { qlen as u32 - m - 1 })
            .collect();
        mms5.sort_unstable();
        mms5.dedup();
        sink.report(Hit {
            tidx,
            toff,
            read_id: params.read_id,
            name: name.to_string(),
            fw: params.fw,
            mms: mms5,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::base_to_code;

    fn codes(s: &str) -> Vec<u8> {
        s.bytes().map(base_to_code).collect()
    }

    /// Backward-search an entire pattern with single LF steps.
    fn interval(idx: &FmIndex, pat: &[u8]) -> (u32, u32) {
        let last = pat[pat.len() - 1];
        let mut top = idx.fchr()[last as usize];
        let mut bot = idx.fchr()[last as usize + 1];
        for &c in pat[..pat.len() - 1].iter().rev() {
            let (lt, lb) = SideLocus::init_pair(top, bot);
            top = idx.lf(&lt, c);
            bot = idx.lf(&lb, c);
        }
        (top, bot)
    }

    fn naive_count(text: &[u8], pat: &[u8]) -> usize {
        if pat.len() > text.len() {
            return 0;
        }
        (0..=text.len() - pat.len())
            .filter(|&i| &text[i..i + pat.len()] == pat)
            .count()
    }

    #[test]
    fn test_lf_walk_matches_naive_counts() {
        let text = codes("GATTACAGATTACACATTAG");
        let idx = FmIndex::build(&[text.clone()], vec!["t".into()], 3, true);
        for plen in 1..=6 {
            for start in 0..=text.len() - plen {
                let pat = &text[start..start + plen];
                let (top, bot) = interval(&idx, pat);
                assert_eq!(
                    (bot - top) as usize,
                    naive_count(&text, pat),
                    "pattern {:?}",
                    pat
                );
            }
        }
    }

    #[test]
    fn test_ftab_agrees_with_lf_walk() {
        let text = codes("ACGTTGCAACGTACGTAAAC");
        let f = 3u32;
        let idx = FmIndex::build(&[text.clone()], vec!["t".into()], f, true);
        for key in 0u32..(1u32 << (2 * f)) {
            let pat: Vec<u8> = (0..f).map(|j| ((key >> (2 * (f - 1 - j))) & 3) as u8).collect();
            let (top, bot) = interval(&idx, &pat);
            assert_eq!(idx.ftab_hi(key), top, "key {:#x}", key);
            assert_eq!(idx.ftab_lo(key + 1), bot, "key {:#x}", key);
        }
    }

    #[test]
    fn test_lf_ex_matches_single_steps() {
        let text = codes("TTACGGATCAGATCATTTACG");
        let idx = FmIndex::build(&[text], vec!["t".into()], 2, true);
        let (top, bot) = interval(&idx, &codes("AT"));
        assert!(bot > top);
        let (lt, lb) = SideLocus::init_pair(top, bot);
        let mut tops = [0u32; 4];
        let mut bots = [0u32; 4];
        idx.lf_ex(&lt, &lb, &mut tops, &mut bots);
        for c in 0..4u8 {
            assert_eq!(tops[c as usize], idx.lf(&lt, c));
            assert_eq!(bots[c as usize], idx.lf(&lb, c));
        }
    }

    #[test]
    fn test_row_resolution_and_boundary_rejection() {
        let refs = vec![codes("AAAA"), codes("AAAA")];
        let idx = FmIndex::build(&refs, vec!["a".into(), "b".into()], 2, true);
        let pat = codes("AAAA");
        let (top, bot) = interval(&idx, &pat);
        assert_eq!(bot - top, 5); // joined occurrences, three straddling

        let mut sink = HitSink::new();
        sink.set_retain(true);
        let params = ReadParams { read_id: 0, fw: true };
        let mut accepted = Vec::new();
        for row in top..bot {
            if idx.report_chase_one(&pat, None, "r", &[], 0, row, top, bot, 4, &params, &mut sink) {
                let h = sink.last_hit().unwrap();
                accepted.push((h.tidx, h.toff));
            }
        }
        accepted.sort_unstable();
        assert_eq!(accepted, vec![(0, 0), (1, 0)]);
    }

    #[test]
    fn test_mirror_index_offsets() {
        // In the mirror orientation the pattern is matched against reversed
        // text and the reported offset is flipped back.
        let r = codes("AACGTTTT");
        let idx = FmIndex::build(&[r.clone()], vec!["t".into()], 2, false);
        // Reversed text is TTTTGCAA; search the reversal of CGTT -> TTGC.
        let pat = codes("TTGC");
        let (top, bot) = interval(&idx, &pat);
        assert_eq!(bot - top, 1);
        let mut sink = HitSink::new();
        let params = ReadParams { read_id: 0, fw: true };
        assert!(idx.report_chase_one(&pat, None, "r", &[], 0, top, top, bot, 4, &params, &mut sink));
        let h = sink.last_hit().unwrap();
        // CGTT occupies offsets 2..6 of the forward text.
        assert_eq!(h.toff, 2);
    }
}
