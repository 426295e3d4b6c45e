// Quality-aware, depth-bounded backtracking search over the FM-index.
//
// The search walks the read from its rightmost character, narrowing an
// arrow pair (top, bot) one LF step at a time. When the pair closes, the
// search backtracks: it substitutes a different base at one of the
// positions walked so far, chosen at random among the positions of lowest
// quality whose substitution still has occurrences, and recurses with a
// tightened set of region constraints. The sum of qualities at substituted
// positions never exceeds the configured threshold.
//
// Scratch space is two arenas laid out as a stack of frames, one frame per
// recursion level: `pairs` holds a 4-way arrow-pair table per walked depth
// (four tops, then four bots) and `elims` a bitmask of substitutions ruled
// out at that depth.

use crate::defaults::{
    DEFAULT_QUAL, MAX_QUERY_LEN, QUAL_MAX, QUAL_MIN, SEEDLING_END, SEEDLING_SEP,
};
use crate::fm_index::{FmIndex, SideLocus};
use crate::sink::{Hit, HitSink, ReadParams};
use crate::utils::{base_to_code, code_to_base};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::BTreeSet;

/// A change applied to a query base before searching, e.g. "position 3 was
/// changed from an A to a T". Mutations are undone before a hit is handed
/// to the sink, so reported reads always carry the original sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryMutation {
    pub pos: u8,
    pub old_base: u8,
    pub new_base: u8,
}

impl QueryMutation {
    pub fn new(pos: u8, old_base: u8, new_base: u8) -> Self {
        debug_assert!(old_base < 4);
        debug_assert!(new_base < 4);
        debug_assert_ne!(old_base, new_base);
        QueryMutation {
            pos,
            old_base,
            new_base,
        }
    }
}

/// Search configuration. Region offsets are depths measured from the end
/// of the read the walk starts at: depths below `unrev_off` admit no
/// substitution, below `one_rev_off` one, below `two_rev_off` two; beyond
/// that only the quality budget applies.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub unrev_off: u32,
    pub one_rev_off: u32,
    pub two_rev_off: u32,
    /// Optional starting interval; both zero means the whole text.
    pub itop: u32,
    pub ibot: u32,
    /// Ceiling on the summed quality of substituted positions.
    pub qual_thresh: u32,
    /// Tolerance within which two alignments count as equally good.
    pub qual_wobble: u32,
    /// When positive, emit partial alignments of up to this many
    /// mismatches instead of reporting hits.
    pub report_seedlings: u32,
    /// Require exactly one mismatch in each half of the seed.
    pub half_and_half: bool,
    /// Only one-hit reporting is implemented; must stay true.
    pub one_hit: bool,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            unrev_off: 0,
            one_rev_off: 0,
            two_rev_off: 0,
            itop: 0,
            ibot: 0,
            qual_thresh: 70,
            qual_wobble: 15,
            report_seedlings: 0,
            half_and_half: false,
            one_hit: true,
            seed: 0,
        }
    }
}

/// Coordinates randomized quality-aware backtracking for one read at a
/// time. Not safe to share: a search mutates the borrowed read (through
/// mutation overlays), the mismatch and character buffers, the scratch
/// arenas and the random source.
pub struct Backtracker<'a> {
    qry: &'a mut [u8],
    qlen: usize,
    qual: Option<&'a [u8]>,
    name: Option<&'a str>,
    index: &'a FmIndex,
    sink: &'a mut HitSink,
    params: ReadParams,
    unrev_off: u32,
    one_rev_off: u32,
    two_rev_off: u32,
    /// Per-depth stride of the scratch arenas; equals the query length.
    spread: usize,
    max_stack_depth: usize,
    qual_thresh: u32,
    one_hit: bool,
    /// Arrow-pair frames, one per recursion level.
    pairs: Vec<u32>,
    /// Elimination bitmask frames, parallel to `pairs`.
    elims: Vec<u8>,
    /// Query offsets of the substitutions on the current path; the first
    /// `stack_depth` entries are live.
    mms: [u32; MAX_QUERY_LEN],
    /// Per-depth character consumed so far: uppercase for matched read
    /// bases, lowercase for substitutions.
    chars: [u8; MAX_QUERY_LEN],
    report_seedlings: u32,
    seedlings: Option<&'a mut Vec<u8>>,
    muts: Option<&'a [QueryMutation]>,
    /// Reference texts; when present every outcome is cross-checked
    /// against an exhaustive scan.
    os: Option<&'a [Vec<u8>]>,
    half_and_half: bool,
    five_depth: usize,
    three_depth: usize,
    rng: StdRng,
}

impl<'a> Backtracker<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: &'a FmIndex,
        sink: &'a mut HitSink,
        params: ReadParams,
        config: &SearchConfig,
        qry: &'a mut [u8],
        qual: Option<&'a [u8]>,
        name: Option<&'a str>,
        muts: Option<&'a [QueryMutation]>,
        seedlings: Option<&'a mut Vec<u8>>,
        os: Option<&'a [Vec<u8>]>,
    ) -> Self {
        debug_assert!(config.one_rev_off >= config.unrev_off);
        debug_assert!(config.two_rev_off >= config.one_rev_off);
        debug_assert!(config.one_hit);
        if config.itop != 0 || config.ibot != 0 {
            debug_assert!(config.itop < config.ibot);
        }
        if config.half_and_half {
            debug_assert_eq!(0, config.report_seedlings);
        }
        if config.report_seedlings > 0 {
            debug_assert!(seedlings.is_some());
        }
        let mut this = Backtracker {
            qry,
            qlen: 0,
            qual,
            name,
            index,
            sink,
            params,
            unrev_off: config.unrev_off,
            one_rev_off: config.one_rev_off,
            two_rev_off: config.two_rev_off,
            spread: 0,
            max_stack_depth: 0,
            qual_thresh: config.qual_thresh,
            one_hit: config.one_hit,
            pairs: Vec::new(),
            elims: Vec::new(),
            mms: [0; MAX_QUERY_LEN],
            chars: [0; MAX_QUERY_LEN],
            report_seedlings: config.report_seedlings,
            seedlings,
            muts: None,
            os,
            half_and_half: config.half_and_half,
            five_depth: config.one_rev_off as usize,
            three_depth: config.two_rev_off as usize,
            rng: StdRng::seed_from_u64(config.seed),
        };
        this.init_query(muts);
        this
    }

    /// Point the backtracker at a new read; scratch arenas grow as needed.
    pub fn set_query(
        &mut self,
        qry: &'a mut [u8],
        qual: Option<&'a [u8]>,
        name: Option<&'a str>,
        muts: Option<&'a [QueryMutation]>,
    ) {
        self.undo_mutations();
        self.muts = None;
        self.qry = qry;
        self.qual = qual;
        self.name = name;
        self.init_query(muts);
    }

    /// Swap the mutation overlay, rebalancing the read buffer.
    pub fn set_muts(&mut self, muts: Option<&'a [QueryMutation]>) {
        self.undo_mutations();
        self.muts = muts;
        self.apply_mutations();
    }

    fn init_query(&mut self, muts: Option<&'a [QueryMutation]>) {
        self.qlen = self.qry.len();
        debug_assert!(self.qlen > 0 && self.qlen <= MAX_QUERY_LEN);
        if let Some(q) = self.qual {
            debug_assert!(q.len() >= self.qlen);
            for &b in &q[..self.qlen] {
                debug_assert!((QUAL_MIN..=QUAL_MAX).contains(&b));
            }
        }
        self.spread = self.qlen;
        self.max_stack_depth = self.qlen - (self.unrev_off as usize).min(self.qlen) + 4;
        let psz = self.spread * self.max_stack_depth * 8;
        if self.pairs.len() < psz {
            self.pairs.resize(psz, 0);
        }
        let esz = self.spread * self.max_stack_depth;
        if self.elims.len() < esz {
            self.elims.resize(esz, 0);
        }
        self.muts = muts;
        self.apply_mutations();
    }

    #[inline]
    fn qbase(&self, k: usize) -> u8 {
        self.qry[k]
    }

    /// Quality at query offset `k`, rebased from phred+33.
    #[inline]
    fn qual_at(&self, k: usize) -> u8 {
        let raw = match self.qual {
            Some(q) => q[k],
            None => DEFAULT_QUAL,
        };
        raw.saturating_sub(QUAL_MIN)
    }

    fn read_name(&self) -> &str {
        self.name.unwrap_or("default")
    }

    #[inline]
    fn pair_idx(&self, frame: usize, d: usize) -> usize {
        (frame * self.spread + d) * 8
    }

    #[inline]
    fn pair_top(&self, frame: usize, d: usize, c: usize) -> u32 {
        self.pairs[self.pair_idx(frame, d) + c]
    }

    #[inline]
    fn pair_bot(&self, frame: usize, d: usize, c: usize) -> u32 {
        self.pairs[self.pair_idx(frame, d) + c + 4]
    }

    #[inline]
    fn pair_spread(&self, frame: usize, d: usize, c: usize) -> u32 {
        self.pair_bot(frame, d, c) - self.pair_top(frame, d, c)
    }

    #[inline]
    fn elim_idx(&self, frame: usize, d: usize) -> usize {
        frame * self.spread + d
    }

    /// Start the search at the extreme right-hand side of the pattern,
    /// using the prefix-lookup table to cover the first several characters
    /// in one step whenever that cannot jump over a legal backtracking
    /// target.
    pub fn backtrack(&mut self, iham: u32) -> bool {
        debug_assert!(self.qlen > 0);
        let f = self.index.ftab_chars() as usize;
        let m = (self.unrev_off as usize).min(self.qlen);
        if m >= f {
            let mut key = self.qbase(self.qlen - f) as u32;
            for i in (1..f).rev() {
                debug_assert!(self.qbase(self.qlen - i) < 4);
                key = (key << 2) | self.qbase(self.qlen - i) as u32;
            }
            let top = self.index.ftab_hi(key);
            let bot = self.index.ftab_lo(key + 1);
            if self.qlen == f && bot > top {
                if self.report_seedlings > 0 {
                    // A full-length exact match cannot seed partial hits;
                    // start over from depth zero.
                    self.search_from(0, 0, 0, iham)
                } else {
                    self.report(0, top, bot)
                }
            } else if bot > top {
                self.search_from(f, top, bot, iham)
            } else {
                false
            }
        } else {
            // The lookup spans past the unrevisitable region and could jump
            // over a legitimate mismatch; walk from depth zero instead.
            self.search_from(0, 0, 0, iham)
        }
    }

    fn search_from(&mut self, depth: usize, top: u32, bot: u32, iham: u32) -> bool {
        log::trace!(
            "search_from(depth={}, top={}, bot={}, iham={})",
            depth,
            top,
            bot,
            iham
        );
        let check = self.oracle_enabled();
        let old_retain = if check { self.sink.set_retain(true) } else { false };
        let ret = self.bt(
            0,
            depth,
            self.unrev_off as usize,
            self.one_rev_off as usize,
            self.two_rev_off as usize,
            top,
            bot,
            iham,
            iham,
        );
        if check {
            self.sink.set_retain(old_retain);
            if ret {
                self.confirm_hit(iham);
            } else {
                self.confirm_no_hit(iham);
            }
        }
        ret
    }

    /// One recursion frame of the randomized quality-aware backtracker.
    ///
    /// `stack_depth` counts the substitutions on the current path and
    /// selects the scratch frame; `depth` is the first position this frame
    /// is responsible for; `(top, bot)` is the arrow pair entering that
    /// position, with (0, 0) meaning "seed from the cumulative character
    /// counts at depth zero".
    #[allow(clippy::too_many_arguments)]
    fn bt(
        &mut self,
        stack_depth: usize,
        depth: usize,
        unrev: usize,
        one_rev: usize,
        two_rev: usize,
        mut top: u32,
        mut bot: u32,
        ham: u32,
        iham: u32,
    ) -> bool {
        debug_assert!(depth < self.qlen);
        debug_assert!(bot >= top);
        debug_assert!(ham <= self.qual_thresh);
        debug_assert!(stack_depth < self.max_stack_depth);
        if self.half_and_half {
            debug_assert_eq!(0, self.report_seedlings);
            debug_assert!(self.three_depth > self.five_depth);
            // A frame entered exactly at a half boundary must already carry
            // the mismatches that half requires.
            if depth == self.five_depth && stack_depth < 1 {
                return false;
            }
            if depth == self.three_depth && stack_depth < 2 {
                return false;
            }
            debug_assert!(depth < self.five_depth || stack_depth >= 1);
            debug_assert!(depth < self.three_depth || stack_depth >= 2);
        }
        if self.report_seedlings > 0 {
            debug_assert!(!self.half_and_half);
        }
        log::trace!(
            "  bt(stack={}, depth={}, regions=({},{},{}), top={}, bot={}, ham={})",
            stack_depth,
            depth,
            unrev,
            one_rev,
            two_rev,
            top,
            bot,
            ham
        );

        // Arrow pairs acceptable as backtracking targets in this frame.
        let mut alt_num = 0u32;
        // Among those, the ones at the lowest quality seen so far.
        let mut eligible_num = 0u32;
        // Summed spread of the eligible pairs; selection weight.
        let mut eligible_sz = 0u32;
        let mut low_alt_qual = 0xffu8;

        let mut ltop = SideLocus::default();
        let mut lbot = SideLocus::default();
        if top != 0 || bot != 0 {
            let (t, b) = SideLocus::init_pair(top, bot);
            ltop = t;
            lbot = b;
        }

        let mut d = depth;
        while d < self.qlen {
            let cur = self.qlen - d - 1;
            let c = self.qbase(cur);
            debug_assert!(c < 4);
            let q = self.qual_at(cur);
            let cur_is_alternative = d >= unrev && ham + q as u32 <= self.qual_thresh;
            let mut cur_is_eligible = false;
            let mut cur_overrides_eligible = false;
            if cur_is_alternative {
                if q < low_alt_qual {
                    cur_is_eligible = true;
                    cur_overrides_eligible = true;
                } else if q == low_alt_qual {
                    cur_is_eligible = true;
                }
            }

            if top == 0 && bot == 0 {
                // Seed the depth-0 quartet from the cumulative counts.
                debug_assert_eq!(0, d);
                let fchr = *self.index.fchr();
                let base = self.pair_idx(stack_depth, 0);
                for i in 0..4 {
                    self.pairs[base + i] = fchr[i];
                    self.pairs[base + i + 4] = fchr[i + 1];
                }
                top = self.pair_top(stack_depth, d, c as usize);
                bot = self.pair_bot(stack_depth, d, c as usize);
            } else if cur_is_alternative {
                // This position may become a backtracking target, so the
                // full quartet is needed.
                let base = self.pair_idx(stack_depth, d);
                self.pairs[base..base + 8].fill(0);
                let index = self.index;
                let (tops, bots) = self.pairs[base..base + 8].split_at_mut(4);
                index.lf_ex(&ltop, &lbot, tops, bots);
                top = self.pair_top(stack_depth, d, c as usize);
                bot = self.pair_bot(stack_depth, d, c as usize);
            } else {
                // Backtracking here would blow the quality budget; only the
                // consumed character's pair is needed.
                top = self.index.lf(&ltop, c);
                bot = self.index.lf(&lbot, c);
            }
            if top != bot {
                let (t, b) = SideLocus::init_pair(top, bot);
                ltop = t;
                lbot = b;
            }

            // The consumed base is never a backtracking target.
            let ei = self.elim_idx(stack_depth, d);
            self.elims[ei] = 1 << c;
            if cur_is_alternative {
                for i in 0..4usize {
                    debug_assert!(self.pair_bot(stack_depth, d, i) >= self.pair_top(stack_depth, d, i));
                    let sp = self.pair_spread(stack_depth, d, i);
                    if sp == 0 {
                        // Closed pair; rule the substitution out for good.
                        self.elims[ei] |= 1 << i;
                    }
                    if i != c as usize && sp > 0 && (self.elims[ei] & (1 << i)) == 0 {
                        if cur_is_eligible {
                            if cur_overrides_eligible {
                                low_alt_qual = q;
                                eligible_num = 0;
                                eligible_sz = 0;
                                cur_overrides_eligible = false;
                            }
                            eligible_sz += sp;
                            eligible_num += 1;
                        }
                        alt_num += 1;
                    }
                }
            }
            debug_assert!(alt_num == 0 || (eligible_sz > 0 && eligible_num > 0));
            debug_assert!(eligible_num <= alt_num);
            debug_assert!(self.eligibility_consistent(
                stack_depth,
                depth,
                d,
                unrev,
                low_alt_qual,
                eligible_sz,
                eligible_num
            ));

            // A match may still have to be treated as a mismatch: partial
            // alignment search keeps going past a full match, and the
            // half-and-half boundaries force a substitution before the walk
            // may cross them.
            let mut keep_going_despite_match = false;
            if cur == 0
                && top < bot
                && self.report_seedlings > 0
                && stack_depth < self.report_seedlings as usize
                && alt_num > 0
            {
                debug_assert!(!self.half_and_half);
                keep_going_despite_match = true;
                if stack_depth > 0 {
                    self.report_seedling(stack_depth);
                }
            } else if self.half_and_half && d + 1 == self.five_depth && top < bot {
                if stack_depth == 0 {
                    keep_going_despite_match = true;
                } else {
                    debug_assert_eq!(1, stack_depth);
                }
            } else if self.half_and_half && d + 1 == self.three_depth && top < bot {
                if stack_depth < 2 {
                    keep_going_despite_match = true;
                } else {
                    debug_assert_eq!(2, stack_depth);
                }
            }

            loop {
                let force = keep_going_despite_match;
                keep_going_despite_match = false;
                if !(top == bot && alt_num > 0) && !force {
                    break;
                }
                if alt_num == 0 {
                    // Forced into the mismatch branch with nothing left to
                    // branch to.
                    debug_assert!(force);
                    return false;
                }
                debug_assert!(eligible_sz > 0 && eligible_num > 0);
                log::trace!(
                    "    branching at d={} ({} alternatives, {} eligible over {} rows)",
                    d,
                    alt_num,
                    eligible_num,
                    eligible_sz
                );

                // Choose a target among the lowest-quality alternatives,
                // weighted by pair spread.
                let r = self.rng.next_u32() % eligible_sz;
                let mut cum_sz = 0u32;
                let mut bt_i = 0usize;
                let mut bt_j = 0usize;
                let mut found = false;
                'scan: for i in depth..=d {
                    if i < unrev {
                        continue;
                    }
                    let icur = self.qlen - i - 1;
                    let qi = self.qual_at(icur);
                    let e = self.elims[self.elim_idx(stack_depth, i)];
                    debug_assert!(e > 0 && e < 16);
                    if qi == low_alt_qual && e != 15 {
                        for j in 0..4usize {
                            if (e & (1 << j)) == 0 {
                                debug_assert!(
                                    self.pair_bot(stack_depth, i, j) > self.pair_top(stack_depth, i, j)
                                );
                                cum_sz += self.pair_spread(stack_depth, i, j);
                                if r < cum_sz {
                                    bt_i = i;
                                    bt_j = j;
                                    found = true;
                                    break 'scan;
                                }
                            }
                        }
                    }
                }
                debug_assert!(found);
                if !found {
                    return false;
                }
                let bt_top = self.pair_top(stack_depth, bt_i, bt_j);
                let bt_bot = self.pair_bot(stack_depth, bt_i, bt_j);
                debug_assert!(bt_bot > bt_top);
                let icur = self.qlen - bt_i - 1;
                let bt_ham = ham + self.qual_at(icur) as u32;
                debug_assert!(bt_ham <= self.qual_thresh);

                // Consuming a backtrack inside a k-revisitable zone makes
                // that zone (k-1)-revisitable from here on.
                let mut bt_unrev = unrev;
                let mut bt_one_rev = one_rev;
                let mut bt_two_rev = two_rev;
                if bt_i < one_rev {
                    debug_assert!(bt_i >= unrev);
                    bt_unrev = one_rev;
                    bt_one_rev = two_rev;
                } else if bt_i < two_rev {
                    if !self.half_and_half {
                        bt_one_rev = two_rev;
                    } else {
                        // Keep any further backtracks out of the 3' half.
                        bt_two_rev = one_rev;
                    }
                }

                self.mms[stack_depth] = icur as u32;
                self.chars[bt_i] = b"acgt"[bt_j];
                log::trace!(
                    "    backtrack target d={} -> {} (ham {} -> {})",
                    bt_i,
                    b"acgt"[bt_j] as char,
                    ham,
                    bt_ham
                );
                let ret = if bt_i + 1 == self.qlen {
                    self.report(stack_depth + 1, bt_top, bt_bot)
                } else {
                    self.bt(
                        stack_depth + 1,
                        bt_i + 1,
                        bt_unrev,
                        bt_one_rev,
                        bt_two_rev,
                        bt_top,
                        bt_bot,
                        bt_ham,
                        iham,
                    )
                };
                if ret {
                    return true;
                }

                // Failed branch: restore the character, eliminate the
                // target, shrink the eligible set.
                self.chars[bt_i] = b"ACGT"[self.qbase(icur) as usize];
                let ei2 = self.elim_idx(stack_depth, bt_i);
                debug_assert_ne!(15, self.elims[ei2]);
                self.elims[ei2] |= 1 << bt_j;
                eligible_sz -= bt_bot - bt_top;
                eligible_num -= 1;
                alt_num -= 1;
                if alt_num == 0 {
                    return false;
                }
                if eligible_num == 0 {
                    // Drained the lowest quality tier; rescan the frame for
                    // the next one.
                    low_alt_qual = 0xff;
                    for k in depth..=d {
                        let kcur = self.qlen - k - 1;
                        let kq = self.qual_at(kcur);
                        if k < unrev || ham + kq as u32 > self.qual_thresh {
                            continue;
                        }
                        let mut k_overrides = kq < low_alt_qual;
                        if kq <= low_alt_qual {
                            let ei3 = self.elim_idx(stack_depth, k);
                            for l in 0..4usize {
                                if (self.elims[ei3] & (1 << l)) == 0 {
                                    if k_overrides {
                                        low_alt_qual = kq;
                                        k_overrides = false;
                                        eligible_num = 0;
                                        eligible_sz = 0;
                                    }
                                    eligible_num += 1;
                                    let sp = self.pair_spread(stack_depth, k, l);
                                    debug_assert!(sp > 0);
                                    eligible_sz += sp;
                                }
                            }
                        }
                    }
                }
                debug_assert!(eligible_num > 0 && eligible_num <= alt_num);
                debug_assert!(eligible_sz >= eligible_num);
                debug_assert!(self.eligibility_consistent(
                    stack_depth,
                    depth,
                    d,
                    unrev,
                    low_alt_qual,
                    eligible_sz,
                    eligible_num
                ));
                // A forced-mismatch boundary stays in force until the
                // alternatives drain; the walk has not advanced.
                if self.half_and_half
                    && top < bot
                    && ((d + 1 == self.five_depth && stack_depth == 0)
                        || (d + 1 == self.three_depth && stack_depth < 2))
                {
                    keep_going_despite_match = true;
                }
            }

            if top == bot && alt_num == 0 {
                // Mismatched with no backtracking opportunities left.
                return false;
            }
            debug_assert!(top < bot);
            self.chars[d] = b"ACGT"[c as usize];
            d += 1;
        }

        // Consumed the whole pattern with open arrows.
        debug_assert!(bot > top);
        if self.report_seedlings > 0 {
            debug_assert!(stack_depth <= self.report_seedlings as usize);
        }
        if stack_depth >= self.report_seedlings as usize {
            self.report(stack_depth, top, bot)
        } else {
            false
        }
    }

    /// Report a search outcome at `stack_depth` mismatches. In seedling
    /// mode the partial alignment is appended to the output stream and the
    /// search keeps going; otherwise mutations are undone, their positions
    /// spliced into the mismatch list, and a hit chased out of the
    /// interval.
    fn report(&mut self, stack_depth: usize, top: u32, bot: u32) -> bool {
        if self.report_seedlings > 0 {
            debug_assert!(stack_depth <= self.report_seedlings as usize);
            self.report_seedling(stack_depth);
            return false;
        }
        self.undo_mutations();
        let hit = match self.muts {
            Some(muts) => {
                debug_assert!(stack_depth + muts.len() <= MAX_QUERY_LEN);
                for (i, m) in muts.iter().enumerate() {
                    self.mms[stack_depth + i] = m.pos as u32;
                }
                self.report_hit(stack_depth + muts.len(), top, bot)
            }
            None => self.report_hit(stack_depth, top, bot),
        };
        self.apply_mutations();
        hit
    }

    /// Rotate through the rows of the interval from a random start until
    /// the index accepts one.
    fn report_hit(&mut self, stack_depth: usize, top: u32, bot: u32) -> bool {
        debug_assert!(self.one_hit);
        let spread = bot - top;
        let r = top + self.rng.next_u32() % spread;
        let index = self.index;
        let name = self.name.unwrap_or("default");
        for i in 0..spread {
            let mut ri = r + i;
            if ri >= bot {
                ri -= spread;
            }
            if index.report_chase_one(
                &*self.qry,
                self.qual,
                name,
                &self.mms[..stack_depth],
                stack_depth as u32,
                ri,
                top,
                bot,
                self.qlen,
                &self.params,
                self.sink,
            ) {
                return true;
            }
        }
        false
    }

    /// Append the current partial alignment to the seedling stream as
    /// (pos, chr) byte pairs.
    fn report_seedling(&mut self, stack_depth: usize) {
        debug_assert!(self.report_seedlings > 0);
        debug_assert!(self.seedlings.is_some());
        for i in 0..stack_depth {
            let pos = self.mms[i] as usize;
            debug_assert!(pos < self.qlen);
            let ci = self.qlen - pos - 1;
            let c = base_to_code(self.chars[ci]);
            debug_assert!(c < 4);
            debug_assert_ne!(c, self.qbase(pos));
            if let Some(out) = self.seedlings.as_deref_mut() {
                out.push(pos as u8);
                out.push(c);
                if i < stack_depth - 1 {
                    out.push(SEEDLING_SEP);
                }
            }
        }
        if let Some(out) = self.seedlings.as_deref_mut() {
            out.push(SEEDLING_END);
        }
    }

    fn apply_mutations(&mut self) {
        let muts = match self.muts {
            Some(m) => m,
            None => return,
        };
        for m in muts {
            debug_assert!((m.pos as usize) < self.qlen);
            debug_assert_eq!(self.qry[m.pos as usize], m.old_base);
            self.qry[m.pos as usize] = m.new_base;
        }
    }

    fn undo_mutations(&mut self) {
        let muts = match self.muts {
            Some(m) => m,
            None => return,
        };
        for m in muts {
            debug_assert_eq!(self.qry[m.pos as usize], m.new_base);
            self.qry[m.pos as usize] = m.old_base;
        }
    }

    /// Recompute the eligibility summary from scratch and compare.
    fn eligibility_consistent(
        &self,
        frame: usize,
        depth: usize,
        d: usize,
        unrev: usize,
        low_alt_qual: u8,
        eligible_sz: u32,
        eligible_num: u32,
    ) -> bool {
        let mut cum_sz = 0u32;
        let mut visited = 0u32;
        for i in depth.max(unrev)..=d {
            let icur = self.qlen - i - 1;
            let qi = self.qual_at(icur);
            let e = self.elims[self.elim_idx(frame, i)];
            debug_assert!(e > 0 && e < 16);
            if qi == low_alt_qual && e != 15 {
                for j in 0..4usize {
                    if (e & (1 << j)) == 0 {
                        cum_sz += self.pair_spread(frame, i, j);
                        visited += 1;
                    }
                }
            }
        }
        cum_sz == eligible_sz && visited == eligible_num
    }

    fn oracle_enabled(&self) -> bool {
        self.report_seedlings == 0 && self.os.is_some_and(|os| !os.is_empty())
    }

    /// Exhaustively enumerate every alignment the current constraints
    /// admit, scanning each reference at each offset right to left. This is
    /// the authoritative definition of a valid hit, used to cross-check the
    /// backtracker whenever reference texts are supplied.
    fn oracle_hits(&self, iham: u32) -> Vec<Hit> {
        let os = match self.os {
            Some(os) => os,
            None => return Vec::new(),
        };
        let ebwt_fw = self.index.is_fw();
        let fw = self.params.fw;
        let five_prime_on_left = ebwt_fw == fw;
        let plen = self.qlen;
        let unrev = self.unrev_off as usize;
        let one_rev = self.one_rev_off as usize;
        let two_rev = self.two_rev_off as usize;
        let mut hits = Vec::new();
        for (tidx, text) in os.iter().enumerate() {
            let olen = text.len();
            if olen < plen {
                continue;
            }
            for j in 0..=olen - plen {
                let mut rev1 = 0u32;
                let mut rev2 = 0u32;
                let mut ham = iham;
                let mut diffs: BTreeSet<u32> = BTreeSet::new();
                let mut ok = if ebwt_fw {
                    (j + plen - 1) as isize
                } else {
                    (olen - (j + plen - 1) - 1) as isize
                };
                let ok_inc: isize = if ebwt_fw { -1 } else { 1 };
                let mut success = true;
                for k in (0..plen).rev() {
                    let kr = plen - 1 - k;
                    if self.qry[k] != text[ok as usize] {
                        ham += self.qual_at(k) as u32;
                        if ham > self.qual_thresh {
                            success = false;
                            break;
                        }
                        if kr < unrev {
                            success = false;
                            break;
                        } else if kr < one_rev {
                            rev1 += 1;
                            if rev1 > 1 && !self.half_and_half {
                                success = false;
                                break;
                            }
                        } else if kr < two_rev {
                            rev2 += 1;
                            if rev2 > 2 && !self.half_and_half {
                                success = false;
                                break;
                            }
                        }
                        // Backtracks spend revisits: a second one anywhere
                        // in the revisitable zones exhausts them both.
                        if !self.half_and_half && rev1 + rev2 > 2 {
                            success = false;
                            break;
                        }
                        if self.half_and_half && (rev1 > 1 || rev2 > 1) {
                            success = false;
                            break;
                        }
                        diffs.insert(if five_prime_on_left {
                            k as u32
                        } else {
                            (plen - k - 1) as u32
                        });
                    }
                    ok += ok_inc;
                }
                if self.half_and_half && success && (rev1 != 1 || rev2 != 1) {
                    success = false;
                }
                if success {
                    let off = if ebwt_fw { j } else { olen - j - plen };
                    if let Some(muts) = self.muts {
                        for m in muts {
                            diffs.insert(if five_prime_on_left {
                                m.pos as u32
                            } else {
                                (plen - m.pos as usize - 1) as u32
                            });
                        }
                    }
                    hits.push(Hit {
                        tidx: tidx as u32,
                        toff: off as u32,
                        read_id: self.params.read_id,
                        name: self.read_name().to_string(),
                        fw,
                        mms: diffs.into_iter().collect(),
                    });
                }
            }
        }
        hits
    }

    fn confirm_hit(&self, iham: u32) {
        let oracle = self.oracle_hits(iham);
        let rhit = match self.sink.retained().last() {
            Some(h) => h,
            None => panic!("search reported a hit but the sink retained none"),
        };
        let matched = oracle.iter().any(|h| {
            if h.tidx == rhit.tidx && h.toff == rhit.toff {
                assert_eq!(h.fw, rhit.fw);
                assert_eq!(
                    h.mms, rhit.mms,
                    "mismatch sets differ at ref {} off {}",
                    h.tidx, h.toff
                );
                true
            } else {
                false
            }
        });
        if !matched {
            log::error!(
                "hit at ref {} off {} not among the {} found by the exhaustive scan",
                rhit.tidx,
                rhit.toff,
                oracle.len()
            );
            self.dump_constraints();
            panic!("reported hit not confirmed by the exhaustive reference scan");
        }
    }

    fn confirm_no_hit(&self, iham: u32) {
        let oracle = self.oracle_hits(iham);
        if !oracle.is_empty() {
            let h = &oracle[0];
            log::error!(
                "exhaustive scan found {} hits but the search reported none; first at ref {} off {} mms {:?}",
                oracle.len(),
                h.tidx,
                h.toff,
                h.mms
            );
            self.dump_constraints();
            panic!("exhaustive reference scan found hits but the search reported none");
        }
    }

    fn dump_constraints(&self) {
        let pat: String = self.qry.iter().map(|&c| code_to_base(c) as char).collect();
        let quals: String = (0..self.qlen)
            .map(|k| (self.qual_at(k) + QUAL_MIN) as char)
            .collect();
        let map: String = (0..self.qlen)
            .rev()
            .map(|i| {
                if i < self.unrev_off as usize {
                    '0'
                } else if i < self.one_rev_off as usize {
                    '1'
                } else if i < self.two_rev_off as usize {
                    '2'
                } else {
                    'X'
                }
            })
            .collect();
        log::error!("  pat:     {}", pat);
        log::error!("  quals:   {}", quals);
        log::error!("  regions: {}", map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fm_index::FmIndex;
    use crate::sink::HitSink;
    use crate::utils::base_to_code;

    fn codes(s: &str) -> Vec<u8> {
        s.bytes().map(base_to_code).collect()
    }

    fn exact_config(qlen: u32) -> SearchConfig {
        SearchConfig {
            unrev_off: qlen,
            one_rev_off: qlen,
            two_rev_off: qlen,
            qual_thresh: 0,
            ..SearchConfig::default()
        }
    }

    #[test]
    fn test_exact_match_reports() {
        let text = codes("ACGTACGTACGTACGT");
        let idx = FmIndex::build(&[text.clone()], vec!["t".into()], 4, true);
        let os = vec![text];
        let mut sink = HitSink::new();
        let mut read = codes("ACGTACGT");
        let cfg = exact_config(8);
        let mut bt = Backtracker::new(
            &idx,
            &mut sink,
            ReadParams { read_id: 0, fw: true },
            &cfg,
            &mut read,
            None,
            Some("r0"),
            None,
            None,
            Some(&os),
        );
        assert!(bt.backtrack(0));
        let hit = sink.last_hit().unwrap();
        assert!(hit.mms.is_empty());
        assert_eq!(hit.toff % 4, 0);
    }

    #[test]
    fn test_mutation_overlay_is_balanced() {
        let text = codes("ACTTACGT");
        let idx = FmIndex::build(&[text.clone()], vec!["t".into()], 4, true);
        let os = vec![text];
        let mut sink = HitSink::new();
        let mut read = codes("ACATACGT");
        let before = read.clone();
        let muts = [QueryMutation::new(2, 0, 3)];
        let cfg = SearchConfig {
            unrev_off: 8,
            one_rev_off: 8,
            two_rev_off: 8,
            qual_thresh: 40,
            ..SearchConfig::default()
        };
        {
            let mut bt = Backtracker::new(
                &idx,
                &mut sink,
                ReadParams { read_id: 0, fw: true },
                &cfg,
                &mut read,
                None,
                Some("r0"),
                Some(&muts),
                None,
                Some(&os),
            );
            // The mutated read matches the text exactly with iham covering
            // the mutation's quality.
            assert!(bt.backtrack(40));
            bt.set_muts(None);
        }
        assert_eq!(read, before);
        let hit = sink.last_hit().unwrap();
        assert_eq!(hit.toff, 0);
        assert_eq!(hit.mms, vec![2]);
    }

    #[test]
    fn test_set_query_reuses_backtracker() {
        let text = codes("GATTACAGATTACA");
        let idx = FmIndex::build(&[text.clone()], vec!["t".into()], 4, true);
        let os = vec![text];
        let mut sink = HitSink::new();
        let mut read1 = codes("GATTACA");
        let mut read2 = codes("TTACAGA");
        let cfg = exact_config(7);
        let mut bt = Backtracker::new(
            &idx,
            &mut sink,
            ReadParams { read_id: 0, fw: true },
            &cfg,
            &mut read1,
            None,
            Some("r1"),
            None,
            None,
            Some(&os),
        );
        assert!(bt.backtrack(0));
        bt.set_query(&mut read2, None, Some("r2"), None);
        assert!(bt.backtrack(0));
        assert_eq!(sink.num_hits(), 2);
        assert_eq!(sink.last_hit().unwrap().toff, 2);
    }

    #[test]
    fn test_default_config_is_one_hit() {
        let cfg = SearchConfig::default();
        assert!(cfg.one_hit);
        assert_eq!(cfg.report_seedlings, 0);
        assert!(!cfg.half_and_half);
    }
}
