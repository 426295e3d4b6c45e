// Hit collection for the backtracking search.
//
// One search invocation reports at most one hit. The sink counts hits,
// keeps the most recent one for the caller, and can optionally retain every
// reported hit so that an exhaustive cross-check can compare against them.

/// A reported alignment of a read against one reference sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    /// Index of the reference sequence hit.
    pub tidx: u32,
    /// Offset of the leftmost aligned position within that reference.
    pub toff: u32,
    pub read_id: u32,
    pub name: String,
    /// Whether the read aligned in its given orientation.
    pub fw: bool,
    /// Mismatched read positions, 5'-relative, sorted and deduplicated.
    pub mms: Vec<u32>,
}

/// Per-read search context supplied by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ReadParams {
    pub read_id: u32,
    /// Orientation of the read being searched.
    pub fw: bool,
}

#[derive(Debug, Default)]
pub struct HitSink {
    num_hits: u64,
    retain: bool,
    retained: Vec<Hit>,
    last: Option<Hit>,
}

impl HitSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a hit. Returns true when the hit was consumed; the search
    /// stops chasing further rows of the interval once a hit is accepted.
    pub fn report(&mut self, hit: Hit) -> bool {
        log::trace!(
            "hit: read {} ({}) at ref {} off {} fw={} mms={:?}",
            hit.read_id,
            hit.name,
            hit.tidx,
            hit.toff,
            hit.fw,
            hit.mms
        );
        self.num_hits += 1;
        if self.retain {
            self.retained.push(hit.clone());
        }
        self.last = Some(hit);
        true
    }

    pub fn num_hits(&self) -> u64 {
        self.num_hits
    }

    /// Toggle retention; returns the previous setting.
    pub fn set_retain(&mut self, retain: bool) -> bool {
        std::mem::replace(&mut self.retain, retain)
    }

    pub fn retained(&self) -> &[Hit] {
        &self.retained
    }

    pub fn last_hit(&self) -> Option<&Hit> {
        self.last.as_ref()
    }

    pub fn clear_last(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(toff: u32) -> Hit {
        Hit {
            tidx: 0,
            toff,
            read_id: 7,
            name: "r".to_string(),
            fw: true,
            mms: vec![],
        }
    }

    #[test]
    fn test_retention_toggle() {
        let mut sink = HitSink::new();
        assert!(sink.report(hit(1)));
        assert_eq!(sink.num_hits(), 1);
        assert!(sink.retained().is_empty());

        let old = sink.set_retain(true);
        assert!(!old);
        sink.report(hit(2));
        sink.set_retain(old);
        sink.report(hit(3));
        assert_eq!(sink.num_hits(), 3);
        assert_eq!(sink.retained().len(), 1);
        assert_eq!(sink.retained()[0].toff, 2);
        assert_eq!(sink.last_hit().unwrap().toff, 3);
    }
}
