// Randomized round-trip tests for the bit-pair reference store: whatever
// goes in as code sequences must come back out of base()/stretch(), both
// from the in-memory build and after a dump/load cycle.

use basalt::refseq::BitPairRef;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::PathBuf;

fn random_seq(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len)
        .map(|_| {
            if rng.gen_bool(0.2) {
                4 // ambiguous
            } else {
                rng.gen_range(0..4u8)
            }
        })
        .collect()
}

#[test]
fn prop_store_roundtrip_random() {
    let dir = PathBuf::from("test_refseq_prop");
    if dir.exists() {
        fs::remove_dir_all(&dir).unwrap();
    }
    fs::create_dir(&dir).unwrap();

    let mut rng = StdRng::seed_from_u64(0xc0de);
    for iter in 0..40 {
        let nrefs = rng.gen_range(1..=4);
        let seqs: Vec<Vec<u8>> = (0..nrefs)
            .map(|_| {
                let len = rng.gen_range(0..=100);
                random_seq(&mut rng, len)
            })
            .collect();
        let store = BitPairRef::from_seqs(&seqs);
        assert_eq!(store.num_refs() as usize, seqs.len());

        // base() agrees with the input, position by position.
        for (i, s) in seqs.iter().enumerate() {
            assert_eq!(store.approx_len(i as u32) as usize, s.len(), "iter {}", iter);
            for (j, &c) in s.iter().enumerate() {
                assert_eq!(store.base(i as u32, j as u32), c, "iter {} ref {} pos {}", iter, i, j);
            }
            assert_eq!(store.base(i as u32, s.len() as u32), 4);
        }

        // stretch() equals the concatenation of base() at random windows.
        for (i, s) in seqs.iter().enumerate() {
            if s.is_empty() {
                continue;
            }
            for _ in 0..8 {
                let toff = rng.gen_range(0..s.len());
                let n = rng.gen_range(1..=s.len() - toff + 3);
                let mut got = vec![0u8; n];
                store.stretch(&mut got, i as u32, toff as u32);
                for (k, &g) in got.iter().enumerate() {
                    assert_eq!(g, store.base(i as u32, (toff + k) as u32));
                }
            }
        }

        // Survives a trip through the on-disk format.
        let prefix = dir.join(format!("r{}", iter));
        store.dump(&prefix).unwrap();
        let loaded = BitPairRef::load(&prefix).unwrap();
        assert_eq!(loaded.num_refs(), store.num_refs());
        for (i, s) in seqs.iter().enumerate() {
            let mut got = vec![0u8; s.len()];
            loaded.stretch(&mut got, i as u32, 0);
            assert_eq!(&got, s, "iter {} ref {}", iter, i);
        }
    }

    fs::remove_dir_all(&dir).unwrap();
}
