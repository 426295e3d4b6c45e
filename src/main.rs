use clap::Parser;
use std::io;
use std::path::PathBuf;

use basalt::backtrack::{Backtracker, SearchConfig};
use basalt::defaults::{MAX_QUERY_LEN, QUAL_MAX, QUAL_MIN};
use basalt::fm_index::FmIndex;
use basalt::refseq::BitPairRef;
use basalt::sink::{HitSink, ReadParams};
use basalt::utils::{base_to_code, reverse_complement_in_place, xopen};
use bio::io::{fasta, fastq};

#[derive(Parser)]
#[command(name = "basalt")]
#[command(about = "Quality-aware backtracking short-read aligner", long_about = None)]
#[command(version)]
struct Cli {
    /// Reference FASTA file (plain or gzipped)
    #[arg(value_name = "REF.FA")]
    reference: PathBuf,

    /// Reads to align, FASTQ (plain or gzipped); "-" for stdin
    #[arg(value_name = "READS.FQ")]
    reads: PathBuf,

    /// Maximum summed quality of mismatched positions
    #[arg(short = 'e', long, value_name = "INT", default_value = "70")]
    qual_thresh: u32,

    /// Depth below which no mismatch is permitted
    #[arg(long, value_name = "INT", default_value = "0")]
    unrev: u32,

    /// Depth below which at most one mismatch is permitted
    #[arg(long, value_name = "INT", default_value = "0")]
    one_rev: u32,

    /// Depth below which at most two mismatches are permitted
    #[arg(long, value_name = "INT", default_value = "0")]
    two_rev: u32,

    /// Require exactly one mismatch in each half of the seed
    #[arg(long)]
    half_and_half: bool,

    /// Width of the prefix-lookup table, in bases
    #[arg(long, value_name = "INT", default_value = "5")]
    ftab_chars: u32,

    /// Seed for the pseudo-random source
    #[arg(long, value_name = "INT", default_value = "0")]
    seed: u64,

    /// Write the packed reference to PREFIX.3/PREFIX.4 and serve lookups
    /// from the reloaded copy
    #[arg(long, value_name = "PREFIX")]
    ref_cache: Option<PathBuf>,

    /// Cross-check every outcome against an exhaustive reference scan
    #[arg(long)]
    verify: bool,
}

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .init();
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn load_references(cli: &Cli) -> io::Result<(Vec<String>, Vec<Vec<u8>>)> {
    let reader = fasta::Reader::new(xopen(&cli.reference)?);
    let mut names = Vec::new();
    let mut seqs = Vec::new();
    for rec in reader.records() {
        let rec = rec.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        names.push(rec.id().to_string());
        seqs.push(rec.seq().iter().map(|&b| base_to_code(b)).collect::<Vec<u8>>());
    }
    if seqs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no sequences in {}", cli.reference.display()),
        ));
    }

    // Optionally round-trip the references through the packed store, so the
    // searched text is exactly what the store serves back.
    if let Some(prefix) = &cli.ref_cache {
        let store = BitPairRef::from_seqs(&seqs);
        store.dump(prefix)?;
        let store = BitPairRef::load(prefix)?;
        seqs = (0..store.num_refs())
            .map(|t| {
                let mut v = vec![0u8; store.approx_len(t) as usize];
                store.stretch(&mut v, t, 0);
                v
            })
            .collect();
        log::info!("packed reference cached at {}.3/.4", prefix.display());
    }
    Ok((names, seqs))
}

fn quals_ok(qual: &[u8], qlen: usize) -> bool {
    qual.len() >= qlen && qual[..qlen].iter().all(|&q| (QUAL_MIN..=QUAL_MAX).contains(&q))
}

fn run(cli: &Cli) -> io::Result<()> {
    if cli.unrev > cli.one_rev || cli.one_rev > cli.two_rev {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "region offsets must satisfy --unrev <= --one-rev <= --two-rev",
        ));
    }
    if cli.half_and_half && !(cli.one_rev > 0 && cli.two_rev > cli.one_rev) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "--half-and-half needs 0 < --one-rev < --two-rev",
        ));
    }
    let (names, refs) = load_references(cli)?;
    let index = FmIndex::build(&refs, names, cli.ftab_chars, true);
    let os = if cli.verify { Some(refs) } else { None };

    let cfg = SearchConfig {
        unrev_off: cli.unrev,
        one_rev_off: cli.one_rev,
        two_rev_off: cli.two_rev,
        qual_thresh: cli.qual_thresh,
        half_and_half: cli.half_and_half,
        seed: cli.seed,
        ..SearchConfig::default()
    };

    let reader = fastq::Reader::new(xopen(&cli.reads)?);
    let mut sink = HitSink::new();
    let mut total = 0u64;
    let mut aligned = 0u64;
    for (read_id, rec) in reader.records().enumerate() {
        let rec = rec.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        total += 1;
        let mut seq: Vec<u8> = rec.seq().iter().map(|&b| base_to_code(b)).collect();
        if seq.is_empty() || seq.len() > MAX_QUERY_LEN {
            log::warn!("skipping {}: length {} out of range", rec.id(), seq.len());
            continue;
        }
        if seq.iter().any(|&c| c > 3) {
            log::warn!("skipping {}: ambiguous base in read", rec.id());
            continue;
        }
        let qlen = seq.len();
        let qual = quals_ok(rec.qual(), qlen).then(|| rec.qual());
        if qual.is_none() && !rec.qual().is_empty() {
            log::warn!("{}: qualities out of range, using the default", rec.id());
        }

        sink.clear_last();
        let params = ReadParams {
            read_id: read_id as u32,
            fw: true,
        };
        let mut found = {
            let mut bt = Backtracker::new(
                &index,
                &mut sink,
                params,
                &cfg,
                &mut seq,
                qual,
                Some(rec.id()),
                None,
                None,
                os.as_deref(),
            );
            bt.backtrack(0)
        };
        if !found {
            // Try the other strand; qualities reverse along with the read.
            reverse_complement_in_place(&mut seq);
            let rev_qual: Option<Vec<u8>> =
                qual.map(|q| q[..qlen].iter().rev().cloned().collect());
            let params = ReadParams {
                read_id: read_id as u32,
                fw: false,
            };
            found = {
                let mut bt = Backtracker::new(
                    &index,
                    &mut sink,
                    params,
                    &cfg,
                    &mut seq,
                    rev_qual.as_deref(),
                    Some(rec.id()),
                    None,
                    None,
                    os.as_deref(),
                );
                bt.backtrack(0)
            };
        }
        if found {
            aligned += 1;
            if let Some(hit) = sink.last_hit() {
                let mms = hit
                    .mms
                    .iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    hit.name,
                    if hit.fw { '+' } else { '-' },
                    index.ref_name(hit.tidx),
                    hit.toff,
                    mms
                );
            }
        }
    }
    log::info!("{} of {} reads aligned", aligned, total);
    Ok(())
}
