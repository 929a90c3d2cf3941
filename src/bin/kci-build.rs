use anyhow::Context;
use byteorder::{LittleEndian as LE, WriteBytesExt};
use clap::Parser;
use kmer_code_index::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Build a first-code index from FASTA (or one sequence per line).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Input FASTA or plain sequence file
    #[arg(short, long)]
    input: PathBuf,

    /// K-mer length (<= 32)
    #[arg(short = 'k', long)]
    k: usize,

    /// Worker threads
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Memory limit in MB (enables spilling and part fitting)
    #[arg(long)]
    memory_mb: Option<usize>,

    /// Counter width: 32|64
    #[arg(long, default_value = "32")]
    counter_width: String,

    /// Binary-search cache depth
    #[arg(long, default_value_t = 10)]
    bscache_depth: u32,

    /// Always spill the leftborder table
    #[arg(long, default_value_t = false)]
    spill: bool,

    /// Place all suffixes into their buckets after building
    #[arg(long, default_value_t = false)]
    insert: bool,

    /// Write the bucket-sorted positions (u64 LE) here; implies --insert
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_counter_width(s: &str) -> CounterWidth {
    match s {
        "64" | "u64" => CounterWidth::U64,
        _ => CounterWidth::U32,
    }
}

/// Records of a FASTA file; without any header line every line is a sequence.
fn read_sequences(path: &Path) -> anyhow::Result<Vec<Vec<u8>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut seqs: Vec<Vec<u8>> = Vec::new();
    let mut fasta = false;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim_end();
        if let Some(_header) = line.strip_prefix('>') {
            fasta = true;
            seqs.push(Vec::new());
        } else if line.is_empty() {
            continue;
        } else if fasta {
            if let Some(last) = seqs.last_mut() {
                last.extend_from_slice(line.as_bytes());
            }
        } else {
            seqs.push(line.as_bytes().to_vec());
        }
    }
    Ok(seqs)
}

fn write_positions<W: Write>(w: &mut W, positions: &[u64]) -> std::io::Result<()> {
    for &p in positions {
        w.write_u64::<LE>(p)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    anyhow::ensure!(args.k > 0 && args.k <= 32, "k must be 1..=32");

    let seqs = read_sequences(&args.input)?;
    let source = SequenceCollection::from_sequences(args.k, &seqs);

    let mut cfg = IndexConfig::default()
        .counter_width(parse_counter_width(&args.counter_width))
        .threads(args.threads)
        .bscache_depth(args.bscache_depth)
        .force_spill(args.spill);
    if let Some(mb) = args.memory_mb {
        cfg = cfg.memory_limit(mb << 20);
    }

    let mut idx = build_code_index(&source, cfg)?;
    eprintln!(
        "Built index: k={}, sequences={}, first codes={}, different={}, hits={}, suffixes={}, max bucket={}, spilled={}",
        args.k,
        source.num_sequences(),
        idx.num_first_codes(),
        idx.differentcodes(),
        idx.first_code_hits(),
        idx.total_suffixes(),
        idx.max_bucket_size(),
        idx.spill_path().is_some()
    );

    if args.insert || args.output.is_some() {
        let mut out = match &args.output {
            Some(path) => Some(BufWriter::new(
                File::create(path).with_context(|| format!("creating {}", path.display()))?,
            )),
            None => None,
        };
        let mut inserted = 0u64;
        let parts = idx.insert_suffixes(&source, |slots, positions| {
            inserted += positions.len() as u64;
            log::debug!("part {slots:?} done");
            if let Some(w) = out.as_mut() {
                write_positions(w, positions)?;
            }
            Ok(())
        })?;
        if let Some(mut w) = out {
            w.flush()?;
        }
        eprintln!("Inserted {inserted} suffixes in {} parts", parts.len());
    }

    Ok(())
}
