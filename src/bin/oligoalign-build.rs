#[macro_use]
extern crate log;

extern crate clap;
extern crate oligoalign;

use std::path::{Path, PathBuf};

use clap::{App, Arg};

use oligoalign::config::SeedLength;
use oligoalign::contig_loader;
use oligoalign::oligo::{encode_kmer, KmerWidth};
use oligoalign::refindex::{
    write_mask_file, ContigSummary, MaskFileEntry, MaskRecord, ReferenceMetadata, ReferencePosition,
};
use oligoalign::util;

/// A k-mer with more than `repeat_threshold` genomic occurrences is replaced
/// by one sentinel record carrying a `TooManyMatch` position (spec §4.2).
/// Grouping is by exact k-mer value within the mask bucket the caller has
/// already partitioned records into.
fn collapse_repeats(records: Vec<MaskRecord>, repeat_threshold: usize) -> Vec<MaskRecord> {
    let mut by_kmer: std::collections::BTreeMap<_, Vec<MaskRecord>> = std::collections::BTreeMap::new();
    for record in records {
        by_kmer.entry(record.kmer).or_default().push(record);
    }
    let mut collapsed = Vec::new();
    for (kmer, occurrences) in by_kmer {
        if occurrences.len() > repeat_threshold {
            collapsed.push(MaskRecord { kmer, position: ReferencePosition::too_many_match() });
        } else {
            collapsed.extend(occurrences);
        }
    }
    collapsed
}

fn seed_length_from_str(s: &str) -> SeedLength {
    match s {
        "16" => SeedLength::K16,
        "32" => SeedLength::K32,
        "64" => SeedLength::K64,
        other => {
            error!("unsupported seed length '{}': must be 16, 32, or 64", other);
            std::process::exit(1);
        }
    }
}

fn main() {
    let args = App::new("oligoalign-build")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Builds a reference index (mask files + metadata) from a FASTA genome.")
        .arg(Arg::with_name("FASTA")
            .short("f")
            .long("fasta")
            .help("Path to the reference FASTA file (may be gzip-compressed).")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("OUTPUT_DIR")
            .short("o")
            .long("output-dir")
            .help("Directory to write mask files and reference-metadata.json into.")
            .takes_value(true)
            .required(true))
        .arg(Arg::with_name("SEED_LENGTH")
            .long("seed-length")
            .help("Seed length in bases: 16, 32, or 64.")
            .takes_value(true)
            .default_value("32"))
        .arg(Arg::with_name("MASK_WIDTH")
            .long("mask-width")
            .help("Number of high bits of each k-mer used to select which mask file it belongs to.")
            .takes_value(true)
            .default_value("4"))
        .arg(Arg::with_name("REPEAT_THRESHOLD")
            .long("repeat-threshold")
            .help("A k-mer occurring more than this many times genome-wide collapses to one TooManyMatch record.")
            .takes_value(true)
            .default_value("100"))
        .arg(Arg::with_name("VERBOSE")
            .short("v")
            .help("Include this flag to trigger debug-level logging."))
        .get_matches();

    util::init_logging(if args.is_present("VERBOSE") {
        log::LogLevelFilter::Debug
    } else {
        log::LogLevelFilter::Info
    });

    let fasta_path = PathBuf::from(args.value_of("FASTA").unwrap());
    let output_dir = PathBuf::from(args.value_of("OUTPUT_DIR").unwrap());
    let seed_length = seed_length_from_str(args.value_of("SEED_LENGTH").unwrap());
    let mask_width: u32 = args
        .value_of("MASK_WIDTH")
        .unwrap()
        .parse()
        .expect("--mask-width must be an integer");
    let repeat_threshold: usize = args
        .value_of("REPEAT_THRESHOLD")
        .unwrap()
        .parse()
        .expect("--repeat-threshold must be an integer");

    let width = match seed_length {
        SeedLength::K16 => KmerWidth::K16,
        SeedLength::K32 => KmerWidth::K32,
        SeedLength::K64 => KmerWidth::K64,
    };

    debug!("Loading contigs from {}...", fasta_path.display());
    let contigs = match contig_loader::load_contigs(&fasta_path, |idx, _name| idx as u32) {
        Ok(c) => c,
        Err(why) => {
            error!("Error loading reference FASTA: {}", why);
            std::process::exit(1);
        }
    };
    info!("Loaded {} contigs.", contigs.len());

    std::fs::create_dir_all(&output_dir).expect("Unable to create output directory.");

    let k = width.bases() as usize;
    let mut records_by_mask: std::collections::BTreeMap<u32, Vec<MaskRecord>> = std::collections::BTreeMap::new();

    for contig in &contigs {
        if contig.sequence.len() < k {
            continue;
        }
        let decoded: Vec<u8> = contig.sequence.iter().map(|b| b.decode()).collect();
        for start in 0..=(decoded.len() - k) {
            let window = &decoded[start..start + k];
            let kmer = match encode_kmer(window, width) {
                Some(v) => v,
                None => continue, // window spans an N
            };
            let mask_value = (kmer >> (width.bits() - mask_width)) as u32;
            let position = ReferencePosition::new(contig.index, start as u64, false);
            records_by_mask.entry(mask_value).or_default().push(MaskRecord { kmer, position });
        }
    }

    let mut mask_files = Vec::new();
    for (mask_value, records) in records_by_mask {
        let mut records = collapse_repeats(records, repeat_threshold);
        records.sort_by_key(|r| r.kmer);
        let path: PathBuf = output_dir.join(format!("mask-{}-{}.dat", k, mask_value));
        write_mask_file(&path, &records).expect("Unable to write mask file.");
        mask_files.push(MaskFileEntry {
            path: path.clone(),
            seed_length: k as u32,
            mask_width,
            mask_value,
            total_kmers: records.len() as u64,
        });
        debug!("Wrote {} records to {}", records.len(), path.display());
    }

    let metadata = ReferenceMetadata {
        format_version: oligoalign::refindex::CURRENT_REFERENCE_FORMAT_VERSION,
        contigs: contigs
            .iter()
            .map(|c| ContigSummary {
                index: c.index,
                karyotype_index: c.karyotype_index,
                name: c.name.clone(),
                metadata: c.metadata.clone(),
            })
            .collect(),
        mask_files,
    };

    let metadata_path: &Path = &output_dir.join("reference-metadata.json");
    match metadata.save(metadata_path) {
        Ok(()) => info!("Done building reference index at {}.", output_dir.display()),
        Err(why) => {
            error!("Error writing reference metadata: {}", why);
            std::process::exit(1);
        }
    }
}
