//! `oligoalign`: seed generation, k-mer permutation matching, match
//! distribution and binning, template building, and pipelined concurrency
//! for aligning short reads against a pre-indexed reference genome.

#[macro_use]
extern crate log;

pub mod binning;
pub mod cigar;
pub mod cluster;
pub mod config;
pub mod contig_loader;
pub mod distribution;
pub mod error;
pub mod matchfinder;
pub mod oligo;
pub mod pipeline;
pub mod record;
pub mod refindex;
pub mod seed;
pub mod selector;
pub mod sort;
pub mod stats;
pub mod template;
pub mod tlen;
pub mod util;

pub use error::{OligoError, OligoResult};
