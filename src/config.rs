//! Pipeline configuration (spec §6 "Configuration (recognized options)").
//!
//! Collects every option that changes the core's behavior. CLI front-ends
//! build a `Config` from `clap` matches and call `validate()` once, before
//! any tile is processed, exactly as `mtsv-binner.rs` validates every
//! argument up front.

use crate::error::{OligoError, OligoResult};

/// Seed length in bases; selects k-mer width.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SeedLength {
    K16,
    K32,
    K64,
}

impl SeedLength {
    pub fn bases(self) -> usize {
        match self {
            SeedLength::K16 => 16,
            SeedLength::K32 => 32,
            SeedLength::K64 => 64,
        }
    }
}

/// `seedDescriptor`: which seeds participate in the first pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SeedDescriptor {
    Auto,
    All,
    Offsets(Vec<usize>),
}

/// `gapScoring`: `bwa` / `eland` / `m:mm:go:ge:me`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GapScoring {
    pub match_score: i32,
    pub mismatch_score: i32,
    pub gap_open: i32,
    pub gap_extend: i32,
    pub min_extend: i32,
}

impl GapScoring {
    pub fn bwa() -> Self {
        GapScoring { match_score: 1, mismatch_score: -4, gap_open: -6, gap_extend: -1, min_extend: -13 }
    }

    pub fn eland() -> Self {
        GapScoring { match_score: 2, mismatch_score: -1, gap_open: -3, gap_extend: -3, min_extend: -13 }
    }

    /// Parses `"m:mm:go:ge:me"`, or the named presets `bwa`/`eland`.
    pub fn parse(s: &str) -> OligoResult<Self> {
        match s {
            "bwa" => Ok(Self::bwa()),
            "eland" => Ok(Self::eland()),
            _ => {
                let parts: Vec<&str> = s.split(':').collect();
                if parts.len() != 5 {
                    return Err(OligoError::Option(format!(
                        "gapScoring must be 'bwa', 'eland', or 'm:mm:go:ge:me', got '{}'",
                        s
                    )));
                }
                let parse_i32 = |p: &str| {
                    p.parse::<i32>()
                        .map_err(|_| OligoError::Option(format!("invalid gapScoring field '{}'", p)))
                };
                Ok(GapScoring {
                    match_score: parse_i32(parts[0])?,
                    mismatch_score: parse_i32(parts[1])?,
                    gap_open: parse_i32(parts[2])?,
                    gap_extend: parse_i32(parts[3])?,
                    min_extend: parse_i32(parts[4])?,
                })
            }
        }
    }
}

/// `keepUnaligned`: `discard` / `front` / `back`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeepUnaligned {
    Discard,
    Front,
    Back,
}

/// `dodgyAlignmentScore`: `Unknown` / `Unaligned` / a fixed 0..254 value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DodgyAlignmentScore {
    Unknown,
    Unaligned,
    Fixed(u8),
}

pub const MAPQ_UNKNOWN: u8 = 255;

/// `memoryControl`: `off` / `warning` / `strict`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryControl {
    Off,
    Warning,
    Strict,
}

/// `realignGaps`: `no` / `sample` / `project` / `all`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RealignGaps {
    No,
    Sample,
    Project,
    All,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub seed_length: SeedLength,
    pub repeat_threshold: u32,
    pub seed_descriptor: SeedDescriptor,
    pub first_pass_seeds: usize,
    pub base_quality_cutoff: Option<u8>,
    pub gap_scoring: GapScoring,
    pub gapped_mismatches_max: u32,
    pub avoid_smith_waterman: bool,
    pub semialigned_gap_limit: u32,
    pub mapq_threshold: u8,
    pub clip_semialigned: bool,
    pub clip_overlapping: bool,
    pub keep_unaligned: KeepUnaligned,
    pub scatter_repeats: bool,
    pub dodgy_alignment_score: DodgyAlignmentScore,
    pub memory_control: MemoryControl,
    pub memory_limit_gb: Option<u32>,
    pub q_score_bin: bool,
    pub q_score_bin_values: Option<[u8; 256]>,
    pub realign_gaps: RealignGaps,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            seed_length: SeedLength::K32,
            repeat_threshold: 100,
            seed_descriptor: SeedDescriptor::Auto,
            first_pass_seeds: 2,
            base_quality_cutoff: None,
            gap_scoring: GapScoring::bwa(),
            gapped_mismatches_max: 2,
            avoid_smith_waterman: false,
            semialigned_gap_limit: 3,
            mapq_threshold: 0,
            clip_semialigned: true,
            clip_overlapping: true,
            keep_unaligned: KeepUnaligned::Back,
            scatter_repeats: false,
            dodgy_alignment_score: DodgyAlignmentScore::Unknown,
            memory_control: MemoryControl::Off,
            memory_limit_gb: None,
            q_score_bin: false,
            q_score_bin_values: None,
            realign_gaps: RealignGaps::Sample,
        }
    }
}

impl Config {
    /// Validates option combinations named in spec §7. Must be called
    /// before any tile is processed; all failures are fatal at start-up.
    pub fn validate(&self) -> OligoResult<()> {
        if self.q_score_bin_values.is_some() && !self.q_score_bin {
            return Err(OligoError::Option(
                "qScoreBinValues set but qScoreBin is false".to_string(),
            ));
        }
        if self.repeat_threshold == 0 {
            warn!("repeatThreshold = 0: no matches will ever be emitted");
        }
        if self.first_pass_seeds == 0 {
            return Err(OligoError::Option(
                "firstPassSeeds must be at least 1".to_string(),
            ));
        }
        if let SeedDescriptor::Offsets(ref offs) = self.seed_descriptor {
            if offs.is_empty() {
                return Err(OligoError::Option(
                    "seedDescriptor offsets list is empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn gap_scoring_presets() {
        assert_eq!(GapScoring::parse("bwa").unwrap(), GapScoring::bwa());
        assert_eq!(GapScoring::parse("eland").unwrap(), GapScoring::eland());
    }

    #[test]
    fn gap_scoring_explicit() {
        let gs = GapScoring::parse("1:-4:-6:-1:-13").unwrap();
        assert_eq!(gs, GapScoring::bwa());
    }

    #[test]
    fn gap_scoring_rejects_malformed() {
        assert!(GapScoring::parse("1:2:3").is_err());
        assert!(GapScoring::parse("a:b:c:d:e").is_err());
    }

    #[test]
    fn validate_rejects_qscore_bin_values_without_bin() {
        let mut cfg = Config::default();
        cfg.q_score_bin_values = Some([0u8; 256]);
        cfg.q_score_bin = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_default() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_first_pass_seeds() {
        let mut cfg = Config::default();
        cfg.first_pass_seeds = 0;
        assert!(cfg.validate().is_err());
    }
}
