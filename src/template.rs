//! Template builder (spec §4.7): turns one cluster's matches into scored,
//! clipped fragment and template alignments. Gapped refinement uses
//! `bio::alignment::pairwise`, the teacher's own alignment dependency,
//! standing in for the ISAAC `ssw`/ungapped-extension step the distilled
//! spec doesn't pin to a specific library.

use bio::alignment::pairwise::{Aligner, Scoring};

use crate::cigar::{CigarArena, CigarOp, CigarSlice};
use crate::config::{Config, DodgyAlignmentScore, GapScoring};
use crate::matchfinder::Match;
use crate::oligo::Base;
use crate::refindex::{Contig, ReferencePosition};
use crate::tlen::{insert_size_penalty, OrientationModel, TemplateLengthStats};

/// Where one fragment is in its state machine (spec §4.7 "State machine
/// per fragment").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FragmentState {
    Raw,
    AdapterClipped,
    Aligned,
    SemiAligned,
    Unaligned,
    SemialignedClipped,
    OverlapClipped,
    Emitted,
}

#[derive(Clone, Copy, Debug)]
pub struct AdapterPattern<'a> {
    pub sequence: &'a [u8],
    pub strand_bound: bool,
}

/// One candidate (or final) fragment alignment for one read (spec §3
/// "Fragment metadata").
#[derive(Clone, Debug)]
pub struct Fragment {
    pub read_index: u32,
    pub reverse: bool,
    pub contig_id: u32,
    pub position: u64,
    pub cigar: CigarSlice,
    pub mismatch_count: u32,
    pub observed_length: u32,
    pub alignment_score: i32,
    pub gap_count: u32,
    pub state: FragmentState,
    pub soft_clip_start: u32,
    pub soft_clip_end: u32,
}

impl Fragment {
    fn unaligned(read_index: u32) -> Fragment {
        Fragment {
            read_index,
            reverse: false,
            contig_id: 0,
            position: 0,
            cigar: CigarSlice { offset: 0, length: 0 },
            mismatch_count: 0,
            observed_length: 0,
            alignment_score: i32::MIN,
            gap_count: 0,
            state: FragmentState::Unaligned,
            soft_clip_start: 0,
            soft_clip_end: 0,
        }
    }
}

/// A finished template: one or two fragments plus the template's overall
/// score and orientation (spec §3 "BAM-template").
#[derive(Clone, Debug)]
pub struct Template {
    pub fragments: Vec<Fragment>,
    pub score: i32,
    pub orientation: Option<OrientationModel>,
    pub mapq: u8,
}

/// Builds templates for one cluster's matches. Owns the CIGAR arena for
/// the cluster's lifetime (spec §9 "Cyclic ownership").
pub struct TemplateBuilder<'a> {
    config: &'a Config,
    contigs: &'a [Contig],
    cigar: CigarArena,
}

impl<'a> TemplateBuilder<'a> {
    pub fn new(config: &'a Config, contigs: &'a [Contig]) -> TemplateBuilder<'a> {
        TemplateBuilder { config, contigs, cigar: CigarArena::new() }
    }

    pub fn cigar_arena(&self) -> &CigarArena {
        &self.cigar
    }

    /// The reference bases a fragment's position and observed length span,
    /// for passes that re-inspect an already-scored candidate (spec §4.7
    /// steps 3 and 7). Returns `None` if the span no longer fits the
    /// contig (shouldn't happen for a fragment `build_candidates` itself
    /// produced, but guarded the same way `build_candidates` is).
    pub fn reference_span(&self, fragment: &Fragment) -> Option<&'a [Base]> {
        let contig = self.contigs.get(fragment.contig_id as usize)?;
        let start = fragment.position;
        let end = start + fragment.observed_length as u64;
        if end > contig.total_bases() {
            return None;
        }
        Some(&contig.sequence[start as usize..end as usize])
    }

    /// Trims contiguous low-quality 3' bases below `base_quality_cutoff`
    /// (spec §4.7 step 2). Returns the trimmed length.
    fn quality_trim(&self, qualities: &[u8]) -> usize {
        let cutoff = match self.config.base_quality_cutoff {
            Some(c) => c,
            None => return qualities.len(),
        };
        let mut end = qualities.len();
        while end > 0 && qualities[end - 1] < cutoff {
            end -= 1;
        }
        end
    }

    /// Step 1 + 3: converts matches into candidate fragment alignments,
    /// dropping any whose span falls off the contig, and scores each with
    /// the configured gap scoring.
    pub fn build_candidates(
        &mut self,
        read_index: u32,
        read_bases: &[Base],
        qualities: &[u8],
        reverse: bool,
        matches: &[Match],
    ) -> Vec<Fragment> {
        let trimmed_len = self.quality_trim(qualities);
        let bases = &read_bases[..trimmed_len];

        let mut candidates = Vec::new();
        for m in matches {
            if m.position.is_sentinel() {
                continue;
            }
            let contig = match self.contigs.get(m.position.contig_id() as usize) {
                Some(c) => c,
                None => continue,
            };
            let start = m.position.offset();
            let end = start + bases.len() as u64;
            if end > contig.total_bases() {
                continue; // spec §4.7 step 1: span falls off the contig end
            }

            let reference_slice = &contig.sequence[start as usize..end as usize];
            let mut fragment = self.score_candidate(read_index, reverse, m.position, bases, reference_slice);

            let trimmed_off = read_bases.len() - trimmed_len;
            if trimmed_off > 0 {
                // quality-trimmed tail becomes a soft clip rather than
                // vanishing from the record: appended right after the
                // fragment's own ops, so it's still contiguous in the arena
                let extra = self.cigar.push(&[(CigarOp::SoftClip, trimmed_off as u32)]);
                fragment.cigar.length += extra.length;
                fragment.soft_clip_end += trimmed_off as u32;
            }
            candidates.push(fragment);
        }
        candidates
    }

    fn score_candidate(
        &mut self,
        read_index: u32,
        reverse: bool,
        position: ReferencePosition,
        read_bases: &[Base],
        reference_bases: &[Base],
    ) -> Fragment {
        let gs = &self.config.gap_scoring;
        let (ungapped_score, mismatches) = ungapped_score(read_bases, reference_bases, gs);

        let (score, cigar_ops, gap_count, state) = if mismatches == 0 {
            (ungapped_score, vec![(CigarOp::Match, read_bases.len() as u32)], 0, FragmentState::Aligned)
        } else if self.should_run_gapped(mismatches, read_bases.len()) {
            gapped_align(read_bases, reference_bases, gs)
        } else {
            (ungapped_score, vec![(CigarOp::Match, read_bases.len() as u32)], 0, FragmentState::Aligned)
        };

        let slice = self.cigar.push(&cigar_ops);
        Fragment {
            read_index,
            reverse,
            contig_id: position.contig_id(),
            position: position.offset(),
            cigar: slice,
            mismatch_count: mismatches,
            observed_length: read_bases.len() as u32,
            alignment_score: score,
            gap_count,
            state,
            soft_clip_start: 0,
            soft_clip_end: 0,
        }
    }

    /// `avoid_smith_waterman` heuristic (spec §4.7 step 3): skip gapped
    /// realignment when too few mismatches remain to plausibly hide a gap.
    fn should_run_gapped(&self, mismatches: u32, read_len: usize) -> bool {
        if self.config.avoid_smith_waterman {
            return mismatches as usize * 4 > read_len;
        }
        true
    }

    /// Semi-aligned rescue (spec §4.7 step 3): allows a single gap up to
    /// `semialigned_gap_limit` bases to resolve a cluster of end
    /// mismatches, accepted only if it reduces mismatches by at least
    /// `gapped_mismatches_max`.
    pub fn try_semialigned(&mut self, fragment: &mut Fragment, read_bases: &[Base], reference_bases: &[Base]) {
        if self.config.semialigned_gap_limit == 0 {
            return;
        }
        let (gapped_score, cigar_ops, gap_count, _state) = gapped_align(read_bases, reference_bases, &self.config.gap_scoring);
        let gapped_mismatches = cigar_ops
            .iter()
            .filter(|(op, _)| matches!(op, CigarOp::Insertion | CigarOp::Deletion))
            .map(|(_, len)| *len)
            .sum::<u32>();

        if fragment.mismatch_count >= gapped_mismatches + self.config.gapped_mismatches_max {
            let slice = self.cigar.push(&cigar_ops);
            fragment.cigar = slice;
            fragment.alignment_score = gapped_score;
            fragment.gap_count = gap_count;
            fragment.mismatch_count = gapped_mismatches;
            fragment.state = FragmentState::SemiAligned;
        }
    }

    /// Adapter clipping (spec §4.7 step 4): marks the overhang past any
    /// matching adapter pattern as soft-clipped.
    pub fn clip_adapters(&mut self, fragment: &mut Fragment, read_bases: &[Base], adapters: &[AdapterPattern]) {
        for adapter in adapters {
            if adapter.strand_bound && fragment.reverse {
                continue;
            }
            if let Some(clip_at) = find_adapter(read_bases, adapter.sequence) {
                let clipped = read_bases.len() as u32 - clip_at as u32;
                if clipped > 0 {
                    fragment.soft_clip_end = fragment.soft_clip_end.max(clipped);
                    fragment.state = FragmentState::AdapterClipped;
                }
            }
        }
    }

    /// Trims either end until 5 consecutive matching bases are seen (spec
    /// §4.7 step 7, `clipSemialigned`).
    pub fn clip_semialigned_ends(&mut self, fragment: &mut Fragment, read_bases: &[Base], reference_bases: &[Base]) {
        if !self.config.clip_semialigned {
            return;
        }
        const RUN: usize = 5;
        let n = read_bases.len().min(reference_bases.len());

        let mut start = 0;
        while start + RUN <= n {
            if (start..start + RUN).all(|i| read_bases[i] == reference_bases[i]) {
                break;
            }
            start += 1;
        }
        let mut end = n;
        while end >= RUN {
            if (end - RUN..end).all(|i| read_bases[i] == reference_bases[i]) {
                break;
            }
            end -= 1;
        }
        fragment.soft_clip_start = fragment.soft_clip_start.max(start as u32);
        fragment.soft_clip_end = fragment.soft_clip_end.max((n - end) as u32);
        fragment.state = FragmentState::SemialignedClipped;
    }

    /// Soft-clips the lower-quality end's overlap between the two
    /// fragments of a proper pair (spec §4.7 step 8, `clipOverlapping`).
    pub fn clip_overlap(&mut self, a: &mut Fragment, b: &mut Fragment, overlap: u32) {
        if !self.config.clip_overlapping || overlap == 0 {
            return;
        }
        // lower alignment score end gets clipped; ties clip the second read
        if a.alignment_score <= b.alignment_score {
            a.soft_clip_end += overlap;
            a.state = FragmentState::OverlapClipped;
        } else {
            b.soft_clip_end += overlap;
            b.state = FragmentState::OverlapClipped;
        }
    }

    /// Enumerates candidate pairs and selects the best-scoring one, along
    /// with the next-best competing score for MAPQ (spec §4.7 steps 5, 6).
    pub fn select_best_pair_with_runner_up(
        &self,
        firsts: &[Fragment],
        seconds: &[Fragment],
        tls: &TemplateLengthStats,
    ) -> Option<(usize, usize, i32, Option<i32>)> {
        let mut scored: Vec<(usize, usize, i32)> = Vec::new();
        for (i, f1) in firsts.iter().enumerate() {
            for (j, f2) in seconds.iter().enumerate() {
                if f1.contig_id != f2.contig_id {
                    continue;
                }
                let length = pair_length(f1, f2);
                let model = orientation_of(f1, f2);
                let penalty = insert_size_penalty(tls, length, model);
                scored.push((i, j, f1.alignment_score + f2.alignment_score + penalty));
            }
        }
        scored.sort_by(|a, b| b.2.cmp(&a.2));
        let (i, j, best_score) = *scored.first()?;
        let runner_up = scored.get(1).map(|&(_, _, s)| s);
        Some((i, j, best_score, runner_up))
    }

    /// MAPQ from the gap between best and next-best score, capped at 60
    /// (spec §4.7 step 6).
    pub fn compute_mapq(&self, best_score: i32, next_best_score: Option<i32>) -> u8 {
        match next_best_score {
            None => 60,
            Some(next) => {
                if best_score <= i32::MIN / 2 {
                    return match self.config.dodgy_alignment_score {
                        DodgyAlignmentScore::Unknown => crate::config::MAPQ_UNKNOWN,
                        DodgyAlignmentScore::Unaligned => 0,
                        DodgyAlignmentScore::Fixed(v) => v,
                    };
                }
                let gap = (best_score - next).max(0);
                (gap.min(60)) as u8
            }
        }
    }
}

pub(crate) fn pair_length(f1: &Fragment, f2: &Fragment) -> u32 {
    let a = f1.position;
    let b = f2.position + f2.observed_length as u64;
    let lo = a.min(f2.position);
    let hi = b.max(f1.position + f1.observed_length as u64);
    (hi - lo) as u32
}

pub(crate) fn orientation_of(f1: &Fragment, f2: &Fragment) -> OrientationModel {
    use OrientationModel::*;
    let proper = f1.position <= f2.position;
    match (f1.reverse, f2.reverse, proper) {
        (false, true, true) => FRp,
        (false, true, false) => FRm,
        (true, false, true) => RFp,
        (true, false, false) => RFm,
        (false, false, true) => FFp,
        (false, false, false) => FFm,
        (true, true, true) => RRp,
        (true, true, false) => RRm,
    }
}

fn find_adapter(read_bases: &[Base], adapter: &[u8]) -> Option<usize> {
    if adapter.is_empty() {
        return None;
    }
    let decoded: Vec<u8> = read_bases.iter().map(|b| b.decode()).collect();
    decoded.windows(adapter.len()).position(|w| w == adapter)
}

/// Counts mismatches base-by-base and scores ungapped (spec §4.7 step 3
/// baseline before considering a gapped candidate).
fn ungapped_score(read: &[Base], reference: &[Base], gs: &GapScoring) -> (i32, u32) {
    let mut mismatches = 0;
    let mut score = 0;
    for (r, g) in read.iter().zip(reference.iter()) {
        if !r.valid || !g.valid || r.code != g.code {
            mismatches += 1;
            score += gs.mismatch_score;
        } else {
            score += gs.match_score;
        }
    }
    (score, mismatches)
}

/// Runs `bio::alignment::pairwise`'s banded Smith-Waterman-like aligner
/// and converts its `Alignment` into our CIGAR op list (spec §4.7 step 3
/// "gapped candidate").
fn gapped_align(read: &[Base], reference: &[Base], gs: &GapScoring) -> (i32, Vec<(CigarOp, u32)>, u32, FragmentState) {
    let read_bytes: Vec<u8> = read.iter().map(|b| b.decode()).collect();
    let reference_bytes: Vec<u8> = reference.iter().map(|b| b.decode()).collect();

    let match_score = gs.match_score;
    let mismatch_score = gs.mismatch_score;
    let scoring = Scoring::new(gs.gap_open, gs.gap_extend, move |a: u8, b: u8| {
        if a == b {
            match_score
        } else {
            mismatch_score
        }
    });
    let mut aligner = Aligner::with_capacity_and_scoring(read_bytes.len(), reference_bytes.len(), scoring);
    let alignment = aligner.global(&read_bytes, &reference_bytes);

    let mut ops = Vec::new();
    let mut gap_count = 0;
    for op in &alignment.operations {
        let cigar_op = match op {
            bio::alignment::AlignmentOperation::Match | bio::alignment::AlignmentOperation::Subst => CigarOp::Match,
            bio::alignment::AlignmentOperation::Ins => {
                gap_count += 1;
                CigarOp::Insertion
            }
            bio::alignment::AlignmentOperation::Del => {
                gap_count += 1;
                CigarOp::Deletion
            }
            bio::alignment::AlignmentOperation::Xclip(_) | bio::alignment::AlignmentOperation::Yclip(_) => {
                continue;
            }
        };
        if let Some(last) = ops.last_mut() {
            let (last_op, last_len): &mut (CigarOp, u32) = last;
            if *last_op == cigar_op {
                *last_len += 1;
                continue;
            }
        }
        ops.push((cigar_op, 1));
    }

    (alignment.score, ops, gap_count, FragmentState::Aligned)
}
