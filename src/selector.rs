//! Per-tile cluster selector (spec §4.9): shards one tile's clusters
//! across worker threads, drives the match finder and template builder
//! for each cluster, and folds the resulting fragments and stats.
//! Grounded on `original_source/.../alignment/MatchSelector.cpp`'s
//! thread-per-shard compute phase, generalized to this crate's module
//! boundaries (seed staging and pass orchestration live with the caller).

use std::collections::HashMap;

use crate::binning::{FragmentCategory, FragmentStorage, StorableFragment};
use crate::cluster::{unpack_call, ReadSchedule, SeedSchedule, TileClusters};
use crate::config::{Config, KeepUnaligned};
use crate::matchfinder::{find_matches, Match, PassKind};
use crate::oligo::{Base, KmerWidth, Permutation};
use crate::record::{FragmentFlags, FragmentHeader};
use crate::refindex::{Contig, MaskRecord};
use crate::seed::{generate_seeds, BarcodeReferenceMap, SeedId};
use crate::stats::{BarcodeStats, TileStats};
use crate::template::{orientation_of, pair_length, AdapterPattern, Fragment, FragmentState, TemplateBuilder};
use crate::tlen::{insert_size_penalty, PairObservation, TemplateLengthStats};

/// Per-barcode context the selector needs beyond the raw match set (spec
/// §4.9 "per-barcode reference resolution").
pub struct BarcodeContext<'a> {
    pub tls_of_barcode: &'a (dyn Fn(u32) -> TemplateLengthStats + Sync),
    pub adapters_of_barcode: &'a (dyn Fn(u32) -> &'a [AdapterPattern<'a>] + Sync),
}

/// Everything one tile's selector pass needs beyond the raw cluster data.
pub struct TileInputs<'a> {
    pub tile: u32,
    pub clusters: &'a TileClusters,
    pub barcode_of_cluster: &'a [u32],
    pub read_schedule: &'a ReadSchedule,
    pub seed_schedule: &'a SeedSchedule,
    pub width: KmerWidth,
    pub mask_width: u32,
}

/// Splits `num_clusters` clusters into `num_threads` shards by
/// `cluster_id mod num_threads` (spec §4.9 "cluster sharding").
pub fn shard_clusters(num_clusters: usize, num_threads: usize) -> Vec<Vec<usize>> {
    let threads = num_threads.max(1);
    let mut shards = vec![Vec::new(); threads];
    for cluster_id in 0..num_clusters {
        shards[cluster_id % threads].push(cluster_id);
    }
    shards
}

/// Extracts one read's bases and qualities for one cluster, decoded from
/// the tile's packed call bytes.
fn read_bases_and_qualities(clusters: &TileClusters, cluster_id: usize, offset: usize, length: usize) -> (Vec<Base>, Vec<u8>) {
    let span = clusters.read_span(offset, length, cluster_id);
    let mut bases = Vec::with_capacity(length);
    let mut qualities = Vec::with_capacity(length);
    for &byte in span {
        let (base, quality) = unpack_call(byte);
        bases.push(base);
        qualities.push(quality);
    }
    (bases, qualities)
}

/// Resolves a fragment's storage category (spec §3 "Bin"): unaligned
/// fragments always land in the `NoMatch` bin; single-ended reads always
/// resolve by their own strand; paired reads are split by which mate
/// carries the forward-strand (lower-coordinate) position.
fn categorize(fragment: &Fragment, is_paired: bool) -> FragmentCategory {
    if matches!(fragment.state, FragmentState::Unaligned) {
        return FragmentCategory::NoMatch;
    }
    if !is_paired {
        return FragmentCategory::SingleEnded;
    }
    if fragment.reverse {
        FragmentCategory::ReverseIndexed
    } else {
        FragmentCategory::ForwardIndexed
    }
}

fn build_header(
    fragment: &Fragment,
    cigar_length: u32,
    read_length: u32,
    barcode: u32,
    cluster_id: u32,
    tile: u32,
    mate: Option<&Fragment>,
) -> FragmentHeader {
    let mut flags = FragmentFlags::default();
    flags.set(FragmentFlags::REVERSE, fragment.reverse);
    flags.set(FragmentFlags::UNMAPPED, matches!(fragment.state, FragmentState::Unaligned));
    let (mate_pos, mate_bin, paired, second_read, proper_pair) = match mate {
        Some(m) => (m.position, m.contig_id, true, fragment.read_index != 0, m.contig_id == fragment.contig_id),
        None => (0, 0, false, false, false),
    };
    flags.set(FragmentFlags::PAIRED, paired);
    flags.set(FragmentFlags::SECOND_READ, second_read);
    flags.set(FragmentFlags::PROPER_PAIR, proper_pair);

    let total_length = FragmentHeader::ENCODED_LEN as u32 + read_length + cigar_length * 4;
    FragmentHeader {
        f_strand_position: fragment.position,
        flags,
        barcode,
        cluster: cluster_id,
        tile,
        cigar_length,
        read_length,
        mate_f_strand_position: mate_pos,
        mate_storage_bin: mate_bin,
        total_length,
        gap_count: fragment.gap_count,
    }
}

/// Resolves the single best template for one cluster and returns the
/// storable fragments, the stats delta to record against its barcode, and
/// (for a proper pair) the pair-length observation for TLS estimation
/// (spec §4.7, §4.8, §4.9).
fn resolve_cluster(
    builder: &mut TemplateBuilder,
    cluster_id: usize,
    barcode: u32,
    tile: u32,
    clusters: &TileClusters,
    read_schedule: &ReadSchedule,
    matches_by_read: &[Vec<Match>],
    barcode_ctx: &BarcodeContext,
    config: &Config,
) -> (Vec<StorableFragment>, BarcodeStats, Option<PairObservation>) {
    let mut stats = BarcodeStats::default();
    stats.clusters_seen = 1;

    let read_data: Vec<(Vec<Base>, Vec<u8>)> = read_schedule
        .reads
        .iter()
        .map(|span| read_bases_and_qualities(clusters, cluster_id, span.offset, span.length))
        .collect();

    let mut candidates_per_read: Vec<Vec<Fragment>> = Vec::with_capacity(read_data.len());
    for (read_index, (bases, qualities)) in read_data.iter().enumerate() {
        let matches = matches_by_read.get(read_index).map(Vec::as_slice).unwrap_or(&[]);
        let reverse = matches.first().map(|m| m.seed_id.is_reverse()).unwrap_or(false);
        let mut candidates = builder.build_candidates(read_index as u32, bases, qualities, reverse, matches);
        for candidate in &mut candidates {
            if candidate.mismatch_count > 0 {
                let read_slice = &bases[..candidate.observed_length as usize];
                if let Some(reference_bases) = builder.reference_span(candidate) {
                    builder.try_semialigned(candidate, read_slice, reference_bases);
                }
            }
        }
        let adapters = (barcode_ctx.adapters_of_barcode)(barcode);
        for candidate in &mut candidates {
            builder.clip_adapters(candidate, bases, adapters);
        }
        candidates_per_read.push(candidates);
    }

    let is_paired = read_schedule.reads.len() == 2;
    let mut fragments: Vec<Fragment> = Vec::new();
    let mut mapq: Option<u8> = None;
    let mut observation: Option<PairObservation> = None;

    if is_paired && !candidates_per_read[0].is_empty() && !candidates_per_read[1].is_empty() {
        let tls = (barcode_ctx.tls_of_barcode)(barcode);
        if let Some((i, j, best_score, runner_up)) = builder.select_best_pair_with_runner_up(&candidates_per_read[0], &candidates_per_read[1], &tls) {
            let mut first = candidates_per_read[0][i].clone();
            let mut second = candidates_per_read[1][j].clone();

            clip_semialigned_if_possible(builder, &mut first, &read_data[0].0);
            clip_semialigned_if_possible(builder, &mut second, &read_data[1].0);

            let overlap = overlap_of(&first, &second);
            builder.clip_overlap(&mut first, &mut second, overlap);

            if first.contig_id == second.contig_id {
                stats.pairs_proper = 1;
                observation = Some(PairObservation { length: pair_length(&first, &second), model: orientation_of(&first, &second) });
            } else {
                stats.pairs_improper = 1;
            }
            mapq = Some(builder.compute_mapq(best_score, runner_up));
            fragments.push(first);
            fragments.push(second);
        }
    } else {
        for (read_index, candidates) in candidates_per_read.iter().enumerate() {
            if candidates.is_empty() {
                continue;
            }
            let mut scores: Vec<i32> = candidates.iter().map(|f| f.alignment_score).collect();
            scores.sort_unstable_by(|a, b| b.cmp(a));
            let best_index = candidates
                .iter()
                .enumerate()
                .max_by_key(|(_, f)| f.alignment_score)
                .map(|(idx, _)| idx)
                .expect("candidates checked non-empty above");
            let mut best = candidates[best_index].clone();
            clip_semialigned_if_possible(builder, &mut best, &read_data[read_index].0);
            mapq = Some(builder.compute_mapq(scores[0], scores.get(1).copied()));
            fragments.push(best);
        }
    }

    if fragments.is_empty() {
        for read_index in 0..read_schedule.reads.len() {
            fragments.push(Fragment {
                read_index: read_index as u32,
                reverse: false,
                contig_id: 0,
                position: 0,
                cigar: crate::cigar::CigarSlice { offset: 0, length: 0 },
                mismatch_count: 0,
                observed_length: 0,
                alignment_score: i32::MIN,
                gap_count: 0,
                state: FragmentState::Unaligned,
                soft_clip_start: 0,
                soft_clip_end: 0,
            });
        }
    }

    for fragment in &fragments {
        match fragment.state {
            FragmentState::Unaligned => stats.clusters_unaligned += 1,
            FragmentState::SemiAligned | FragmentState::SemialignedClipped => stats.semialigned_alignments += 1,
            FragmentState::AdapterClipped => stats.adapter_clipped += 1,
            _ => {}
        }
        if fragment.gap_count > 0 {
            stats.gapped_alignments += 1;
        }
        stats.mismatch_total += fragment.mismatch_count as u64;
        if !matches!(fragment.state, FragmentState::Unaligned) {
            stats.clusters_aligned += 1;
        }
    }

    // spec §4.9 write gate: mirrors the original's `buildTemplate(...,
    // mapqThreshold) || keepUnaligned` -- discard only applies when the
    // cluster is unaligned or under-confident, and never overrides a
    // non-discard keepUnaligned setting.
    let is_unaligned_cluster = fragments.iter().all(|f| matches!(f.state, FragmentState::Unaligned));
    let below_mapq_threshold = mapq.map(|m| m < config.mapq_threshold).unwrap_or(true);
    let discard = config.keep_unaligned == KeepUnaligned::Discard && (is_unaligned_cluster || below_mapq_threshold);

    let mates: Vec<Option<Fragment>> = if fragments.len() == 2 {
        vec![Some(fragments[1].clone()), Some(fragments[0].clone())]
    } else {
        vec![None; fragments.len()]
    };

    let mut storable = Vec::new();
    if !discard {
        storable.reserve(fragments.len());
        for (idx, fragment) in fragments.iter().enumerate() {
            let cigar_bytes = builder.cigar_arena().to_bytes(fragment.cigar);
            let cigar_length = fragment.cigar.length;
            let packed_calls: Vec<u8> = {
                let (bases, qualities) = &read_data[idx];
                bases.iter().zip(qualities.iter()).map(|(&b, &q)| crate::cluster::pack_call(b, q)).collect()
            };
            let header = build_header(fragment, cigar_length, packed_calls.len() as u32, barcode, cluster_id as u32, tile, mates[idx].as_ref());
            storable.push(StorableFragment {
                header,
                packed_calls,
                cigar_bytes,
                bin_position: crate::refindex::ReferencePosition::new(fragment.contig_id, fragment.position, false).0,
                category: categorize(fragment, is_paired),
            });
        }
    }

    (storable, stats, observation)
}

/// Runs `clip_semialigned_ends` on `fragment` against its own reference
/// span, the step 7 companion to the per-candidate `try_semialigned` rescue
/// above (spec §4.7 step 7).
fn clip_semialigned_if_possible(builder: &mut TemplateBuilder, fragment: &mut Fragment, read_bases: &[Base]) {
    let read_slice = &read_bases[..fragment.observed_length as usize];
    if let Some(reference_bases) = builder.reference_span(fragment) {
        builder.clip_semialigned_ends(fragment, read_slice, reference_bases);
    }
}

fn overlap_of(a: &Fragment, b: &Fragment) -> u32 {
    if a.contig_id != b.contig_id {
        return 0;
    }
    let a_end = a.position + a.observed_length as u64;
    let b_end = b.position + b.observed_length as u64;
    let start = a.position.max(b.position);
    let end = a_end.min(b_end);
    if end > start {
        (end - start) as u32
    } else {
        0
    }
}

/// Drives the full match-find → template-build → storage pass for one
/// tile's clusters, sharded across `num_threads` worker threads (spec
/// §4.9). Returns the folded tile stats plus the per-cluster pair-length
/// observations harvested along the way (spec §4.8's TLS estimation
/// feeds on exactly these); fragments are routed into `storage` as
/// they're resolved, grouped by cluster so a pair's two fragments reach
/// `storage.add` together rather than one at a time.
pub fn process_tile(
    config: &Config,
    contigs: &[Contig],
    mask_lookup: &(dyn Fn(Permutation, u32) -> Vec<MaskRecord> + Sync),
    inputs: &TileInputs,
    barcode_map: &(dyn BarcodeReferenceMap + Sync),
    barcode_ctx: &BarcodeContext,
    storage: &mut dyn FragmentStorage,
    num_threads: usize,
) -> (TileStats, Vec<(u32, PairObservation)>) {
    let seeds = generate_seeds(
        inputs.tile,
        inputs.clusters,
        inputs.barcode_of_cluster,
        barcode_map,
        inputs.read_schedule,
        inputs.seed_schedule,
        inputs.width,
    );

    let all_matches = find_matches(
        seeds,
        mask_lookup,
        inputs.width,
        inputs.mask_width,
        config.repeat_threshold,
        PassKind::FullPass,
        true,
        num_threads,
    );

    let mut matches_by_cluster: HashMap<(u32, u32), Vec<Vec<Match>>> = HashMap::new();
    for m in all_matches {
        let key = (m.seed_id.cluster(), m.seed_id.barcode());
        let read_index = read_index_of_seed(inputs, m.seed_id);
        let entry = matches_by_cluster.entry(key).or_insert_with(|| vec![Vec::new(); inputs.read_schedule.reads.len()]);
        if let Some(slot) = entry.get_mut(read_index) {
            slot.push(m);
        }
    }

    let shards = shard_clusters(inputs.clusters.num_clusters(), num_threads);
    type ShardResult = (Vec<(u32, Vec<StorableFragment>)>, Vec<(u32, PairObservation)>, TileStats);
    let mut per_thread_results: Vec<ShardResult> = Vec::with_capacity(shards.len());

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(shards.len());
        for shard in &shards {
            let matches_by_cluster = &matches_by_cluster;
            let handle = scope.spawn(move || {
                let mut builder = TemplateBuilder::new(config, contigs);
                let mut cluster_groups: Vec<(u32, Vec<StorableFragment>)> = Vec::new();
                let mut observations: Vec<(u32, PairObservation)> = Vec::new();
                let mut tile_stats = TileStats::new();
                for &cluster_id in shard {
                    let barcode = inputs.barcode_of_cluster[cluster_id];
                    let key = (cluster_id as u32, barcode);
                    let empty = vec![Vec::new(); inputs.read_schedule.reads.len()];
                    let matches_by_read = matches_by_cluster.get(&key).unwrap_or(&empty);
                    let (storable, stats, observation) = resolve_cluster(
                        &mut builder,
                        cluster_id,
                        barcode,
                        inputs.tile,
                        inputs.clusters,
                        inputs.read_schedule,
                        matches_by_read,
                        barcode_ctx,
                        config,
                    );
                    tile_stats.record(barcode, &stats);
                    if let Some(observation) = observation {
                        observations.push((barcode, observation));
                    }
                    if !storable.is_empty() {
                        cluster_groups.push((barcode, storable));
                    }
                }
                (cluster_groups, observations, tile_stats)
            });
            handles.push(handle);
        }
        for handle in handles {
            per_thread_results.push(handle.join().expect("selector worker thread panicked"));
        }
    });

    let mut combined_stats = Vec::with_capacity(per_thread_results.len());
    let mut all_observations = Vec::new();
    for (cluster_groups, observations, stats) in per_thread_results {
        combined_stats.push(stats);
        all_observations.extend(observations);
        for (barcode, storable) in cluster_groups {
            storage.add(barcode, &storable).expect("fragment storage write failed");
        }
    }

    (TileStats::fold(&combined_stats), all_observations)
}

fn read_index_of_seed(inputs: &TileInputs, seed_id: SeedId) -> usize {
    let seed_index = seed_id.seed_index() as usize;
    let mut remaining = seed_index;
    for (read_idx, offsets) in inputs.seed_schedule.offsets_per_read.iter().enumerate() {
        if remaining < offsets.len() {
            return read_idx;
        }
        remaining -= offsets.len();
    }
    0
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tlen::OrientationModel;

    #[test]
    fn shard_clusters_distributes_round_robin() {
        let shards = shard_clusters(7, 3);
        assert_eq!(shards.len(), 3);
        assert_eq!(shards.iter().map(|s| s.len()).sum::<usize>(), 7);
        assert_eq!(shards[0], vec![0, 3, 6]);
    }

    #[test]
    fn shard_clusters_handles_single_thread() {
        let shards = shard_clusters(5, 1);
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0], vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn categorize_unaligned_is_no_match() {
        let fragment = Fragment {
            read_index: 0,
            reverse: false,
            contig_id: 0,
            position: 0,
            cigar: crate::cigar::CigarSlice { offset: 0, length: 0 },
            mismatch_count: 0,
            observed_length: 0,
            alignment_score: i32::MIN,
            gap_count: 0,
            state: FragmentState::Unaligned,
            soft_clip_start: 0,
            soft_clip_end: 0,
        };
        assert_eq!(categorize(&fragment, true), FragmentCategory::NoMatch);
    }

    #[test]
    fn categorize_single_ended_aligned_fragment() {
        let fragment = Fragment {
            read_index: 0,
            reverse: false,
            contig_id: 0,
            position: 10,
            cigar: crate::cigar::CigarSlice { offset: 0, length: 1 },
            mismatch_count: 0,
            observed_length: 32,
            alignment_score: 32,
            gap_count: 0,
            state: FragmentState::Aligned,
            soft_clip_start: 0,
            soft_clip_end: 0,
        };
        assert_eq!(categorize(&fragment, false), FragmentCategory::SingleEnded);
    }

    #[test]
    fn overlap_of_computes_shared_span() {
        let mut a = sample_fragment(100, 50);
        let b = sample_fragment(130, 50);
        a.contig_id = 0;
        assert_eq!(overlap_of(&a, &b), 20);
    }

    fn sample_fragment(position: u64, length: u32) -> Fragment {
        Fragment {
            read_index: 0,
            reverse: false,
            contig_id: 0,
            position,
            cigar: crate::cigar::CigarSlice { offset: 0, length: 0 },
            mismatch_count: 0,
            observed_length: length,
            alignment_score: 0,
            gap_count: 0,
            state: FragmentState::Aligned,
            soft_clip_start: 0,
            soft_clip_end: 0,
        }
    }

    #[test]
    fn insert_size_penalty_feeds_pair_selection() {
        let tls = TemplateLengthStats {
            min: 100,
            low_stddev: 5.0,
            median: 150,
            high_stddev: 5.0,
            max: 200,
            model0: OrientationModel::FRp,
            model1: OrientationModel::FRm,
            stable: true,
        };
        assert_eq!(insert_size_penalty(&tls, 150, OrientationModel::FRp), 0);
    }

    #[test]
    fn build_header_carries_the_real_cluster_id() {
        let fragment = sample_fragment(10, 32);
        let header = build_header(&fragment, 1, 32, 7, 42, 3, None);
        assert_eq!(header.cluster, 42);
        assert_eq!(header.barcode, 7);
        assert_eq!(header.tile, 3);
    }
}
