//! Match finder (spec §4.5), grounded on
//! `original_source/.../alignment/MatchFilter.cpp`. The six permutation
//! filter tables below are transcribed directly from that file's
//! `getUse()` truth tables, including the fact that `(1,1)` is accepted
//! under every single permutation — this is the spec's Open Question (a)
//! and is preserved as-is, not "fixed".

use crate::oligo::{quarters, KmerValue, KmerWidth, Permutation, ALL_PERMUTATIONS};
use crate::refindex::{MaskRecord, ReferencePosition};
use crate::seed::{Seed, SeedId};

/// One filter table entry is indexed by `(mismatch_c << 2) | mismatch_d`,
/// each count in `0..=3` (a 4th quarter can carry up to `k/4` mismatches,
/// but anything beyond 2 is already excluded before the table lookup).
type FilterTable = [bool; 16];

fn table_index(mismatch_c: u32, mismatch_d: u32) -> usize {
    ((mismatch_c.min(3) << 2) | mismatch_d.min(3)) as usize
}

fn make_table(accepted: &[(u32, u32)]) -> FilterTable {
    let mut table = [false; 16];
    for &(c, d) in accepted {
        table[table_index(c, d)] = true;
    }
    table
}

fn filter_table(permutation: Permutation) -> FilterTable {
    match permutation {
        Permutation::Abcd => make_table(&[(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (2, 0)]),
        Permutation::Bcda => make_table(&[(0, 1), (0, 2), (1, 1)]),
        Permutation::Cdab => make_table(&[(0, 1), (0, 2), (1, 1)]),
        Permutation::Acbd => make_table(&[(1, 1)]),
        Permutation::Bdac => make_table(&[(1, 1)]),
        Permutation::Adbc => make_table(&[(1, 1)]),
    }
}

fn accepted(permutation: Permutation, mismatch_c: u32, mismatch_d: u32) -> bool {
    filter_table(permutation)[table_index(mismatch_c, mismatch_d)]
}

/// A single accepted match: the seed that found it and the genomic
/// position it resolves to, with strand recorded via the seed's own
/// `is_reverse()` flag (spec §3 "Match").
#[derive(Clone, Copy, Debug)]
pub struct Match {
    pub seed_id: SeedId,
    pub position: ReferencePosition,
}

/// Counts 2-bit-per-base mismatches between two same-width quarter values.
fn count_quarter_mismatches(a: KmerValue, b: KmerValue, bases_in_quarter: u32) -> u32 {
    let diff = a ^ b;
    let mut mismatches = 0;
    for i in 0..bases_in_quarter {
        if (diff >> (i * 2)) & 0b11 != 0 {
            mismatches += 1;
        }
    }
    mismatches
}

/// Mismatch counts in quarters C and D between a permuted seed k-mer and a
/// permuted reference k-mer — the two quarters not covered by the mask
/// file's A+B prefix match (spec §4.5 step 3).
fn quarter_mismatches(seed_kmer: KmerValue, ref_kmer: KmerValue, width: KmerWidth) -> (u32, u32) {
    let [_sa, _sb, sc, sd] = quarters(seed_kmer, width);
    let [_ra, _rb, rc, rd] = quarters(ref_kmer, width);
    let bases_per_quarter = width.bases() / 4;
    (
        count_quarter_mismatches(sc, rc, bases_per_quarter),
        count_quarter_mismatches(sd, rd, bases_per_quarter),
    )
}

/// Top `mask_width` bits of a (possibly permuted) k-mer.
pub fn mask_prefix(kmer: KmerValue, width: KmerWidth, mask_width: u32) -> u32 {
    let total_bits = width.bits();
    (kmer >> (total_bits - mask_width)) as u32
}

/// Whether the current pass only honors seeds without a neighbor flag
/// (the "single-seed first pass" of spec §4.5 step 3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PassKind {
    FirstPass,
    FullPass,
}

/// Runs one permutation's merge-join between a group of sorted, permuted
/// seeds and the mask records sharing that group's top `mask_width`-bit
/// (quarters A+B) prefix (spec §4.5 step 3).
///
/// All seeds and all records passed in already share the same A+B prefix
/// (the caller groups by `mask_prefix` before calling); this scans every
/// seed against every record in the group and scores quarters C and D,
/// since the permitted mismatches make this a proximity join rather than
/// an equi-join on the full k-mer.
///
/// `cluster_already_has_match` is consulted before emitting a
/// `TooManyMatch` sentinel: per spec, the sentinel is only emitted the
/// first time a cluster comes up empty, never repeated.
pub fn merge_join(
    permutation: Permutation,
    seeds: &[Seed],
    mask_records: &[MaskRecord],
    width: KmerWidth,
    repeat_threshold: u32,
    pass: PassKind,
    include_neighbors: bool,
    mut cluster_already_has_match: impl FnMut(u32) -> bool,
) -> Vec<Match> {
    let mut matches = Vec::new();

    for seed in seeds {
        let mut per_seed_count: u32 = 0;
        for record in mask_records {
            let (mismatch_c, mismatch_d) = quarter_mismatches(seed.kmer, record.kmer, width);

            if mismatch_c + mismatch_d > 2 || !accepted(permutation, mismatch_c, mismatch_d) {
                continue;
            }

            if record.position.is_too_many_match() {
                if !cluster_already_has_match(seed.id.cluster()) {
                    matches.push(Match { seed_id: seed.id, position: record.position });
                }
                continue;
            }

            if record.position.has_neighbors() && pass == PassKind::FirstPass && !include_neighbors {
                continue;
            }

            per_seed_count += 1;
            if per_seed_count > repeat_threshold {
                // recovered locally: emit a sentinel in place of the
                // overflowing record and stop scanning further records for
                // this seed in this permutation (spec §4.5 "Failure
                // semantics"). At `repeat_threshold == 0` even the sentinel
                // is suppressed, matching spec §8 "no matches are ever
                // emitted" for that boundary.
                if repeat_threshold > 0 && !cluster_already_has_match(seed.id.cluster()) {
                    matches.push(Match { seed_id: seed.id, position: ReferencePosition::too_many_match() });
                }
                break;
            }
            matches.push(Match { seed_id: seed.id, position: record.position });
        }
    }

    matches
}

/// Applies all six permutations in order, restoring base order between
/// passes via `reorder`, and returns the concatenated, globally-sorted
/// match stream the selector consumes (spec §4.5 "After all permutations").
pub fn find_matches(
    mut seeds: Vec<Seed>,
    mask_lookup: impl Fn(Permutation, u32) -> Vec<MaskRecord>,
    width: KmerWidth,
    mask_width: u32,
    repeat_threshold: u32,
    pass: PassKind,
    include_neighbors: bool,
    threads: usize,
) -> Vec<Match> {
    let mut all_matches = Vec::new();
    let mut clusters_with_matches: std::collections::HashSet<u32> = std::collections::HashSet::new();

    for &permutation in ALL_PERMUTATIONS.iter() {
        for seed in seeds.iter_mut() {
            seed.kmer = permutation.apply(seed.kmer, width);
        }
        crate::sort::parallel_sort(&mut seeds, threads, |a, b| {
            a.kmer.cmp(&b.kmer).then_with(|| a.id.0.cmp(&b.id.0))
        });

        let mut start = 0;
        while start < seeds.len() {
            let prefix = mask_prefix(seeds[start].kmer, width, mask_width);
            let mut end = start + 1;
            while end < seeds.len() && mask_prefix(seeds[end].kmer, width, mask_width) == prefix {
                end += 1;
            }
            let records = mask_lookup(permutation, prefix);
            let matches = merge_join(
                permutation,
                &seeds[start..end],
                &records,
                width,
                repeat_threshold,
                pass,
                include_neighbors,
                |cluster| clusters_with_matches.contains(&cluster),
            );
            for m in &matches {
                clusters_with_matches.insert(m.seed_id.cluster());
            }
            all_matches.extend(matches);
            start = end;
        }

        for seed in seeds.iter_mut() {
            seed.kmer = permutation.reorder(seed.kmer, width);
        }
    }

    crate::sort::parallel_sort(&mut all_matches, threads, |a, b| {
        (a.seed_id.tile(), a.seed_id.barcode(), a.seed_id.cluster(), a.seed_id.seed_index(), a.position.0).cmp(&(
            b.seed_id.tile(),
            b.seed_id.barcode(),
            b.seed_id.cluster(),
            b.seed_id.seed_index(),
            b.position.0,
        ))
    });

    all_matches
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_table_matches_original_source_truth_table() {
        // Transcribed from MatchFilter.cpp's getUse(): (1,1) is accepted by
        // every permutation, by design (Open Question (a)).
        for &perm in ALL_PERMUTATIONS.iter() {
            assert!(accepted(perm, 1, 1), "{} must accept (1,1)", perm.name());
        }
        assert!(accepted(Permutation::Abcd, 0, 0));
        assert!(accepted(Permutation::Abcd, 2, 0));
        assert!(!accepted(Permutation::Abcd, 0, 3));
        assert!(accepted(Permutation::Bcda, 0, 1));
        assert!(!accepted(Permutation::Bcda, 2, 0));
        assert!(!accepted(Permutation::Acbd, 0, 1));
    }

    #[test]
    fn every_sum_le_2_pattern_is_accepted_at_least_once() {
        let patterns = [(0u32, 0u32), (0, 1), (0, 2), (1, 0), (1, 1), (2, 0)];
        for &(c, d) in &patterns {
            let hits = ALL_PERMUTATIONS.iter().filter(|&&p| accepted(p, c, d)).count();
            assert!(hits >= 1, "({},{}) accepted by no permutation", c, d);
        }
    }

    #[test]
    fn mismatch_count_is_zero_for_identical_kmers() {
        let k: KmerValue = 0b0110_1001_1100_0011;
        assert_eq!(quarter_mismatches(k, k, KmerWidth::K16), (0, 0));
    }

    #[test]
    fn quarter_mismatches_isolates_c_and_d() {
        use crate::oligo::{encode_kmer, KmerWidth};
        let a = encode_kmer(b"AAAAAAAAAAAAAAAA", KmerWidth::K16).unwrap();
        let b = encode_kmer(b"AAAAAAAACAAAGAAA", KmerWidth::K16).unwrap();
        // quarter boundaries at bases 4/8/12: mismatch in C (base 8) and D (base 12)
        let (c, d) = quarter_mismatches(a, b, KmerWidth::K16);
        assert_eq!((c, d), (1, 1));
    }

    #[test]
    fn mask_prefix_extracts_top_bits() {
        let shift = KmerWidth::K16.bits() - 2;
        let kmer: KmerValue = 0b11 << shift;
        let prefix = mask_prefix(kmer, KmerWidth::K16, 2);
        assert_eq!(prefix, 0b11);
    }

    #[test]
    fn mask_prefix_and_encode_kmer_round_trip_for_k64() {
        let bases = b"ACGTACGTACGTACGTACGTACGTACGTACGTACGTACGTACGTACGTACGTACGTACGTAC";
        assert_eq!(bases.len(), 64);
        let kmer = crate::oligo::encode_kmer(bases, KmerWidth::K64).expect("K64 encoding must not overflow KmerValue");
        assert_eq!(crate::oligo::decode_kmer(kmer, KmerWidth::K64), bases.to_vec());
        // top 4 bits come from the first two bases, "AC" = 0b00_01
        assert_eq!(mask_prefix(kmer, KmerWidth::K64, 4), 0b0001);
    }

    #[test]
    fn too_many_match_sentinel_emitted_once_per_cluster() {
        let id_a = SeedId::new(0, 0, 5, 0, false);
        let record = MaskRecord { kmer: 7, position: ReferencePosition::too_many_match() };
        let seeds = vec![Seed { kmer: 7, id: id_a }];

        let mut seen = false;
        let matches_first = merge_join(
            Permutation::Abcd,
            &seeds,
            &[record],
            KmerWidth::K16,
            10,
            PassKind::FirstPass,
            false,
            |_| seen,
        );
        assert_eq!(matches_first.len(), 1);
        seen = true;
        let matches_second = merge_join(
            Permutation::Abcd,
            &seeds,
            &[record],
            KmerWidth::K16,
            10,
            PassKind::FirstPass,
            false,
            |_| seen,
        );
        assert!(matches_second.is_empty());
    }

    #[test]
    fn runtime_overflow_emits_sentinel_and_stops() {
        let id = SeedId::new(0, 0, 9, 0, false);
        let seeds = vec![Seed { kmer: 0, id }];
        // Three records under the same A+B prefix all pass the (0,0) filter
        // for Abcd; with repeat_threshold = 1 the second record overflows.
        let records = vec![
            MaskRecord { kmer: 0, position: ReferencePosition::new(0, 10, false) },
            MaskRecord { kmer: 0, position: ReferencePosition::new(0, 20, false) },
            MaskRecord { kmer: 0, position: ReferencePosition::new(0, 30, false) },
        ];
        let matches = merge_join(Permutation::Abcd, &seeds, &records, KmerWidth::K16, 1, PassKind::FirstPass, false, |_| false);
        assert_eq!(matches.len(), 2);
        assert!(!matches[0].position.is_too_many_match());
        assert!(matches[1].position.is_too_many_match());
    }

    #[test]
    fn repeat_threshold_zero_emits_nothing_on_overflow() {
        let id = SeedId::new(0, 0, 9, 0, false);
        let seeds = vec![Seed { kmer: 0, id }];
        let records = vec![MaskRecord { kmer: 0, position: ReferencePosition::new(0, 10, false) }];
        let matches = merge_join(Permutation::Abcd, &seeds, &records, KmerWidth::K16, 0, PassKind::FirstPass, false, |_| false);
        assert!(matches.is_empty());
    }
}
