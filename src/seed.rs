//! Seed generator (spec §4.3): turns cluster cycles into forward/reverse
//! k-mer seeds, tagging any seed that spans an `N` with the dedicated
//! N-seed sentinel so it sorts last and never matches.

use crate::cluster::{unpack_call, ReadSchedule, SeedSchedule, TileClusters};
use crate::config::SeedLength;
use crate::oligo::{encode_kmer, reverse_complement, Base, KmerValue, KmerWidth};

/// `seed_id` bit layout (spec §3 "Seed"): fixed widths packed MSB-first so
/// that sorting by the raw `u64` sorts by `(tile, barcode, cluster,
/// seed_index, reverse)` in that priority order.
const TILE_BITS: u32 = 12;
const BARCODE_BITS: u32 = 12;
const CLUSTER_BITS: u32 = 24;
const SEED_INDEX_BITS: u32 = 7;
const REVERSE_BITS: u32 = 1;

const REVERSE_SHIFT: u32 = 0;
const SEED_INDEX_SHIFT: u32 = REVERSE_SHIFT + REVERSE_BITS;
const CLUSTER_SHIFT: u32 = SEED_INDEX_SHIFT + SEED_INDEX_BITS;
const BARCODE_SHIFT: u32 = CLUSTER_SHIFT + CLUSTER_BITS;
const TILE_SHIFT: u32 = BARCODE_SHIFT + BARCODE_BITS;

const _: () = assert!(TILE_SHIFT + TILE_BITS <= 64);

/// The N-seed sentinel: an all-ones k-mer value that never equals a real
/// encoded k-mer's high bits combined with a seed id carrying the
/// dedicated "N" marker bit, so it sorts to the end of any permutation.
pub const N_SEED_KMER: KmerValue = KmerValue::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SeedId(pub u64);

impl SeedId {
    pub fn new(tile: u32, barcode: u32, cluster: u32, seed_index: u32, reverse: bool) -> SeedId {
        crate::error::invariant!(tile < (1 << TILE_BITS), "tile id {} overflows seed_id field", tile);
        crate::error::invariant!(barcode < (1 << BARCODE_BITS), "barcode id {} overflows seed_id field", barcode);
        crate::error::invariant!(cluster < (1 << CLUSTER_BITS), "cluster id {} overflows seed_id field", cluster);
        crate::error::invariant!(seed_index < (1 << SEED_INDEX_BITS), "seed index {} overflows seed_id field", seed_index);
        let rev = if reverse { 1u64 } else { 0u64 };
        let packed = ((tile as u64) << TILE_SHIFT)
            | ((barcode as u64) << BARCODE_SHIFT)
            | ((cluster as u64) << CLUSTER_SHIFT)
            | ((seed_index as u64) << SEED_INDEX_SHIFT)
            | (rev << REVERSE_SHIFT);
        SeedId(packed)
    }

    pub fn tile(self) -> u32 {
        ((self.0 >> TILE_SHIFT) & mask(TILE_BITS)) as u32
    }
    pub fn barcode(self) -> u32 {
        ((self.0 >> BARCODE_SHIFT) & mask(BARCODE_BITS)) as u32
    }
    pub fn cluster(self) -> u32 {
        ((self.0 >> CLUSTER_SHIFT) & mask(CLUSTER_BITS)) as u32
    }
    pub fn seed_index(self) -> u32 {
        ((self.0 >> SEED_INDEX_SHIFT) & mask(SEED_INDEX_BITS)) as u32
    }
    pub fn is_reverse(self) -> bool {
        (self.0 >> REVERSE_SHIFT) & 1 == 1
    }
}

fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

/// `(kmer_value, seed_id)`: the generator's output unit (spec §3 "Seed").
#[derive(Clone, Copy, Debug)]
pub struct Seed {
    pub kmer: KmerValue,
    pub id: SeedId,
}

impl Seed {
    pub fn is_n_seed(self) -> bool {
        self.kmer == N_SEED_KMER
    }
}

/// Which reference each barcode's clusters map to, and whether that
/// reference has already been resolved as "unmapped" for this tile.
pub trait BarcodeReferenceMap {
    fn is_mapped(&self, barcode: u32) -> bool;
}

/// Extracts every forward/reverse seed for one tile's clusters, per the
/// per-cycle incremental build described in spec §4.3.
pub fn generate_seeds(
    tile: u32,
    clusters: &TileClusters,
    barcode_of_cluster: &[u32],
    barcode_map: &dyn BarcodeReferenceMap,
    read_schedule: &ReadSchedule,
    seed_schedule: &SeedSchedule,
    width: KmerWidth,
) -> Vec<Seed> {
    let k = width.bases() as usize;
    let mut seeds = Vec::new();

    for (cluster_id, &barcode) in barcode_of_cluster.iter().enumerate() {
        if !barcode_map.is_mapped(barcode) {
            continue;
        }
        for (read_idx, read) in read_schedule.reads.iter().enumerate() {
            let offsets = match seed_schedule.offsets_per_read.get(read_idx) {
                Some(o) => o,
                None => continue,
            };
            for (seed_index, &seed_offset) in offsets.iter().enumerate() {
                if seed_offset + k > read.length {
                    continue;
                }
                let cycle_start = read.offset + seed_offset;
                let mut forward_bases = Vec::with_capacity(k);
                let mut has_n = false;
                for i in 0..k {
                    let byte = clusters.call(cluster_id, cycle_start + i);
                    let (base, _quality): (Base, u8) = unpack_call(byte);
                    if !base.valid {
                        has_n = true;
                    }
                    forward_bases.push(base.decode());
                }

                let id_fwd = SeedId::new(tile, barcode, cluster_id as u32, seed_index as u32, false);
                let id_rev = SeedId::new(tile, barcode, cluster_id as u32, seed_index as u32, true);

                if has_n {
                    seeds.push(Seed { kmer: N_SEED_KMER, id: id_fwd });
                    seeds.push(Seed { kmer: N_SEED_KMER, id: id_rev });
                    continue;
                }

                let fwd_kmer = encode_kmer(&forward_bases, width)
                    .expect("seed bases validated N-free above");
                let rev_kmer = reverse_complement(fwd_kmer, width);

                seeds.push(Seed { kmer: fwd_kmer, id: id_fwd });
                seeds.push(Seed { kmer: rev_kmer, id: id_rev });
            }
        }
    }

    seeds
}

/// Partitions seeds into contiguous per-reference ranges (the barcode's
/// mapped reference determines the partition), preserving relative order
/// within each partition. Each returned range is later sorted by
/// `(kmer, seed_id)` independently and in parallel (spec §4.3, §4.4).
pub fn partition_by_reference(
    seeds: Vec<Seed>,
    reference_of_barcode: &dyn Fn(u32) -> u32,
) -> Vec<(u32, Vec<Seed>)> {
    let mut by_reference: std::collections::BTreeMap<u32, Vec<Seed>> = std::collections::BTreeMap::new();
    for seed in seeds {
        let reference = reference_of_barcode(seed.id.barcode());
        by_reference.entry(reference).or_default().push(seed);
    }
    by_reference.into_iter().collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::{pack_call, ReadSpan};

    struct AllMapped;
    impl BarcodeReferenceMap for AllMapped {
        fn is_mapped(&self, _barcode: u32) -> bool {
            true
        }
    }

    #[test]
    fn seed_id_packs_and_unpacks_fields() {
        let id = SeedId::new(7, 3, 99, 1, true);
        assert_eq!(id.tile(), 7);
        assert_eq!(id.barcode(), 3);
        assert_eq!(id.cluster(), 99);
        assert_eq!(id.seed_index(), 1);
        assert!(id.is_reverse());
    }

    #[test]
    fn seed_id_ordering_prioritizes_tile_then_barcode_then_cluster() {
        let a = SeedId::new(1, 0, 0, 0, false);
        let b = SeedId::new(1, 0, 1, 0, false);
        let c = SeedId::new(2, 0, 0, 0, false);
        assert!(a.0 < b.0);
        assert!(b.0 < c.0);
    }

    #[test]
    fn n_in_seed_produces_n_seed_sentinel() {
        let bases = b"ACGTACGTACGTACGTACGTACGTACGTACGT".to_vec();
        let mut clusters = TileClusters::new(1, 40);
        for (i, &b) in bases.iter().enumerate() {
            clusters.set_call(0, i, pack_call(Base::encode(b), 40));
        }
        // poison one base with N
        clusters.set_call(0, 5, crate::cluster::N_CALL_BYTE);

        let schedule = ReadSchedule { reads: vec![ReadSpan { offset: 0, length: 32 }] };
        let seed_schedule = SeedSchedule { offsets_per_read: vec![vec![0]] };
        let seeds = generate_seeds(0, &clusters, &[0], &AllMapped, &schedule, &seed_schedule, KmerWidth::K32);

        assert_eq!(seeds.len(), 2);
        assert!(seeds.iter().all(|s| s.is_n_seed()));
    }

    #[test]
    fn clean_seed_yields_forward_and_reverse_complement() {
        let bases = b"ACGTACGTACGTACGTACGTACGTACGTACGT".to_vec();
        let mut clusters = TileClusters::new(1, 40);
        for (i, &b) in bases.iter().enumerate() {
            clusters.set_call(0, i, pack_call(Base::encode(b), 40));
        }
        let schedule = ReadSchedule { reads: vec![ReadSpan { offset: 0, length: 32 }] };
        let seed_schedule = SeedSchedule { offsets_per_read: vec![vec![0]] };
        let seeds = generate_seeds(0, &clusters, &[0], &AllMapped, &schedule, &seed_schedule, KmerWidth::K32);

        assert_eq!(seeds.len(), 2);
        assert!(!seeds[0].is_n_seed());
        assert_ne!(seeds[0].kmer, seeds[1].kmer);
        assert!(!seeds[0].id.is_reverse());
        assert!(seeds[1].id.is_reverse());
    }

    #[test]
    fn unmapped_barcode_produces_no_seeds() {
        struct NoneMapped;
        impl BarcodeReferenceMap for NoneMapped {
            fn is_mapped(&self, _barcode: u32) -> bool {
                false
            }
        }
        let clusters = TileClusters::new(1, 40);
        let schedule = ReadSchedule { reads: vec![ReadSpan { offset: 0, length: 32 }] };
        let seed_schedule = SeedSchedule { offsets_per_read: vec![vec![0]] };
        let seeds = generate_seeds(0, &clusters, &[0], &NoneMapped, &schedule, &seed_schedule, KmerWidth::K32);
        assert!(seeds.is_empty());
    }

    #[test]
    fn partition_by_reference_groups_contiguously() {
        let seeds = vec![
            Seed { kmer: 1, id: SeedId::new(0, 0, 0, 0, false) },
            Seed { kmer: 2, id: SeedId::new(0, 1, 0, 0, false) },
            Seed { kmer: 3, id: SeedId::new(0, 0, 1, 0, false) },
        ];
        let reference_of = |barcode: u32| if barcode == 0 { 10 } else { 20 };
        let partitioned = partition_by_reference(seeds, &reference_of);
        assert_eq!(partitioned.len(), 2);
        let (ref_a, seeds_a) = &partitioned[0];
        assert_eq!(*ref_a, 10);
        assert_eq!(seeds_a.len(), 2);
    }
}
