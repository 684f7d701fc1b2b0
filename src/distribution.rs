//! Match distribution histogram and the `BinIndexMap` it drives (spec
//! §4.6), grounded on `original_source/.../MatchDistribution.cpp` and
//! `.../matchSelector/BinIndexMap.hh`.

use crate::refindex::{Contig, ReferencePosition};

/// One count vector per contig (indexed by karyotype index), one entry per
/// `distribution_bin_size`-wide window of that contig.
#[derive(Clone, Debug, Default)]
pub struct MatchDistribution {
    bin_size: u64,
    contigs: Vec<Vec<u32>>,
}

impl MatchDistribution {
    pub fn bin_size(&self) -> u64 {
        self.bin_size
    }

    /// Sizes the histogram to the reference's geometry, one bin vector per
    /// contig (indexed by karyotype index) sized to hold the contig's full
    /// length (spec §4.6 "lightweight dry-run pass").
    pub fn initialize(contigs: &[Contig], bin_size: u64) -> MatchDistribution {
        crate::error::invariant!(bin_size > 0, "distribution bin size must be positive");
        let n = contigs.iter().map(|c| c.karyotype_index as usize + 1).max().unwrap_or(0);
        let mut by_karyotype: Vec<Vec<u32>> = vec![Vec::new(); n];
        for contig in contigs {
            let bin_count = (contig.total_bases() + bin_size - 1) / bin_size;
            by_karyotype[contig.karyotype_index as usize] = vec![0u32; bin_count as usize];
        }
        MatchDistribution { bin_size, contigs: by_karyotype }
    }

    pub fn record(&mut self, karyotype_index: usize, contig_offset: u64) {
        let bin = (contig_offset / self.bin_size) as usize;
        self.contigs[karyotype_index][bin] += 1;
    }

    /// Sums another distribution of the identical geometry into this one.
    pub fn consolidate(&mut self, other: &MatchDistribution) {
        crate::error::invariant!(
            self.contigs.len() == other.contigs.len(),
            "match distribution geometries must match for consolidation"
        );
        for (ours, theirs) in self.contigs.iter_mut().zip(other.contigs.iter()) {
            crate::error::invariant!(
                ours.len() == theirs.len(),
                "match distribution contig bin counts must match for consolidation"
            );
            for (a, b) in ours.iter_mut().zip(theirs.iter()) {
                *a += b;
            }
        }
    }

    pub fn contig_counts(&self, karyotype_index: usize) -> &[u32] {
        &self.contigs[karyotype_index]
    }

    pub fn num_contigs(&self) -> usize {
        self.contigs.len()
    }
}

/// Maps a reference position to an output bin index (spec §3 "Bin", §4.6).
/// Index 0 is the dedicated unaligned bin; bins never straddle contigs.
#[derive(Clone, Debug)]
pub struct BinIndexMap {
    distribution_bin_size: u64,
    /// `bin_index_of[0]` is always `[0]` (the unaligned sentinel); entry
    /// `karyotype_index + 1` holds that contig's per-distribution-bin
    /// output bin indices.
    bin_index_of: Vec<Vec<u32>>,
}

impl BinIndexMap {
    /// Builds the map per spec §4.6: a new output bin starts only once the
    /// current bin already holds data and the next distribution bin's
    /// count would overflow `output_bin_size`; bins never span contigs.
    pub fn new(distribution: &MatchDistribution, output_bin_size: u64, skip_empty_bins: bool) -> BinIndexMap {
        let mut bin_index_of = Vec::with_capacity(distribution.num_contigs() + 1);
        let mut current_bin_index: u32 = 0;
        bin_index_of.push(vec![current_bin_index]);
        current_bin_index += 1;

        for karyotype_index in 0..distribution.num_contigs() {
            let counts = distribution.contig_counts(karyotype_index);
            let mut indices = Vec::with_capacity(counts.len());
            let mut current_bin_size: u64 = 0;
            let mut current_contig_size: u64 = 0;
            for &count in counts {
                if current_bin_size != 0 && current_bin_size + count as u64 > output_bin_size {
                    current_bin_index += 1;
                    current_bin_size = 0;
                }
                current_bin_size += count as u64;
                current_contig_size += count as u64;
                indices.push(current_bin_index);
            }
            if !skip_empty_bins || current_contig_size != 0 {
                current_bin_index += 1;
            }
            bin_index_of.push(indices);
        }

        BinIndexMap { distribution_bin_size: distribution.bin_size(), bin_index_of }
    }

    pub fn bin_of(&self, position: ReferencePosition) -> u32 {
        if position.is_sentinel() {
            return 0;
        }
        let contig_bins = &self.bin_index_of[position.contig_id() as usize + 1];
        let index = (position.offset() / self.distribution_bin_size) as usize;
        crate::error::invariant!(index < contig_bins.len(), "reference position outside contig's distribution bins");
        contig_bins[index]
    }

    pub fn highest_bin_index(&self) -> u32 {
        self.bin_index_of
            .iter()
            .rev()
            .find_map(|v| v.last().copied())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::refindex::ContigMetadata;

    fn contig(index: u32, karyotype: u32, bases: u64) -> Contig {
        Contig {
            index,
            karyotype_index: karyotype,
            name: format!("chr{}", index),
            sequence: vec![crate::oligo::Base::encode(b'A'); bases as usize],
            metadata: ContigMetadata {
                file_offset: 0,
                size: bases,
                acgt_count: bases,
                bam_sq_as: None,
                bam_sq_ur: None,
                bam_sq_m5: None,
            },
        }
    }

    #[test]
    fn initialize_sizes_bins_per_contig() {
        let contigs = vec![contig(0, 0, 1000), contig(1, 1, 550)];
        let dist = MatchDistribution::initialize(&contigs, 100);
        assert_eq!(dist.contig_counts(0).len(), 10);
        assert_eq!(dist.contig_counts(1).len(), 6);
    }

    #[test]
    fn consolidate_sums_matching_geometries() {
        let contigs = vec![contig(0, 0, 300)];
        let mut a = MatchDistribution::initialize(&contigs, 100);
        let mut b = MatchDistribution::initialize(&contigs, 100);
        a.record(0, 50);
        b.record(0, 50);
        b.record(0, 250);
        a.consolidate(&b);
        assert_eq!(a.contig_counts(0), &[2, 0, 1]);
    }

    #[test]
    fn bin_index_map_never_straddles_contigs_and_closes_on_overflow() {
        let contigs = vec![contig(0, 0, 1000), contig(1, 1, 1000)];
        let mut dist = MatchDistribution::initialize(&contigs, 100);
        for bin in 0..10 {
            for _ in 0..60 {
                dist.record(0, bin * 100);
            }
        }
        for bin in 0..10 {
            for _ in 0..60 {
                dist.record(1, bin * 100);
            }
        }
        let map = BinIndexMap::new(&dist, 100, false);

        // unaligned bin is always 0
        assert_eq!(map.bin_index_of[0], vec![0]);
        // first contig's bins never reuse bin 0
        assert!(map.bin_index_of[1].iter().all(|&b| b >= 1));
        // second contig's first bin index is strictly greater than the
        // first contig's last bin index (no straddling)
        let first_contig_max = *map.bin_index_of[1].iter().max().unwrap();
        let second_contig_min = *map.bin_index_of[2].iter().min().unwrap();
        assert!(second_contig_min > first_contig_max);
    }

    #[test]
    fn bin_of_maps_unaligned_sentinel_to_zero() {
        let contigs = vec![contig(0, 0, 1000)];
        let dist = MatchDistribution::initialize(&contigs, 100);
        let map = BinIndexMap::new(&dist, 1000, false);
        assert_eq!(map.bin_of(ReferencePosition::no_match()), 0);
        assert_eq!(map.bin_of(ReferencePosition::too_many_match()), 0);
    }

    #[test]
    fn bin_of_resolves_a_real_position() {
        let contigs = vec![contig(0, 0, 1000)];
        let dist = MatchDistribution::initialize(&contigs, 100);
        let map = BinIndexMap::new(&dist, 100000, false);
        let pos = ReferencePosition::new(0, 250, false);
        assert_eq!(map.bin_of(pos), 1);
    }
}
