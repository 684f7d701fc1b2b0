//! Template-length estimator (spec §4.8): accumulates well-aligned pairs
//! per barcode until the five-number summary stabilizes and one
//! orientation model holds a strict majority.

/// The eight orientation classes a paired template can fall into (spec §3
/// "Template-length statistics").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OrientationModel {
    FFp,
    FRp,
    RFp,
    RRp,
    FFm,
    FRm,
    RFm,
    RRm,
}

pub const ALL_MODELS: [OrientationModel; 8] = [
    OrientationModel::FFp,
    OrientationModel::FRp,
    OrientationModel::RFp,
    OrientationModel::RRp,
    OrientationModel::FFm,
    OrientationModel::FRm,
    OrientationModel::RFm,
    OrientationModel::RRm,
];

/// The frozen five-number summary plus orientation models the builder
/// consumes (spec §3 "Template-length statistics").
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TemplateLengthStats {
    pub min: u32,
    pub low_stddev: f64,
    pub median: u32,
    pub high_stddev: f64,
    pub max: u32,
    pub model0: OrientationModel,
    pub model1: OrientationModel,
    pub stable: bool,
}

impl TemplateLengthStats {
    /// An unstable placeholder used for single-ended data (spec §4.8:
    /// "for single-ended data the stats are marked unstable and the
    /// pairing step of §4.7 is skipped").
    pub fn unstable() -> TemplateLengthStats {
        TemplateLengthStats {
            min: 0,
            low_stddev: 0.0,
            median: 0,
            high_stddev: 0.0,
            max: 0,
            model0: OrientationModel::FRp,
            model1: OrientationModel::FRp,
            stable: false,
        }
    }
}

/// One well-aligned pair observation fed to the estimator.
#[derive(Clone, Copy, Debug)]
pub struct PairObservation {
    pub length: u32,
    pub model: OrientationModel,
}

/// Accumulates observations in fixed-size batches and checks for
/// stability between successive batches, per spec §4.8.
pub struct Estimator {
    batch_size: usize,
    tolerance: f64,
    observations: Vec<PairObservation>,
    previous_summary: Option<FiveNumberSummary>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct FiveNumberSummary {
    min: u32,
    low_stddev: f64,
    median: u32,
    high_stddev: f64,
    max: u32,
}

impl Estimator {
    pub fn new(batch_size: usize, tolerance: f64) -> Estimator {
        Estimator { batch_size, tolerance, observations: Vec::new(), previous_summary: None }
    }

    /// Feeds one batch of observations; returns `Some(stats)` once the
    /// sample stabilizes (unchanged five-number summary within
    /// `tolerance` across batches, plus a strict-majority orientation
    /// model), otherwise `None` to request another batch.
    pub fn feed(&mut self, batch: &[PairObservation]) -> Option<TemplateLengthStats> {
        self.observations.extend_from_slice(batch);
        if self.observations.len() < self.batch_size {
            return None;
        }

        let summary = five_number_summary(&self.observations);
        let (model0, model1, majority_model) = model_counts(&self.observations);

        let stable = match self.previous_summary {
            Some(prev) => summary.close_to(&prev, self.tolerance) && majority_model,
            None => false,
        };
        self.previous_summary = Some(summary);

        if stable {
            Some(TemplateLengthStats {
                min: summary.min,
                low_stddev: summary.low_stddev,
                median: summary.median,
                high_stddev: summary.high_stddev,
                max: summary.max,
                model0,
                model1,
                stable: true,
            })
        } else {
            None
        }
    }
}

impl FiveNumberSummary {
    fn close_to(&self, other: &FiveNumberSummary, tolerance: f64) -> bool {
        (self.min as f64 - other.min as f64).abs() <= tolerance
            && (self.median as f64 - other.median as f64).abs() <= tolerance
            && (self.max as f64 - other.max as f64).abs() <= tolerance
            && (self.low_stddev - other.low_stddev).abs() <= tolerance
            && (self.high_stddev - other.high_stddev).abs() <= tolerance
    }
}

fn five_number_summary(observations: &[PairObservation]) -> FiveNumberSummary {
    let mut lengths: Vec<u32> = observations.iter().map(|o| o.length).collect();
    lengths.sort_unstable();
    let min = lengths[0];
    let max = lengths[lengths.len() - 1];
    let median = lengths[lengths.len() / 2];

    let mean = lengths.iter().map(|&l| l as f64).sum::<f64>() / lengths.len() as f64;
    let (low_sq, low_n, high_sq, high_n) = lengths.iter().fold((0.0, 0u32, 0.0, 0u32), |(ls, ln, hs, hn), &l| {
        let d = l as f64 - mean;
        if (l as f64) <= mean {
            (ls + d * d, ln + 1, hs, hn)
        } else {
            (ls, ln, hs + d * d, hn + 1)
        }
    });
    let low_stddev = if low_n > 0 { (low_sq / low_n as f64).sqrt() } else { 0.0 };
    let high_stddev = if high_n > 0 { (high_sq / high_n as f64).sqrt() } else { 0.0 };

    FiveNumberSummary { min, low_stddev, median, high_stddev, max }
}

/// Returns the two most frequent models (`model0`, `model1`) plus whether
/// `model0` holds a strict majority of observations.
fn model_counts(observations: &[PairObservation]) -> (OrientationModel, OrientationModel, bool) {
    let mut counts: std::collections::HashMap<OrientationModel, u32> = std::collections::HashMap::new();
    for obs in observations {
        *counts.entry(obs.model).or_insert(0) += 1;
    }
    let mut ranked: Vec<(OrientationModel, u32)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    let total = observations.len() as u32;
    let model0 = ranked.first().map(|(m, _)| *m).unwrap_or(OrientationModel::FRp);
    let model1 = ranked.get(1).map(|(m, _)| *m).unwrap_or(model0);
    let majority = ranked.first().map(|&(_, count)| count * 2 > total).unwrap_or(false);
    (model0, model1, majority)
}

/// Computes the scoring penalty `insert_size_penalty` described in spec
/// §4.7 step 5: zero within `[min, max]` under the expected orientation,
/// a large fixed penalty otherwise.
pub fn insert_size_penalty(stats: &TemplateLengthStats, length: u32, model: OrientationModel) -> i32 {
    const OUT_OF_RANGE_PENALTY: i32 = -1000;
    let orientation_ok = model == stats.model0 || model == stats.model1;
    let length_ok = length >= stats.min && length <= stats.max;
    if orientation_ok && length_ok {
        0
    } else {
        OUT_OF_RANGE_PENALTY
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn obs(length: u32, model: OrientationModel) -> PairObservation {
        PairObservation { length, model }
    }

    #[test]
    fn unstable_until_majority_model_and_summary_converge() {
        let mut estimator = Estimator::new(4, 5.0);
        let batch1: Vec<_> = (0..4).map(|_| obs(200, OrientationModel::FRp)).collect();
        assert!(estimator.feed(&batch1).is_none());

        let batch2: Vec<_> = (0..4).map(|_| obs(200, OrientationModel::FRp)).collect();
        let stats = estimator.feed(&batch2);
        assert!(stats.is_some());
        assert!(stats.unwrap().stable);
    }

    #[test]
    fn single_ended_placeholder_is_unstable() {
        let stats = TemplateLengthStats::unstable();
        assert!(!stats.stable);
    }

    #[test]
    fn insert_size_penalty_is_zero_in_range_and_expected_orientation() {
        let stats = TemplateLengthStats {
            min: 200,
            max: 300,
            median: 250,
            low_stddev: 10.0,
            high_stddev: 10.0,
            model0: OrientationModel::FRp,
            model1: OrientationModel::FRm,
            stable: true,
        };
        assert_eq!(insert_size_penalty(&stats, 250, OrientationModel::FRp), 0);
        assert!(insert_size_penalty(&stats, 50, OrientationModel::FRp) < 0);
        assert!(insert_size_penalty(&stats, 250, OrientationModel::RRp) < 0);
    }

    #[test]
    fn five_number_summary_basic() {
        let data: Vec<_> = vec![100, 200, 300, 400, 500].into_iter().map(|l| obs(l, OrientationModel::FRp)).collect();
        let summary = five_number_summary(&data);
        assert_eq!(summary.min, 100);
        assert_eq!(summary.max, 500);
        assert_eq!(summary.median, 300);
    }
}
