//! Detection aggregation.
//!
//! Folds per-frame batches into one decision for the whole request. This is the
//! only place that decides whether a detection counts as a target and whether an
//! annotated artifact must be persisted.

use crate::detect::{Detection, DetectionBatch};

/// Which labels trigger persistence and alerting for a profile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetPolicy {
    labels: Vec<String>,
}

impl TargetPolicy {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels
                .into_iter()
                .map(|l| l.into().trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
        }
    }

    pub fn fire() -> Self {
        Self::new(["fire"])
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_target(&self, detection: &Detection) -> bool {
        self.labels
            .iter()
            .any(|l| l.eq_ignore_ascii_case(detection.label.trim()))
    }

    pub fn batch_has_target(&self, batch: &DetectionBatch) -> bool {
        batch.detections.iter().any(|d| self.is_target(d))
    }
}

/// Whole-request summary.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregate {
    /// Frame order, then within-frame order. Not deduplicated.
    pub detections: Vec<Detection>,
    pub target_present: bool,
    /// Highest confidence among target detections, `0.0` when there are none.
    pub max_confidence: f32,
    pub frames_sampled: u64,
}

impl Aggregate {
    /// Persist an annotated artifact iff a target was seen.
    pub fn requires_artifact(&self) -> bool {
        self.target_present
    }
}

/// Incremental aggregator, fed one batch per sampled frame.
#[derive(Debug)]
pub struct Aggregator {
    policy: TargetPolicy,
    acc: Aggregate,
}

impl Aggregator {
    pub fn new(policy: TargetPolicy) -> Self {
        Self {
            policy,
            acc: Aggregate::default(),
        }
    }

    pub fn push(&mut self, batch: DetectionBatch) {
        self.acc.frames_sampled += 1;
        for det in batch.detections {
            if self.policy.is_target(&det) {
                self.acc.target_present = true;
                self.acc.max_confidence = self.acc.max_confidence.max(det.confidence);
            }
            self.acc.detections.push(det);
        }
    }

    pub fn finish(self) -> Aggregate {
        self.acc
    }
}

/// Aggregate a complete sequence of batches.
pub fn aggregate<I>(policy: TargetPolicy, batches: I) -> Aggregate
where
    I: IntoIterator<Item = DetectionBatch>,
{
    let mut agg = Aggregator::new(policy);
    for batch in batches {
        agg.push(batch);
    }
    agg.finish()
}
