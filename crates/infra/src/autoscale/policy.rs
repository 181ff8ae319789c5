//! Backlog-driven scaling policy.
//!
//! Pure: a decision depends only on the policy and the last N samples. The
//! control loop owns one [`ScalingController`] per queue.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Estimated wait, in seconds, for a job enqueued now:
/// `(visible + in_flight) / max(running_workers, 1) * 60`.
pub fn wait_seconds(visible: usize, in_flight: usize, running_workers: usize) -> f64 {
    let backlog = (visible + in_flight) as f64;
    backlog / running_workers.max(1) as f64 * 60.0
}

/// One point-in-time sample for one queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMetricSnapshot {
    pub queue: String,
    pub visible: usize,
    pub in_flight: usize,
    pub running_workers: usize,
    pub sampled_at: DateTime<Utc>,
}

impl QueueMetricSnapshot {
    pub fn wait_seconds(&self) -> f64 {
        wait_seconds(self.visible, self.in_flight, self.running_workers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDecision {
    ScaleOut,
    ScaleIn,
    Hold,
}

impl core::fmt::Display for ScalingDecision {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ScalingDecision::ScaleOut => "scale_out",
            ScalingDecision::ScaleIn => "scale_in",
            ScalingDecision::Hold => "hold",
        })
    }
}

/// What the control loop emits per queue per tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvaluation {
    pub queue: String,
    pub wait_seconds: f64,
    pub decision: ScalingDecision,
}

/// Where a single sample falls relative to the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Above,
    Below,
    Within,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PolicyError {
    #[error("scale-out threshold ({out}) must be greater than scale-in threshold ({inn})")]
    Thresholds { out: f64, inn: f64 },
    #[error("hysteresis window must hold at least one sample")]
    EmptyWindow,
}

/// Thresholds and window length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    scale_out_above: f64,
    scale_in_below: f64,
    window: usize,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            scale_out_above: 75.0,
            scale_in_below: 50.0,
            window: 3,
        }
    }
}

impl ScalingPolicy {
    pub fn new(scale_out_above: f64, scale_in_below: f64, window: usize) -> Result<Self, PolicyError> {
        if !(scale_out_above > scale_in_below) {
            return Err(PolicyError::Thresholds {
                out: scale_out_above,
                inn: scale_in_below,
            });
        }
        if window == 0 {
            return Err(PolicyError::EmptyWindow);
        }
        Ok(Self {
            scale_out_above,
            scale_in_below,
            window,
        })
    }

    pub fn scale_out_above(&self) -> f64 {
        self.scale_out_above
    }

    pub fn scale_in_below(&self) -> f64 {
        self.scale_in_below
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn classify(&self, wait_seconds: f64) -> Band {
        if wait_seconds > self.scale_out_above {
            Band::Above
        } else if wait_seconds < self.scale_in_below {
            Band::Below
        } else {
            Band::Within
        }
    }
}

/// Bounded history of the last N bands, oldest evicted first.
#[derive(Debug, Clone)]
pub struct HysteresisWindow {
    samples: VecDeque<Band>,
    capacity: usize,
}

impl HysteresisWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, band: Band) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(band);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Act only once the window is full and every sample agrees.
    pub fn decision(&self) -> ScalingDecision {
        if self.samples.len() < self.capacity {
            return ScalingDecision::Hold;
        }
        if self.samples.iter().all(|b| *b == Band::Above) {
            ScalingDecision::ScaleOut
        } else if self.samples.iter().all(|b| *b == Band::Below) {
            ScalingDecision::ScaleIn
        } else {
            ScalingDecision::Hold
        }
    }
}

/// Policy plus history for one queue.
#[derive(Debug, Clone)]
pub struct ScalingController {
    policy: ScalingPolicy,
    window: HysteresisWindow,
}

impl ScalingController {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            window: HysteresisWindow::new(policy.window()),
            policy,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn evaluate(&mut self, snapshot: &QueueMetricSnapshot) -> ScalingEvaluation {
        let wait = snapshot.wait_seconds();
        self.window.push(self.policy.classify(wait));
        ScalingEvaluation {
            queue: snapshot.queue.clone(),
            wait_seconds: wait,
            decision: self.window.decision(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(visible: usize, in_flight: usize, running_workers: usize) -> QueueMetricSnapshot {
        QueueMetricSnapshot {
            queue: "sam".to_string(),
            visible,
            in_flight,
            running_workers,
            sampled_at: Utc::now(),
        }
    }

    fn run(controller: &mut ScalingController, samples: &[(usize, usize, usize)]) -> Vec<ScalingDecision> {
        samples
            .iter()
            .map(|&(v, f, r)| controller.evaluate(&snapshot(v, f, r)).decision)
            .collect()
    }

    #[test]
    fn wait_seconds_formula() {
        assert_eq!(wait_seconds(10, 0, 2), 300.0);
        assert_eq!(wait_seconds(0, 0, 3), 0.0);
        assert_eq!(wait_seconds(1, 1, 0), 120.0);
    }

    #[test]
    fn sustained_backlog_scales_out_on_third_sample() {
        let mut c = ScalingController::new(ScalingPolicy::default());
        assert_eq!(
            run(&mut c, &[(10, 0, 2); 3]),
            vec![ScalingDecision::Hold, ScalingDecision::Hold, ScalingDecision::ScaleOut]
        );
    }

    #[test]
    fn sustained_idle_scales_in() {
        let mut c = ScalingController::new(ScalingPolicy::default());
        assert_eq!(run(&mut c, &[(0, 0, 3); 3])[2], ScalingDecision::ScaleIn);
    }

    #[test]
    fn single_outlier_does_not_flip_decision() {
        let mut c = ScalingController::new(ScalingPolicy::default());
        let decisions = run(&mut c, &[(10, 0, 2), (10, 0, 2), (0, 0, 2), (10, 0, 2), (10, 0, 2)]);
        assert!(decisions.iter().all(|d| *d == ScalingDecision::Hold));
    }

    #[test]
    fn dead_band_holds() {
        // 1 message per worker is exactly 60s: between 50 and 75.
        let mut c = ScalingController::new(ScalingPolicy::default());
        assert!(run(&mut c, &[(2, 0, 2); 5]).iter().all(|d| *d == ScalingDecision::Hold));
    }

    #[test]
    fn window_is_not_cleared_after_a_decision() {
        let mut c = ScalingController::new(ScalingPolicy::default());
        let decisions = run(&mut c, &[(10, 0, 1); 5]);
        assert_eq!(&decisions[2..], &[ScalingDecision::ScaleOut; 3]);
    }

    #[test]
    fn policy_rejects_inverted_thresholds() {
        assert!(ScalingPolicy::new(50.0, 75.0, 3).is_err());
        assert!(ScalingPolicy::new(60.0, 60.0, 3).is_err());
        assert_eq!(ScalingPolicy::new(75.0, 50.0, 0), Err(PolicyError::EmptyWindow));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the decision is a function of the last N samples only.
        #[test]
        fn decision_depends_only_on_last_window(
            prefix in prop::collection::vec((0usize..50, 0usize..50, 0usize..6), 0..20),
            tail in prop::collection::vec((0usize..50, 0usize..50, 0usize..6), 3),
        ) {
            let mut with_history = ScalingController::new(ScalingPolicy::default());
            run(&mut with_history, &prefix);
            let a = run(&mut with_history, &tail);

            let mut fresh = ScalingController::new(ScalingPolicy::default());
            let b = run(&mut fresh, &tail);

            prop_assert_eq!(a[2], b[2]);
        }

        /// Property: a non-hold decision needs every sample in the window to agree.
        #[test]
        fn non_hold_requires_unanimous_window(
            samples in prop::collection::vec((0usize..50, 0usize..50, 0usize..6), 3..30),
        ) {
            let policy = ScalingPolicy::default();
            let mut c = ScalingController::new(policy);
            let decisions = run(&mut c, &samples);

            for (i, decision) in decisions.iter().enumerate() {
                if i + 1 < policy.window() {
                    prop_assert_eq!(*decision, ScalingDecision::Hold);
                    continue;
                }
                let bands: Vec<Band> = samples[i + 1 - policy.window()..=i]
                    .iter()
                    .map(|&(v, f, r)| policy.classify(wait_seconds(v, f, r)))
                    .collect();
                match decision {
                    ScalingDecision::ScaleOut => prop_assert!(bands.iter().all(|b| *b == Band::Above)),
                    ScalingDecision::ScaleIn => prop_assert!(bands.iter().all(|b| *b == Band::Below)),
                    ScalingDecision::Hold => prop_assert!(
                        !bands.iter().all(|b| *b == Band::Above) && !bands.iter().all(|b| *b == Band::Below)
                    ),
                }
            }
        }

        #[test]
        fn wait_never_divides_by_zero(v in 0usize..10_000, f in 0usize..10_000) {
            prop_assert!(wait_seconds(v, f, 0).is_finite());
            prop_assert_eq!(wait_seconds(v, f, 0), wait_seconds(v, f, 1));
        }
    }
}
