//! Reconciliation planning primitives.
//!
//! This library computes what a reconciliation pass should do for one
//! service, without touching the coordination store. Key concepts:
//!
//! - **Desired state**: the service's run-state and instance count.
//! - **Members**: the instances that currently have records, each with an
//!   index (`0..N-1`) and the desired run-state written for it.
//! - **Plan**: which indices to start and which members to stop, pause, or
//!   resume so the member set moves toward the desired state.
//!
//! # Invariants
//!
//! - Plans are deterministic given the same inputs
//! - A planned start never reuses an index held by any member
//! - Pause and resume never change cardinality
//! - A member is never both stopped and resumed by the same plan

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Desired run-state of a service or of one of its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Run,
    Pause,
    Stop,
}

impl RunState {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Pause => "pause",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the service asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Service-level run-state.
    pub state: RunState,

    /// Declared instance count.
    pub count: u32,

    /// Scale-up waits until no members remain ("restart all on instance
    /// change" policy).
    pub restart_all: bool,
}

impl Target {
    /// Instance count after applying the run-state (Stop means zero).
    pub fn desired_count(&self) -> u32 {
        match self.state {
            RunState::Stop => 0,
            RunState::Run | RunState::Pause => self.count,
        }
    }
}

/// One existing instance as seen by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member<K> {
    /// Caller's handle for the instance.
    pub key: K,

    /// Instance index.
    pub index: u32,

    /// Desired run-state currently recorded for the instance. Instances
    /// already told to stop are transitioning out and do not count toward
    /// the live total, but keep their index reserved.
    pub state: RunState,
}

impl<K> Member<K> {
    fn is_active(&self) -> bool {
        self.state != RunState::Stop
    }
}

/// The actions for one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan<K> {
    /// Indices to start new instances at, lowest first.
    pub start: Vec<u32>,

    /// Members whose desired state becomes Stop, highest index first.
    pub stop: Vec<K>,

    /// Members whose desired state becomes Pause.
    pub pause: Vec<K>,

    /// Members whose desired state returns to Run.
    pub resume: Vec<K>,

    /// Scale-up was held back by the restart-all policy.
    pub deferred: bool,
}

impl<K> SyncPlan<K> {
    fn empty() -> Self {
        Self {
            start: Vec::new(),
            stop: Vec::new(),
            pause: Vec::new(),
            resume: Vec::new(),
            deferred: false,
        }
    }

    /// Returns true if the plan changes nothing.
    pub fn is_empty(&self) -> bool {
        self.start.is_empty()
            && self.stop.is_empty()
            && self.pause.is_empty()
            && self.resume.is_empty()
    }
}

/// Compute the plan that moves `members` toward `target`.
///
/// - **Pause**: every Run member is paused; nothing else changes.
/// - **Run**: Pause members below the desired count are resumed; Pause
///   members at or above it are stopped as surplus.
/// - **Scale-up** fills the lowest indices in `[0, desired)` not held by any
///   member (including members already stopping), at most
///   `desired - live` of them. With `restart_all`, scale-up waits until the
///   member set is empty.
/// - **Scale-down** stops `live - desired` live members, highest index first.
pub fn plan_sync<K: Clone>(target: &Target, members: &[Member<K>]) -> SyncPlan<K> {
    let mut plan = SyncPlan::empty();

    if target.state == RunState::Pause {
        plan.pause = members
            .iter()
            .filter(|m| m.state == RunState::Run)
            .map(|m| m.key.clone())
            .collect();
        return plan;
    }

    let desired = target.desired_count();

    // Positions into `members` of instances that stay live this pass.
    let mut live: Vec<usize> = Vec::new();
    let mut resume: Vec<usize> = Vec::new();
    let mut stop: Vec<usize> = Vec::new();

    for (pos, member) in members.iter().enumerate() {
        if !member.is_active() {
            continue;
        }
        if member.state == RunState::Pause && target.state == RunState::Run {
            if member.index < desired {
                resume.push(pos);
            } else {
                stop.push(pos);
                continue;
            }
        }
        live.push(pos);
    }

    let current = live.len() as u32;

    if desired > current {
        if target.restart_all && !members.is_empty() {
            plan.deferred = true;
        } else {
            let held: BTreeSet<u32> = members.iter().map(|m| m.index).collect();
            plan.start = (0..desired)
                .filter(|i| !held.contains(i))
                .take((desired - current) as usize)
                .collect();
        }
    } else if desired < current {
        let mut candidates = live.clone();
        candidates.sort_by(|a, b| members[*b].index.cmp(&members[*a].index));
        let excess = (current - desired) as usize;
        let chosen: Vec<usize> = candidates.into_iter().take(excess).collect();
        resume.retain(|pos| !chosen.contains(pos));
        stop.extend(chosen);
    }

    plan.stop = stop.into_iter().map(|pos| members[pos].key.clone()).collect();
    plan.resume = resume.into_iter().map(|pos| members[pos].key.clone()).collect();
    plan
}

// =============================================================================
// Retry backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_RETRY_BASE,
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Default interval between periodic reconciliation passes.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default base delay before retrying a failed store read or watch.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(250);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn run(count: u32) -> Target {
        Target {
            state: RunState::Run,
            count,
            restart_all: false,
        }
    }

    fn members(entries: &[(u32, RunState)]) -> Vec<Member<u32>> {
        entries
            .iter()
            .map(|(index, state)| Member {
                key: *index,
                index: *index,
                state: *state,
            })
            .collect()
    }

    fn running(n: u32) -> Vec<Member<u32>> {
        (0..n)
            .map(|i| Member {
                key: i,
                index: i,
                state: RunState::Run,
            })
            .collect()
    }

    #[test]
    fn test_scale_up_from_empty() {
        let plan = plan_sync(&run(5), &running(0));
        assert_eq!(plan.start, vec![0, 1, 2, 3, 4]);
        assert!(plan.stop.is_empty());
    }

    #[test]
    fn test_scale_up_fills_gaps_first() {
        let m = members(&[(0, RunState::Run), (2, RunState::Run), (4, RunState::Run)]);
        let plan = plan_sync(&run(5), &m);
        assert_eq!(plan.start, vec![1, 3]);
    }

    #[test]
    fn test_scale_down_highest_index_first() {
        let plan = plan_sync(&run(4), &running(8));
        assert_eq!(plan.stop, vec![7, 6, 5, 4]);
        assert!(plan.start.is_empty());
    }

    #[test]
    fn test_stopping_members_not_double_counted() {
        // 4 running at 0..3, two already stopping at 4 and 6.
        let m = members(&[
            (0, RunState::Run),
            (1, RunState::Run),
            (2, RunState::Run),
            (3, RunState::Run),
            (4, RunState::Stop),
            (6, RunState::Stop),
        ]);
        let plan = plan_sync(&run(4), &m);
        assert!(plan.is_empty());

        // Growing to 6 skips the reserved indices 4 and 6.
        let plan = plan_sync(&run(6), &m);
        assert_eq!(plan.start, vec![5]);
    }

    #[test]
    fn test_scale_up_after_stopped_removed() {
        // 8 -> 4 stopped 4..7; two of the stopped (4, 5) were then removed.
        let m = members(&[
            (0, RunState::Run),
            (1, RunState::Run),
            (2, RunState::Run),
            (3, RunState::Run),
            (6, RunState::Stop),
            (7, RunState::Stop),
        ]);
        let plan = plan_sync(&run(5), &m);
        assert_eq!(plan.start, vec![4]);
        assert!(plan.stop.is_empty());
    }

    #[test]
    fn test_restart_all_defers_scale_up() {
        let target = Target {
            restart_all: true,
            ..run(8)
        };
        let plan = plan_sync(&target, &running(5));
        assert!(plan.start.is_empty());
        assert!(plan.deferred);

        let plan = plan_sync(&target, &running(0));
        assert_eq!(plan.start.len(), 8);
        assert!(!plan.deferred);
    }

    #[test]
    fn test_restart_all_still_scales_down() {
        let target = Target {
            restart_all: true,
            ..run(2)
        };
        let plan = plan_sync(&target, &running(3));
        assert_eq!(plan.stop, vec![2]);
    }

    #[test]
    fn test_stop_state_stops_everything_live() {
        let target = Target {
            state: RunState::Stop,
            count: 3,
            restart_all: false,
        };
        let m = members(&[(0, RunState::Run), (1, RunState::Pause), (2, RunState::Stop)]);
        let plan = plan_sync(&target, &m);
        assert_eq!(plan.stop, vec![1, 0]);
        assert!(plan.resume.is_empty());
        assert!(plan.start.is_empty());
    }

    #[test]
    fn test_pause_only_touches_running() {
        let target = Target {
            state: RunState::Pause,
            count: 10,
            restart_all: false,
        };
        let m = members(&[(0, RunState::Run), (1, RunState::Pause), (2, RunState::Stop)]);
        let plan = plan_sync(&target, &m);
        assert_eq!(plan.pause, vec![0]);
        assert!(plan.start.is_empty());
        assert!(plan.stop.is_empty());
    }

    #[test]
    fn test_resume_below_desired_and_stop_surplus_paused() {
        let m = members(&[(0, RunState::Pause), (1, RunState::Pause), (2, RunState::Pause)]);
        let plan = plan_sync(&run(2), &m);
        assert_eq!(plan.resume, vec![0, 1]);
        assert_eq!(plan.stop, vec![2]);
        assert!(plan.start.is_empty());
    }

    #[test]
    fn test_never_stop_and_resume_same_member() {
        let m = members(&[(0, RunState::Pause), (1, RunState::Pause), (2, RunState::Run)]);
        let plan = plan_sync(&run(3), &m);
        assert_eq!(plan.resume, vec![0, 1]);
        assert!(plan.stop.is_empty());

        // Scale-down picks the highest live index; the resumed member survives.
        let m = members(&[(5, RunState::Run), (1, RunState::Pause), (6, RunState::Run)]);
        let plan = plan_sync(&run(2), &m);
        assert_eq!(plan.stop, vec![6]);
        assert_eq!(plan.resume, vec![1]);
    }

    #[rstest]
    #[case(RunState::Run, "\"run\"")]
    #[case(RunState::Pause, "\"pause\"")]
    #[case(RunState::Stop, "\"stop\"")]
    fn test_run_state_serde(#[case] state: RunState, #[case] json: &str) {
        assert_eq!(serde_json::to_string(&state).unwrap(), json);
        assert_eq!(serde_json::from_str::<RunState>(json).unwrap(), state);
        assert_eq!(format!("\"{state}\""), json);
    }

    #[test]
    fn test_backoff_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_within_range() {
        let policy = BackoffPolicy::default();
        for attempt in 0..8 {
            let base = policy.delay_without_jitter(attempt);
            let d = policy.delay(attempt).as_millis() as f64;
            assert!(d >= base * 0.75 - 1.0 && d <= base * 1.25 + 1.0);
        }
    }

    impl BackoffPolicy {
        fn delay_without_jitter(&self, attempt: u32) -> f64 {
            (self.base.as_millis() as f64 * 2.0_f64.powi(attempt as i32))
                .min(self.max.as_millis() as f64)
        }
    }

    fn arb_state() -> impl Strategy<Value = RunState> {
        prop_oneof![Just(RunState::Run), Just(RunState::Pause), Just(RunState::Stop)]
    }

    proptest! {
        #[test]
        fn prop_starts_never_reuse_held_indices(
            indices in proptest::collection::btree_set(0u32..20, 0..12),
            states in proptest::collection::vec(arb_state(), 12),
            count in 0u32..16,
        ) {
            let m: Vec<Member<u32>> = indices
                .iter()
                .zip(states.iter())
                .map(|(i, s)| Member { key: *i, index: *i, state: *s })
                .collect();
            let plan = plan_sync(&run(count), &m);
            for idx in &plan.start {
                prop_assert!(!indices.contains(idx));
                prop_assert!(*idx < count);
            }
            for key in &plan.stop {
                prop_assert!(!plan.resume.contains(key));
            }
        }

        #[test]
        fn prop_running_set_converges(count in 0u32..12, initial in 0u32..12) {
            // Apply plans, treating stops as immediately acknowledged.
            let mut m = running(initial);
            for _ in 0..3 {
                let plan = plan_sync(&run(count), &m);
                m.retain(|x| !plan.stop.contains(&x.key));
                for idx in plan.start {
                    m.push(Member { key: idx, index: idx, state: RunState::Run });
                }
            }
            let mut indices: Vec<u32> = m.iter().map(|x| x.index).collect();
            indices.sort_unstable();
            prop_assert_eq!(indices, (0..count).collect::<Vec<_>>());
        }

        #[test]
        fn prop_scale_down_is_monotonic(from in 0u32..16, to in 0u32..16) {
            let plan = plan_sync(&run(to), &running(from));
            if to < from {
                prop_assert!(plan.start.is_empty());
                prop_assert_eq!(plan.stop.len() as u32, from - to);
                prop_assert!(plan.stop.iter().all(|k| *k >= to));
            }
        }
    }
}
