//! Threshold-driven health state machine.
//!
//! A node starts BAD. Its first probe result is applied directly, so a
//! reachable node becomes eligible as soon as the first probe completes.
//! After that, `unhealthy_threshold` consecutive failures flip GOOD to BAD
//! and `healthy_threshold` consecutive successes flip BAD to GOOD. Both
//! default to 1, so out of the box every probe result is decisive.

use crate::backend::NodeHealth;

/// A change of health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: NodeHealth,
    pub to: NodeHealth,
}

/// Per-node health tracker, owned by the node's probe task.
#[derive(Debug)]
pub struct HealthTracker {
    current: NodeHealth,
    probed: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            current: NodeHealth::Bad,
            probed: false,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
        }
    }

    /// Current state.
    pub fn state(&self) -> NodeHealth {
        self.current
    }

    /// Consecutive failures seen since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a successful probe. Returns the transition, if one happened.
    pub fn record_success(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);

        let first = !std::mem::replace(&mut self.probed, true);
        if self.current == NodeHealth::Bad
            && (first || self.consecutive_successes >= self.healthy_threshold)
        {
            return Some(self.flip(NodeHealth::Good));
        }
        None
    }

    /// Record a failed probe. Returns the transition, if one happened.
    pub fn record_failure(&mut self) -> Option<Transition> {
        self.consecutive_successes = 0;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.probed = true;

        if self.current == NodeHealth::Good && self.consecutive_failures >= self.unhealthy_threshold {
            return Some(self.flip(NodeHealth::Bad));
        }
        None
    }

    fn flip(&mut self, to: NodeHealth) -> Transition {
        let from = std::mem::replace(&mut self.current, to);
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        Transition { from, to }
    }
}
