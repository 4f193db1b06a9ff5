//! Selection coordinator: tracks which conversation is active and which
//! transition epoch is current.
//!
//! Every select starts a new epoch; results of asynchronous fetches carry
//! the epoch they were started under, and results from a superseded epoch
//! are discarded without touching state. This is the sole defence against
//! the select-A-then-quickly-select-B race.

use crate::hlog;
use crate::types::{ConversationRef, SessionState};

/// Where the coordinator currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionPhase {
    /// No conversation selected.
    Idle,
    /// A selection is underway; fetches for this target are in flight.
    Transitioning(ConversationRef),
    /// Selection complete; sends are permitted.
    Active(ConversationRef),
}

/// Handed out by [`SelectionCoordinator::begin_select`]; the engine threads
/// the epoch through its fetch futures and reports back with it.
#[derive(Debug, Clone)]
pub struct TransitionTicket {
    pub epoch: u64,
    pub target: ConversationRef,
    /// Group targets need a membership fetch before history; private ones
    /// go straight to history.
    pub needs_membership: bool,
}

/// What a reported fetch step did to the transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Step accepted, transition still in flight.
    Progress,
    /// Transition finished; the conversation is now active.
    Completed(ConversationRef),
    /// The epoch was superseded; the result was discarded.
    Stale,
}

pub struct SelectionCoordinator {
    phase: SelectionPhase,
    epoch: u64,
}

impl SelectionCoordinator {
    pub fn new() -> Self {
        Self {
            phase: SelectionPhase::Idle,
            epoch: 0,
        }
    }

    pub fn phase(&self) -> &SelectionPhase {
        &self.phase
    }

    pub fn active(&self) -> Option<&ConversationRef> {
        match &self.phase {
            SelectionPhase::Active(target) => Some(target),
            _ => None,
        }
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    /// Start selecting `target`. Returns None when the target is already
    /// active (idempotent re-select, no fetches). Otherwise the session's
    /// active conversation is set immediately, so the channel invariant
    /// holds throughout the transition, and fetches are keyed to the new
    /// epoch.
    pub fn begin_select(
        &mut self,
        state: &mut SessionState,
        target: ConversationRef,
    ) -> Option<TransitionTicket> {
        if let SelectionPhase::Active(current) = &self.phase {
            if *current == target {
                hlog!("select: {} already active", target);
                return None;
            }
        }
        self.epoch += 1;
        let needs_membership = target.is_group();
        self.phase = SelectionPhase::Transitioning(target.clone());
        state.active = Some(target.clone());
        hlog!("select: epoch {} -> {}", self.epoch, target);
        Some(TransitionTicket {
            epoch: self.epoch,
            target,
            needs_membership,
        })
    }

    /// Membership arrived for a group target.
    pub fn membership_loaded(&mut self, epoch: u64) -> StepOutcome {
        if !self.is_current(epoch) {
            return StepOutcome::Stale;
        }
        StepOutcome::Progress
    }

    /// History arrived; the transition completes.
    pub fn history_loaded(&mut self, epoch: u64) -> StepOutcome {
        if !self.is_current(epoch) {
            return StepOutcome::Stale;
        }
        self.complete()
    }

    /// The history fetch was skipped (non-member group); the transition
    /// completes with an empty timeline.
    pub fn history_skipped(&mut self, epoch: u64) -> StepOutcome {
        if !self.is_current(epoch) {
            return StepOutcome::Stale;
        }
        self.complete()
    }

    /// A fetch for the current epoch failed; abort the transition back to
    /// Idle. Returns false when the epoch was already superseded.
    pub fn fail(&mut self, state: &mut SessionState, epoch: u64) -> bool {
        if !self.is_current(epoch) {
            return false;
        }
        self.epoch += 1;
        self.phase = SelectionPhase::Idle;
        state.active = None;
        true
    }

    /// Deselect without selecting anything else.
    pub fn clear(&mut self, state: &mut SessionState) {
        self.epoch += 1;
        self.phase = SelectionPhase::Idle;
        state.active = None;
    }

    fn complete(&mut self) -> StepOutcome {
        match std::mem::replace(&mut self.phase, SelectionPhase::Idle) {
            SelectionPhase::Transitioning(target) => {
                self.phase = SelectionPhase::Active(target.clone());
                hlog!("select: epoch {} active: {}", self.epoch, target);
                StepOutcome::Completed(target)
            }
            other => {
                self.phase = other;
                StepOutcome::Progress
            }
        }
    }
}

impl Default for SelectionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
