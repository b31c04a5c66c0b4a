use crate::types::{AddResult, EditAtResult, EditId, NewFocus, StateId};

/// Lifecycle of the document state as seen from the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No `Init` has completed yet.
    Uninitialized,
    /// The prover is live; `tip` is the state new sentences go on top of.
    Ready { tip: StateId },
    /// The session quit or the prover died.
    Closed,
}

/// How an `Edit_at` moved the tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAtOutcome {
    /// Plain rewind: everything after `tip` is abandoned.
    Rewound { tip: StateId },
    /// The target lies inside a finished proof; coqtop opened that branch.
    FocusChanged(NewFocus),
}

/// Tracks the tip state id and open foci across calls.
#[derive(Debug, Clone)]
pub struct EditTracker {
    phase: Phase,
    focus_stack: Vec<NewFocus>,
    last_unfocused: Option<StateId>,
    next_edit_id: EditId,
}

impl Default for EditTracker {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
            focus_stack: Vec::new(),
            last_unfocused: None,
            next_edit_id: -1,
        }
    }
}

impl EditTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tip(&self) -> Option<StateId> {
        match self.phase {
            Phase::Ready { tip } => Some(tip),
            _ => None,
        }
    }

    /// Open foci, innermost last.
    pub fn focus_stack(&self) -> &[NewFocus] {
        &self.focus_stack
    }

    /// Branch coqtop most recently parked to process an `Add`.
    pub fn last_unfocused(&self) -> Option<StateId> {
        self.last_unfocused
    }

    /// A fresh caller edit id. Ids count down from -1 and never repeat.
    pub fn next_edit_id(&mut self) -> EditId {
        let id = self.next_edit_id;
        self.next_edit_id -= 1;
        id
    }

    pub fn on_init(&mut self, state_id: StateId) {
        self.phase = Phase::Ready { tip: state_id };
        self.focus_stack.clear();
        self.last_unfocused = None;
    }

    pub fn on_add(&mut self, result: &AddResult) {
        self.phase = Phase::Ready {
            tip: result.state_id,
        };
        if result.unfocused_state_id.is_some() {
            self.last_unfocused = result.unfocused_state_id;
        }
    }

    pub fn on_edit_at(&mut self, target: StateId, result: &EditAtResult) -> EditAtOutcome {
        if let Some(top) = self.focus_stack.last() {
            if target == top.qed_state_id || target == top.old_tip {
                self.focus_stack.pop();
            }
        }
        match result.new_focus {
            Some(focus) => {
                self.phase = Phase::Ready {
                    tip: focus.state_id,
                };
                self.focus_stack.push(focus);
                EditAtOutcome::FocusChanged(focus)
            }
            None => {
                self.phase = Phase::Ready { tip: target };
                EditAtOutcome::Rewound { tip: target }
            }
        }
    }

    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.focus_stack.clear();
    }
}
