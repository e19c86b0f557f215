//! Pure, serializable, event-driven state machine kernel.
//!
//! Definitions are pure: `(state, event, context) -> (next_state, actions,
//! context')`. Actions are declarative labels, not functions — side effects
//! happen in the hosting controller, which drains `context.pending_actions`
//! after every transition. This is the explicit typed queue that replaces
//! the ambient global slots of the system this kernel is modeled after.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A transition record kept in a snapshot's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: String,
    pub event: String,
    pub to: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// A serializable snapshot of a running machine: current state, opaque
/// context, and a bounded transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<C> {
    pub value: String,
    pub context: C,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl<C> Snapshot<C> {
    pub fn new(initial_state: impl Into<String>, context: C) -> Self {
        Self {
            value: initial_state.into(),
            context,
            history: Vec::new(),
        }
    }

    /// Record a transition in history, capping it so snapshots don't grow
    /// unboundedly (controllers additionally keep their own `transitions`
    /// table for the last-50 query).
    pub fn record(&mut self, from: &str, event: &str, to: &str) {
        self.history.push(TransitionRecord {
            from: from.to_string(),
            event: event.to_string(),
            to: to.to_string(),
            at: chrono::Utc::now(),
        });
        const MAX_HISTORY: usize = 200;
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(0..excess);
        }
    }
}

/// A declarative action label plus an opaque payload, appended to a
/// machine context's `pending_actions` queue and drained by the hosting
/// controller after each transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl PendingAction {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Shared behavior every machine context provides so the generic kernel
/// helpers (`record`, pending-action draining) can operate on it without
/// knowing the controller-specific fields.
pub trait MachineContext {
    fn pending_actions_mut(&mut self) -> &mut Vec<PendingAction>;

    fn push_action(&mut self, kind: impl Into<String>, payload: Value) {
        self.pending_actions_mut()
            .push(PendingAction::new(kind, payload));
    }

    fn drain_actions(&mut self) -> Vec<PendingAction> {
        std::mem::take(self.pending_actions_mut())
    }
}

/// Result of applying one event to a machine: the machine is mutated
/// in-place (state transitions commit context changes immediately,
/// consistent with §5's "between suspensions, transitions are atomic"),
/// and the caller is told whether the event was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, Default)]
    struct TestContext {
        pending_actions: Vec<PendingAction>,
        counter: i32,
    }

    impl MachineContext for TestContext {
        fn pending_actions_mut(&mut self) -> &mut Vec<PendingAction> {
            &mut self.pending_actions
        }
    }

    #[test]
    fn snapshot_records_history_and_caps_it() {
        let mut snap = Snapshot::new("idle", TestContext::default());
        for i in 0..250 {
            snap.record("idle", &format!("EVT{i}"), "idle");
        }
        assert_eq!(snap.history.len(), 200);
        assert_eq!(snap.history.last().unwrap().event, "EVT249");
    }

    #[test]
    fn pending_actions_drain_clears_queue() {
        let mut ctx = TestContext::default();
        ctx.push_action("check_tools", json!({"issue_id": "x"}));
        ctx.push_action("execute_task", json!({}));
        assert_eq!(ctx.pending_actions.len(), 2);
        let drained = ctx.drain_actions();
        assert_eq!(drained.len(), 2);
        assert_eq!(ctx.pending_actions.len(), 0);
        assert_eq!(drained[0].kind, "check_tools");
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let mut snap = Snapshot::new("executing", TestContext { pending_actions: vec![], counter: 7 });
        snap.record("preparing", "TOOLS_READY", "executing");
        let serialized = serde_json::to_string(&snap).unwrap();
        let restored: Snapshot<TestContext> = serde_json::from_str(&serialized).unwrap();
        assert_eq!(restored.value, "executing");
        assert_eq!(restored.context.counter, 7);
        assert_eq!(restored.history.len(), 1);
    }
}
