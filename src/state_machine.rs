//! Replica role state machine
//!
//! Every lifecycle event for a replica passes through here, one at a
//! time under a single lock, so role transitions are totally ordered.
//! Role changes and closes that cannot complete while transactions are
//! still draining or the copy pump is still running are parked and
//! completed exactly once when the blocking condition clears, through a
//! consumed one-shot channel. Illegal transitions are caller contract
//! breaches and abort the process.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Mutex;

use crate::errors::{StoreError, StoreResult};

/// Current role and activity of a replica. Exactly one state is current
/// at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    PrimaryActive,
    PrimaryPassive,
    PrimaryChangePending,
    PrimaryClosePending,
    SecondaryActive,
    SecondaryPassive,
    SecondaryChangePending,
    SecondaryClosePending,
    Closed,
}

impl ReplicaState {
    pub fn is_primary(self) -> bool {
        matches!(
            self,
            ReplicaState::PrimaryActive
                | ReplicaState::PrimaryPassive
                | ReplicaState::PrimaryChangePending
                | ReplicaState::PrimaryClosePending
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaRole {
    None,
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a fresh store; fails if data already exists.
    CreateNew,
    /// Open existing data, creating an empty store when none exists.
    OpenExisting,
}

/// Events accepted by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    Open(OpenMode),
    ChangeRole(ReplicaRole),
    Close,
    StartTransaction,
    FinishTransaction,
    CopyPumpClosed,
}

/// Result of posting an event.
#[derive(Debug)]
pub enum EventOutcome {
    /// The event completed inline and the replica is now in this state.
    Completed(ReplicaState),
    /// The event is parked; the receiver yields the final result exactly
    /// once when the blocking condition clears.
    Parked(mpsc::Receiver<StoreResult<ReplicaState>>),
}

impl EventOutcome {
    /// Blocks until the event completes, inline or parked.
    pub fn wait(self) -> StoreResult<ReplicaState> {
        match self {
            EventOutcome::Completed(state) => Ok(state),
            EventOutcome::Parked(rx) => rx
                .recv()
                .map_err(|_| StoreError::StoreFatal("parked event dropped".into()))?,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParkedKind {
    ChangeToPrimary,
    ChangeToSecondary,
    Close,
}

struct ParkedOp {
    kind: ParkedKind,
    done: mpsc::Sender<StoreResult<ReplicaState>>,
}

struct Inner {
    state: ReplicaState,
    tx_count: usize,
    parked: VecDeque<ParkedOp>,
}

pub struct ReplicaStateMachine {
    inner: Mutex<Inner>,
}

impl Default for ReplicaStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaStateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ReplicaState::Closed,
                tx_count: 0,
                parked: VecDeque::new(),
            }),
        }
    }

    pub fn current_state(&self) -> ReplicaState {
        self.inner
            .lock()
            .map(|i| i.state)
            .unwrap_or(ReplicaState::Closed)
    }

    pub fn active_transaction_count(&self) -> usize {
        self.inner.lock().map(|i| i.tx_count).unwrap_or(0)
    }

    /// Posts one event. Transient conditions come back as `Err`; illegal
    /// transitions panic because they indicate a caller invariant
    /// violation, not a runtime condition.
    pub fn post_event(&self, event: StoreEvent) -> StoreResult<EventOutcome> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::StoreFatal("state machine lock poisoned".into()))?;

        match event {
            StoreEvent::Open(_) => {
                assert_eq!(
                    inner.state,
                    ReplicaState::Closed,
                    "Open posted while replica is in state {:?}",
                    inner.state
                );
                inner.state = ReplicaState::SecondaryPassive;
                Ok(EventOutcome::Completed(inner.state))
            }

            StoreEvent::ChangeRole(ReplicaRole::None) => {
                // Replica is being dropped; storage cleanup happens at Close.
                Ok(EventOutcome::Completed(inner.state))
            }

            StoreEvent::ChangeRole(ReplicaRole::Primary) => match inner.state {
                ReplicaState::SecondaryPassive => {
                    inner.state = ReplicaState::PrimaryPassive;
                    Ok(EventOutcome::Completed(inner.state))
                }
                ReplicaState::SecondaryActive => {
                    // Copy pump must close before the promotion completes.
                    inner.state = ReplicaState::SecondaryChangePending;
                    Ok(EventOutcome::Parked(
                        Self::park(&mut inner, ParkedKind::ChangeToPrimary),
                    ))
                }
                ReplicaState::SecondaryChangePending | ReplicaState::PrimaryChangePending => Ok(
                    EventOutcome::Parked(Self::park(&mut inner, ParkedKind::ChangeToPrimary)),
                ),
                ReplicaState::PrimaryPassive | ReplicaState::PrimaryActive => {
                    Ok(EventOutcome::Completed(inner.state))
                }
                other => panic!("ChangeRole(Primary) posted in state {:?}", other),
            },

            StoreEvent::ChangeRole(ReplicaRole::Secondary) => match inner.state {
                ReplicaState::PrimaryPassive => {
                    inner.state = ReplicaState::SecondaryActive;
                    Ok(EventOutcome::Completed(inner.state))
                }
                ReplicaState::PrimaryActive => {
                    // Outstanding transactions must drain before demotion.
                    inner.state = ReplicaState::PrimaryChangePending;
                    Ok(EventOutcome::Parked(
                        Self::park(&mut inner, ParkedKind::ChangeToSecondary),
                    ))
                }
                ReplicaState::PrimaryChangePending | ReplicaState::SecondaryChangePending => Ok(
                    EventOutcome::Parked(Self::park(&mut inner, ParkedKind::ChangeToSecondary)),
                ),
                ReplicaState::SecondaryPassive => {
                    // Idle secondary: the replication pump attaches.
                    inner.state = ReplicaState::SecondaryActive;
                    Ok(EventOutcome::Completed(inner.state))
                }
                ReplicaState::SecondaryActive => Ok(EventOutcome::Completed(inner.state)),
                other => panic!("ChangeRole(Secondary) posted in state {:?}", other),
            },

            StoreEvent::Close => match inner.state {
                ReplicaState::Closed => Ok(EventOutcome::Completed(ReplicaState::Closed)),
                ReplicaState::PrimaryPassive | ReplicaState::SecondaryPassive => {
                    inner.state = ReplicaState::Closed;
                    Ok(EventOutcome::Completed(inner.state))
                }
                ReplicaState::PrimaryActive => {
                    inner.state = ReplicaState::PrimaryClosePending;
                    Ok(EventOutcome::Parked(Self::park(&mut inner, ParkedKind::Close)))
                }
                ReplicaState::SecondaryActive => {
                    inner.state = ReplicaState::SecondaryClosePending;
                    Ok(EventOutcome::Parked(Self::park(&mut inner, ParkedKind::Close)))
                }
                ReplicaState::PrimaryChangePending
                | ReplicaState::SecondaryChangePending
                | ReplicaState::PrimaryClosePending
                | ReplicaState::SecondaryClosePending => Ok(EventOutcome::Parked(
                    Self::park(&mut inner, ParkedKind::Close),
                )),
            },

            StoreEvent::StartTransaction => match inner.state {
                ReplicaState::PrimaryPassive | ReplicaState::PrimaryActive => {
                    inner.tx_count += 1;
                    inner.state = ReplicaState::PrimaryActive;
                    Ok(EventOutcome::Completed(inner.state))
                }
                ReplicaState::SecondaryPassive | ReplicaState::SecondaryActive => {
                    Err(StoreError::NotPrimary)
                }
                ReplicaState::PrimaryChangePending | ReplicaState::SecondaryChangePending => {
                    Err(StoreError::ReconfigurationPending)
                }
                ReplicaState::PrimaryClosePending
                | ReplicaState::SecondaryClosePending
                | ReplicaState::Closed => Err(StoreError::ObjectClosed),
            },

            StoreEvent::FinishTransaction => {
                assert!(
                    inner.tx_count > 0,
                    "FinishTransaction posted with no outstanding transaction in state {:?}",
                    inner.state
                );
                inner.tx_count -= 1;
                if inner.tx_count == 0 {
                    if inner.state == ReplicaState::PrimaryActive {
                        inner.state = ReplicaState::PrimaryPassive;
                    }
                    Self::resolve_parked(&mut inner);
                }
                Ok(EventOutcome::Completed(inner.state))
            }

            StoreEvent::CopyPumpClosed => {
                match inner.state {
                    ReplicaState::SecondaryActive => {
                        inner.state = ReplicaState::SecondaryPassive;
                    }
                    ReplicaState::SecondaryChangePending | ReplicaState::SecondaryClosePending => {
                        // Pending op resolves below.
                    }
                    other => panic!("CopyPumpClosed posted in state {:?}", other),
                }
                Self::resolve_parked(&mut inner);
                Ok(EventOutcome::Completed(inner.state))
            }
        }
    }

    fn park(inner: &mut Inner, kind: ParkedKind) -> mpsc::Receiver<StoreResult<ReplicaState>> {
        let (tx, rx) = mpsc::channel();
        inner.parked.push_back(ParkedOp { kind, done: tx });
        rx
    }

    /// Completes queued operations, in order, as long as the head can
    /// make progress against the current state.
    fn resolve_parked(inner: &mut Inner) {
        while let Some(head) = inner.parked.front() {
            let next_state = match (inner.state, head.kind) {
                (ReplicaState::PrimaryChangePending, ParkedKind::ChangeToSecondary)
                    if inner.tx_count == 0 =>
                {
                    Some(ReplicaState::SecondaryActive)
                }
                (ReplicaState::SecondaryChangePending, ParkedKind::ChangeToPrimary) => {
                    Some(ReplicaState::PrimaryPassive)
                }
                (ReplicaState::PrimaryClosePending, ParkedKind::Close) if inner.tx_count == 0 => {
                    Some(ReplicaState::Closed)
                }
                (ReplicaState::SecondaryClosePending, ParkedKind::Close) => {
                    Some(ReplicaState::Closed)
                }
                // A later request re-evaluated against the state the
                // previous one produced.
                (ReplicaState::PrimaryPassive, ParkedKind::ChangeToSecondary) => {
                    Some(ReplicaState::SecondaryActive)
                }
                (ReplicaState::SecondaryPassive, ParkedKind::ChangeToPrimary) => {
                    Some(ReplicaState::PrimaryPassive)
                }
                (ReplicaState::PrimaryPassive, ParkedKind::Close)
                | (ReplicaState::SecondaryPassive, ParkedKind::Close) => {
                    Some(ReplicaState::Closed)
                }
                (ReplicaState::SecondaryActive, ParkedKind::ChangeToPrimary) => {
                    inner.state = ReplicaState::SecondaryChangePending;
                    None
                }
                (ReplicaState::PrimaryActive, ParkedKind::ChangeToSecondary) => {
                    inner.state = ReplicaState::PrimaryChangePending;
                    None
                }
                (ReplicaState::SecondaryActive, ParkedKind::Close) => {
                    inner.state = ReplicaState::SecondaryClosePending;
                    None
                }
                (ReplicaState::Closed, _) => {
                    let op = inner.parked.pop_front().unwrap();
                    let _ = op.done.send(Err(StoreError::ObjectClosed));
                    continue;
                }
                _ => None,
            };

            match next_state {
                Some(state) => {
                    inner.state = state;
                    let op = inner.parked.pop_front().unwrap();
                    let _ = op.done.send(Ok(state));
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(sm: &ReplicaStateMachine) {
        sm.post_event(StoreEvent::Open(OpenMode::OpenExisting))
            .unwrap();
    }

    fn promote(sm: &ReplicaStateMachine) {
        match sm
            .post_event(StoreEvent::ChangeRole(ReplicaRole::Primary))
            .unwrap()
        {
            EventOutcome::Completed(_) => {}
            EventOutcome::Parked(_) => panic!("promotion should complete inline"),
        }
    }

    #[test]
    fn test_open_then_promote() {
        let sm = ReplicaStateMachine::new();
        assert_eq!(sm.current_state(), ReplicaState::Closed);
        open(&sm);
        assert_eq!(sm.current_state(), ReplicaState::SecondaryPassive);
        promote(&sm);
        assert_eq!(sm.current_state(), ReplicaState::PrimaryPassive);
    }

    #[test]
    fn test_transactions_toggle_active() {
        let sm = ReplicaStateMachine::new();
        open(&sm);
        promote(&sm);

        sm.post_event(StoreEvent::StartTransaction).unwrap();
        sm.post_event(StoreEvent::StartTransaction).unwrap();
        assert_eq!(sm.current_state(), ReplicaState::PrimaryActive);

        sm.post_event(StoreEvent::FinishTransaction).unwrap();
        assert_eq!(sm.current_state(), ReplicaState::PrimaryActive);
        sm.post_event(StoreEvent::FinishTransaction).unwrap();
        assert_eq!(sm.current_state(), ReplicaState::PrimaryPassive);
    }

    #[test]
    fn test_start_transaction_rejected_by_role() {
        let sm = ReplicaStateMachine::new();
        open(&sm);
        assert!(matches!(
            sm.post_event(StoreEvent::StartTransaction).unwrap_err(),
            StoreError::NotPrimary
        ));

        let sm = ReplicaStateMachine::new();
        assert!(matches!(
            sm.post_event(StoreEvent::StartTransaction).unwrap_err(),
            StoreError::ObjectClosed
        ));
    }

    #[test]
    fn test_demotion_waits_for_transactions() {
        let sm = ReplicaStateMachine::new();
        open(&sm);
        promote(&sm);
        sm.post_event(StoreEvent::StartTransaction).unwrap();

        let outcome = sm
            .post_event(StoreEvent::ChangeRole(ReplicaRole::Secondary))
            .unwrap();
        let rx = match outcome {
            EventOutcome::Parked(rx) => rx,
            EventOutcome::Completed(_) => panic!("demotion should park behind transaction"),
        };
        assert_eq!(sm.current_state(), ReplicaState::PrimaryChangePending);

        // New writes are refused while the change is pending.
        assert!(matches!(
            sm.post_event(StoreEvent::StartTransaction).unwrap_err(),
            StoreError::ReconfigurationPending
        ));

        sm.post_event(StoreEvent::FinishTransaction).unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), ReplicaState::SecondaryActive);
    }

    #[test]
    fn test_promotion_waits_for_copy_pump() {
        let sm = ReplicaStateMachine::new();
        open(&sm);
        promote(&sm);
        // Demote so the pump is considered running.
        sm.post_event(StoreEvent::ChangeRole(ReplicaRole::Secondary))
            .unwrap();
        assert_eq!(sm.current_state(), ReplicaState::SecondaryActive);

        let rx = match sm
            .post_event(StoreEvent::ChangeRole(ReplicaRole::Primary))
            .unwrap()
        {
            EventOutcome::Parked(rx) => rx,
            EventOutcome::Completed(_) => panic!("promotion should park behind pump"),
        };

        sm.post_event(StoreEvent::CopyPumpClosed).unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), ReplicaState::PrimaryPassive);
    }

    #[test]
    fn test_queued_role_changes_resolve_in_order() {
        let sm = ReplicaStateMachine::new();
        open(&sm);
        promote(&sm);
        sm.post_event(StoreEvent::StartTransaction).unwrap();

        let first = match sm
            .post_event(StoreEvent::ChangeRole(ReplicaRole::Secondary))
            .unwrap()
        {
            EventOutcome::Parked(rx) => rx,
            EventOutcome::Completed(_) => panic!("should park"),
        };
        let second = match sm
            .post_event(StoreEvent::ChangeRole(ReplicaRole::Primary))
            .unwrap()
        {
            EventOutcome::Parked(rx) => rx,
            EventOutcome::Completed(_) => panic!("should queue behind first"),
        };

        sm.post_event(StoreEvent::FinishTransaction).unwrap();

        // First lands on SecondaryActive, second parks again behind the
        // pump and resolves when it closes.
        assert_eq!(first.recv().unwrap().unwrap(), ReplicaState::SecondaryActive);
        sm.post_event(StoreEvent::CopyPumpClosed).unwrap();
        assert_eq!(second.recv().unwrap().unwrap(), ReplicaState::PrimaryPassive);
    }

    #[test]
    fn test_close_waits_for_transactions() {
        let sm = ReplicaStateMachine::new();
        open(&sm);
        promote(&sm);
        sm.post_event(StoreEvent::StartTransaction).unwrap();

        let rx = match sm.post_event(StoreEvent::Close).unwrap() {
            EventOutcome::Parked(rx) => rx,
            EventOutcome::Completed(_) => panic!("close should park behind transaction"),
        };
        assert_eq!(sm.current_state(), ReplicaState::PrimaryClosePending);

        sm.post_event(StoreEvent::FinishTransaction).unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), ReplicaState::Closed);
    }

    #[test]
    fn test_change_role_none_short_circuits() {
        let sm = ReplicaStateMachine::new();
        open(&sm);
        let outcome = sm
            .post_event(StoreEvent::ChangeRole(ReplicaRole::None))
            .unwrap();
        assert!(matches!(
            outcome,
            EventOutcome::Completed(ReplicaState::SecondaryPassive)
        ));
    }

    #[test]
    #[should_panic(expected = "FinishTransaction")]
    fn test_unbalanced_finish_asserts() {
        let sm = ReplicaStateMachine::new();
        open(&sm);
        promote(&sm);
        let _ = sm.post_event(StoreEvent::FinishTransaction);
    }
}
