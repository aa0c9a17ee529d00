//! The MET signalling protocol state machine (spec §4.2).
//!
//! A 2-D constant table indexed by `(state, signal_id)` plus a small
//! transition function, per the design note in spec §9: dense state,
//! dense signal space, no exceptions.

use crate::controller::{ControllerId, MAX_CONTROLLERS};
use crate::error::MetError;
use crate::signal::{cargo_in_range, ready_cargo, wait_cargo, SignalId, NUM_SIGNALS};

/// The four server-observed protocol states (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    WaitReadyOrStop,
    TrialInit,
    WaitMstart,
    Run,
}

const NUM_STATES: usize = 4;

/// `ILLEGAL[state][signal]` is `true` when `signal` is illegal while the
/// router is in `state`. Transcribed from the table in spec §4.2;
/// confirmed against `original_source/c/metsigsrv.c`'s `MSIGIL` table.
///
/// Columns, in `SignalId` order: null, ready, start, stop, wait, quit,
/// state, target, reward, rdtype, calibrate.
#[rustfmt::skip]
const ILLEGAL: [[bool; NUM_SIGNALS]; NUM_STATES] = [
    // WaitReadyOrStop
    [false, false, true,  false, false, false, false, false, false, false, false],
    // TrialInit
    [false, false, true,  false, false, false, false, false, false, false, false],
    // WaitMstart
    [false, true,  true,  true,  false, false, true,  true,  false, false, false],
    // Run
    [false, true,  true,  false, false, false, false, false, false, false, false],
];

pub fn is_legal(state: ProtocolState, id: SignalId) -> bool {
    !ILLEGAL[state as usize][id.index()]
}

/// Whether an accepted signal requires the router to synthesize `mstart`
/// in the very same broadcast cycle (spec §4.1 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Accepted,
    AcceptedAndMstartRequired,
}

/// Server-side protocol state plus the in-flight trial-init reply bitmask.
///
/// `pending_replies` is a `u16` bitmask keyed by `ControllerId`, not a
/// `HashSet`: with `N <= MAX_CONTROLLERS` this is the arena-with-index
/// style the per-controller id was designed for (spec §9).
#[derive(Debug, Clone)]
pub struct RouterState {
    state: ProtocolState,
    pending_replies: u16,
    n: u8,
}

impl RouterState {
    pub fn new(n: u8) -> Self {
        assert!(n >= 1 && n <= MAX_CONTROLLERS, "N must be 1..=15");
        RouterState {
            state: ProtocolState::WaitReadyOrStop,
            pending_replies: 0,
            n,
        }
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    fn validate(&self, id: SignalId, cargo: u16) -> Result<(), MetError> {
        if !is_legal(self.state, id) {
            return Err(MetError::Pbsig);
        }
        if !cargo_in_range(id, cargo) {
            return Err(MetError::Pbcrg);
        }
        Ok(())
    }

    /// Validate `(source, id, cargo)` against the current state and apply
    /// any resulting transition.
    ///
    /// Time bounds and `source == 0` checks are the router's job (they
    /// depend on which pipe the signal was read from, not on protocol
    /// state), so they are not repeated here.
    pub fn apply(
        &mut self,
        source: ControllerId,
        id: SignalId,
        cargo: u16,
    ) -> Result<SignalOutcome, MetError> {
        self.validate(id, cargo)?;

        match id {
            SignalId::Ready => self.apply_ready(source, cargo),
            SignalId::Wait => {
                self.apply_wait(cargo);
                Ok(SignalOutcome::Accepted)
            }
            SignalId::Stop => {
                if self.state == ProtocolState::Run {
                    self.state = ProtocolState::WaitReadyOrStop;
                }
                Ok(SignalOutcome::Accepted)
            }
            // Null, Start (never reaches here legally for a child), State,
            // Target, Reward, Rdtype, Calibrate, Quit: legal-but-inert,
            // or handled by the router's own loop-exit logic (Quit).
            _ => Ok(SignalOutcome::Accepted),
        }
    }

    fn apply_ready(&mut self, source: ControllerId, cargo: u16) -> Result<SignalOutcome, MetError> {
        if cargo == ready_cargo::TRIGGER {
            if self.state == ProtocolState::WaitReadyOrStop {
                self.state = ProtocolState::TrialInit;
                self.pending_replies = 0;
            }
            return Ok(SignalOutcome::Accepted);
        }

        // cargo == REPLY (the only other legal value, per cargo_in_range).
        if self.state != ProtocolState::TrialInit {
            // Legal per the table in WaitReadyOrStop too, but inert there:
            // a reply with no preceding trigger causes no state change.
            return Ok(SignalOutcome::Accepted);
        }

        let bit = 1u16 << (source.get() - 1);
        if self.pending_replies & bit != 0 {
            return Err(MetError::Pbsig); // duplicate mready(reply)
        }
        self.pending_replies |= bit;

        if self.pending_replies.count_ones() as u8 == self.n {
            self.pending_replies = 0;
            // wait-mstart is instantaneous from the router's point of view:
            // the synthesized mstart is appended to this same batch, so any
            // later signal in this cycle must already be validated against
            // `run`.
            self.state = ProtocolState::Run;
            return Ok(SignalOutcome::AcceptedAndMstartRequired);
        }

        Ok(SignalOutcome::Accepted)
    }

    fn apply_wait(&mut self, cargo: u16) {
        match self.state {
            ProtocolState::TrialInit | ProtocolState::WaitMstart => {
                self.state = ProtocolState::WaitReadyOrStop;
                self.pending_replies = 0;
            }
            ProtocolState::Run if cargo == wait_cargo::ABORT => {
                self.state = ProtocolState::WaitReadyOrStop;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(n: u8) -> ControllerId {
        ControllerId::child(n).unwrap()
    }

    #[test]
    fn happy_trial_two_children() {
        let mut rs = RouterState::new(2);
        assert_eq!(rs.state(), ProtocolState::WaitReadyOrStop);

        let out = rs
            .apply(cid(1), SignalId::Ready, ready_cargo::TRIGGER)
            .unwrap();
        assert_eq!(out, SignalOutcome::Accepted);
        assert_eq!(rs.state(), ProtocolState::TrialInit);

        let out = rs
            .apply(cid(1), SignalId::Ready, ready_cargo::REPLY)
            .unwrap();
        assert_eq!(out, SignalOutcome::Accepted);
        assert_eq!(rs.state(), ProtocolState::TrialInit);

        let out = rs
            .apply(cid(2), SignalId::Ready, ready_cargo::REPLY)
            .unwrap();
        assert_eq!(out, SignalOutcome::AcceptedAndMstartRequired);
        assert_eq!(rs.state(), ProtocolState::Run);
    }

    #[test]
    fn duplicate_reply_is_a_breach() {
        let mut rs = RouterState::new(2);
        rs.apply(cid(1), SignalId::Ready, ready_cargo::TRIGGER).unwrap();
        rs.apply(cid(2), SignalId::Ready, ready_cargo::REPLY).unwrap();
        let err = rs
            .apply(cid(2), SignalId::Ready, ready_cargo::REPLY)
            .unwrap_err();
        assert_eq!(err, MetError::Pbsig);
    }

    #[test]
    fn abort_during_trial_init_resets_without_mstart() {
        let mut rs = RouterState::new(2);
        rs.apply(cid(1), SignalId::Ready, ready_cargo::TRIGGER).unwrap();
        let out = rs
            .apply(cid(1), SignalId::Wait, wait_cargo::ABORT)
            .unwrap();
        assert_eq!(out, SignalOutcome::Accepted);
        assert_eq!(rs.state(), ProtocolState::WaitReadyOrStop);
    }

    #[test]
    fn mstart_from_a_child_is_always_illegal() {
        for n in [1u8, 2] {
            let mut rs = RouterState::new(2);
            if n == 2 {
                rs.apply(cid(1), SignalId::Ready, ready_cargo::TRIGGER).unwrap();
            }
            let err = rs.apply(cid(1), SignalId::Start, 1).unwrap_err();
            assert_eq!(err, MetError::Pbsig);
        }
    }

    #[test]
    fn run_plus_stop_returns_to_wait_ready_or_stop() {
        let mut rs = RouterState::new(1);
        rs.apply(cid(1), SignalId::Ready, ready_cargo::TRIGGER).unwrap();
        let out = rs.apply(cid(1), SignalId::Ready, ready_cargo::REPLY).unwrap();
        assert_eq!(out, SignalOutcome::AcceptedAndMstartRequired);
        assert_eq!(rs.state(), ProtocolState::Run);

        rs.apply(cid(1), SignalId::Stop, 3).unwrap();
        assert_eq!(rs.state(), ProtocolState::WaitReadyOrStop);
    }

    #[test]
    fn reply_before_any_trigger_is_inert_not_a_breach() {
        let mut rs = RouterState::new(2);
        let out = rs
            .apply(cid(1), SignalId::Ready, ready_cargo::REPLY)
            .unwrap();
        assert_eq!(out, SignalOutcome::Accepted);
        assert_eq!(rs.state(), ProtocolState::WaitReadyOrStop);
    }
}
