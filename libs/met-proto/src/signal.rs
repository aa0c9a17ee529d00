//! The closed set of MET signal identifiers and their cargo ranges (spec §3).

use crate::error::MetError;

/// One of the eleven signal identifiers (spec §3 table).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalId {
    Null = 0,
    Ready = 1,
    Start = 2,
    Stop = 3,
    Wait = 4,
    Quit = 5,
    State = 6,
    Target = 7,
    Reward = 8,
    Rdtype = 9,
    Calibrate = 10,
}

/// Number of distinct signal identifiers; used to size the legality table.
pub const NUM_SIGNALS: usize = 11;

impl SignalId {
    pub fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for SignalId {
    type Error = MetError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        use SignalId::*;
        Ok(match raw {
            0 => Null,
            1 => Ready,
            2 => Start,
            3 => Stop,
            4 => Wait,
            5 => Quit,
            6 => State,
            7 => Target,
            8 => Reward,
            9 => Rdtype,
            10 => Calibrate,
            _ => return Err(MetError::Pbsig),
        })
    }
}

/// `mready` cargo values.
pub mod ready_cargo {
    pub const TRIGGER: u16 = 1;
    pub const REPLY: u16 = 2;
}

/// `mwait` cargo values. Per spec §9's resolved Open Question, `init` and
/// `finish` share the single wire value `1`; callers distinguish them only
/// by protocol-state context, never by a distinct cargo.
pub mod wait_cargo {
    pub const INIT_OR_FINISH: u16 = 1;
    pub const ABORT: u16 = 2;
}

/// Cargo legality for a signal id (spec §3 table).
pub fn cargo_in_range(id: SignalId, cargo: u16) -> bool {
    use SignalId::*;
    match id {
        Null => true,
        Ready => cargo == ready_cargo::TRIGGER || cargo == ready_cargo::REPLY,
        Start => cargo >= 1,
        Stop => (1..=5).contains(&cargo),
        Wait => cargo == wait_cargo::INIT_OR_FINISH || cargo == wait_cargo::ABORT,
        Quit => cargo <= MetError::MAX_KIND as u16,
        State | Target | Reward | Rdtype | Calibrate => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for raw in 0..=10u8 {
            let id = SignalId::try_from(raw).unwrap();
            assert_eq!(id as u8, raw);
        }
        assert_eq!(SignalId::try_from(11), Err(MetError::Pbsig));
        assert_eq!(SignalId::try_from(255), Err(MetError::Pbsig));
    }

    #[test]
    fn ready_cargo_is_closed() {
        assert!(cargo_in_range(SignalId::Ready, 1));
        assert!(cargo_in_range(SignalId::Ready, 2));
        assert!(!cargo_in_range(SignalId::Ready, 0));
        assert!(!cargo_in_range(SignalId::Ready, 3));
    }

    #[test]
    fn quit_cargo_matches_error_kinds() {
        assert!(cargo_in_range(SignalId::Quit, 0));
        assert!(cargo_in_range(SignalId::Quit, 14));
        assert!(!cargo_in_range(SignalId::Quit, 15));
    }
}
