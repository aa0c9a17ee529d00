//! Wire vocabulary shared by the server and every controller: the
//! signal tuple, the controller id space, the error taxonomy, and the
//! protocol state machine. No process or shared-memory code lives here.

pub mod controller;
pub mod error;
pub mod protocol;
pub mod signal;
pub mod wire;

pub use controller::{ControllerId, MAX_CONTROLLERS};
pub use error::{ErrorAccumulator, MetError};
pub use protocol::{is_legal, ProtocolState, RouterState, SignalOutcome};
pub use signal::{cargo_in_range, ready_cargo, wait_cargo, SignalId};
pub use wire::{atomic_signal_capacity, time_in_range, Signal, SIGNAL_WIRE_SIZE};
