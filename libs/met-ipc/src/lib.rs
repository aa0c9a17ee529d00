//! Controller-side IPC: sending/receiving signals over a pipe pair, and
//! waiting for readiness across the broadcast pipe and every shared-memory
//! slot a controller touches.

mod endpoint;
mod multiplexer;
mod slot_handle;

pub use endpoint::{OutgoingSignal, SignalEndpoint};
pub use multiplexer::{ReadinessMultiplexer, ReadinessReport, SlotToken};
pub use slot_handle::Slot;
