//! The closed MET error taxonomy (spec §7).
//!
//! Discriminants double as the wire `cargo` of a synthesized `mquit`
//! and as the process exit code, so they are pinned to the kind table
//! and must never be renumbered independently of each other.

/// One of the 15 MET error kinds. `None` (0) means "no error yet".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MetError {
    #[error("no error")]
    None = 0,
    /// Source field on a request pipe did not match the owning controller.
    #[error("signal source does not match the requesting controller")]
    Pbsrc = 1,
    /// Signal id is illegal for the current protocol state.
    #[error("signal is illegal in the current protocol state")]
    Pbsig = 2,
    /// Cargo value is out of range for its signal id.
    #[error("cargo value out of range for signal")]
    Pbcrg = 3,
    /// Time value is not finite, negative, or otherwise out of range.
    #[error("time value out of range")]
    Pbtim = 4,
    /// Unexpected OS-level error (fcntl, mmap, fork, etc).
    #[error("unexpected OS error")]
    Syser = 5,
    /// Broken broadcast pipe (server -> child).
    #[error("broken broadcast pipe")]
    Brkbp = 6,
    /// Broken request pipe (child -> server).
    #[error("broken request pipe")]
    Brkrp = 7,
    /// Broadcast pipe would block on a non-blocking write.
    #[error("clogged broadcast pipe")]
    Clgbp = 8,
    /// Request pipe would block on a non-blocking write.
    #[error("clogged request pipe")]
    Clgrp = 9,
    /// A child terminated unexpectedly.
    #[error("unexpected child termination")]
    Chld = 10,
    /// External interrupt (SIGINT, SIGHUP, ...).
    #[error("external interrupt")]
    Intr = 11,
    /// Internal invariant violation (includes the reader/writer deadlock guard).
    #[error("internal invariant violation")]
    Intrn = 12,
    /// A bounded wait (barrier, reap) exceeded its deadline.
    #[error("timeout on bounded wait")]
    Tmout = 13,
    /// Embedding-runtime error reported by a child; opaque to the core.
    #[error("embedding-runtime error")]
    Matlb = 14,
}

impl MetError {
    pub const MAX_KIND: u8 = 14;

    pub fn kind(self) -> u8 {
        self as u8
    }

    pub fn from_kind(kind: u8) -> Option<Self> {
        use MetError::*;
        Some(match kind {
            0 => None,
            1 => Pbsrc,
            2 => Pbsig,
            3 => Pbcrg,
            4 => Pbtim,
            5 => Syser,
            6 => Brkbp,
            7 => Brkrp,
            8 => Clgbp,
            9 => Clgrp,
            10 => Chld,
            11 => Intr,
            12 => Intrn,
            13 => Tmout,
            14 => Matlb,
            _ => return Option::None,
        })
    }

    /// Classify an I/O error observed while writing to a broadcast pipe.
    pub fn from_broadcast_io(err: &std::io::Error) -> MetError {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => MetError::Clgbp,
            std::io::ErrorKind::BrokenPipe => MetError::Brkbp,
            _ => MetError::Syser,
        }
    }

    /// Classify an I/O error observed while reading/writing a request pipe.
    pub fn from_request_io(err: &std::io::Error) -> MetError {
        match err.kind() {
            std::io::ErrorKind::WouldBlock => MetError::Clgrp,
            std::io::ErrorKind::BrokenPipe => MetError::Brkrp,
            _ => MetError::Syser,
        }
    }
}

/// Tracks the first non-`None` error observed across the full lifecycle,
/// per spec §7's propagation rule ("the server's accumulated error is the
/// first non-NONE error observed").
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorAccumulator(Option<MetError>);

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self(None)
    }

    /// Record `err` if nothing has been recorded yet. Returns `self` for chaining.
    pub fn record(&mut self, err: MetError) -> &mut Self {
        if self.0.is_none() && err != MetError::None {
            self.0 = Some(err);
        }
        self
    }

    pub fn get(&self) -> MetError {
        self.0.unwrap_or(MetError::None)
    }
}
