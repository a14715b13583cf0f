//! The Cross-Domain Composability Protocol (CDCP).
//!
//! CDCP extends SCP to instances that include one external rollup: a
//! chain that does not run a native sequencer but is represented inside
//! the protocol by a [`wrapped_sequencer::WrappedSequencer`]. The
//! [`publisher::Publisher`] first collects the native participants'
//! votes, then defers the final decision to the wrapped sequencer, which
//! simulates against an external-chain snapshot and submits one atomic
//! transaction to the external rollup client before acknowledging.

pub mod publisher;
pub mod wrapped_sequencer;

/// Errors surfaced by external collaborators, opaque to the protocol.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
