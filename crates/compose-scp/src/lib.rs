//! The Synchronous Composability Protocol (SCP).
//!
//! SCP decides a single cross-chain request through a two-phase-commit
//! style round between one [`publisher::Publisher`] and one
//! [`sequencer::Sequencer`] per participating chain: the publisher opens
//! the instance, every sequencer simulates its local portion of the
//! request (exchanging mailbox messages with its peers until the
//! simulation is decisive) and votes, and the publisher broadcasts the
//! unanimous-accept-or-reject outcome.
//!
//! All networking, execution, and timer driving are external
//! collaborators; the types here are the protocol state machines only.

pub mod publisher;
pub mod sequencer;

/// Errors surfaced by external collaborators, opaque to the protocol.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
