//! The Superblock Construction Protocol (SBCP).
//!
//! SBCP is the outer orchestrator around SCP/CDCP instances. The
//! [`publisher::Publisher`] batches instances into periods (never letting
//! two concurrent instances share a chain), aggregates the per-chain
//! proofs arriving at a period boundary into a single network proof for
//! L1, and broadcasts a rollback when proving falls too far behind. The
//! [`sequencer::Sequencer`] builds L2 blocks tagged with their period,
//! gates local transactions around active instances, and triggers
//! settlement when its chain's portion of a period is sealed.

pub mod publisher;
pub mod sequencer;

/// Errors surfaced by external collaborators, opaque to the protocol.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
