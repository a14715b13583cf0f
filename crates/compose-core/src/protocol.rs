//! Wire-level shapes of the protocol messages.
//!
//! Serialization and framing are a transport concern; these types fix the
//! field sets and semantics only. [`crate::mailbox::MailboxMessage`] is its
//! own wire shape.

use bytes::Bytes;

use crate::{
    primitive::{
        ChainId,
        InstanceId,
        PeriodId,
        SequenceNumber,
        SuperblockHash,
        SuperblockNumber,
    },
    request::XtRequest,
};

/// Publisher → sequencers: open a new instance over `request`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StartInstance {
    pub instance_id: InstanceId,
    pub period: PeriodId,
    pub sequence_number: SequenceNumber,
    pub request: XtRequest,
}

/// Sequencer → publisher: the local simulation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Vote {
    pub instance_id: InstanceId,
    pub chain_id: ChainId,
    pub accept: bool,
}

/// Publisher → sequencers: the instance's final decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Decided {
    pub instance_id: InstanceId,
    pub accept: bool,
}

/// CDCP publisher → wrapped sequencer: the unanimous verdict of the native
/// participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NativeDecided {
    pub instance_id: InstanceId,
    pub accept: bool,
}

/// Wrapped sequencer → CDCP publisher: outcome of the external-rollup
/// submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WsDecided {
    pub instance_id: InstanceId,
    pub accept: bool,
}

/// SBCP publisher → sequencers: a new period has begun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StartPeriod {
    pub period: PeriodId,
    pub superblock: SuperblockNumber,
}

/// SBCP publisher → sequencers: discard everything above the last
/// finalized superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rollback {
    pub period: PeriodId,
    pub superblock: SuperblockNumber,
    pub superblock_hash: SuperblockHash,
}

/// SBCP sequencer → publisher: the per-chain proof for one superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Proof {
    pub period: PeriodId,
    pub superblock: SuperblockNumber,
    pub proof_data: Bytes,
}
