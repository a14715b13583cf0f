use bytes::Bytes;

use crate::primitive::{
    ChainId,
    EthAddress,
    SessionId,
};

/// The routing and identity key of a pending cross-chain read.
///
/// Headers are compared field-wise; two headers are the same read request
/// exactly when every field matches. They key the match between a
/// simulation's expected reads and the mailbox messages received from
/// peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MailboxMessageHeader {
    pub session_id: SessionId,
    pub source_chain_id: ChainId,
    pub dest_chain_id: ChainId,
    pub sender: EthAddress,
    pub receiver: EthAddress,
    pub label: String,
}

/// A uni-directional message exchanged between sequencers during
/// simulation.
///
/// Messages are content, not references: sending one hands a copy to the
/// peer. Equality (and hashing, for the written-messages cache) includes
/// the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MailboxMessage {
    pub header: MailboxMessageHeader,
    pub data: Bytes,
}
