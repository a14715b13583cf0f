use bytes::Bytes;
use indexmap::IndexSet;

use crate::primitive::ChainId;

/// The portion of a cross-chain request targeting a single chain.
///
/// Transactions are raw byte strings; empty payloads are admissible and
/// their order within the chain is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransactionRequest {
    chain_id: ChainId,
    transactions: Vec<Bytes>,
}

impl TransactionRequest {
    #[must_use]
    pub fn new(chain_id: ChainId, transactions: Vec<Bytes>) -> Self {
        Self {
            chain_id,
            transactions,
        }
    }

    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    #[must_use]
    pub fn transactions(&self) -> &[Bytes] {
        &self.transactions
    }
}

/// A user's bundle of transactions targeting multiple chains, to be
/// included atomically.
///
/// An `XtRequest` is just an ordered sequence of [`TransactionRequest`]s.
/// It places no restriction on how many distinct chains appear; requests
/// over fewer than two chains are rejected when an instance is created
/// from them, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct XtRequest {
    requests: Vec<TransactionRequest>,
}

impl XtRequest {
    #[must_use]
    pub fn new(requests: Vec<TransactionRequest>) -> Self {
        Self {
            requests,
        }
    }

    #[must_use]
    pub fn requests(&self) -> &[TransactionRequest] {
        &self.requests
    }

    /// Returns the distinct chains targeted by this request, in order of
    /// first appearance.
    #[must_use]
    pub fn chains(&self) -> IndexSet<ChainId> {
        self.requests
            .iter()
            .map(TransactionRequest::chain_id)
            .collect()
    }

    /// Returns the ordered concatenation of all transactions targeting
    /// `chain_id`, across every [`TransactionRequest`] in the bundle.
    #[must_use]
    pub fn transactions_for(&self, chain_id: ChainId) -> Vec<Bytes> {
        self.requests
            .iter()
            .filter(|request| request.chain_id() == chain_id)
            .flat_map(|request| request.transactions().iter().cloned())
            .collect()
    }
}

impl FromIterator<TransactionRequest> for XtRequest {
    fn from_iter<T: IntoIterator<Item = TransactionRequest>>(iter: T) -> Self {
        Self {
            requests: iter.into_iter().collect(),
        }
    }
}
