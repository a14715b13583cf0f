use indexmap::IndexSet;
use sha2::{
    Digest as _,
    Sha256,
};

use crate::{
    primitive::{
        ChainId,
        InstanceId,
        PeriodId,
        SequenceNumber,
    },
    request::XtRequest,
};

impl InstanceId {
    /// Derives the content-addressed identifier of an instance.
    ///
    /// The identifier is the SHA-256 digest over the big-endian 8-byte
    /// encodings of the period and the sequence number, followed, for every
    /// [`TransactionRequest`](crate::request::TransactionRequest) in request
    /// order, by the 8-byte chain id, the 8-byte count of non-empty
    /// transactions, and then each non-empty transaction as its 8-byte
    /// length followed by its bytes. Empty transactions contribute nothing,
    /// so requests that differ only in the omission of an empty payload
    /// derive the same identifier.
    #[must_use]
    pub fn derive(period: PeriodId, sequence_number: SequenceNumber, request: &XtRequest) -> Self {
        fn as_u64_be(value: usize) -> [u8; 8] {
            u64::try_from(value)
                .expect("running on a machine with at most 64 bit pointer width")
                .to_be_bytes()
        }

        let mut hasher = Sha256::new();
        hasher.update(period.get().to_be_bytes());
        hasher.update(sequence_number.get().to_be_bytes());
        for transaction_request in request.requests() {
            let transactions: Vec<_> = transaction_request
                .transactions()
                .iter()
                .filter(|transaction| !transaction.is_empty())
                .collect();
            hasher.update(transaction_request.chain_id().get().to_be_bytes());
            hasher.update(as_u64_be(transactions.len()));
            for transaction in transactions {
                hasher.update(as_u64_be(transaction.len()));
                hasher.update(transaction);
            }
        }
        Self::new(hasher.finalize().into())
    }
}

/// The terminal-at-most-once decision attached to every instance.
///
/// Starts out `Pending` and leaves it exactly once, for either `Accepted`
/// or `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecisionState {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl DecisionState {
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }

    #[must_use]
    pub fn from_accept(accept: bool) -> Self {
        if accept {
            Self::Accepted
        } else {
            Self::Rejected
        }
    }
}

/// A single run of SCP or CDCP deciding one [`XtRequest`].
///
/// Created by the SBCP publisher when the request becomes schedulable and
/// destroyed after the decision; the identifier is a pure function of the
/// other three fields.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instance {
    id: InstanceId,
    period: PeriodId,
    sequence_number: SequenceNumber,
    request: XtRequest,
}

impl Instance {
    /// Constructs an instance, deriving its identifier from the inputs.
    #[must_use]
    pub fn new(period: PeriodId, sequence_number: SequenceNumber, request: XtRequest) -> Self {
        let id = InstanceId::derive(period, sequence_number, &request);
        Self {
            id,
            period,
            sequence_number,
            request,
        }
    }

    #[must_use]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    #[must_use]
    pub fn period(&self) -> PeriodId {
        self.period
    }

    #[must_use]
    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    #[must_use]
    pub fn request(&self) -> &XtRequest {
        &self.request
    }

    /// The distinct chains participating in this instance, in first
    /// appearance order.
    #[must_use]
    pub fn chains(&self) -> IndexSet<ChainId> {
        self.request.chains()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{
        DecisionState,
        Instance,
        InstanceId,
    };
    use crate::{
        primitive::{
            ChainId,
            PeriodId,
            SequenceNumber,
        },
        request::{
            TransactionRequest,
            XtRequest,
        },
    };

    fn xt_request(entries: Vec<(u64, Vec<&'static [u8]>)>) -> XtRequest {
        entries
            .into_iter()
            .map(|(chain, txs)| {
                TransactionRequest::new(
                    ChainId::new(chain),
                    txs.into_iter().map(Bytes::from_static).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn identifier_is_deterministic() {
        let request = xt_request(vec![(1, vec![b"a"]), (2, vec![b"b"])]);
        let lhs = InstanceId::derive(PeriodId::new(10), SequenceNumber::new(1), &request);
        let rhs = InstanceId::derive(PeriodId::new(10), SequenceNumber::new(1), &request);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn identifier_depends_on_period_sequence_and_content() {
        let request = xt_request(vec![(1, vec![b"a"]), (2, vec![b"b"])]);
        let base = InstanceId::derive(PeriodId::new(10), SequenceNumber::new(1), &request);
        assert_ne!(
            base,
            InstanceId::derive(PeriodId::new(11), SequenceNumber::new(1), &request),
        );
        assert_ne!(
            base,
            InstanceId::derive(PeriodId::new(10), SequenceNumber::new(2), &request),
        );
        let other = xt_request(vec![(1, vec![b"a"]), (2, vec![b"c"])]);
        assert_ne!(
            base,
            InstanceId::derive(PeriodId::new(10), SequenceNumber::new(1), &other),
        );
    }

    #[test]
    fn empty_transactions_are_skipped_in_the_hash_input() {
        let with_empty = xt_request(vec![(1, vec![b"a", b"", b"b"]), (2, vec![b""])]);
        let without_empty = xt_request(vec![(1, vec![b"a", b"b"]), (2, vec![])]);
        assert_eq!(
            InstanceId::derive(PeriodId::new(3), SequenceNumber::new(7), &with_empty),
            InstanceId::derive(PeriodId::new(3), SequenceNumber::new(7), &without_empty),
        );
    }

    #[test]
    fn instance_exposes_chains_of_its_request() {
        let request = xt_request(vec![(5, vec![b"a"]), (9, vec![b"b"]), (5, vec![b"c"])]);
        let instance = Instance::new(PeriodId::new(1), SequenceNumber::new(1), request);
        let chains: Vec<_> = instance.chains().into_iter().collect();
        assert_eq!(chains, vec![ChainId::new(5), ChainId::new(9)]);
        assert_eq!(
            instance.id(),
            InstanceId::derive(
                instance.period(),
                instance.sequence_number(),
                instance.request()
            ),
        );
    }

    #[test]
    fn decision_state_maps_accept_flag() {
        assert!(DecisionState::Pending.is_pending());
        assert_eq!(DecisionState::from_accept(true), DecisionState::Accepted);
        assert_eq!(DecisionState::from_accept(false), DecisionState::Rejected);
    }
}
