use std::{
    collections::HashMap,
    sync::{
        Mutex,
        MutexGuard,
    },
};

use compose_core::{
    instance::{
        DecisionState,
        Instance,
    },
    primitive::ChainId,
    protocol::{
        Decided,
        StartInstance,
    },
};
use indexmap::IndexSet;
use tracing::{
    debug,
    info,
};

/// Outbound messages the publisher hands to the transport. Sends are
/// one-shot, asynchronous, and best-effort; there is no acknowledgment or
/// retry at this layer.
pub trait PublisherNetwork: Send + Sync {
    fn send_start_instance(&self, message: StartInstance);

    fn send_decided(&self, message: Decided);
}

/// Runs the two-phase-commit round for a single instance.
///
/// The publisher collects one vote per participating chain. The first
/// `false` vote rejects the instance immediately; once every participant
/// has voted `true` it is accepted. Either way exactly one [`Decided`]
/// message is emitted.
pub struct Publisher<N> {
    instance: Instance,
    participants: IndexSet<ChainId>,
    network: N,
    state: Mutex<VoteState>,
}

struct VoteState {
    decision: DecisionState,
    votes: HashMap<ChainId, bool>,
}

#[derive(Debug, thiserror::Error)]
#[error("an instance requires at least two distinct chains, got {received}")]
pub struct TooFewChains {
    received: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessVoteError {
    #[error("sender not participant")]
    NotParticipant { sender: ChainId },
    #[error("duplicated vote")]
    DuplicatedVote { sender: ChainId },
}

impl<N: PublisherNetwork> Publisher<N> {
    /// Constructs the publisher side of an SCP instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance's request spans fewer than two
    /// distinct chains.
    pub fn new(instance: Instance, network: N) -> Result<Self, TooFewChains> {
        let participants = instance.chains();
        if participants.len() < 2 {
            return Err(TooFewChains {
                received: participants.len(),
            });
        }
        Ok(Self {
            instance,
            participants,
            network,
            state: Mutex::new(VoteState {
                decision: DecisionState::Pending,
                votes: HashMap::new(),
            }),
        })
    }

    #[must_use]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    #[must_use]
    pub fn decision_state(&self) -> DecisionState {
        self.lock_state().decision
    }

    /// Broadcasts `StartInstance` to the participants.
    ///
    /// The message is sent on every call; invoking this exactly once per
    /// instance is the caller's responsibility.
    pub fn run(&self) {
        self.network.send_start_instance(StartInstance {
            instance_id: self.instance.id(),
            period: self.instance.period(),
            sequence_number: self.instance.sequence_number(),
            request: self.instance.request().clone(),
        });
    }

    /// Records the vote of one participant, deciding the instance if it is
    /// the first `false` or the last outstanding `true`.
    ///
    /// Votes arriving after the decision are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if `sender` is not a participant of this instance
    /// or has already voted.
    pub fn process_vote(&self, sender: ChainId, accept: bool) -> Result<(), ProcessVoteError> {
        let mut state = self.lock_state();
        if !state.decision.is_pending() {
            debug!(
                instance_id = %self.instance.id(),
                sender = %sender,
                "instance is already decided; ignoring vote",
            );
            return Ok(());
        }
        if !self.participants.contains(&sender) {
            return Err(ProcessVoteError::NotParticipant {
                sender,
            });
        }
        if state.votes.contains_key(&sender) {
            return Err(ProcessVoteError::DuplicatedVote {
                sender,
            });
        }
        state.votes.insert(sender, accept);
        if !accept {
            self.decide(&mut state, false);
        } else if state.votes.len() == self.participants.len() {
            self.decide(&mut state, true);
        }
        Ok(())
    }

    /// Rejects the instance if it is still undecided. Safe to call at any
    /// time; a timeout after the decision is a no-op.
    pub fn timeout(&self) {
        let mut state = self.lock_state();
        if !state.decision.is_pending() {
            return;
        }
        info!(instance_id = %self.instance.id(), "instance timed out; rejecting");
        self.decide(&mut state, false);
    }

    fn decide(&self, state: &mut VoteState, accept: bool) {
        state.decision = DecisionState::from_accept(accept);
        info!(instance_id = %self.instance.id(), accept, "instance decided");
        self.network.send_decided(Decided {
            instance_id: self.instance.id(),
            accept,
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, VoteState> {
        self.state.lock().expect("mutex is not poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        Mutex,
    };

    use bytes::Bytes;
    use compose_core::{
        instance::{
            DecisionState,
            Instance,
        },
        primitive::{
            ChainId,
            PeriodId,
            SequenceNumber,
        },
        protocol::{
            Decided,
            StartInstance,
        },
        request::{
            TransactionRequest,
            XtRequest,
        },
    };

    use super::{
        ProcessVoteError,
        Publisher,
        PublisherNetwork,
    };

    #[derive(Clone, Default)]
    struct RecordingNetwork {
        started: Arc<Mutex<Vec<StartInstance>>>,
        decided: Arc<Mutex<Vec<Decided>>>,
    }

    impl RecordingNetwork {
        fn started(&self) -> Vec<StartInstance> {
            self.started.lock().unwrap().clone()
        }

        fn decided(&self) -> Vec<Decided> {
            self.decided.lock().unwrap().clone()
        }
    }

    impl PublisherNetwork for RecordingNetwork {
        fn send_start_instance(&self, message: StartInstance) {
            self.started.lock().unwrap().push(message);
        }

        fn send_decided(&self, message: Decided) {
            self.decided.lock().unwrap().push(message);
        }
    }

    fn two_chain_instance() -> Instance {
        let request = XtRequest::new(vec![
            TransactionRequest::new(ChainId::new(1), vec![Bytes::from_static(&[0x61])]),
            TransactionRequest::new(ChainId::new(2), vec![Bytes::from_static(&[0x62])]),
        ]);
        Instance::new(PeriodId::new(10), SequenceNumber::new(1), request)
    }

    fn publisher() -> (Publisher<RecordingNetwork>, RecordingNetwork) {
        let network = RecordingNetwork::default();
        let publisher = Publisher::new(two_chain_instance(), network.clone()).unwrap();
        (publisher, network)
    }

    #[test]
    fn construction_rejects_single_chain_requests() {
        let request = XtRequest::new(vec![TransactionRequest::new(
            ChainId::new(1),
            vec![Bytes::from_static(b"a")],
        )]);
        let instance = Instance::new(PeriodId::new(1), SequenceNumber::new(1), request);
        assert!(Publisher::new(instance, RecordingNetwork::default()).is_err());
    }

    #[test]
    fn run_broadcasts_the_instance() {
        let (publisher, network) = publisher();
        publisher.run();
        let started = network.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].instance_id, publisher.instance().id());
        assert_eq!(started[0].request, *publisher.instance().request());
    }

    #[test]
    fn unanimous_votes_accept_the_instance() {
        let (publisher, network) = publisher();
        publisher.run();

        publisher.process_vote(ChainId::new(1), true).unwrap();
        assert_eq!(publisher.decision_state(), DecisionState::Pending);
        assert!(network.decided().is_empty());

        publisher.process_vote(ChainId::new(2), true).unwrap();
        assert_eq!(publisher.decision_state(), DecisionState::Accepted);
        assert_eq!(
            network.decided(),
            vec![Decided {
                instance_id: publisher.instance().id(),
                accept: true,
            }],
        );

        // a late timeout emits nothing further
        publisher.timeout();
        assert_eq!(network.decided().len(), 1);
    }

    #[test]
    fn first_false_vote_rejects_immediately() {
        let (publisher, network) = publisher();

        publisher.process_vote(ChainId::new(2), false).unwrap();
        assert_eq!(publisher.decision_state(), DecisionState::Rejected);
        assert_eq!(
            network.decided(),
            vec![Decided {
                instance_id: publisher.instance().id(),
                accept: false,
            }],
        );

        // the straggler's vote is ignored without error
        publisher.process_vote(ChainId::new(1), true).unwrap();
        assert_eq!(network.decided().len(), 1);
    }

    #[test]
    fn vote_from_non_participant_fails() {
        let (publisher, _network) = publisher();
        assert!(matches!(
            publisher.process_vote(ChainId::new(3), true),
            Err(ProcessVoteError::NotParticipant { .. }),
        ));
        assert_eq!(publisher.decision_state(), DecisionState::Pending);
    }

    #[test]
    fn second_vote_from_same_participant_fails() {
        let (publisher, _network) = publisher();
        publisher.process_vote(ChainId::new(1), true).unwrap();
        assert!(matches!(
            publisher.process_vote(ChainId::new(1), true),
            Err(ProcessVoteError::DuplicatedVote { .. }),
        ));
    }

    #[test]
    fn timeout_rejects_a_pending_instance_once() {
        let (publisher, network) = publisher();
        publisher.timeout();
        assert_eq!(publisher.decision_state(), DecisionState::Rejected);
        publisher.timeout();
        assert_eq!(network.decided().len(), 1);
    }
}
