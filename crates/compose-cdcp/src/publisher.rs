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
        NativeDecided,
        StartInstance,
    },
};
use indexmap::IndexSet;
use tracing::{
    debug,
    info,
};

/// Outbound messages of the CDCP publisher. `Decided` goes to the native
/// participants, `NativeDecided` to the wrapped sequencer. Sends are
/// best-effort, without acknowledgment or retry.
pub trait PublisherNetwork: Send + Sync {
    fn send_start_instance(&self, message: StartInstance);

    fn send_decided(&self, message: Decided);

    fn send_native_decided(&self, message: NativeDecided);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    WaitingVotes,
    WaitingWsDecided,
    Done,
}

struct PublisherState {
    phase: Phase,
    decision: DecisionState,
    votes: HashMap<ChainId, bool>,
    ws_decision: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum NewPublisherError {
    #[error("the external rollup chain `{chain_id}` is not a participant of the instance")]
    ExternalChainNotParticipant { chain_id: ChainId },
    #[error("the instance has no native participants")]
    NoNativeParticipants,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessVoteError {
    #[error("sender not participant")]
    NotParticipant { sender: ChainId },
    #[error("vote from the external rollup chain")]
    ExternalChainVote { sender: ChainId },
    #[error("duplicated vote")]
    DuplicatedVote { sender: ChainId },
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessWsDecidedError {
    #[error("WSDecided from a chain other than the external rollup")]
    NotExternalChain { sender: ChainId },
    #[error("duplicated WSDecided")]
    DuplicatedWsDecided,
    #[error("WSDecided(true) before the native participants decided")]
    AcceptedBeforeNativeVotes,
}

/// Publisher side of a CDCP instance.
///
/// Collects the native participants' votes exactly as the SCP publisher
/// does, but does not decide on unanimity: it forwards the native verdict
/// to the wrapped sequencer and only broadcasts `Decided` after the
/// wrapped sequencer acknowledged (or any participant rejected).
pub struct Publisher<N> {
    instance: Instance,
    external_chain_id: ChainId,
    native_participants: IndexSet<ChainId>,
    network: N,
    state: Mutex<PublisherState>,
}

impl<N: PublisherNetwork> Publisher<N> {
    /// Constructs the publisher side of a CDCP instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the external rollup chain is not among the
    /// instance's chains, or if no native chain participates.
    pub fn new(
        instance: Instance,
        external_chain_id: ChainId,
        network: N,
    ) -> Result<Self, NewPublisherError> {
        let mut native_participants = instance.chains();
        if !native_participants.shift_remove(&external_chain_id) {
            return Err(NewPublisherError::ExternalChainNotParticipant {
                chain_id: external_chain_id,
            });
        }
        if native_participants.is_empty() {
            return Err(NewPublisherError::NoNativeParticipants);
        }
        Ok(Self {
            instance,
            external_chain_id,
            native_participants,
            network,
            state: Mutex::new(PublisherState {
                phase: Phase::WaitingVotes,
                decision: DecisionState::Pending,
                votes: HashMap::new(),
                ws_decision: None,
            }),
        })
    }

    #[must_use]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    #[must_use]
    pub fn external_chain_id(&self) -> ChainId {
        self.external_chain_id
    }

    #[must_use]
    pub fn decision_state(&self) -> DecisionState {
        self.lock_state().decision
    }

    /// Broadcasts `StartInstance`. Invoking this exactly once per instance
    /// is the caller's responsibility.
    pub fn run(&self) {
        self.network.send_start_instance(StartInstance {
            instance_id: self.instance.id(),
            period: self.instance.period(),
            sequence_number: self.instance.sequence_number(),
            request: self.instance.request().clone(),
        });
    }

    /// Records the vote of one native participant.
    ///
    /// The first `false` vote rejects the instance towards natives and
    /// wrapped sequencer alike; once every native participant has voted
    /// `true` the wrapped sequencer is asked to decide. Votes outside the
    /// voting phase are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error for votes from the external rollup chain, from
    /// non-participants, or from participants that already voted.
    pub fn process_vote(&self, sender: ChainId, accept: bool) -> Result<(), ProcessVoteError> {
        let mut state = self.lock_state();
        if state.phase != Phase::WaitingVotes {
            debug!(
                instance_id = %self.instance.id(),
                sender = %sender,
                "not collecting votes; ignoring vote",
            );
            return Ok(());
        }
        if sender == self.external_chain_id {
            return Err(ProcessVoteError::ExternalChainVote {
                sender,
            });
        }
        if !self.native_participants.contains(&sender) {
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
            self.reject_all(&mut state);
        } else if state.votes.len() == self.native_participants.len() {
            state.phase = Phase::WaitingWsDecided;
            info!(
                instance_id = %self.instance.id(),
                "native participants voted unanimously; waiting for the wrapped sequencer",
            );
            self.network.send_native_decided(NativeDecided {
                instance_id: self.instance.id(),
                accept: true,
            });
        }
        Ok(())
    }

    /// Records the wrapped sequencer's decision, which is final.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender is not the external rollup chain,
    /// if a decision was already processed, or if an accept arrives while
    /// the native votes are still outstanding (an impossible protocol
    /// state).
    pub fn process_ws_decided(
        &self,
        sender: ChainId,
        accept: bool,
    ) -> Result<(), ProcessWsDecidedError> {
        let mut state = self.lock_state();
        if sender != self.external_chain_id {
            return Err(ProcessWsDecidedError::NotExternalChain {
                sender,
            });
        }
        if state.ws_decision.is_some() {
            return Err(ProcessWsDecidedError::DuplicatedWsDecided);
        }
        if state.phase == Phase::Done {
            debug!(
                instance_id = %self.instance.id(),
                "instance already decided; dropping WSDecided",
            );
            return Ok(());
        }
        if accept && state.phase == Phase::WaitingVotes {
            return Err(ProcessWsDecidedError::AcceptedBeforeNativeVotes);
        }
        state.ws_decision = Some(accept);
        state.phase = Phase::Done;
        state.decision = DecisionState::from_accept(accept);
        info!(instance_id = %self.instance.id(), accept, "wrapped sequencer decided");
        self.network.send_decided(Decided {
            instance_id: self.instance.id(),
            accept,
        });
        Ok(())
    }

    /// Rejects the instance if the native votes are still outstanding.
    ///
    /// Once the decision is with the wrapped sequencer the publisher has
    /// no authority to override it, so a timeout in that phase (or after
    /// the decision) is a no-op.
    pub fn timeout(&self) {
        let mut state = self.lock_state();
        if state.phase != Phase::WaitingVotes {
            return;
        }
        info!(instance_id = %self.instance.id(), "instance timed out; rejecting");
        self.reject_all(&mut state);
    }

    fn reject_all(&self, state: &mut PublisherState) {
        state.phase = Phase::Done;
        state.decision = DecisionState::Rejected;
        self.network.send_decided(Decided {
            instance_id: self.instance.id(),
            accept: false,
        });
        self.network.send_native_decided(NativeDecided {
            instance_id: self.instance.id(),
            accept: false,
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().expect("mutex is not poisoned")
    }
}
