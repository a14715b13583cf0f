use std::{
    collections::HashSet,
    sync::{
        Mutex,
        MutexGuard,
    },
};

use bytes::Bytes;
use compose_core::{
    instance::{
        DecisionState,
        Instance,
    },
    mailbox::{
        MailboxMessage,
        MailboxMessageHeader,
    },
    primitive::{
        ChainId,
        StateRoot,
    },
    protocol::Vote,
};
use tracing::{
    debug,
    info,
    warn,
};

use crate::BoxError;

/// One simulation attempt of the local portion of a request.
///
/// `inbox_messages` carries every mailbox message consumed so far; the
/// engine replays them before executing `transactions` against the pinned
/// `snapshot`.
#[derive(Debug, Clone)]
pub struct SimulationRequest {
    pub inbox_messages: Vec<MailboxMessage>,
    pub transactions: Vec<Bytes>,
    pub snapshot: StateRoot,
}

/// What the engine reports back for one simulation attempt.
#[derive(Debug, Clone)]
pub enum SimulationOutcome {
    /// The simulation ran to completion, producing the listed outbound
    /// mailbox messages.
    Success {
        written_messages: Vec<MailboxMessage>,
    },
    /// The simulation cannot proceed until the described message is
    /// available in the inbox.
    ReadMiss(MailboxMessageHeader),
}

/// The VM collaborator executing the local transactions. Simulations are
/// pure with respect to the snapshot and must not block on external I/O.
pub trait ExecutionEngine: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Simulates the local transactions.
    ///
    /// # Errors
    ///
    /// A returned error is non-recoverable for this instance; the
    /// sequencer votes `false` and terminates.
    fn simulate(&self, request: SimulationRequest) -> Result<SimulationOutcome, BoxError>;
}

/// Outbound messages the sequencer hands to the transport: mailbox
/// messages to peer sequencers and the vote to the publisher. Best-effort,
/// no acknowledgment or retry.
pub trait SequencerNetwork: Send + Sync {
    fn send_mailbox_message(&self, message: MailboxMessage);

    fn send_vote(&self, vote: Vote);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Simulating,
    WaitingDecided,
    Done,
}

struct SimulationState {
    phase: Phase,
    decision: DecisionState,
    /// Messages consumed from peers, replayed into every re-simulation.
    inbox_messages: Vec<MailboxMessage>,
    /// Messages received from peers but not yet requested by the
    /// simulation.
    pending_messages: Vec<MailboxMessage>,
    /// Read misses the simulation is blocked on.
    expected_read_requests: Vec<MailboxMessageHeader>,
    /// Every message already sent, keyed on full content. Re-simulation
    /// re-emits earlier writes; the cache keeps each send at most once.
    written_messages: HashSet<MailboxMessage>,
}

#[derive(Debug, thiserror::Error)]
#[error("no transactions for chain `{chain_id}`")]
pub struct NoTransactions {
    chain_id: ChainId,
}

#[derive(Debug, thiserror::Error)]
#[error("simulation failed non-recoverably: {0}")]
pub struct SimulationFailed(BoxError);

/// Sequencer side of an SCP instance for one chain.
///
/// Filters the cross-chain request down to its own chain's transactions
/// and simulates them against a pinned snapshot, exchanging mailbox
/// messages with peers until the simulation either succeeds (vote `true`)
/// or fails non-recoverably (vote `false`).
pub struct Sequencer<E, N> {
    instance: Instance,
    chain_id: ChainId,
    transactions: Vec<Bytes>,
    snapshot: StateRoot,
    engine: E,
    network: N,
    state: Mutex<SimulationState>,
}

impl<E: ExecutionEngine, N: SequencerNetwork> Sequencer<E, N> {
    /// Constructs the sequencer side of an SCP instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the request contains no transactions for the
    /// engine's chain.
    pub fn new(
        instance: Instance,
        engine: E,
        network: N,
        snapshot: StateRoot,
    ) -> Result<Self, NoTransactions> {
        let chain_id = engine.chain_id();
        let transactions = instance.request().transactions_for(chain_id);
        if transactions.is_empty() {
            return Err(NoTransactions {
                chain_id,
            });
        }
        Ok(Self {
            instance,
            chain_id,
            transactions,
            snapshot,
            engine,
            network,
            state: Mutex::new(SimulationState {
                phase: Phase::Simulating,
                decision: DecisionState::Pending,
                inbox_messages: Vec::new(),
                pending_messages: Vec::new(),
                expected_read_requests: Vec::new(),
                written_messages: HashSet::new(),
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

    /// Drives the simulation until it votes, blocks on a read miss, or
    /// fails.
    ///
    /// # Errors
    ///
    /// Surfaces the engine's non-recoverable error after voting `false`.
    pub fn run(&self) -> Result<(), SimulationFailed> {
        let mut state = self.lock_state();
        self.drive_simulation(&mut state)
    }

    /// Buffers a mailbox message from a peer and re-simulates if it
    /// satisfies an outstanding read miss.
    ///
    /// Messages arriving outside the simulation phase are dropped.
    ///
    /// # Errors
    ///
    /// Surfaces the engine's non-recoverable error if the triggered
    /// re-simulation fails.
    pub fn process_mailbox_message(&self, message: MailboxMessage) -> Result<(), SimulationFailed> {
        let mut state = self.lock_state();
        if state.phase != Phase::Simulating {
            debug!(
                instance_id = %self.instance.id(),
                label = %message.header.label,
                "not simulating; dropping mailbox message",
            );
            return Ok(());
        }
        state.pending_messages.push(message);
        if consume_expected_reads(&mut state) {
            self.drive_simulation(&mut state)
        } else {
            Ok(())
        }
    }

    /// Records the publisher's decision and terminates the instance.
    /// Repeated deliveries after the first are dropped.
    pub fn process_decided_message(&self, accept: bool) {
        let mut state = self.lock_state();
        if state.phase == Phase::Done {
            debug!(
                instance_id = %self.instance.id(),
                "instance already terminated; dropping decided message",
            );
            return;
        }
        state.decision = DecisionState::from_accept(accept);
        state.phase = Phase::Done;
        info!(instance_id = %self.instance.id(), accept, "instance decided");
    }

    /// Votes `false` and terminates unless the sequencer has already voted
    /// or terminated.
    pub fn timeout(&self) {
        let mut state = self.lock_state();
        if state.phase != Phase::Simulating {
            return;
        }
        info!(instance_id = %self.instance.id(), "instance timed out while simulating");
        self.send_vote(false);
        state.phase = Phase::Done;
        state.decision = DecisionState::Rejected;
    }

    fn drive_simulation(&self, state: &mut SimulationState) -> Result<(), SimulationFailed> {
        while state.phase == Phase::Simulating {
            let request = SimulationRequest {
                inbox_messages: state.inbox_messages.clone(),
                transactions: self.transactions.clone(),
                snapshot: self.snapshot,
            };
            match self.engine.simulate(request) {
                Ok(SimulationOutcome::Success {
                    written_messages,
                }) => {
                    for message in written_messages {
                        if state.written_messages.insert(message.clone()) {
                            self.network.send_mailbox_message(message);
                        }
                    }
                    self.send_vote(true);
                    state.phase = Phase::WaitingDecided;
                }
                Ok(SimulationOutcome::ReadMiss(header)) => {
                    state.expected_read_requests.push(header);
                    if !consume_expected_reads(state) {
                        // blocked until a matching message arrives
                        break;
                    }
                }
                Err(error) => {
                    warn!(
                        instance_id = %self.instance.id(),
                        error = %error,
                        "simulation failed non-recoverably; voting false",
                    );
                    self.send_vote(false);
                    state.phase = Phase::Done;
                    state.decision = DecisionState::Rejected;
                    return Err(SimulationFailed(error));
                }
            }
        }
        Ok(())
    }

    fn send_vote(&self, accept: bool) {
        self.network.send_vote(Vote {
            instance_id: self.instance.id(),
            chain_id: self.chain_id,
            accept,
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, SimulationState> {
        self.state.lock().expect("mutex is not poisoned")
    }
}

/// Moves every pending message matching an expected read into the inbox,
/// consuming both entries. Returns whether any match was made, in which
/// case the simulation is worth retrying.
fn consume_expected_reads(state: &mut SimulationState) -> bool {
    let mut matched = false;
    let mut still_expected = Vec::new();
    for header in std::mem::take(&mut state.expected_read_requests) {
        if let Some(position) = state
            .pending_messages
            .iter()
            .position(|message| message.header == header)
        {
            let message = state.pending_messages.remove(position);
            state.inbox_messages.push(message);
            matched = true;
        } else {
            still_expected.push(header);
        }
    }
    state.expected_read_requests = still_expected;
    matched
}
