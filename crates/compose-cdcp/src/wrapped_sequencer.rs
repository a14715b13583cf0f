use std::{
    collections::HashSet,
    sync::{
        Mutex,
        MutexGuard,
    },
};

use async_trait::async_trait;
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
    protocol::WsDecided,
};
use tracing::{
    debug,
    info,
    instrument,
    warn,
};

use crate::BoxError;

/// One simulation attempt against the external-chain snapshot.
///
/// Unlike the native simulation request this also pre-populates the
/// outbox: write misses reported by earlier attempts are replayed so the
/// simulation can observe its own cross-chain writes.
#[derive(Debug, Clone)]
pub struct WsSimulationRequest {
    pub inbox_messages: Vec<MailboxMessage>,
    pub outbox_messages: Vec<MailboxMessage>,
    pub transactions: Vec<Bytes>,
    pub snapshot: StateRoot,
}

/// What the engine reports back for one simulation attempt. At most one
/// read miss and at most one write miss are reported per attempt; written
/// messages may accompany either.
#[derive(Debug, Clone, Default)]
pub struct WsSimulationResponse {
    pub read_miss: Option<MailboxMessageHeader>,
    pub write_miss: Option<MailboxMessage>,
    pub written_messages: Vec<MailboxMessage>,
}

/// The VM collaborator simulating against the external rollup's state.
pub trait WsExecutionEngine: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Simulates the local transactions.
    ///
    /// # Errors
    ///
    /// A returned error is non-recoverable for this instance; the wrapped
    /// sequencer reports `WSDecided(false)` and terminates.
    fn simulate(&self, request: WsSimulationRequest) -> Result<WsSimulationResponse, BoxError>;
}

/// The atomic bundle submitted to the external rollup: inbox and outbox
/// pre-population plus the transactions, included all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeExecuteArguments {
    pub put_inbox_messages: Vec<MailboxMessage>,
    pub put_outbox_messages: Vec<MailboxMessage>,
    pub transactions: Vec<Bytes>,
}

/// Client of the external rollup. Submission may block arbitrarily long;
/// it is invoked with the instance lock released. A successful return
/// means the external rollup guarantees eventual inclusion.
#[async_trait]
pub trait ErClient: Send + Sync {
    async fn submit_transaction(&self, arguments: SafeExecuteArguments) -> Result<(), BoxError>;
}

/// Outbound messages of the wrapped sequencer: mailbox messages to peer
/// sequencers and the final acknowledgment to the publisher.
pub trait WsNetwork: Send + Sync {
    fn send_mailbox_message(&self, message: MailboxMessage);

    fn send_ws_decided(&self, message: WsDecided);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Simulating,
    WaitingNativeDecided,
    WaitingErResponse,
    Done,
}

struct WsState {
    phase: Phase,
    decision: DecisionState,
    inbox_messages: Vec<MailboxMessage>,
    pending_messages: Vec<MailboxMessage>,
    expected_read_requests: Vec<MailboxMessageHeader>,
    /// Write misses accumulated so far, replayed as the outbox of every
    /// re-simulation and submitted with the final bundle.
    write_pre_population: Vec<MailboxMessage>,
    written_messages: HashSet<MailboxMessage>,
    native_decision: Option<bool>,
}

/// What is left to do once the lock is released.
enum Followup {
    Nothing,
    Submit(SafeExecuteArguments),
    SurfaceSimulationError(BoxError),
}

#[derive(Debug, thiserror::Error)]
#[error("no transactions for chain `{chain_id}`")]
pub struct NoTransactions {
    chain_id: ChainId,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("simulation failed non-recoverably: {0}")]
    Simulation(BoxError),
    #[error("external rollup submission failed: {0}")]
    Submission(BoxError),
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessNativeDecidedError {
    #[error("duplicated NativeDecided")]
    DuplicatedNativeDecided,
    #[error("external rollup submission failed: {0}")]
    Submission(BoxError),
}

/// Represents the external rollup inside a CDCP instance.
///
/// Simulates the external chain's portion of the request (servicing both
/// read misses and write misses), waits for the publisher's native
/// verdict, and on a positive one submits the whole bundle atomically to
/// the external rollup client before acknowledging with `WSDecided`.
pub struct WrappedSequencer<E, C, N> {
    instance: Instance,
    chain_id: ChainId,
    transactions: Vec<Bytes>,
    snapshot: StateRoot,
    engine: E,
    er_client: C,
    network: N,
    state: Mutex<WsState>,
}

impl<E, C, N> WrappedSequencer<E, C, N>
where
    E: WsExecutionEngine,
    C: ErClient,
    N: WsNetwork,
{
    /// Constructs the wrapped sequencer of a CDCP instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the request contains no transactions for the
    /// engine's chain.
    pub fn new(
        instance: Instance,
        engine: E,
        er_client: C,
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
            er_client,
            network,
            state: Mutex::new(WsState {
                phase: Phase::Simulating,
                decision: DecisionState::Pending,
                inbox_messages: Vec::new(),
                pending_messages: Vec::new(),
                expected_read_requests: Vec::new(),
                write_pre_population: Vec::new(),
                written_messages: HashSet::new(),
                native_decision: None,
            }),
        })
    }

    #[must_use]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The external rollup chain this wrapped sequencer represents.
    #[must_use]
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    #[must_use]
    pub fn decision_state(&self) -> DecisionState {
        self.lock_state().decision
    }

    /// Drives the simulation until it is decisive, blocks on a read miss,
    /// or fails. If the native verdict already arrived and was positive,
    /// this continues straight into the external rollup submission.
    ///
    /// # Errors
    ///
    /// Surfaces a non-recoverable simulation error or a failed external
    /// rollup submission, after reporting `WSDecided(false)`.
    #[instrument(skip_all, fields(instance_id = %self.instance.id()))]
    pub async fn run(&self) -> Result<(), RunError> {
        let followup = {
            let mut state = self.lock_state();
            self.drive_simulation(&mut state)
        };
        self.perform(followup).await
    }

    /// Buffers a mailbox message from a peer and re-simulates if it
    /// satisfies an outstanding read miss. Messages arriving outside the
    /// simulation phase are dropped.
    ///
    /// # Errors
    ///
    /// As for [`Self::run`], which the re-simulation continues into.
    pub async fn process_mailbox_message(&self, message: MailboxMessage) -> Result<(), RunError> {
        let followup = {
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
                Followup::Nothing
            }
        };
        self.perform(followup).await
    }

    /// Records the publisher's native verdict.
    ///
    /// A negative verdict terminates the instance without contacting the
    /// external rollup and without an outbound acknowledgment (the
    /// publisher already decided). A positive verdict triggers the
    /// external rollup submission as soon as the local simulation is
    /// decisive.
    ///
    /// # Errors
    ///
    /// Returns an error on a repeated delivery or a failed external
    /// rollup submission.
    #[instrument(skip_all, fields(instance_id = %self.instance.id(), accept))]
    pub async fn process_native_decided(
        &self,
        accept: bool,
    ) -> Result<(), ProcessNativeDecidedError> {
        let followup = {
            let mut state = self.lock_state();
            if state.native_decision.is_some() {
                return Err(ProcessNativeDecidedError::DuplicatedNativeDecided);
            }
            if state.phase == Phase::Done {
                debug!(
                    instance_id = %self.instance.id(),
                    "instance already terminated; dropping native verdict",
                );
                return Ok(());
            }
            state.native_decision = Some(accept);
            match state.phase {
                // the simulation loop picks the verdict up once decisive
                Phase::Simulating => Followup::Nothing,
                Phase::WaitingNativeDecided => self.apply_native_decision(&mut state),
                Phase::WaitingErResponse | Phase::Done => Followup::Nothing,
            }
        };
        match followup {
            Followup::Nothing | Followup::SurfaceSimulationError(_) => Ok(()),
            Followup::Submit(arguments) => self
                .submit(arguments)
                .await
                .map_err(ProcessNativeDecidedError::Submission),
        }
    }

    /// Reports `WSDecided(false)` and terminates, unless the external
    /// rollup submission is already in flight or the instance is done.
    pub fn timeout(&self) {
        let mut state = self.lock_state();
        match state.phase {
            Phase::WaitingErResponse | Phase::Done => {}
            Phase::Simulating | Phase::WaitingNativeDecided => {
                info!(instance_id = %self.instance.id(), "instance timed out; rejecting");
                self.send_ws_decided(false);
                state.phase = Phase::Done;
                state.decision = DecisionState::Rejected;
            }
        }
    }

    fn drive_simulation(&self, state: &mut WsState) -> Followup {
        while state.phase == Phase::Simulating {
            let request = WsSimulationRequest {
                inbox_messages: state.inbox_messages.clone(),
                outbox_messages: state.write_pre_population.clone(),
                transactions: self.transactions.clone(),
                snapshot: self.snapshot,
            };
            let response = match self.engine.simulate(request) {
                Ok(response) => response,
                Err(error) => {
                    warn!(
                        instance_id = %self.instance.id(),
                        error = %error,
                        "simulation failed non-recoverably; rejecting",
                    );
                    self.send_ws_decided(false);
                    state.phase = Phase::Done;
                    state.decision = DecisionState::Rejected;
                    return Followup::SurfaceSimulationError(error);
                }
            };
            for message in response.written_messages {
                if state.written_messages.insert(message.clone()) {
                    self.network.send_mailbox_message(message);
                }
            }
            if let Some(header) = response.read_miss {
                state.expected_read_requests.push(header);
                if !consume_expected_reads(state) {
                    // blocked until a matching message arrives
                    break;
                }
            } else if let Some(message) = response.write_miss {
                state.write_pre_population.push(message);
                // re-run with the grown outbox pre-population
            } else {
                state.phase = Phase::WaitingNativeDecided;
                return self.apply_native_decision(state);
            }
        }
        Followup::Nothing
    }

    /// Acts on a stored native verdict once the simulation is decisive.
    /// Advances into the submission phase under the lock; the submission
    /// itself happens after release.
    fn apply_native_decision(&self, state: &mut WsState) -> Followup {
        match state.native_decision {
            None => Followup::Nothing,
            Some(false) => {
                // the publisher already knows; no acknowledgment
                state.phase = Phase::Done;
                state.decision = DecisionState::Rejected;
                Followup::Nothing
            }
            Some(true) => {
                state.phase = Phase::WaitingErResponse;
                Followup::Submit(SafeExecuteArguments {
                    put_inbox_messages: state.inbox_messages.clone(),
                    put_outbox_messages: state.write_pre_population.clone(),
                    transactions: self.transactions.clone(),
                })
            }
        }
    }

    async fn perform(&self, followup: Followup) -> Result<(), RunError> {
        match followup {
            Followup::Nothing => Ok(()),
            Followup::SurfaceSimulationError(error) => Err(RunError::Simulation(error)),
            Followup::Submit(arguments) => {
                self.submit(arguments).await.map_err(RunError::Submission)
            }
        }
    }

    async fn submit(&self, arguments: SafeExecuteArguments) -> Result<(), BoxError> {
        let result = self.er_client.submit_transaction(arguments).await;
        let mut state = self.lock_state();
        match result {
            Ok(()) => {
                info!(instance_id = %self.instance.id(), "external rollup accepted the bundle");
                state.phase = Phase::Done;
                state.decision = DecisionState::Accepted;
                self.send_ws_decided(true);
                Ok(())
            }
            Err(error) => {
                warn!(
                    instance_id = %self.instance.id(),
                    error = %error,
                    "external rollup rejected the bundle",
                );
                state.phase = Phase::Done;
                state.decision = DecisionState::Rejected;
                self.send_ws_decided(false);
                Err(error)
            }
        }
    }

    fn send_ws_decided(&self, accept: bool) {
        self.network.send_ws_decided(WsDecided {
            instance_id: self.instance.id(),
            accept,
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, WsState> {
        self.state.lock().expect("mutex is not poisoned")
    }
}

fn consume_expected_reads(state: &mut WsState) -> bool {
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
