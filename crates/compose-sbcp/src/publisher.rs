use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        HashMap,
        HashSet,
    },
    sync::{
        Mutex,
        MutexGuard,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use compose_core::{
    instance::Instance,
    primitive::{
        ChainId,
        PeriodId,
        SequenceNumber,
        SuperblockHash,
        SuperblockNumber,
    },
    protocol::{
        Rollback,
        StartPeriod,
    },
    request::XtRequest,
};
use tracing::{
    debug,
    info,
    instrument,
    warn,
};

use crate::BoxError;

/// Aggregates the per-chain proofs of one superblock into a single
/// network proof. May block arbitrarily long; it is invoked with the
/// publisher lock released.
#[async_trait]
pub trait Prover: Send + Sync {
    async fn request_network_proof(
        &self,
        superblock: SuperblockNumber,
        last_superblock_hash: SuperblockHash,
        chain_proofs: Vec<(ChainId, Bytes)>,
    ) -> Result<Bytes, BoxError>;
}

/// Broadcasts period transitions and rollbacks to the sequencers.
/// Best-effort, no acknowledgment or retry.
pub trait Messenger: Send + Sync {
    fn broadcast_start_period(&self, message: StartPeriod);

    fn broadcast_rollback(&self, message: Rollback);
}

/// The settlement contract: receives the finished network proof.
pub trait L1Client: Send + Sync {
    fn publish_proof(&self, superblock: SuperblockNumber, proof: Bytes);
}

struct PublisherState {
    period: PeriodId,
    target_superblock: SuperblockNumber,
    last_finalized_superblock: SuperblockNumber,
    last_finalized_superblock_hash: SuperblockHash,
    sequence_number: SequenceNumber,
    /// Chains participating in a not-yet-decided instance.
    active_chains: HashSet<ChainId>,
    /// Per-chain proofs collected per superblock, in ascending chain
    /// order so the prover input is deterministic.
    proofs: HashMap<SuperblockNumber, BTreeMap<ChainId, Bytes>>,
}

/// Assembles an SBCP [`Publisher`].
///
/// `period`, `target_superblock`, and the finalized pair are rebuilt from
/// L1 on startup; `proof_window` set to zero disables the period gate.
pub struct Builder<P, M, L> {
    pub chains: BTreeSet<ChainId>,
    pub proof_window: u64,
    pub period: PeriodId,
    pub target_superblock: SuperblockNumber,
    pub last_finalized_superblock: SuperblockNumber,
    pub last_finalized_superblock_hash: SuperblockHash,
    pub prover: P,
    pub messenger: M,
    pub l1: L,
}

#[derive(Debug, thiserror::Error)]
#[error(
    "target superblock `{target_superblock}` is below the last finalized superblock \
     `{last_finalized_superblock}`"
)]
pub struct TargetBelowFinalized {
    target_superblock: SuperblockNumber,
    last_finalized_superblock: SuperblockNumber,
}

impl<P, M, L> Builder<P, M, L> {
    /// Creates the publisher.
    ///
    /// # Errors
    ///
    /// Returns an error if the target superblock starts out below the
    /// last finalized one.
    pub fn build(self) -> Result<Publisher<P, M, L>, TargetBelowFinalized> {
        let Self {
            chains,
            proof_window,
            period,
            target_superblock,
            last_finalized_superblock,
            last_finalized_superblock_hash,
            prover,
            messenger,
            l1,
        } = self;
        if target_superblock < last_finalized_superblock {
            return Err(TargetBelowFinalized {
                target_superblock,
                last_finalized_superblock,
            });
        }
        Ok(Publisher {
            chains,
            proof_window,
            prover,
            messenger,
            l1,
            state: Mutex::new(PublisherState {
                period,
                target_superblock,
                last_finalized_superblock,
                last_finalized_superblock_hash,
                sequence_number: SequenceNumber::new(0),
                active_chains: HashSet::new(),
                proofs: HashMap::new(),
            }),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error(
    "cannot start period: target superblock `{target_superblock}` would run more than \
     {proof_window} superblocks ahead of finalized `{last_finalized_superblock}`"
)]
pub struct CannotStartPeriod {
    target_superblock: SuperblockNumber,
    last_finalized_superblock: SuperblockNumber,
    proof_window: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StartInstanceError {
    #[error("invalid request")]
    InvalidRequest { distinct_chains: usize },
    #[error("cannot start instance")]
    ChainAlreadyActive { chain_id: ChainId },
}

#[derive(Debug, thiserror::Error)]
#[error("chain not active: `{chain_id}`")]
pub struct ChainNotActive {
    chain_id: ChainId,
}

#[derive(Debug, thiserror::Error)]
#[error("old settled state: received `{received}`, already finalized `{last_finalized_superblock}`")]
pub struct OldSettledState {
    received: SuperblockNumber,
    last_finalized_superblock: SuperblockNumber,
}

#[derive(Debug, thiserror::Error)]
#[error("network proof request failed: {0}")]
pub struct NetworkProofFailed(BoxError);

/// Orchestrates periods and instances across the whole network.
///
/// The publisher owns the period counter and the target superblock,
/// schedules instances so that no chain participates in two at once,
/// collects the per-chain proofs of each sealed superblock, and either
/// publishes the aggregated network proof to L1 or rolls the network
/// back.
pub struct Publisher<P, M, L> {
    /// The configured network-wide chain set.
    chains: BTreeSet<ChainId>,
    /// Maximum number of unproven superblocks tolerated before period
    /// transitions are refused. Zero disables the gate.
    proof_window: u64,
    prover: P,
    messenger: M,
    l1: L,
    state: Mutex<PublisherState>,
}

impl<P, M, L> Publisher<P, M, L>
where
    P: Prover,
    M: Messenger,
    L: L1Client,
{
    #[must_use]
    pub fn period(&self) -> PeriodId {
        self.lock_state().period
    }

    #[must_use]
    pub fn target_superblock(&self) -> SuperblockNumber {
        self.lock_state().target_superblock
    }

    #[must_use]
    pub fn last_finalized_superblock(&self) -> SuperblockNumber {
        self.lock_state().last_finalized_superblock
    }

    /// Opens the next period: increments the period counter and the
    /// target superblock, resets the instance sequence, and broadcasts
    /// `StartPeriod`.
    ///
    /// Active instances are deliberately left untouched; an instance may
    /// straddle a period boundary.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving all state unchanged, if the new target
    /// would run more than the proof window ahead of the last finalized
    /// superblock.
    pub fn start_period(&self) -> Result<(), CannotStartPeriod> {
        let mut state = self.lock_state();
        let target_superblock = state.target_superblock.next();
        if self.proof_window != 0
            && target_superblock.get()
                > state
                    .last_finalized_superblock
                    .get()
                    .saturating_add(1)
                    .saturating_add(self.proof_window)
        {
            return Err(CannotStartPeriod {
                target_superblock,
                last_finalized_superblock: state.last_finalized_superblock,
                proof_window: self.proof_window,
            });
        }
        state.period = state.period.next();
        state.target_superblock = target_superblock;
        state.sequence_number = SequenceNumber::new(0);
        info!(
            period = %state.period,
            target_superblock = %state.target_superblock,
            "starting period",
        );
        self.messenger.broadcast_start_period(StartPeriod {
            period: state.period,
            superblock: state.target_superblock,
        });
        Ok(())
    }

    /// Schedules a cross-chain request as the next instance of the
    /// current period, reserving every chain it touches.
    ///
    /// The instance is returned to the caller for publication; SBCP does
    /// not itself emit `StartInstance` messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the request spans fewer than two distinct
    /// chains, or if any of its chains is already reserved by an
    /// undecided instance.
    pub fn start_instance(&self, request: XtRequest) -> Result<Instance, StartInstanceError> {
        let mut state = self.lock_state();
        let chains = request.chains();
        if chains.len() < 2 {
            return Err(StartInstanceError::InvalidRequest {
                distinct_chains: chains.len(),
            });
        }
        if let Some(busy) = chains
            .iter()
            .find(|chain_id| state.active_chains.contains(chain_id))
        {
            return Err(StartInstanceError::ChainAlreadyActive {
                chain_id: *busy,
            });
        }
        state.sequence_number = state.sequence_number.next();
        let instance = Instance::new(state.period, state.sequence_number, request);
        state.active_chains.extend(chains);
        info!(
            instance_id = %instance.id(),
            period = %instance.period(),
            sequence_number = %instance.sequence_number(),
            "starting instance",
        );
        Ok(instance)
    }

    /// Releases the chains of a decided instance.
    ///
    /// # Errors
    ///
    /// Returns an error, releasing nothing, if any of the instance's
    /// chains is not currently reserved. This is also the fate of an
    /// instance that was in flight when a rollback cleared the
    /// reservations: it has been invalidated.
    pub fn decide_instance(&self, instance: &Instance) -> Result<(), ChainNotActive> {
        let mut state = self.lock_state();
        let chains = instance.chains();
        if let Some(inactive) = chains
            .iter()
            .find(|chain_id| !state.active_chains.contains(chain_id))
        {
            return Err(ChainNotActive {
                chain_id: *inactive,
            });
        }
        for chain_id in &chains {
            state.active_chains.remove(chain_id);
        }
        debug!(instance_id = %instance.id(), "released instance chains");
        Ok(())
    }

    /// Adopts a newer finalized superblock observed on L1.
    ///
    /// # Errors
    ///
    /// Returns an error if the superblock number is not strictly greater
    /// than the current finalized one.
    pub fn advance_settled_state(
        &self,
        superblock: SuperblockNumber,
        superblock_hash: SuperblockHash,
    ) -> Result<(), OldSettledState> {
        let mut state = self.lock_state();
        if superblock <= state.last_finalized_superblock {
            return Err(OldSettledState {
                received: superblock,
                last_finalized_superblock: state.last_finalized_superblock,
            });
        }
        state.last_finalized_superblock = superblock;
        state.last_finalized_superblock_hash = superblock_hash;
        info!(superblock = %superblock, "advanced settled state");
        Ok(())
    }

    /// The proof window elapsed without the next superblock finalizing:
    /// roll the network back to the last finalized superblock.
    pub fn proof_timeout(&self) {
        let mut state = self.lock_state();
        warn!(
            last_finalized_superblock = %state.last_finalized_superblock,
            "proof window elapsed; rolling back",
        );
        self.rollback(&mut state);
    }

    /// Stores the per-chain proof of a sealed superblock and, once every
    /// chain has delivered one, requests the aggregated network proof and
    /// publishes it to L1.
    ///
    /// Proofs that are stale, premature, out of order, mis-attributed to
    /// the wrong period, or duplicated are ignored with a log line only.
    ///
    /// # Errors
    ///
    /// Returns an error if the network proof request fails; the network
    /// is rolled back first.
    #[instrument(skip_all, fields(%period, %superblock, %chain_id))]
    pub async fn receive_proof(
        &self,
        period: PeriodId,
        superblock: SuperblockNumber,
        proof: Bytes,
        chain_id: ChainId,
    ) -> Result<(), NetworkProofFailed> {
        let complete = {
            let mut state = self.lock_state();
            if superblock <= state.last_finalized_superblock {
                debug!(%superblock, %chain_id, "superblock already finalized; ignoring proof");
                return Ok(());
            }
            if superblock >= state.target_superblock {
                debug!(%superblock, %chain_id, "superblock not yet sealed; ignoring proof");
                return Ok(());
            }
            if superblock != state.last_finalized_superblock.next() {
                debug!(
                    %superblock,
                    %chain_id,
                    "superblock is not the next to finalize; ignoring proof",
                );
                return Ok(());
            }
            // the period in which this superblock was sealed
            let sealed_in = state
                .period
                .get()
                .checked_sub(state.target_superblock.get() - superblock.get());
            if sealed_in != Some(period.get()) {
                warn!(
                    %superblock,
                    %chain_id,
                    received_period = %period,
                    "proof is attributed to the wrong period; ignoring",
                );
                return Ok(());
            }
            if !self.chains.contains(&chain_id) {
                warn!(%chain_id, "proof from a chain outside the network; ignoring");
                return Ok(());
            }
            let slot = state.proofs.entry(superblock).or_default();
            if slot.contains_key(&chain_id) {
                debug!(%superblock, %chain_id, "proof already received; ignoring");
                return Ok(());
            }
            slot.insert(chain_id, proof);
            info!(
                %superblock,
                %chain_id,
                received = slot.len(),
                expected = self.chains.len(),
                "stored chain proof",
            );
            if slot.len() < self.chains.len() {
                return Ok(());
            }
            let chain_proofs: Vec<(ChainId, Bytes)> = slot
                .iter()
                .map(|(chain_id, proof)| (*chain_id, proof.clone()))
                .collect();
            (state.last_finalized_superblock_hash, chain_proofs)
        };
        let (last_superblock_hash, chain_proofs) = complete;

        // the prover may block arbitrarily long; the lock stays released
        match self
            .prover
            .request_network_proof(superblock, last_superblock_hash, chain_proofs)
            .await
        {
            Ok(network_proof) => {
                let mut state = self.lock_state();
                state.proofs.remove(&superblock);
                info!(%superblock, "publishing network proof");
                self.l1.publish_proof(superblock, network_proof);
                Ok(())
            }
            Err(error) => {
                warn!(
                    %superblock,
                    error = %error,
                    "network proof request failed; rolling back",
                );
                let mut state = self.lock_state();
                self.rollback(&mut state);
                Err(NetworkProofFailed(error))
            }
        }
    }

    /// Reverts the target to just above the last finalized superblock,
    /// invalidates every in-flight instance, and tells the sequencers to
    /// discard their unfinalized blocks.
    fn rollback(&self, state: &mut PublisherState) {
        state.active_chains.clear();
        state.sequence_number = SequenceNumber::new(0);
        state.target_superblock = state.last_finalized_superblock.next();
        self.messenger.broadcast_rollback(Rollback {
            period: state.period,
            superblock: state.last_finalized_superblock,
            superblock_hash: state.last_finalized_superblock_hash,
        });
        state.proofs.clear();
    }

    fn lock_state(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().expect("mutex is not poisoned")
    }
}
