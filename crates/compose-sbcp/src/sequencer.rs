use std::{
    collections::HashMap,
    sync::{
        Mutex,
        MutexGuard,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use compose_core::{
    block::{
        BlockHeader,
        PendingBlock,
        SealedBlockHeader,
        SettledState,
    },
    primitive::{
        BlockNumber,
        InstanceId,
        PeriodId,
        SequenceNumber,
        SuperblockNumber,
    },
    protocol::{
        Proof,
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

/// Produces the chain's proof for one superblock, covering the sealed
/// block if the chain contributed one. May block on computation; it is
/// invoked with the sequencer lock released.
#[async_trait]
pub trait Prover: Send + Sync {
    async fn request_proofs(
        &self,
        block: Option<SealedBlockHeader>,
        superblock: SuperblockNumber,
    ) -> Result<Bytes, BoxError>;
}

/// Upstream channel to the SBCP publisher: cross-chain requests received
/// from users are forwarded, finished proofs are delivered.
pub trait Messenger: Send + Sync {
    fn forward_request(&self, request: XtRequest);

    fn send_proof(&self, message: Proof);
}

struct SequencerState {
    period: PeriodId,
    target_superblock: SuperblockNumber,
    pending_block: Option<PendingBlock>,
    active_instance: Option<InstanceId>,
    last_sequence_number: Option<SequenceNumber>,
    head: BlockNumber,
    /// The chain's sealed block per period, kept until the superblock it
    /// belongs to is finalized.
    sealed_blocks: HashMap<PeriodId, SealedBlockHeader>,
    settled: SettledState,
}

/// Assembles an SBCP [`Sequencer`].
///
/// The settled state is rebuilt from L1 on startup; the head starts at
/// the settled block.
pub struct Builder<P, M> {
    pub period: PeriodId,
    pub target_superblock: SuperblockNumber,
    pub settled: SettledState,
    pub prover: P,
    pub messenger: M,
}

impl<P, M> Builder<P, M> {
    #[must_use]
    pub fn build(self) -> Sequencer<P, M> {
        let Self {
            period,
            target_superblock,
            settled,
            prover,
            messenger,
        } = self;
        Sequencer {
            prover,
            messenger,
            state: Mutex::new(SequencerState {
                period,
                target_superblock,
                pending_block: None,
                active_instance: None,
                last_sequence_number: None,
                head: settled.header().number(),
                sealed_blocks: HashMap::new(),
                settled,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("proof request failed: {0}")]
pub struct ProofRequestFailed(BoxError);

#[derive(Debug, thiserror::Error)]
#[error(
    "mismatched finalized state: rollback refers to superblock `{received}` but `{settled}` is \
     settled"
)]
pub struct MismatchedFinalizedState {
    received: SuperblockNumber,
    settled: SuperblockNumber,
}

#[derive(Debug, thiserror::Error)]
pub enum BeginBlockError {
    #[error("block already open")]
    BlockAlreadyOpen { open: BlockNumber },
    #[error("not sequential")]
    NotSequential {
        head: BlockNumber,
        received: BlockNumber,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("no pending block")]
pub struct NoPendingBlock;

#[derive(Debug, thiserror::Error)]
pub enum OnStartInstanceError {
    #[error("no pending block")]
    NoPendingBlock,
    #[error("active instance exists")]
    ActiveInstanceExists { active: InstanceId },
    #[error("period ID mismatch")]
    PeriodIdMismatch {
        block_period: PeriodId,
        instance_period: PeriodId,
    },
    #[error("low sequence number")]
    LowSequenceNumber {
        last: SequenceNumber,
        received: SequenceNumber,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum OnDecidedInstanceError {
    #[error("no active instance")]
    NoActiveInstance,
    #[error("active instance mismatch")]
    ActiveInstanceMismatch {
        active: InstanceId,
        received: InstanceId,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EndBlockError {
    #[error("no pending block")]
    NoPendingBlock,
    #[error("seal mismatch")]
    SealMismatch {
        pending: BlockNumber,
        received: BlockNumber,
    },
    #[error("active instance exists")]
    ActiveInstanceExists { active: InstanceId },
    #[error(transparent)]
    ProofRequest(#[from] ProofRequestFailed),
}

/// Sequencer side of SBCP for one chain.
///
/// Builds L2 blocks tagged with the period and target superblock under
/// which they were opened, admits local transactions only while no
/// cross-chain instance is active in the open block, and triggers
/// settlement for a period once its block is sealed.
pub struct Sequencer<P, M> {
    prover: P,
    messenger: M,
    state: Mutex<SequencerState>,
}

impl<P, M> Sequencer<P, M>
where
    P: Prover,
    M: Messenger,
{
    #[must_use]
    pub fn period(&self) -> PeriodId {
        self.lock_state().period
    }

    #[must_use]
    pub fn head(&self) -> BlockNumber {
        self.lock_state().head
    }

    #[must_use]
    pub fn settled_state(&self) -> SettledState {
        self.lock_state().settled
    }

    /// Adopts the publisher's new period and target superblock.
    ///
    /// If no block is open, settlement for the period that just closed
    /// starts immediately; otherwise it is deferred until the open block
    /// is sealed (observed at [`Self::end_block`]).
    ///
    /// # Errors
    ///
    /// Surfaces a failed proof request of the immediate settlement.
    #[instrument(skip_all, fields(period = %message.period, superblock = %message.superblock))]
    pub async fn start_period(&self, message: StartPeriod) -> Result<(), ProofRequestFailed> {
        let settlement = {
            let mut state = self.lock_state();
            info!(
                period = %message.period,
                target_superblock = %message.superblock,
                "starting period",
            );
            state.period = message.period;
            state.target_superblock = message.superblock;
            state.last_sequence_number = None;
            if state.pending_block.is_some() {
                debug!("block still open; deferring settlement until it is sealed");
                None
            } else {
                previous_settlement(&state)
            }
        };
        match settlement {
            Some((period, superblock, block)) => self.settle(period, superblock, block).await,
            None => Ok(()),
        }
    }

    /// Serves a rollback broadcast by the publisher: discards everything
    /// above the finalized superblock and returns the safe block header
    /// to reset the execution layer to.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollback does not refer to the settled
    /// state this sequencer knows.
    pub fn rollback(&self, message: Rollback) -> Result<BlockHeader, MismatchedFinalizedState> {
        let mut state = self.lock_state();
        if message.superblock != state.settled.superblock_number()
            || message.superblock_hash != state.settled.superblock_hash()
        {
            return Err(MismatchedFinalizedState {
                received: message.superblock,
                settled: state.settled.superblock_number(),
            });
        }
        warn!(
            period = %message.period,
            superblock = %message.superblock,
            "rolling back to the settled state",
        );
        state
            .sealed_blocks
            .retain(|_, sealed| sealed.superblock() <= message.superblock);
        state.pending_block = None;
        state.active_instance = None;
        state.last_sequence_number = None;
        state.head = state.settled.header().number();
        state.period = message.period;
        state.target_superblock = message.superblock.next();
        Ok(state.settled.header())
    }

    /// Forwards a user's cross-chain request to the publisher.
    pub fn receive_xt_request(&self, request: XtRequest) {
        self.messenger.forward_request(request);
    }

    /// Adopts a newer finalized superblock observed on L1. Older or
    /// equal observations are ignored.
    pub fn advance_settled_state(&self, settled: SettledState) {
        let mut state = self.lock_state();
        if settled.superblock_number() <= state.settled.superblock_number() {
            debug!(
                received = %settled.superblock_number(),
                settled = %state.settled.superblock_number(),
                "ignoring old settled state",
            );
            return;
        }
        info!(superblock = %settled.superblock_number(), "advanced settled state");
        state.settled = settled;
    }

    /// Opens the next block, tagging it with the current period and
    /// target superblock.
    ///
    /// # Errors
    ///
    /// Returns an error if a block is already open or `number` does not
    /// directly follow the head.
    pub fn begin_block(&self, number: BlockNumber) -> Result<(), BeginBlockError> {
        let mut state = self.lock_state();
        if let Some(pending) = &state.pending_block {
            return Err(BeginBlockError::BlockAlreadyOpen {
                open: pending.number(),
            });
        }
        if number != state.head.next() {
            return Err(BeginBlockError::NotSequential {
                head: state.head,
                received: number,
            });
        }
        state.pending_block = Some(PendingBlock::new(
            number,
            state.period,
            state.target_superblock,
        ));
        debug!(block = %number, "opened block");
        Ok(())
    }

    /// Whether a local (non-cross-chain) transaction may be included in
    /// the open block right now.
    ///
    /// # Errors
    ///
    /// Returns an error if no block is open.
    pub fn can_include_local_tx(&self) -> Result<bool, NoPendingBlock> {
        let state = self.lock_state();
        if state.pending_block.is_none() {
            return Err(NoPendingBlock);
        }
        Ok(state.active_instance.is_none())
    }

    /// Admits a cross-chain instance into the open block.
    ///
    /// # Errors
    ///
    /// Returns an error if no block is open, another instance is still
    /// active, the instance belongs to a different period than the open
    /// block, or its sequence number does not increase.
    pub fn on_start_instance(
        &self,
        instance_id: InstanceId,
        period: PeriodId,
        sequence_number: SequenceNumber,
    ) -> Result<(), OnStartInstanceError> {
        let mut state = self.lock_state();
        let Some(pending) = &state.pending_block else {
            return Err(OnStartInstanceError::NoPendingBlock);
        };
        if let Some(active) = state.active_instance {
            return Err(OnStartInstanceError::ActiveInstanceExists {
                active,
            });
        }
        if period != pending.period() {
            return Err(OnStartInstanceError::PeriodIdMismatch {
                block_period: pending.period(),
                instance_period: period,
            });
        }
        if let Some(last) = state.last_sequence_number {
            if sequence_number <= last {
                return Err(OnStartInstanceError::LowSequenceNumber {
                    last,
                    received: sequence_number,
                });
            }
        }
        state.active_instance = Some(instance_id);
        state.last_sequence_number = Some(sequence_number);
        debug!(instance_id = %instance_id, "instance active in open block");
        Ok(())
    }

    /// Clears the active instance once the publisher decided it.
    ///
    /// # Errors
    ///
    /// Returns an error if no instance is active or a different one is.
    pub fn on_decided_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<(), OnDecidedInstanceError> {
        let mut state = self.lock_state();
        let Some(active) = state.active_instance else {
            return Err(OnDecidedInstanceError::NoActiveInstance);
        };
        if active != instance_id {
            return Err(OnDecidedInstanceError::ActiveInstanceMismatch {
                active,
                received: instance_id,
            });
        }
        state.active_instance = None;
        debug!(instance_id = %instance_id, "instance decided; local transactions admitted");
        Ok(())
    }

    /// Seals the open block under its period tag and advances the head.
    ///
    /// If a period boundary passed while the block was open, the
    /// deferred settlement for the closed period starts now.
    ///
    /// # Errors
    ///
    /// Returns an error if no block is open, the header does not match
    /// it, an instance is still active, or the deferred settlement's
    /// proof request fails.
    #[instrument(skip_all, fields(block = %header.number()))]
    pub async fn end_block(&self, header: BlockHeader) -> Result<(), EndBlockError> {
        let settlement = {
            let mut state = self.lock_state();
            let Some(pending) = state.pending_block else {
                return Err(EndBlockError::NoPendingBlock);
            };
            if header.number() != pending.number() {
                return Err(EndBlockError::SealMismatch {
                    pending: pending.number(),
                    received: header.number(),
                });
            }
            if let Some(active) = state.active_instance {
                return Err(EndBlockError::ActiveInstanceExists {
                    active,
                });
            }
            let sealed = SealedBlockHeader::new(header, pending.period(), pending.superblock());
            state.sealed_blocks.insert(pending.period(), sealed);
            state.head = header.number();
            state.pending_block = None;
            info!(
                block = %header.number(),
                period = %pending.period(),
                superblock = %pending.superblock(),
                "sealed block",
            );
            if pending.period() < state.period {
                // a period boundary passed while this block was open
                previous_settlement(&state)
            } else {
                None
            }
        };
        match settlement {
            Some((period, superblock, block)) => {
                self.settle(period, superblock, block).await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Requests the chain's proof for a closed period and forwards it to
    /// the publisher. The prover is called with the lock released.
    async fn settle(
        &self,
        period: PeriodId,
        superblock: SuperblockNumber,
        block: Option<SealedBlockHeader>,
    ) -> Result<(), ProofRequestFailed> {
        info!(
            period = %period,
            superblock = %superblock,
            has_block = block.is_some(),
            "requesting settlement proof",
        );
        let proof = self
            .prover
            .request_proofs(block, superblock)
            .await
            .map_err(ProofRequestFailed)?;
        self.messenger.send_proof(Proof {
            period,
            superblock,
            proof_data: proof,
        });
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, SequencerState> {
        self.state.lock().expect("mutex is not poisoned")
    }
}

/// The settlement task for the period preceding the current one, if any:
/// its period and superblock numbers plus the chain's sealed block for
/// that period.
fn previous_settlement(
    state: &SequencerState,
) -> Option<(PeriodId, SuperblockNumber, Option<SealedBlockHeader>)> {
    let period = PeriodId::new(state.period.get().checked_sub(1)?);
    let superblock = SuperblockNumber::new(state.target_superblock.get().checked_sub(1)?);
    let block = state.sealed_blocks.get(&period).copied();
    Some((period, superblock, block))
}

#[cfg(test)]
mod tests;
