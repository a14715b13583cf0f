use std::sync::{
    Arc,
    Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use compose_core::{
    block::{
        BlockHeader,
        SealedBlockHeader,
        SettledState,
    },
    primitive::{
        BlockHash,
        BlockNumber,
        ChainId,
        InstanceId,
        PeriodId,
        SequenceNumber,
        StateRoot,
        SuperblockHash,
        SuperblockNumber,
    },
    protocol::{
        Proof,
        Rollback,
        StartPeriod,
    },
    request::{
        TransactionRequest,
        XtRequest,
    },
};

use super::{
    BeginBlockError,
    Builder,
    EndBlockError,
    Messenger,
    OnDecidedInstanceError,
    OnStartInstanceError,
    Prover,
    Sequencer,
};
use crate::BoxError;

#[derive(Clone, Default)]
struct RecordingProver {
    requests: Arc<Mutex<Vec<(Option<SealedBlockHeader>, SuperblockNumber)>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl RecordingProver {
    fn failing(message: &str) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            failure: Arc::new(Mutex::new(Some(message.to_string()))),
        }
    }

    fn requests(&self) -> Vec<(Option<SealedBlockHeader>, SuperblockNumber)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prover for RecordingProver {
    async fn request_proofs(
        &self,
        block: Option<SealedBlockHeader>,
        superblock: SuperblockNumber,
    ) -> Result<Bytes, BoxError> {
        self.requests.lock().unwrap().push((block, superblock));
        match self.failure.lock().unwrap().clone() {
            Some(message) => Err(message.into()),
            None => Ok(Bytes::from_static(b"chain-proof")),
        }
    }
}

#[derive(Clone, Default)]
struct RecordingMessenger {
    forwarded: Arc<Mutex<Vec<XtRequest>>>,
    proofs: Arc<Mutex<Vec<Proof>>>,
}

impl RecordingMessenger {
    fn forwarded(&self) -> Vec<XtRequest> {
        self.forwarded.lock().unwrap().clone()
    }

    fn proofs(&self) -> Vec<Proof> {
        self.proofs.lock().unwrap().clone()
    }
}

impl Messenger for RecordingMessenger {
    fn forward_request(&self, request: XtRequest) {
        self.forwarded.lock().unwrap().push(request);
    }

    fn send_proof(&self, message: Proof) {
        self.proofs.lock().unwrap().push(message);
    }
}

fn header(number: u64) -> BlockHeader {
    BlockHeader::new(
        BlockNumber::new(number),
        BlockHash::new([u8::try_from(number % 251).unwrap(); 32]),
        StateRoot::new([7; 32]),
    )
}

fn settled() -> SettledState {
    SettledState::new(
        header(100),
        SuperblockNumber::new(9),
        SuperblockHash::new([9; 32]),
    )
}

type TestSequencer = Sequencer<RecordingProver, RecordingMessenger>;

fn sequencer_with(
    prover: RecordingProver,
) -> (TestSequencer, RecordingProver, RecordingMessenger) {
    let messenger = RecordingMessenger::default();
    let sequencer = Builder {
        period: PeriodId::new(10),
        target_superblock: SuperblockNumber::new(10),
        settled: settled(),
        prover: prover.clone(),
        messenger: messenger.clone(),
    }
    .build();
    (sequencer, prover, messenger)
}

fn sequencer() -> (TestSequencer, RecordingProver, RecordingMessenger) {
    sequencer_with(RecordingProver::default())
}

fn start_period(period: u64, superblock: u64) -> StartPeriod {
    StartPeriod {
        period: PeriodId::new(period),
        superblock: SuperblockNumber::new(superblock),
    }
}

#[test]
fn blocks_are_opened_sequentially() {
    let (sequencer, _prover, _messenger) = sequencer();

    assert!(matches!(
        sequencer.begin_block(BlockNumber::new(103)),
        Err(BeginBlockError::NotSequential { .. }),
    ));

    sequencer.begin_block(BlockNumber::new(101)).unwrap();
    assert!(matches!(
        sequencer.begin_block(BlockNumber::new(102)),
        Err(BeginBlockError::BlockAlreadyOpen { .. }),
    ));
}

#[tokio::test]
async fn sealing_advances_the_head() {
    let (sequencer, _prover, _messenger) = sequencer();

    sequencer.begin_block(BlockNumber::new(101)).unwrap();
    sequencer.end_block(header(101)).await.unwrap();
    assert_eq!(sequencer.head(), BlockNumber::new(101));

    sequencer.begin_block(BlockNumber::new(102)).unwrap();
    assert!(matches!(
        sequencer.end_block(header(103)).await,
        Err(EndBlockError::SealMismatch { .. }),
    ));
}

#[tokio::test]
async fn end_block_requires_an_open_block() {
    let (sequencer, _prover, _messenger) = sequencer();
    assert!(matches!(
        sequencer.end_block(header(101)).await,
        Err(EndBlockError::NoPendingBlock),
    ));
}

#[test]
fn local_transactions_are_gated_by_active_instances() {
    let (sequencer, _prover, _messenger) = sequencer();
    assert!(sequencer.can_include_local_tx().is_err());

    sequencer.begin_block(BlockNumber::new(101)).unwrap();
    assert!(sequencer.can_include_local_tx().unwrap());

    let id = InstanceId::new([1; 32]);
    sequencer
        .on_start_instance(id, PeriodId::new(10), SequenceNumber::new(1))
        .unwrap();
    assert!(!sequencer.can_include_local_tx().unwrap());

    sequencer.on_decided_instance(id).unwrap();
    assert!(sequencer.can_include_local_tx().unwrap());
}

#[tokio::test]
async fn instances_require_an_open_block_of_their_period() {
    let (sequencer, _prover, _messenger) = sequencer();
    let id = InstanceId::new([1; 32]);

    assert!(matches!(
        sequencer.on_start_instance(id, PeriodId::new(10), SequenceNumber::new(1)),
        Err(OnStartInstanceError::NoPendingBlock),
    ));

    sequencer.begin_block(BlockNumber::new(101)).unwrap();
    assert!(matches!(
        sequencer.on_start_instance(id, PeriodId::new(11), SequenceNumber::new(1)),
        Err(OnStartInstanceError::PeriodIdMismatch { .. }),
    ));

    sequencer
        .on_start_instance(id, PeriodId::new(10), SequenceNumber::new(1))
        .unwrap();
    assert!(matches!(
        sequencer.on_start_instance(InstanceId::new([2; 32]), PeriodId::new(10), SequenceNumber::new(2)),
        Err(OnStartInstanceError::ActiveInstanceExists { .. }),
    ));

    // sealing is refused while the instance is undecided
    assert!(matches!(
        sequencer.end_block(header(101)).await,
        Err(EndBlockError::ActiveInstanceExists { .. }),
    ));
}

#[test]
fn sequence_numbers_increase_strictly_within_a_period() {
    let (sequencer, _prover, _messenger) = sequencer();
    sequencer.begin_block(BlockNumber::new(101)).unwrap();

    let first = InstanceId::new([1; 32]);
    sequencer
        .on_start_instance(first, PeriodId::new(10), SequenceNumber::new(2))
        .unwrap();
    sequencer.on_decided_instance(first).unwrap();

    for stale in [1, 2] {
        assert!(matches!(
            sequencer.on_start_instance(
                InstanceId::new([3; 32]),
                PeriodId::new(10),
                SequenceNumber::new(stale),
            ),
            Err(OnStartInstanceError::LowSequenceNumber { .. }),
        ));
    }

    sequencer
        .on_start_instance(InstanceId::new([3; 32]), PeriodId::new(10), SequenceNumber::new(3))
        .unwrap();
}

#[test]
fn decided_instances_must_match_the_active_one() {
    let (sequencer, _prover, _messenger) = sequencer();
    sequencer.begin_block(BlockNumber::new(101)).unwrap();

    assert!(matches!(
        sequencer.on_decided_instance(InstanceId::new([1; 32])),
        Err(OnDecidedInstanceError::NoActiveInstance),
    ));

    sequencer
        .on_start_instance(InstanceId::new([1; 32]), PeriodId::new(10), SequenceNumber::new(1))
        .unwrap();
    assert!(matches!(
        sequencer.on_decided_instance(InstanceId::new([2; 32])),
        Err(OnDecidedInstanceError::ActiveInstanceMismatch { .. }),
    ));
}

#[tokio::test]
async fn start_period_without_an_open_block_settles_immediately() {
    let (sequencer, prover, messenger) = sequencer();

    // seal this period's block first
    sequencer.begin_block(BlockNumber::new(101)).unwrap();
    sequencer.end_block(header(101)).await.unwrap();
    assert!(prover.requests().is_empty());

    sequencer.start_period(start_period(11, 11)).await.unwrap();

    let requests = prover.requests();
    assert_eq!(requests.len(), 1);
    let (block, superblock) = &requests[0];
    assert_eq!(*superblock, SuperblockNumber::new(10));
    let sealed = block.as_ref().expect("the sealed block of period 10 backs the proof");
    assert_eq!(sealed.period(), PeriodId::new(10));
    assert_eq!(sealed.superblock(), SuperblockNumber::new(10));
    assert_eq!(sealed.header(), header(101));

    assert_eq!(
        messenger.proofs(),
        vec![Proof {
            period: PeriodId::new(10),
            superblock: SuperblockNumber::new(10),
            proof_data: Bytes::from_static(b"chain-proof"),
        }],
    );
}

#[tokio::test]
async fn start_period_without_a_sealed_block_settles_with_none() {
    let (sequencer, prover, messenger) = sequencer();
    sequencer.start_period(start_period(11, 11)).await.unwrap();

    let requests = prover.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0], (None, SuperblockNumber::new(10)));
    assert_eq!(messenger.proofs().len(), 1);
}

#[tokio::test]
async fn settlement_is_deferred_while_a_block_is_open() {
    let (sequencer, prover, messenger) = sequencer();

    sequencer.begin_block(BlockNumber::new(101)).unwrap();
    sequencer.start_period(start_period(11, 11)).await.unwrap();
    assert!(prover.requests().is_empty());

    // the block still carries the tags it was opened under
    sequencer.end_block(header(101)).await.unwrap();

    let requests = prover.requests();
    assert_eq!(requests.len(), 1);
    let (block, superblock) = &requests[0];
    assert_eq!(*superblock, SuperblockNumber::new(10));
    assert_eq!(
        block.as_ref().expect("sealed block backs the proof").period(),
        PeriodId::new(10),
    );
    assert_eq!(messenger.proofs().len(), 1);

    // the next seal happens within the current period and settles nothing
    sequencer.begin_block(BlockNumber::new(102)).unwrap();
    sequencer.end_block(header(102)).await.unwrap();
    assert_eq!(prover.requests().len(), 1);
}

#[tokio::test]
async fn failed_proof_requests_surface() {
    let (sequencer, _prover, messenger) = sequencer_with(RecordingProver::failing("prover down"));
    let error = sequencer
        .start_period(start_period(11, 11))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("prover down"));
    assert!(messenger.proofs().is_empty());
}

#[tokio::test]
async fn rollback_discards_unfinalized_state() {
    let (sequencer, _prover, _messenger) = sequencer();

    sequencer.begin_block(BlockNumber::new(101)).unwrap();
    sequencer.end_block(header(101)).await.unwrap();
    sequencer.start_period(start_period(11, 11)).await.unwrap();
    sequencer.begin_block(BlockNumber::new(102)).unwrap();
    sequencer
        .on_start_instance(InstanceId::new([1; 32]), PeriodId::new(11), SequenceNumber::new(1))
        .unwrap();

    let safe = sequencer
        .rollback(Rollback {
            period: PeriodId::new(11),
            superblock: SuperblockNumber::new(9),
            superblock_hash: SuperblockHash::new([9; 32]),
        })
        .unwrap();
    assert_eq!(safe, header(100));
    assert_eq!(sequencer.head(), BlockNumber::new(100));
    assert_eq!(sequencer.period(), PeriodId::new(11));

    // pending block and active instance are gone; building restarts at
    // the settled head
    assert!(sequencer.can_include_local_tx().is_err());
    sequencer.begin_block(BlockNumber::new(101)).unwrap();
    sequencer
        .on_start_instance(InstanceId::new([2; 32]), PeriodId::new(11), SequenceNumber::new(1))
        .unwrap();
}

#[test]
fn rollback_requires_the_matching_settled_state() {
    let (sequencer, _prover, _messenger) = sequencer();
    assert!(sequencer
        .rollback(Rollback {
            period: PeriodId::new(11),
            superblock: SuperblockNumber::new(8),
            superblock_hash: SuperblockHash::new([8; 32]),
        })
        .is_err());
    assert!(sequencer
        .rollback(Rollback {
            period: PeriodId::new(11),
            superblock: SuperblockNumber::new(9),
            superblock_hash: SuperblockHash::new([0; 32]),
        })
        .is_err());
}

#[test]
fn settled_state_only_advances() {
    let (sequencer, _prover, _messenger) = sequencer();
    let newer = SettledState::new(
        header(105),
        SuperblockNumber::new(10),
        SuperblockHash::new([10; 32]),
    );
    sequencer.advance_settled_state(newer);
    assert_eq!(sequencer.settled_state(), newer);

    // older and equal observations are ignored
    sequencer.advance_settled_state(settled());
    sequencer.advance_settled_state(newer);
    assert_eq!(sequencer.settled_state(), newer);
}

#[test]
fn cross_chain_requests_are_forwarded_to_the_publisher() {
    let (sequencer, _prover, messenger) = sequencer();
    let request = XtRequest::new(vec![
        TransactionRequest::new(ChainId::new(1), vec![Bytes::from_static(b"a")]),
        TransactionRequest::new(ChainId::new(2), vec![Bytes::from_static(b"b")]),
    ]);
    sequencer.receive_xt_request(request.clone());
    assert_eq!(messenger.forwarded(), vec![request]);
}
