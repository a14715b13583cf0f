use crate::primitive::{
    BlockHash,
    BlockNumber,
    PeriodId,
    StateRoot,
    SuperblockHash,
    SuperblockNumber,
};

/// Identity of an L2 block as the coordination core sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockHeader {
    number: BlockNumber,
    hash: BlockHash,
    state_root: StateRoot,
}

impl BlockHeader {
    #[must_use]
    pub fn new(number: BlockNumber, hash: BlockHash, state_root: StateRoot) -> Self {
        Self {
            number,
            hash,
            state_root,
        }
    }

    #[must_use]
    pub fn number(&self) -> BlockNumber {
        self.number
    }

    #[must_use]
    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    #[must_use]
    pub fn state_root(&self) -> StateRoot {
        self.state_root
    }
}

/// A block that has been opened but not yet sealed, tagged with the period
/// and target superblock under which it was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBlock {
    number: BlockNumber,
    period: PeriodId,
    superblock: SuperblockNumber,
}

impl PendingBlock {
    #[must_use]
    pub fn new(number: BlockNumber, period: PeriodId, superblock: SuperblockNumber) -> Self {
        Self {
            number,
            period,
            superblock,
        }
    }

    #[must_use]
    pub fn number(&self) -> BlockNumber {
        self.number
    }

    #[must_use]
    pub fn period(&self) -> PeriodId {
        self.period
    }

    #[must_use]
    pub fn superblock(&self) -> SuperblockNumber {
        self.superblock
    }
}

/// A sealed block together with the period and superblock tag it was
/// opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SealedBlockHeader {
    header: BlockHeader,
    period: PeriodId,
    superblock: SuperblockNumber,
}

impl SealedBlockHeader {
    #[must_use]
    pub fn new(header: BlockHeader, period: PeriodId, superblock: SuperblockNumber) -> Self {
        Self {
            header,
            period,
            superblock,
        }
    }

    #[must_use]
    pub fn header(&self) -> BlockHeader {
        self.header
    }

    #[must_use]
    pub fn period(&self) -> PeriodId {
        self.period
    }

    #[must_use]
    pub fn superblock(&self) -> SuperblockNumber {
        self.superblock
    }
}

/// The authoritative L1 view: the most recent block finalized under a
/// superblock, with that superblock's number and hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SettledState {
    header: BlockHeader,
    superblock_number: SuperblockNumber,
    superblock_hash: SuperblockHash,
}

impl SettledState {
    #[must_use]
    pub fn new(
        header: BlockHeader,
        superblock_number: SuperblockNumber,
        superblock_hash: SuperblockHash,
    ) -> Self {
        Self {
            header,
            superblock_number,
            superblock_hash,
        }
    }

    #[must_use]
    pub fn header(&self) -> BlockHeader {
        self.header
    }

    #[must_use]
    pub fn superblock_number(&self) -> SuperblockNumber {
        self.superblock_number
    }

    #[must_use]
    pub fn superblock_hash(&self) -> SuperblockHash {
        self.superblock_hash
    }
}
