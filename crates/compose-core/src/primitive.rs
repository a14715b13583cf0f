//! Primitive identifiers shared by every protocol layer.
//!
//! The numeric identifiers are opaque newtypes over `u64`; the fixed-size
//! identifiers are newtypes over byte arrays. None of them carry semantics
//! beyond identity and ordering.

pub const INSTANCE_ID_LEN: usize = 32;

pub const STATE_ROOT_LEN: usize = 32;

pub const BLOCK_HASH_LEN: usize = 32;

pub const SUPERBLOCK_HASH_LEN: usize = 32;

pub const ETH_ADDRESS_LEN: usize = 20;

macro_rules! u64_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name {
            inner: u64,
        }

        impl $name {
            #[must_use]
            pub const fn new(inner: u64) -> Self {
                Self {
                    inner,
                }
            }

            #[must_use]
            pub const fn get(self) -> u64 {
                self.inner
            }

            /// Returns the next identifier in the monotone sequence,
            /// saturating at `u64::MAX`.
            #[must_use]
            pub const fn next(self) -> Self {
                Self {
                    inner: self.inner.saturating_add(1),
                }
            }
        }

        impl From<u64> for $name {
            fn from(inner: u64) -> Self {
                Self::new(inner)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.inner.fmt(f)
            }
        }
    };
}

u64_id!(
    /// Identifies an independently sequenced chain. Opaque; assignment is a
    /// deployment concern.
    ChainId
);
u64_id!(
    /// Monotone counter of protocol periods.
    PeriodId
);
u64_id!(
    /// Monotone per-period counter of scheduled instances. Reset to zero at
    /// every period boundary.
    SequenceNumber
);
u64_id!(SuperblockNumber);
u64_id!(BlockNumber);
u64_id!(SessionId);

macro_rules! byte_array_id {
    ($(#[$docs:meta])* $name:ident, $len:expr, $error:ident) => {
        $(#[$docs])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name {
            inner: [u8; $len],
        }

        impl $name {
            #[must_use]
            pub const fn new(inner: [u8; $len]) -> Self {
                Self {
                    inner,
                }
            }

            #[must_use]
            pub const fn get(self) -> [u8; $len] {
                self.inner
            }

            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.inner
            }

            /// Convert a byte slice to the fixed-size identifier.
            ///
            /// # Errors
            ///
            /// Returns an error if the byte slice did not contain exactly
            /// the expected number of bytes.
            pub fn try_from_slice(bytes: &[u8]) -> Result<Self, $error> {
                let inner = <[u8; $len]>::try_from(bytes).map_err(|_| $error {
                    received: bytes.len(),
                })?;
                Ok(Self::new(inner))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.inner
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(inner: [u8; $len]) -> Self {
                Self {
                    inner,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                for byte in self.inner {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }

        #[derive(Debug, thiserror::Error)]
        #[error("expected {expected} bytes, got {received}", expected = $len)]
        pub struct $error {
            received: usize,
        }
    };
}

byte_array_id!(
    /// Content-addressed identifier of a protocol instance.
    ///
    /// Derived from the scheduling period, the per-period sequence number,
    /// and the cross-chain request itself; see [`InstanceId::derive`].
    InstanceId,
    INSTANCE_ID_LEN,
    IncorrectInstanceIdLength
);
byte_array_id!(StateRoot, STATE_ROOT_LEN, IncorrectStateRootLength);
byte_array_id!(BlockHash, BLOCK_HASH_LEN, IncorrectBlockHashLength);
byte_array_id!(
    /// Aggregate state reference of one period, published to L1.
    SuperblockHash,
    SUPERBLOCK_HASH_LEN,
    IncorrectSuperblockHashLength
);
byte_array_id!(
    /// A 20-byte account address on a participating rollup.
    EthAddress,
    ETH_ADDRESS_LEN,
    IncorrectEthAddressLength
);
