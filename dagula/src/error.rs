use crate::bitswap::CodecError;
use wnfs_common::{BlockStoreError, Cid};

/// Errors raised from the dagula library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Only raw, dag-pb, dag-cbor and dag-json blocks can be decoded.
    /// This is raised when a traversal reaches a CID with any other codec.
    #[error("Unsupported codec in Cid: {cid}")]
    UnsupportedCodec {
        /// The CID with the unsupported codec
        cid: Cid,
    },

    /// Only identity, SHA2-256, SHA2-512 and BLAKE3 multihashes can be computed.
    /// Raised when a block prefix or CID names any other hash function.
    #[error("Unsupported hash code {code:#x}")]
    UnsupportedHashCode {
        /// The multihash code
        code: u64,
    },

    /// A path segment has no matching entry in the block it was resolved against.
    #[error("file does not exist")]
    PathNotFound {
        /// The CID of the last block that was successfully resolved
        cid: Cid,
        /// The path segment that couldn't be found
        segment: String,
    },

    /// The input couldn't be parsed as `<cid>[/segment...]`.
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath {
        /// The path as given
        path: String,
        /// Why it couldn't be parsed
        reason: String,
    },

    /// A traversal option couldn't be parsed from a string.
    #[error("Invalid {option}: {value:?}")]
    InvalidOption {
        /// Which option was being parsed
        option: &'static str,
        /// The unrecognized value
        value: String,
    },

    /// Errors from fetching blocks from the remote peer
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// An error rasied from the blockstore.
    #[error("BlockStore error: {0}")]
    BlockStoreError(BlockStoreError),

    // -------------
    // Anyhow Errors
    // -------------
    /// An error raised when trying to parse a block (e.g. to look for further links)
    #[error("Error during block parsing: {0}")]
    ParsingError(anyhow::Error),

    // ----------
    // Sub-errors
    // ----------
    /// Errors related to UnixFS metadata and HAMT sharding
    #[error(transparent)]
    UnixFs(#[from] UnixFsError),

    /// Errors when framing or parsing bitswap messages
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An error rasied when trying to write a CAR file.
    #[error("CAR (de)serialization error: {0}")]
    CarFileError(#[from] iroh_car::Error),

    /// IO errors, e.g. from reading UnixFS file content
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The outcome of a failed block request.
///
/// Every caller waiting on the same request receives a clone of the same error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The peer told us it doesn't have the block.
    #[error("Peer does not have block {cid}")]
    BlockUnavailable {
        /// The requested CID
        cid: Cid,
    },

    /// The bitswap stream to the peer couldn't be established.
    #[error("Bitswap stream unavailable: {reason}")]
    TransportUnavailable {
        /// Description of the underlying dial error
        reason: String,
    },

    /// The bitswap stream failed before a response arrived.
    #[error("Bitswap stream error: {reason}")]
    TransportError {
        /// Description of the underlying stream error
        reason: String,
    },

    /// No response arrived within the configured request timeout.
    #[error("Timed out waiting for block {cid}")]
    Timeout {
        /// The requested CID
        cid: Cid,
    },

    /// The CID's multihash can't be computed, so a delivered block couldn't be verified.
    #[error("Unsupported hash code {code:#x} in Cid: {cid}")]
    UnsupportedHashCode {
        /// The requested CID
        cid: Cid,
        /// The multihash code
        code: u64,
    },
}

/// Errors related to UnixFS metadata in dag-pb nodes
#[derive(thiserror::Error, Debug)]
pub enum UnixFsError {
    /// The `Data` field of a dag-pb node isn't a valid UnixFS protobuf.
    #[error("Invalid UnixFS data in {cid}: {source}")]
    InvalidData {
        /// The dag-pb node's CID
        cid: Cid,
        /// The protobuf error
        source: prost::DecodeError,
    },

    /// HAMT shards are only supported with murmur3-x64-64 hashing.
    #[error("Unsupported HAMT hash function {hash_type:#x} in shard {cid}")]
    UnsupportedHamtHash {
        /// The shard's CID
        cid: Cid,
        /// The multihash code from the shard's UnixFS data
        hash_type: u64,
    },

    /// HAMT fanouts need to be a power of two between 2 and 1024.
    #[error("Invalid HAMT fanout {fanout} in shard {cid}")]
    InvalidFanout {
        /// The shard's CID
        cid: Cid,
        /// The fanout from the shard's UnixFS data
        fanout: u64,
    },

    /// The 64 bits of the name hash were used up before the entry was found.
    #[error("HAMT shard {cid} is nested deeper than the name hash allows")]
    ShardDepthExceeded {
        /// The shard's CID
        cid: Cid,
    },

    /// Only files, directories and raw blocks can be exported.
    #[error("Block {cid} is neither a UnixFS file nor a directory")]
    NotExportable {
        /// The path target's CID
        cid: Cid,
    },
}

impl Error {
    /// Return the fetch error, if this error was caused by fetching a block.
    pub fn as_fetch_error(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BlockStoreError> for Error {
    fn from(err: BlockStoreError) -> Self {
        match err {
            BlockStoreError::CIDNotFound(cid) => Self::Fetch(FetchError::BlockUnavailable { cid }),
            BlockStoreError::Custom(err) => match err.downcast::<FetchError>() {
                Ok(fetch_err) => Self::Fetch(fetch_err),
                Err(err) => Self::BlockStoreError(BlockStoreError::Custom(err)),
            },
            err => Self::BlockStoreError(err),
        }
    }
}

impl From<FetchError> for BlockStoreError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::BlockUnavailable { cid } => Self::CIDNotFound(cid),
            err => Self::Custom(anyhow::Error::new(err)),
        }
    }
}
