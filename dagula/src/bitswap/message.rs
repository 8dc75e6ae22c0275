use super::codec::CodecError;
use crate::{
    codecs::DAG_PB,
    error::Error,
    hash::{self, SHA2_256},
};
use bytes::Bytes;
use ipld_core::cid::{Cid, Version, multihash::Multihash};
use unsigned_varint::{decode, encode};

/// A Bitswap message, as exchanged on `/ipfs/bitswap/1.2.0` streams.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    /// Blocks the sender wants
    #[prost(message, optional, tag = "1")]
    pub wantlist: Option<Wantlist>,
    /// Bitswap 1.0 blocks, always CIDv0
    #[prost(bytes = "bytes", repeated, tag = "2")]
    pub blocks: Vec<Bytes>,
    /// Blocks with their CID prefix
    #[prost(message, repeated, tag = "3")]
    pub payload: Vec<Block>,
    /// Have/DontHave answers
    #[prost(message, repeated, tag = "4")]
    pub block_presences: Vec<BlockPresence>,
    /// Bytes the sender still has queued for us
    #[prost(int32, tag = "5")]
    pub pending_bytes: i32,
}

/// The wantlist part of a message
#[derive(Clone, PartialEq, prost::Message)]
pub struct Wantlist {
    /// Changes to the wantlist
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<Entry>,
    /// Whether this replaces the sender's entire wantlist
    #[prost(bool, tag = "2")]
    pub full: bool,
}

/// A single wantlist entry
#[derive(Clone, PartialEq, prost::Message)]
pub struct Entry {
    /// The binary CID
    #[prost(bytes = "bytes", tag = "1")]
    pub block: Bytes,
    /// Higher is more urgent
    #[prost(int32, tag = "2")]
    pub priority: i32,
    /// Remove the CID from the wantlist
    #[prost(bool, tag = "3")]
    pub cancel: bool,
    /// See `WantType`
    #[prost(enumeration = "WantType", tag = "4")]
    pub want_type: i32,
    /// Ask the peer to tell us when it doesn't have the block
    #[prost(bool, tag = "5")]
    pub send_dont_have: bool,
}

/// What we want to receive for a wantlist entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WantType {
    /// Send the block itself
    Block = 0,
    /// Only tell us whether you have it
    Have = 1,
}

/// A block with the prefix needed to rebuild its CID
#[derive(Clone, PartialEq, prost::Message)]
pub struct Block {
    /// CID version, codec & multihash parameters, see `BlockPrefix`
    #[prost(bytes = "bytes", tag = "1")]
    pub prefix: Bytes,
    /// The block's bytes
    #[prost(bytes = "bytes", tag = "2")]
    pub data: Bytes,
}

/// An answer to a `Have` want, or to a `Block` want with `send_dont_have`
#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockPresence {
    /// The binary CID
    #[prost(bytes = "bytes", tag = "1")]
    pub cid: Bytes,
    /// See `BlockPresenceType`
    #[prost(enumeration = "BlockPresenceType", tag = "2")]
    pub r#type: i32,
}

/// Whether a peer has a block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum BlockPresenceType {
    /// The peer has the block
    Have = 0,
    /// The peer doesn't have the block
    DontHave = 1,
}

/// The CID metadata sent along with a block: everything but the digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPrefix {
    /// CID version
    pub version: u64,
    /// Content codec
    pub codec: u64,
    /// Multihash code
    pub mh_type: u64,
    /// Digest length in bytes
    pub mh_len: u64,
}

impl BlockPrefix {
    /// The prefix of an existing CID.
    pub fn from_cid(cid: &Cid) -> Self {
        Self {
            version: u64::from(cid.version()),
            codec: cid.codec(),
            mh_type: cid.hash().code(),
            mh_len: u64::from(cid.hash().size()),
        }
    }

    /// Parse a prefix from its wire form, four unsigned varints.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        let (version, rest) = decode::u64(bytes)?;
        let (codec, rest) = decode::u64(rest)?;
        let (mh_type, rest) = decode::u64(rest)?;
        let (mh_len, _) = decode::u64(rest)?;
        Ok(Self {
            version,
            codec,
            mh_type,
            mh_len,
        })
    }

    /// Encode the prefix into its wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8);
        for value in [self.version, self.codec, self.mh_type, self.mh_len] {
            bytes.extend_from_slice(encode::u64(value, &mut encode::u64_buffer()));
        }
        bytes
    }

    /// Hash `data` according to this prefix and build the resulting CID.
    pub fn to_cid(&self, data: &[u8]) -> Result<Cid, Error> {
        let hash = hash::digest(self.mh_type, data)?;
        let len = usize::try_from(self.mh_len).unwrap_or(usize::MAX);
        let hash = if len < hash.digest().len() {
            Multihash::wrap(self.mh_type, &hash.digest()[..len])
                .map_err(|e| Error::ParsingError(e.into()))?
        } else {
            hash
        };

        let version = Version::try_from(self.version).map_err(|e| Error::ParsingError(e.into()))?;
        Cid::new(version, self.codec, hash).map_err(|e| Error::ParsingError(e.into()))
    }
}

impl Message {
    /// A message asking for a single block, with a `DontHave` reply if the peer lacks it.
    pub fn want_block(cid: &Cid, priority: i32) -> Self {
        Self {
            wantlist: Some(Wantlist {
                entries: vec![Entry {
                    block: Bytes::from(cid.to_bytes()),
                    priority,
                    cancel: false,
                    want_type: WantType::Block as i32,
                    send_dont_have: true,
                }],
                full: false,
            }),
            ..Default::default()
        }
    }

    /// A message carrying blocks, in the Bitswap 1.1+ payload format.
    pub fn with_blocks<'a>(blocks: impl IntoIterator<Item = (&'a Cid, &'a Bytes)>) -> Self {
        Self {
            payload: blocks
                .into_iter()
                .map(|(cid, data)| Block {
                    prefix: Bytes::from(BlockPrefix::from_cid(cid).to_bytes()),
                    data: data.clone(),
                })
                .collect(),
            ..Default::default()
        }
    }

    /// A message telling the receiver we don't have these blocks.
    pub fn dont_have<'a>(cids: impl IntoIterator<Item = &'a Cid>) -> Self {
        Self {
            block_presences: cids
                .into_iter()
                .map(|cid| BlockPresence {
                    cid: Bytes::from(cid.to_bytes()),
                    r#type: BlockPresenceType::DontHave as i32,
                })
                .collect(),
            ..Default::default()
        }
    }

    /// The CIDs in the wantlist that aren't cancellations.
    pub fn wanted_cids(&self) -> impl Iterator<Item = Result<Cid, CodecError>> + '_ {
        self.wantlist
            .iter()
            .flat_map(|wantlist| wantlist.entries.iter())
            .filter(|entry| !entry.cancel)
            .map(|entry| -> Result<Cid, CodecError> { Ok(Cid::try_from(&entry.block[..])?) })
    }

    /// All blocks in this message with the CID each one hashes to.
    ///
    /// Since CIDs are recomputed from the data, a corrupted block never
    /// matches the CID it was requested under.
    pub fn received_blocks(&self) -> impl Iterator<Item = Result<(Cid, Bytes), Error>> + '_ {
        let legacy = self.blocks.iter().map(|data| -> Result<(Cid, Bytes), Error> {
            let hash = hash::digest(SHA2_256, data)?;
            let cid = Cid::new(Version::V0, DAG_PB, hash).map_err(|e| Error::ParsingError(e.into()))?;
            Ok((cid, data.clone()))
        });

        let payload = self.payload.iter().map(|block| -> Result<(Cid, Bytes), Error> {
            let prefix = BlockPrefix::parse(&block.prefix)?;
            Ok((prefix.to_cid(&block.data)?, block.data.clone()))
        });

        legacy.chain(payload)
    }

    /// All CIDs the sender says it doesn't have.
    pub fn dont_haves(&self) -> impl Iterator<Item = Result<Cid, CodecError>> + '_ {
        self.block_presences
            .iter()
            .filter(|presence| presence.r#type == BlockPresenceType::DontHave as i32)
            .map(|presence| -> Result<Cid, CodecError> { Ok(Cid::try_from(&presence.cid[..])?) })
    }
}
