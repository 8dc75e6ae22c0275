use crate::{codecs::Link, error::UnixFsError, hash::MURMUR3_X64_64, unixfs::Data};
use std::io::Cursor;
use tracing::trace;
use wnfs_common::Cid;

/// Hash a directory entry name the way HAMT shards bucket them:
/// The first 8 bytes of its murmur3-x64-128 hash, as a big-endian integer.
pub fn name_hash(name: &str) -> u64 {
    // Reading from an in-memory cursor can't fail
    let hash = murmur3::murmur3_x64_128(&mut Cursor::new(name.as_bytes()), 0).unwrap_or_default();
    // The crate packs h1 into the lower half, which is what's emitted first
    hash as u64
}

/// A cursor over the bits of a name hash, consumed most-significant bit first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashBits {
    hash: u64,
    consumed: u32,
}

impl HashBits {
    /// Start reading the bits of a name's hash
    pub fn new(name: &str) -> Self {
        Self::from_hash(name_hash(name))
    }

    /// Start reading the bits of a precomputed hash
    pub fn from_hash(hash: u64) -> Self {
        Self { hash, consumed: 0 }
    }

    /// Take the next `bits` bits, or `None` if not enough bits remain.
    pub fn take(&mut self, bits: u32) -> Option<u64> {
        if bits == 0 || self.consumed + bits > u64::BITS {
            return None;
        }
        let index = (self.hash << self.consumed) >> (u64::BITS - bits);
        self.consumed += bits;
        Some(index)
    }
}

/// The layout parameters of a HAMT shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    bits: u32,
    padding: usize,
}

impl ShardLayout {
    /// Check a shard's hash function & fanout and derive its layout.
    pub fn from_data(cid: &Cid, data: &Data) -> Result<Self, UnixFsError> {
        let hash_type = data.hash_type.unwrap_or_default();
        if hash_type != MURMUR3_X64_64 {
            return Err(UnixFsError::UnsupportedHamtHash {
                cid: *cid,
                hash_type,
            });
        }

        let fanout = data.fanout.unwrap_or_default();
        Self::from_fanout(fanout).ok_or(UnixFsError::InvalidFanout { cid: *cid, fanout })
    }

    /// The layout for a fanout. It needs to be a power of two between 2 and 1024.
    pub fn from_fanout(fanout: u64) -> Option<Self> {
        if !(2..=1024).contains(&fanout) || !fanout.is_power_of_two() {
            return None;
        }
        Some(Self {
            bits: fanout.trailing_zeros(),
            padding: format!("{:X}", fanout - 1).len(),
        })
    }

    /// The number of hash bits consumed per shard level
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// The link name prefix for a bucket index
    pub fn prefix(&self, index: u64) -> String {
        format!("{index:0width$X}", width = self.padding)
    }

    /// Split a link name into its bucket prefix and the entry name.
    ///
    /// An empty entry name means the link points to a child shard.
    pub fn split_name<'a>(&self, link_name: &'a str) -> Option<(&'a str, &'a str)> {
        if link_name.len() < self.padding || !link_name.is_char_boundary(self.padding) {
            return None;
        }
        Some(link_name.split_at(self.padding))
    }
}

/// What a single shard says about the name we're looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStep {
    /// This shard links to the entry directly
    Entry(Cid),
    /// Continue the lookup in a child shard
    Shard(Cid),
    /// The name isn't part of the directory
    NotFound,
}

/// An ongoing lookup of a name through the shards of a HAMT directory.
#[derive(Debug, Clone)]
pub struct ShardLookup {
    name: String,
    bits: HashBits,
}

impl ShardLookup {
    /// Start looking up `name`, beginning at a HAMT directory's root shard.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let bits = HashBits::new(&name);
        Self { name, bits }
    }

    /// The entry name that's being looked up
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check the next shard on the way to the entry.
    pub fn step(&mut self, cid: &Cid, data: &Data, links: &[Link]) -> Result<ShardStep, UnixFsError> {
        let layout = ShardLayout::from_data(cid, data)?;
        let index = self
            .bits
            .take(layout.bits())
            .ok_or(UnixFsError::ShardDepthExceeded { cid: *cid })?;
        let prefix = layout.prefix(index);

        trace!(shard = %cid, name = %self.name, %prefix, "looking up HAMT bucket");

        let found = links.iter().find_map(|link| {
            let (link_prefix, entry) = layout.split_name(link.name.as_deref()?)?;
            (link_prefix == prefix).then_some((entry, link.cid))
        });

        Ok(match found {
            Some(("", child)) => ShardStep::Shard(child),
            Some((entry, cid)) if entry == self.name => ShardStep::Entry(cid),
            _ => ShardStep::NotFound,
        })
    }
}
