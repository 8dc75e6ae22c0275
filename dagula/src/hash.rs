use crate::error::Error;
use ipld_core::cid::{Cid, multihash::Multihash};
use sha2::{Digest, Sha256, Sha512};

/// The identity "hash": the digest is the data itself.
pub const IDENTITY: u64 = 0x00;
/// SHA2-256, the default for CIDv0 and most IPFS content.
pub const SHA2_256: u64 = 0x12;
/// SHA2-512
pub const SHA2_512: u64 = 0x13;
/// BLAKE3 with 32 byte output
pub const BLAKE3: u64 = 0x1e;
/// The hash function used by UnixFS HAMT shards for bucketing names.
pub const MURMUR3_X64_64: u64 = 0x22;

const SUPPORTED: [u64; 4] = [IDENTITY, SHA2_256, SHA2_512, BLAKE3];

/// Returns whether multihashes with given code can be computed.
pub fn is_supported(code: u64) -> bool {
    SUPPORTED.contains(&code)
}

/// Compute the multihash of `data` using the hash function identified by `code`.
pub fn digest(code: u64, data: &[u8]) -> Result<Multihash<64>, Error> {
    let wrapped = match code {
        IDENTITY => Multihash::wrap(code, data),
        SHA2_256 => Multihash::wrap(code, &Sha256::digest(data)),
        SHA2_512 => Multihash::wrap(code, &Sha512::digest(data)),
        BLAKE3 => Multihash::wrap(code, blake3::hash(data).as_bytes()),
        _ => return Err(Error::UnsupportedHashCode { code }),
    };

    wrapped.map_err(|e| Error::ParsingError(e.into()))
}

/// Check whether `data` hashes to the multihash in `cid`.
#[cfg(test)]
pub(crate) fn verify(cid: &Cid, data: &[u8]) -> Result<bool, Error> {
    let hash = cid.hash();
    let computed = digest(hash.code(), data)?;
    Ok(computed.digest() == hash.digest())
}

/// Create a CIDv1 for `data` with given codec, hashed with SHA2-256.
pub fn cid_for(codec: u64, data: &[u8]) -> Result<Cid, Error> {
    Ok(Cid::new_v1(codec, digest(SHA2_256, data)?))
}
