//! Fetching blocks from a single peer over the bitswap protocol.
//!
//! The [`BitswapFetcher`] sends wants on one outbound stream and resolves
//! them from the messages it's handed via [`BitswapFetcher::handle_inbound`].
//! It's a [`wnfs_common::BlockStore`], so it can back any traversal.

mod codec;
mod fetcher;
/// Bitswap protobuf messages
pub mod message;

pub use codec::{BitswapCodec, CodecError, MAX_MESSAGE_SIZE};
pub use fetcher::{BITSWAP_PROTOCOL, BitswapFetcher, Config, Dialer};
pub use message::Message;
