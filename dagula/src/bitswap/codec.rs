use super::message::Message;
use bytes::{Buf, BytesMut};
use prost::Message as _;
use tokio_util::codec::{Decoder, Encoder};
use unsigned_varint::{decode, encode};

/// The largest Bitswap message accepted by default
pub const MAX_MESSAGE_SIZE: usize = 4 * 1_024 * 1_024;

/// Errors when framing or parsing bitswap messages
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The underlying stream failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A length prefix or block prefix isn't a valid unsigned varint
    #[error("Invalid varint: {0}")]
    Varint(#[from] decode::Error),

    /// A peer sent (or we tried to send) a message bigger than allowed
    #[error("Bitswap message of {size} bytes exceeds the maximum of {max_size} bytes")]
    MessageTooLarge {
        /// The message's size
        size: usize,
        /// The configured maximum
        max_size: usize,
    },

    /// The frame isn't a valid Bitswap protobuf
    #[error("Invalid bitswap message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The message couldn't be protobuf-encoded
    #[error("Couldn't encode bitswap message: {0}")]
    Encode(#[from] prost::EncodeError),

    /// A wantlist entry or block presence has an invalid CID
    #[error("Invalid CID in bitswap message: {0}")]
    InvalidCid(#[from] ipld_core::cid::Error),
}

/// Frames Bitswap messages with an unsigned varint length prefix.
#[derive(Debug, Clone)]
pub struct BitswapCodec {
    max_message_size: usize,
}

impl BitswapCodec {
    /// Create a codec that rejects messages bigger than `max_message_size` bytes.
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for BitswapCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Decoder for BitswapCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (size, header_len) = match decode::usize(&src[..]) {
            Ok((size, rest)) => (size, src.len() - rest.len()),
            Err(decode::Error::Insufficient) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if size > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size,
                max_size: self.max_message_size,
            });
        }

        let frame_len = header_len + size;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let frame = src.split_to(size).freeze();
        Ok(Some(Message::decode(frame)?))
    }
}

impl Encoder<Message> for BitswapCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.encoded_len();
        if size > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size,
                max_size: self.max_message_size,
            });
        }

        let mut buffer = encode::usize_buffer();
        let header = encode::usize(size, &mut buffer);
        dst.reserve(header.len() + size);
        dst.extend_from_slice(header);
        item.encode(dst)?;
        Ok(())
    }
}
