use crate::bitswap::{BitswapCodec, BitswapFetcher, Config, Dialer, Message};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::io::DuplexStream;
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    compat::{Compat, TokioAsyncReadCompatExt},
};
use tracing::{debug, warn};
use wnfs_common::{BlockStore, BlockStoreError, Cid, utils::CondSend};

const BUFFER_SIZE: usize = 1 << 20;

type Responses = Arc<tokio::sync::Mutex<FramedWrite<DuplexStream, BitswapCodec>>>;

/// An in-process bitswap peer serving blocks from memory.
///
/// Wants arrive on streams dialed by a [`MockDialer`], responses are sent on
/// a single stream that's read by the connected fetcher's `handle_inbound`.
#[derive(Debug, Clone, Default)]
pub struct MockPeer {
    blocks: Arc<Mutex<HashMap<Cid, Bytes>>>,
    wants: Arc<Mutex<Vec<Cid>>>,
    dials: Arc<AtomicUsize>,
    failing_dials: Arc<AtomicUsize>,
    latency: Duration,
    unresponsive: bool,
}

/// Dials streams to a [`MockPeer`]
#[derive(Debug)]
pub struct MockDialer {
    peer: MockPeer,
    responses: Responses,
}

impl MockPeer {
    /// A peer without any blocks that responds immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay each response by up to `latency`, depending on the block.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Record wants, but never respond to them.
    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    /// Refuse the next `count` dials.
    pub fn failing_dials(self, count: usize) -> Self {
        self.failing_dials.store(count, Ordering::SeqCst);
        self
    }

    /// Make a block available.
    pub fn insert(&self, cid: Cid, bytes: impl Into<Bytes>) {
        self.blocks.lock().insert(cid, bytes.into());
    }

    /// All CIDs the peer received wants for, in order.
    pub fn wants(&self) -> Vec<Cid> {
        self.wants.lock().clone()
    }

    /// How often the peer was dialed, including refused dials.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Create a fetcher for this peer.
    ///
    /// Needs to be called from within a tokio runtime.
    pub fn connect(&self, config: Config) -> BitswapFetcher<MockDialer> {
        let (responses, inbound) = tokio::io::duplex(BUFFER_SIZE);
        let responses = Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
            responses,
            BitswapCodec::new(config.max_message_size),
        )));

        let fetcher = BitswapFetcher::new(
            MockDialer {
                peer: self.clone(),
                responses,
            },
            config,
        );

        tokio::spawn({
            let fetcher = fetcher.clone();
            async move {
                if let Err(e) = fetcher.handle_inbound(inbound.compat()).await {
                    warn!(error = %e, "mock peer response stream broke");
                }
            }
        });

        fetcher
    }

    fn delay_for(&self, cid: &Cid) -> Duration {
        let spread = cid.hash().digest().first().copied().unwrap_or_default() % 4;
        self.latency * (u32::from(spread) + 1) / 4
    }

    async fn serve(self, stream: DuplexStream, responses: Responses) {
        let mut wants = FramedRead::new(stream, BitswapCodec::default());
        while let Some(message) = wants.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "mock peer received a malformed message");
                    return;
                }
            };

            for cid in message.wanted_cids().filter_map(Result::ok) {
                self.wants.lock().push(cid);
                if self.unresponsive {
                    continue;
                }

                let delay = self.delay_for(&cid);
                let reply = match self.blocks.lock().get(&cid) {
                    Some(bytes) => Message::with_blocks([(&cid, bytes)]),
                    None => Message::dont_have([&cid]),
                };
                let responses = Arc::clone(&responses);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = responses.lock().await.send(reply).await {
                        debug!(error = %e, "mock peer couldn't respond");
                    }
                });
            }
        }
    }
}

impl Dialer for MockDialer {
    type Stream = Compat<DuplexStream>;

    async fn dial(&self) -> io::Result<Self::Stream> {
        self.peer.dials.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .peer
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock peer refused the dial",
            ));
        }

        let (local, remote) = tokio::io::duplex(BUFFER_SIZE);
        tokio::spawn(
            self.peer
                .clone()
                .serve(remote, Arc::clone(&self.responses)),
        );
        Ok(local.compat())
    }
}

impl BlockStore for MockPeer {
    async fn get_block(&self, cid: &Cid) -> Result<Bytes, BlockStoreError> {
        self.blocks
            .lock()
            .get(cid)
            .cloned()
            .ok_or(BlockStoreError::CIDNotFound(*cid))
    }

    async fn put_block_keyed(
        &self,
        cid: Cid,
        bytes: impl Into<Bytes> + CondSend,
    ) -> Result<(), BlockStoreError> {
        self.insert(cid, bytes);
        Ok(())
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool, BlockStoreError> {
        Ok(self.blocks.lock().contains_key(cid))
    }
}
