use super::{
    codec::{BitswapCodec, CodecError, MAX_MESSAGE_SIZE},
    message::Message,
};
use crate::{
    error::FetchError,
    hash::{self, IDENTITY},
};
use bytes::Bytes;
use futures::{
    AsyncRead, AsyncWrite, FutureExt, SinkExt, StreamExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fmt::Debug,
    future::Future,
    io,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    compat::{Compat, FuturesAsyncReadCompatExt, FuturesAsyncWriteCompatExt},
};
use tracing::{debug, instrument, trace, warn};
use wnfs_common::{BlockStore, BlockStoreError, Cid, utils::CondSend};

/// The protocol identifier streams to the peer are dialed with.
pub const BITSWAP_PROTOCOL: &str = "/ipfs/bitswap/1.2.0";

/// Configuration values (such as timeouts) for fetching blocks over bitswap
#[derive(Debug, Clone)]
pub struct Config {
    /// How long to wait for a block or a `DontHave` after sending a want.
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,
    /// The maximum size of a single bitswap message, sent or received.
    ///
    /// Default: 4 MiB
    pub max_message_size: usize,
    /// The priority attached to every want.
    ///
    /// Default: 1
    pub want_priority: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_message_size: MAX_MESSAGE_SIZE,
            want_priority: 1,
        }
    }
}

/// Opens streams to the peer blocks are fetched from.
pub trait Dialer: Send + Sync + 'static {
    /// The duplex byte stream used to send wants
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new stream to the peer, speaking `BITSWAP_PROTOCOL`.
    fn dial(&self) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Called once the fetcher is destroyed, to release any transport resources.
    fn close(&self) {}
}

impl<F, Fut, S> Dialer for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<S>> + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    fn dial(&self) -> impl Future<Output = io::Result<S>> + Send {
        self()
    }
}

type Outcome = Result<Bytes, FetchError>;
type SessionAttempt<S> = Shared<BoxFuture<'static, Result<Arc<Session<S>>, FetchError>>>;

/// Fetches blocks from a single peer over bitswap.
///
/// Wants are sent on a single outbound stream, which is dialed lazily.
/// Responses arrive on inbound streams the peer opens, which need to be
/// passed to `handle_inbound`.
///
/// Cloning is cheap and yields a handle to the same fetcher.
/// Fetching needs to happen from within a tokio runtime.
pub struct BitswapFetcher<D: Dialer> {
    inner: Arc<Inner<D>>,
}

struct Inner<D: Dialer> {
    dialer: Arc<D>,
    config: Config,
    pending: Mutex<HashMap<Cid, Pending>>,
    session: Mutex<Option<SessionAttempt<D::Stream>>>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
}

struct Pending {
    id: u64,
    resolver: oneshot::Sender<Outcome>,
    outcome: Shared<BoxFuture<'static, Outcome>>,
}

struct Session<S> {
    writer: tokio::sync::Mutex<FramedWrite<Compat<S>, BitswapCodec>>,
}

impl<D: Dialer> Clone for BitswapFetcher<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dialer> Debug for BitswapFetcher<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitswapFetcher")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.pending.lock().len())
            .field("connected", &self.inner.session.lock().is_some())
            .finish()
    }
}

impl<D: Dialer> BitswapFetcher<D> {
    /// Create a fetcher using `dialer` to open streams to the peer.
    ///
    /// Nothing is dialed until the first block is fetched.
    pub fn new(dialer: D, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer: Arc::new(dialer),
                config,
                pending: Mutex::new(HashMap::new()),
                session: Mutex::new(None),
                next_id: AtomicU64::new(0),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// The fetcher's configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Fetch a block from the peer.
    ///
    /// Concurrent fetches for the same CID share one want and its outcome.
    /// Each request runs in its own tokio task, so it settles and gets cleaned
    /// up even if every caller stops waiting for it.
    pub async fn fetch(&self, cid: &Cid) -> Result<Bytes, FetchError> {
        let hash = cid.hash();
        if hash.code() == IDENTITY {
            return Ok(Bytes::copy_from_slice(hash.digest()));
        }
        if !hash::is_supported(hash.code()) {
            // A delivered block could never be matched to its CID
            return Err(FetchError::UnsupportedHashCode {
                cid: *cid,
                code: hash.code(),
            });
        }

        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(FetchError::TransportUnavailable {
                reason: "fetcher was destroyed".into(),
            });
        }

        let outcome = {
            let mut pending = self.inner.pending.lock();
            match pending.get(cid) {
                Some(request) => {
                    trace!(%cid, "joining pending request");
                    request.outcome.clone()
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (resolver, receiver) = oneshot::channel();
                    let task =
                        tokio::spawn(request(Arc::downgrade(&self.inner), *cid, id, receiver));
                    let outcome = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(FetchError::TransportError {
                                reason: e.to_string(),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    pending.insert(
                        *cid,
                        Pending {
                            id,
                            resolver,
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };

        outcome.await
    }

    /// Read messages from a peer-initiated stream until it ends.
    ///
    /// Returns an error if the stream breaks or the peer sends a malformed frame.
    pub async fn handle_inbound<S: AsyncRead + Unpin>(&self, stream: S) -> Result<(), CodecError> {
        let mut frames = FramedRead::new(
            stream.compat(),
            BitswapCodec::new(self.inner.config.max_message_size),
        );

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(message) => self.handle_message(message),
                Err(e) => {
                    warn!(error = %e, "closing broken inbound bitswap stream");
                    return Err(e);
                }
            }
        }

        debug!("inbound bitswap stream ended");
        Ok(())
    }

    /// Resolve pending requests from a single bitswap message.
    pub fn handle_message(&self, message: Message) {
        for received in message.received_blocks() {
            match received {
                Ok((cid, data)) => {
                    if !self.inner.resolve(&cid, Ok(data)) {
                        debug!(%cid, "dropping block nobody asked for");
                    }
                }
                Err(e) => warn!(error = %e, "dropping malformed block"),
            }
        }

        for dont_have in message.dont_haves() {
            match dont_have {
                Ok(cid) => {
                    debug!(%cid, "peer doesn't have block");
                    self.inner
                        .resolve(&cid, Err(FetchError::BlockUnavailable { cid }));
                }
                Err(e) => warn!(error = %e, "dropping malformed block presence"),
            }
        }
    }

    /// Close the outbound stream and fail all requests still waiting for a response.
    ///
    /// Calling this more than once, or before anything was fetched, is fine.
    #[instrument(skip(self))]
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let attempt = self.inner.session.lock().take();
        let session = attempt.and_then(|attempt| attempt.peek().cloned());
        if let Some(Ok(session)) = session {
            debug!("closing bitswap stream");
            session.close().await;
        }

        let pending = self.inner.pending.lock().drain().collect::<Vec<_>>();
        for (cid, request) in pending {
            trace!(%cid, "failing pending request");
            let _ = request.resolver.send(Err(FetchError::TransportError {
                reason: "fetcher was destroyed".into(),
            }));
        }

        self.inner.dialer.close();
    }
}

/// The task behind every fetch of `cid`.
///
/// It only holds a weak reference to the fetcher while waiting for the
/// response, so pending requests don't keep it alive.
async fn request<D: Dialer>(
    inner: Weak<Inner<D>>,
    cid: Cid,
    id: u64,
    receiver: oneshot::Receiver<Outcome>,
) -> Outcome {
    let sent = match inner.upgrade() {
        Some(inner) => inner.send_want(&cid).await.map(|()| inner.config.request_timeout),
        None => Err(FetchError::TransportUnavailable {
            reason: "fetcher was dropped".into(),
        }),
    };

    let outcome = match sent {
        Ok(timeout) => match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(FetchError::TransportError {
                reason: "request was dropped".into(),
            }),
            Err(_) => {
                debug!(%cid, ?timeout, "request timed out");
                Err(FetchError::Timeout { cid })
            }
        },
        Err(e) => Err(e),
    };

    if let Some(inner) = inner.upgrade() {
        inner.forget(&cid, id);
    }

    outcome
}

async fn dial<D: Dialer>(
    dialer: Arc<D>,
    max_message_size: usize,
) -> Result<Arc<Session<D::Stream>>, FetchError> {
    debug!(protocol = BITSWAP_PROTOCOL, "dialing peer");
    let stream = dialer.dial().await.map_err(|e| {
        warn!(error = %e, "couldn't open bitswap stream");
        FetchError::TransportUnavailable {
            reason: e.to_string(),
        }
    })?;

    Ok(Arc::new(Session {
        writer: tokio::sync::Mutex::new(FramedWrite::new(
            stream.compat_write(),
            BitswapCodec::new(max_message_size),
        )),
    }))
}

impl<D: Dialer> Inner<D> {
    /// Get the session, dialing if there is none yet.
    /// Concurrent callers share a single dial attempt.
    async fn session(&self) -> Result<Arc<Session<D::Stream>>, FetchError> {
        let attempt = {
            let mut session = self.session.lock();
            match session.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let attempt = dial(Arc::clone(&self.dialer), self.config.max_message_size)
                        .boxed()
                        .shared();
                    *session = Some(attempt.clone());
                    attempt
                }
            }
        };

        let result = attempt.clone().await;
        if result.is_err() {
            let mut session = self.session.lock();
            if matches!(session.as_ref(), Some(current) if Shared::ptr_eq(current, &attempt)) {
                *session = None;
            }
        }
        result
    }

    async fn send_want(&self, cid: &Cid) -> Result<(), FetchError> {
        let session = self.session().await?;
        trace!(%cid, "sending want");

        let want = Message::want_block(cid, self.config.want_priority);
        let error = match tokio::time::timeout(self.config.request_timeout, session.send(want)).await
        {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                warn!(error = %e, "bitswap stream broke, discarding session");
                FetchError::TransportError {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                warn!(%cid, "bitswap stream stalled, discarding session");
                FetchError::Timeout { cid: *cid }
            }
        };

        self.discard(&session);
        Err(error)
    }

    /// Drop `session`, unless it has been replaced in the meantime.
    fn discard(&self, session: &Arc<Session<D::Stream>>) {
        let mut current = self.session.lock();
        if matches!(current.as_ref().and_then(|c| c.peek()), Some(Ok(s)) if Arc::ptr_eq(s, session))
        {
            *current = None;
        }
    }

    /// Settle the pending request for `cid`. Returns false if there was none.
    fn resolve(&self, cid: &Cid, outcome: Outcome) -> bool {
        let Some(request) = self.pending.lock().remove(cid) else {
            return false;
        };
        let _ = request.resolver.send(outcome);
        true
    }

    /// Remove a settled request, unless it has been replaced in the meantime.
    fn forget(&self, cid: &Cid, id: u64) {
        let mut pending = self.pending.lock();
        if pending.get(cid).is_some_and(|request| request.id == id) {
            pending.remove(cid);
        }
    }
}

impl<S: AsyncWrite + Unpin> Session<S> {
    async fn send(&self, message: Message) -> Result<(), CodecError> {
        self.writer.lock().await.send(message).await
    }

    async fn close(&self) {
        if let Err(e) = self.writer.lock().await.close().await {
            debug!(error = %e, "error while closing bitswap stream");
        }
    }
}

impl<D: Dialer> BlockStore for BitswapFetcher<D> {
    async fn get_block(&self, cid: &Cid) -> Result<Bytes, BlockStoreError> {
        Ok(self.fetch(cid).await?)
    }

    async fn put_block_keyed(
        &self,
        cid: Cid,
        _bytes: impl Into<Bytes> + CondSend,
    ) -> Result<(), BlockStoreError> {
        Err(BlockStoreError::Custom(anyhow::anyhow!(
            "can't store block {cid}: bitswap fetchers are read-only"
        )))
    }

    async fn has_block(&self, cid: &Cid) -> Result<bool, BlockStoreError> {
        match self.fetch(cid).await {
            Ok(_) => Ok(true),
            Err(FetchError::BlockUnavailable { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
