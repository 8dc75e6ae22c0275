use crate::{
    Dagula,
    bitswap::{BITSWAP_PROTOCOL, BitswapFetcher, Config, Dialer},
    error::{Error, FetchError},
};
use futures::{AsyncRead, StreamExt};
use libp2p::{
    Multiaddr, PeerId, Stream, StreamProtocol, Swarm, SwarmBuilder, multiaddr::Protocol, noise,
    swarm::SwarmEvent, tcp, yamux,
};
use libp2p_stream::Control;
use std::{fmt::Debug, io, time::Duration};
use tokio::{sync::oneshot, task::AbortHandle};
use tracing::{debug, instrument, trace, warn};

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Opens bitswap streams to a single peer over a libp2p swarm.
///
/// The swarm and the inbound stream acceptor run in background tasks, which
/// are stopped once the fetcher using this dialer is destroyed.
pub struct Libp2pDialer {
    peer_id: PeerId,
    control: Control,
    tasks: Vec<AbortHandle>,
}

impl Debug for Libp2pDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Libp2pDialer")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

impl Dialer for Libp2pDialer {
    type Stream = Stream;

    fn dial(&self) -> impl Future<Output = io::Result<Stream>> + Send {
        let mut control = self.control.clone();
        let peer_id = self.peer_id;
        async move {
            control
                .open_stream(peer_id, StreamProtocol::new(BITSWAP_PROTOCOL))
                .await
                .map_err(|e| io::Error::other(e.to_string()))
        }
    }

    fn close(&self) {
        debug!(peer = %self.peer_id, "stopping libp2p tasks");
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Connect to the peer at `peer`, which needs to end in `/p2p/<peer id>`,
/// and create a client fetching blocks from it.
///
/// Needs to be called from within a tokio runtime.
/// Call [`Dagula::destroy`] to close the connection.
#[instrument(skip(config))]
pub async fn from_network(
    peer: Multiaddr,
    config: Config,
) -> Result<Dagula<BitswapFetcher<Libp2pDialer>>, Error> {
    let peer_id = peer
        .iter()
        .find_map(|protocol| match protocol {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })
        .ok_or_else(|| Error::InvalidOption {
            option: "peer address",
            value: peer.to_string(),
        })?;

    let mut swarm = build_swarm()?;
    let mut control = swarm.behaviour().new_control();
    let incoming = control
        .accept(StreamProtocol::new(BITSWAP_PROTOCOL))
        .map_err(unavailable)?;

    swarm.dial(peer.clone()).map_err(unavailable)?;
    tokio::time::timeout(config.request_timeout, connect(&mut swarm, peer_id))
        .await
        .map_err(|_| FetchError::TransportUnavailable {
            reason: format!("timed out connecting to {peer}"),
        })??;

    let (fetcher_tx, fetcher_rx) = oneshot::channel();
    let driver = tokio::spawn(drive(swarm));
    let acceptor = tokio::spawn(accept_inbound(peer_id, incoming, fetcher_rx));

    let dagula = Dagula::from_dialer(
        Libp2pDialer {
            peer_id,
            control,
            tasks: vec![driver.abort_handle(), acceptor.abort_handle()],
        },
        config,
    );
    let _ = fetcher_tx.send(dagula.store().clone());

    Ok(dagula)
}

fn build_swarm() -> Result<Swarm<libp2p_stream::Behaviour>, FetchError> {
    Ok(SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(unavailable)?
        .with_behaviour(|_| libp2p_stream::Behaviour::new())
        .map_err(unavailable)?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build())
}

fn unavailable(e: impl ToString) -> FetchError {
    FetchError::TransportUnavailable {
        reason: e.to_string(),
    }
}

async fn connect(swarm: &mut Swarm<libp2p_stream::Behaviour>, peer_id: PeerId) -> Result<(), Error> {
    loop {
        match swarm.select_next_some().await {
            SwarmEvent::ConnectionEstablished {
                peer_id: connected, ..
            } if connected == peer_id => {
                debug!(peer = %peer_id, "connected");
                return Ok(());
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(failed),
                error,
                ..
            } if failed == peer_id => return Err(unavailable(error).into()),
            event => trace!(?event, "swarm event"),
        }
    }
}

async fn drive(mut swarm: Swarm<libp2p_stream::Behaviour>) {
    loop {
        match swarm.select_next_some().await {
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!(peer = %peer_id, ?cause, "connection closed");
            }
            event => trace!(?event, "swarm event"),
        }
    }
}

/// Hand every inbound stream from `peer_id` to the fetcher, once it exists.
async fn accept_inbound<D, S>(
    peer_id: PeerId,
    mut incoming: impl futures::Stream<Item = (PeerId, S)> + Unpin,
    fetcher: oneshot::Receiver<BitswapFetcher<D>>,
) where
    D: Dialer,
    S: AsyncRead + Unpin + Send + 'static,
{
    let Ok(fetcher) = fetcher.await else {
        return;
    };

    while let Some((remote, stream)) = incoming.next().await {
        if remote != peer_id {
            debug!(peer = %remote, "ignoring bitswap stream from unknown peer");
            continue;
        }

        trace!(peer = %remote, "accepted inbound bitswap stream");
        let fetcher = fetcher.clone();
        tokio::spawn(async move {
            if let Err(e) = fetcher.handle_inbound(stream).await {
                warn!(error = %e, "inbound bitswap stream failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitswap::{BitswapCodec, Message},
        codecs::RAW,
        hash::cid_for,
        test_utils::{MockPeer, TestDag},
    };
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use futures::{SinkExt, TryStreamExt, stream};
    use libp2p::identity::Keypair;
    use std::collections::HashMap;
    use testresult::TestResult;
    use tokio::io::DuplexStream;
    use tokio_util::{
        codec::{FramedRead, FramedWrite},
        compat::{
            Compat, FuturesAsyncReadCompatExt, FuturesAsyncWriteCompatExt,
            TokioAsyncReadCompatExt,
        },
    };
    use wnfs_common::{BlockStore, Cid, MemoryBlockStore};

    fn random_peer() -> PeerId {
        Keypair::generate_ed25519().public().to_peer_id()
    }

    /// Start a bitswap peer listening on localhost.
    ///
    /// Returns its listen address (without `/p2p`) and its peer id.
    async fn serve(blocks: HashMap<Cid, Bytes>) -> anyhow::Result<(Multiaddr, PeerId)> {
        let mut swarm = build_swarm()?;
        let peer_id = *swarm.local_peer_id();
        let mut control = swarm.behaviour().new_control();
        let mut incoming = control.accept(StreamProtocol::new(BITSWAP_PROTOCOL))?;

        swarm.listen_on("/ip4/127.0.0.1/tcp/0".parse()?)?;
        let address = loop {
            if let SwarmEvent::NewListenAddr { address, .. } = swarm.select_next_some().await {
                break address;
            }
        };
        tokio::spawn(drive(swarm));

        tokio::spawn(async move {
            while let Some((client, stream)) = incoming.next().await {
                tokio::spawn(respond(client, stream, control.clone(), blocks.clone()));
            }
        });

        Ok((address, peer_id))
    }

    /// Answer wants from `client`, on a single stream opened back to it.
    async fn respond(
        client: PeerId,
        stream: Stream,
        mut control: Control,
        blocks: HashMap<Cid, Bytes>,
    ) -> anyhow::Result<()> {
        let mut wants = FramedRead::new(stream.compat(), BitswapCodec::default());
        let mut responses = None;

        while let Some(message) = wants.next().await {
            let message = message?;
            if responses.is_none() {
                let stream = control
                    .open_stream(client, StreamProtocol::new(BITSWAP_PROTOCOL))
                    .await?;
                responses = Some(FramedWrite::new(
                    stream.compat_write(),
                    BitswapCodec::default(),
                ));
            }
            let Some(responses) = responses.as_mut() else {
                continue;
            };

            for cid in message.wanted_cids().filter_map(Result::ok) {
                let reply = match blocks.get(&cid) {
                    Some(bytes) => Message::with_blocks([(&cid, bytes)]),
                    None => Message::dont_have([&cid]),
                };
                responses.send(reply).await?;
            }
        }
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn fetches_from_a_libp2p_peer() -> TestResult {
        let store = MemoryBlockStore::new();
        let dag = TestDag::two_levels(&store).await?;
        let mut blocks = HashMap::new();
        for cid in [dag.root, dag.wrap, dag.one, dag.two, dag.three] {
            blocks.insert(cid, store.get_block(&cid).await?);
        }
        let (address, peer_id) = serve(blocks).await?;

        let dagula = from_network(address.with(Protocol::P2p(peer_id)), Config::default()).await?;
        let cids = dagula
            .get(dag.root)
            .map_ok(|block| block.cid)
            .try_collect::<Vec<_>>()
            .await?;
        assert_eq!(cids, vec![dag.root, dag.wrap, dag.two, dag.three, dag.one]);

        let missing = cid_for(RAW, b"missing")?;
        assert_matches!(
            dagula.get_block(&missing).await,
            Err(Error::Fetch(FetchError::BlockUnavailable { cid })) if cid == missing
        );

        dagula.destroy().await;
        assert_matches!(
            dagula.get_block(&dag.root).await,
            Err(Error::Fetch(FetchError::TransportUnavailable { .. }))
        );
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn addresses_need_the_right_peer_id() -> TestResult {
        let (address, _) = serve(HashMap::new()).await?;

        assert_matches!(
            from_network(address.clone(), Config::default()).await,
            Err(Error::InvalidOption { option: "peer address", .. })
        );

        let config = Config {
            request_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        assert_matches!(
            from_network(address.with(Protocol::P2p(random_peer())), config).await,
            Err(Error::Fetch(FetchError::TransportUnavailable { .. }))
        );
        Ok(())
    }

    async fn delivering(cid: &Cid, data: &Bytes) -> anyhow::Result<Compat<DuplexStream>> {
        let (local, remote) = tokio::io::duplex(1 << 16);
        FramedWrite::new(remote, BitswapCodec::default())
            .send(Message::with_blocks([(cid, data)]))
            .await?;
        Ok(local.compat())
    }

    #[test_log::test(tokio::test)]
    async fn ignores_inbound_streams_from_other_peers() -> TestResult {
        let data = Bytes::from_static(b"from the right peer");
        let cid = cid_for(RAW, &data)?;
        let peer = MockPeer::new().unresponsive();
        let fetcher = peer.connect(Config::default());
        let pending = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch(&cid).await }
        });
        while peer.wants().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let expected = random_peer();
        let (fetcher_tx, fetcher_rx) = oneshot::channel();
        let _ = fetcher_tx.send(fetcher.clone());
        let impostor = stream::iter([(random_peer(), delivering(&cid, &data).await?)]);
        accept_inbound(expected, impostor, fetcher_rx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        let (fetcher_tx, fetcher_rx) = oneshot::channel();
        let _ = fetcher_tx.send(fetcher);
        let genuine = stream::iter([(expected, delivering(&cid, &data).await?)]);
        accept_inbound(expected, genuine, fetcher_rx).await;
        assert_eq!(pending.await??, data);
        Ok(())
    }
}
