#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms)]
#![deny(unreachable_pub)]

//! # Dagula
//!
//! Fetch IPLD DAGs from a single peer over bitswap, and resolve paths through
//! them, including UnixFS HAMT-sharded directories.
//!
//! All traversals yield [`Block`]s in a deterministic order and work on top of
//! any [`BlockStore`]. The [`BitswapFetcher`] is the block store that fetches
//! from the network.
//!
//! ## Examples
//!
//! ```
//! use dagula::{Dagula, PathOptions, DagScope};
//! use futures::TryStreamExt;
//! use wnfs_common::{BlockStore, MemoryBlockStore, CODEC_RAW};
//!
//! # #[async_std::main]
//! # async fn main() -> anyhow::Result<()> {
//! let store = MemoryBlockStore::new();
//! let cid = store.put_block(b"Hello, World!".to_vec(), CODEC_RAW).await?;
//!
//! let dagula = Dagula::new(store);
//! let blocks = dagula.get(cid).try_collect::<Vec<_>>().await?;
//! assert_eq!(blocks.len(), 1);
//!
//! let options = PathOptions {
//!     scope: DagScope::Block,
//!     ..Default::default()
//! };
//! let blocks = dagula
//!     .get_path(&format!("/ipfs/{cid}"), options)
//!     .try_collect::<Vec<_>>()
//!     .await?;
//! assert_eq!(blocks[0].bytes.as_ref(), b"Hello, World!");
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use ipld_core::ipld::Ipld;
use tracing::{debug, instrument};
use wnfs_common::{BlockStore, Cid};
use wnfs_unixfs_file::unixfs::UnixFsFile;

/// Test utilities. Enabled with the `test_utils` feature flag.
#[cfg(any(test, feature = "test_utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test_utils")))]
pub mod test_utils;

/// Fetching blocks from a peer over bitswap
pub mod bitswap;
/// Writing yielded blocks as CAR files
pub mod car;
/// Decoding blocks and finding their links, per multicodec
pub mod codecs;
/// Algorithms for walking IPLD directed acyclic graphs
pub mod dag_walk;
/// Error types
mod error;
/// Name hashing and bucket lookups in HAMT-sharded directories
pub mod hamt;
/// Multihash computation
pub mod hash;
/// Connecting to a peer over libp2p. Enabled with the `libp2p` feature flag.
#[cfg(feature = "libp2p")]
#[cfg_attr(docsrs, doc(cfg(feature = "libp2p")))]
pub mod p2p;
/// Resolving paths through DAGs
pub mod path;
/// UnixFS metadata in dag-pb nodes
pub mod unixfs;

pub use bitswap::{BitswapFetcher, Config, Dialer};
pub use error::*;
pub use path::{DagScope, Order, PathOptions};

use codecs::{Node, RAW};
use dag_walk::{DagWalk, LinkFilter};
use hamt::ShardLayout;
use unixfs::DataType;

/// A block of data together with the CID it was fetched by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// The block's CID
    pub cid: Cid,
    /// The block's exact bytes
    pub bytes: Bytes,
}

/// The result of exporting a path target as UnixFS
#[derive(Debug)]
pub enum UnixFsEntry {
    /// A file, whose content can be read via `UnixFsFile::into_content_reader`
    File(UnixFsFile),
    /// A directory's entries in link order. For HAMT-sharded directories,
    /// this is the order in which entries appear while walking the shards.
    Directory {
        /// The directory's CID
        cid: Cid,
        /// Entry names and their CIDs
        entries: Vec<(String, Cid)>,
    },
    /// A raw block that's not part of any UnixFS structure
    Raw(Block),
    /// A dag-cbor or dag-json value
    Object {
        /// The block's CID
        cid: Cid,
        /// The decoded value
        value: Ipld,
    },
}

/// A client for fetching DAGs & resolving paths from a block store.
///
/// Usually the block store is a [`BitswapFetcher`], see [`Dagula::from_dialer`].
#[derive(Debug, Clone)]
pub struct Dagula<B> {
    store: B,
}

impl<B: BlockStore> Dagula<B> {
    /// Create a client reading blocks from given store.
    pub fn new(store: B) -> Self {
        Self { store }
    }

    /// The underlying block store
    pub fn store(&self) -> &B {
        &self.store
    }

    /// Stream all blocks of the DAG below `cid` breadth-first, including `cid` itself.
    ///
    /// Each level is fetched concurrently, the blocks within a level are
    /// yielded in link order.
    pub fn get(&self, cid: Cid) -> impl Stream<Item = Result<Block, Error>> + Unpin + '_ {
        debug!(%cid, "walking DAG");
        DagWalk::breadth_first([cid]).stream(&self.store)
    }

    /// Resolve `path` and stream all blocks on the way, followed by the blocks
    /// `options.scope` asks for. See [`path::get_path`].
    pub fn get_path(
        &self,
        path: &str,
        options: PathOptions,
    ) -> impl Stream<Item = Result<Block, Error>> + Send + Unpin + '_ {
        path::get_path(&self.store, path, options)
    }

    /// Fetch a single block.
    pub async fn get_block(&self, cid: &Cid) -> Result<Block, Error> {
        let bytes = self.store.get_block(cid).await?;
        Ok(Block { cid: *cid, bytes })
    }

    /// Resolve `path` and export its target as a UnixFS file, directory or raw block,
    /// or as the decoded value of a dag-cbor or dag-json block.
    #[instrument(skip(self))]
    pub async fn get_unixfs(&self, path: &str) -> Result<UnixFsEntry, Error> {
        let options = PathOptions {
            scope: DagScope::Block,
            ..Default::default()
        };
        let target = path::get_path(&self.store, path, options)
            .try_fold(None, |_, block| async move { Ok(Some(block)) })
            .await?
            .ok_or_else(|| Error::InvalidPath {
                path: path.to_owned(),
                reason: "resolved to nothing".into(),
            })?;
        let cid = target.cid;

        if cid.codec() == RAW {
            return Ok(UnixFsEntry::Raw(target));
        }
        if !codecs::is_supported(cid.codec()) {
            return Err(UnixFsError::NotExportable { cid }.into());
        }

        let node = match codecs::decode(&cid, &target.bytes)? {
            Node::Ipld { value, .. } => return Ok(UnixFsEntry::Object { cid, value }),
            node => node,
        };
        let data = unixfs::unixfs_data(&cid, &node)?.ok_or(UnixFsError::NotExportable { cid })?;

        match data.kind() {
            Some(DataType::File | DataType::Raw) => {
                let file = UnixFsFile::load(&cid, &self.store)
                    .await
                    .map_err(Error::ParsingError)?;
                Ok(UnixFsEntry::File(file))
            }
            Some(DataType::Directory) => Ok(UnixFsEntry::Directory {
                cid,
                entries: node
                    .links()
                    .iter()
                    .map(|link| (link.name.clone().unwrap_or_default(), link.cid))
                    .collect(),
            }),
            Some(DataType::HamtShard) => Ok(UnixFsEntry::Directory {
                cid,
                entries: self.hamt_entries(cid).await?,
            }),
            _ => Err(UnixFsError::NotExportable { cid }.into()),
        }
    }

    async fn hamt_entries(&self, root: Cid) -> Result<Vec<(String, Cid)>, Error> {
        let mut walk = DagWalk::breadth_first([root]).with_filter(LinkFilter::HamtShards);
        let mut entries = Vec::new();
        while let Some(shard) = walk.next(&self.store).await? {
            let node = codecs::decode(&shard.cid, &shard.bytes)?;
            let Some(data) = unixfs::unixfs_data(&shard.cid, &node)? else {
                continue;
            };
            let layout = ShardLayout::from_data(&shard.cid, &data)?;
            for link in node.links() {
                let Some((_, name)) = link.name.as_deref().and_then(|n| layout.split_name(n))
                else {
                    continue;
                };
                if !name.is_empty() {
                    entries.push((name.to_owned(), link.cid));
                }
            }
        }
        Ok(entries)
    }
}

impl<D: Dialer> Dagula<BitswapFetcher<D>> {
    /// Create a client fetching blocks over bitswap from the peer `dialer` connects to.
    ///
    /// Responses need to be passed to [`BitswapFetcher::handle_inbound`], which is
    /// reachable via [`Dagula::store`].
    pub fn from_dialer(dialer: D, config: Config) -> Self {
        Self::new(BitswapFetcher::new(dialer, config))
    }

    /// Close the bitswap session and fail all outstanding requests.
    ///
    /// This is idempotent.
    pub async fn destroy(&self) {
        self.store.destroy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hash::cid_for,
        test_utils::{
            MockPeer, TestDag, put_dag_pb, put_directory, put_hamt_directory, put_raw,
        },
    };
    use assert_matches::assert_matches;
    use testresult::TestResult;
    use tokio::io::AsyncReadExt;
    use wnfs_common::MemoryBlockStore;
    use wnfs_unixfs_file::builder::FileBuilder;

    #[test_log::test(async_std::test)]
    async fn gets_whole_dags() -> TestResult {
        let store = MemoryBlockStore::new();
        let dag = TestDag::two_levels(&store).await?;
        let dagula = Dagula::new(store);

        let cids = dagula
            .get(dag.root)
            .map_ok(|block| block.cid)
            .try_collect::<Vec<_>>()
            .await?;
        assert_eq!(cids, vec![dag.root, dag.wrap, dag.two, dag.three, dag.one]);
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn gets_single_blocks() -> TestResult {
        let store = MemoryBlockStore::new();
        let cid = put_raw(&store, b"single").await?;
        let dagula = Dagula::new(store);

        assert_eq!(dagula.get_block(&cid).await?.bytes.as_ref(), b"single");
        let missing = cid_for(RAW, b"missing")?;
        assert_matches!(
            dagula.get_block(&missing).await,
            Err(Error::Fetch(FetchError::BlockUnavailable { .. }))
        );
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn exports_unixfs_files() -> TestResult {
        let store = MemoryBlockStore::new();
        let content = (0..10_000u32).flat_map(u32::to_le_bytes).collect::<Vec<_>>();
        let file = FileBuilder::new()
            .content_bytes(content.clone())
            .fixed_chunker(1024)
            .degree(4)
            .build()?
            .store(&store)
            .await?;
        let dir = put_directory(&store, &[("file.bin", file)]).await?;
        let dagula = Dagula::new(store);

        let entry = dagula.get_unixfs(&format!("{dir}/file.bin")).await?;
        let UnixFsEntry::File(file) = entry else {
            panic!("expected a file, got {entry:?}");
        };
        let mut read = Vec::new();
        file.into_content_reader(dagula.store(), None)?
            .read_to_end(&mut read)
            .await?;
        assert_eq!(read, content);
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn exports_directories() -> TestResult {
        let store = MemoryBlockStore::new();
        let one = put_raw(&store, b"one").await?;
        let two = put_raw(&store, b"two").await?;
        let dir = put_directory(&store, &[("one", one), ("two", two)]).await?;

        let mut entries = Vec::new();
        for i in 0..300 {
            let name = format!("entry-{i}");
            let cid = put_raw(&store, name.as_bytes()).await?;
            entries.push((name, cid));
        }
        let hamt = put_hamt_directory(&store, &entries, 16).await?;
        let dagula = Dagula::new(store);

        assert_matches!(
            dagula.get_unixfs(&dir.to_string()).await?,
            UnixFsEntry::Directory { entries, .. } if entries == vec![("one".to_owned(), one), ("two".to_owned(), two)]
        );

        let UnixFsEntry::Directory {
            entries: mut listed,
            ..
        } = dagula.get_unixfs(&hamt.root.to_string()).await?
        else {
            panic!("expected a directory");
        };
        listed.sort();
        entries.sort();
        assert_eq!(listed, entries);

        assert_matches!(
            dagula.get_unixfs(&format!("{}/entry-42", hamt.root)).await?,
            UnixFsEntry::Raw(Block { bytes, .. }) if bytes.as_ref() == b"entry-42"
        );
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn exports_structured_data_as_objects() -> TestResult {
        let store = MemoryBlockStore::new();
        let dag = TestDag::two_levels(&store).await?;
        let dagula = Dagula::new(store);

        let UnixFsEntry::Object { cid, value } = dagula.get_unixfs(&dag.root.to_string()).await?
        else {
            panic!("expected an object");
        };
        assert_eq!(cid, dag.root);
        let expected: Ipld = serde_ipld_dagcbor::from_slice(&dagula.get_block(&cid).await?.bytes)?;
        assert_eq!(value, expected);
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn refuses_to_export_symlinks_and_unknown_codecs() -> TestResult {
        let store = MemoryBlockStore::new();
        let symlink = put_dag_pb(&store, DataType::Symlink, &[]).await?;
        let git = cid_for(0x78, b"git object")?;
        store.put_block_keyed(git, b"git object".to_vec()).await?;
        let dagula = Dagula::new(store);

        for cid in [symlink, git] {
            assert_matches!(
                dagula.get_unixfs(&cid.to_string()).await,
                Err(Error::UnixFs(UnixFsError::NotExportable { cid: c })) if c == cid
            );
        }
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn fetches_over_bitswap() -> TestResult {
        let store = MemoryBlockStore::new();
        let dag = TestDag::two_levels(&store).await?;
        let peer = MockPeer::new();
        for cid in [dag.root, dag.wrap, dag.one, dag.two, dag.three] {
            peer.insert(cid, store.get_block(&cid).await?);
        }

        let dagula = Dagula::new(peer.connect(Config::default()));
        let blocks = dagula.get(dag.root).try_collect::<Vec<_>>().await?;
        assert_eq!(blocks.len(), 5);

        dagula.destroy().await;
        dagula.destroy().await;
        assert_matches!(
            dagula.get_block(&dag.root).await,
            Err(Error::Fetch(FetchError::TransportUnavailable { .. }))
        );
        Ok(())
    }
}
