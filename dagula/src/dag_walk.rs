use crate::{
    Block,
    codecs::{self, Node},
    error::Error,
    hamt::ShardLayout,
    unixfs,
};
use futures::{Stream, future::try_join_all, stream::try_unfold};
use std::collections::VecDeque;
use tracing::{debug, trace};
use wnfs_common::{BlockStore, Cid};

/// Which links of a block the walk follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkFilter {
    /// Follow every link
    #[default]
    All,
    /// Only follow links from HAMT shards to their child shards
    HamtShards,
}

/// A struct that represents an ongoing walk through the Dag.
///
/// Blocks are neither skipped nor deduplicated: a block linked twice is
/// yielded twice.
#[derive(Clone, Debug)]
pub struct DagWalk {
    /// CIDs to visit next. Used as the next level when walking breadth-first
    /// and as a stack (popped from the front) when walking depth-first.
    pub frontier: VecDeque<Cid>,
    /// Fetched blocks of the current level that haven't been yielded yet
    ready: VecDeque<Block>,
    /// The last yielded block. Its links are added to the frontier on the next step.
    unexpanded: Option<Block>,
    /// Whether to do a breadth-first or depth-first traversal.
    pub breadth_first: bool,
    /// Which links get followed
    pub filter: LinkFilter,
}

impl DagWalk {
    /// Start a breadth-first traversal of given roots.
    ///
    /// The walk goes level by level: All blocks of a level are fetched concurrently,
    /// and handed out in link order once all of them have arrived.
    /// The next level is only requested after the previous level was consumed.
    pub fn breadth_first(roots: impl IntoIterator<Item = Cid>) -> Self {
        Self::new(roots, true)
    }

    /// Start a depth-first traversal of given roots.
    ///
    /// Depth-first will follow links immediately after discovering them, walking
    /// each child's subtree completely before its next sibling. Blocks are fetched
    /// one at a time.
    pub fn depth_first(roots: impl IntoIterator<Item = Cid>) -> Self {
        Self::new(roots, false)
    }

    /// Start a DAG traversal of given roots. See also `breadth_first` and `depth_first`.
    pub fn new(roots: impl IntoIterator<Item = Cid>, breadth_first: bool) -> Self {
        Self {
            frontier: roots.into_iter().collect(),
            ready: VecDeque::new(),
            unexpanded: None,
            breadth_first,
            filter: LinkFilter::All,
        }
    }

    /// Restrict which links the walk follows.
    pub fn with_filter(mut self, filter: LinkFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Return the next block in the traversal.
    ///
    /// Returns `None` if no blocks are left to be visited.
    ///
    /// Links of the previously returned block are only decoded at this point,
    /// so a block with an unsupported codec is still returned before the
    /// traversal fails on it.
    pub async fn next(&mut self, store: &impl BlockStore) -> Result<Option<Block>, Error> {
        if let Some(block) = self.unexpanded.take() {
            self.expand(&block)?;
        }

        if self.breadth_first && self.ready.is_empty() && !self.frontier.is_empty() {
            let level = self.frontier.drain(..).collect::<Vec<_>>();
            debug!(blocks = level.len(), "fetching next level");
            let blocks = try_join_all(level.into_iter().map(|cid| fetch(cid, store))).await?;
            self.ready.extend(blocks);
        }

        let block = if self.breadth_first {
            self.ready.pop_front()
        } else {
            match self.frontier.pop_front() {
                Some(cid) => Some(fetch(cid, store).await?),
                None => None,
            }
        };

        if let Some(block) = &block {
            self.unexpanded = Some(block.clone());
        }

        Ok(block)
    }

    /// Turn this traversal into a stream
    pub fn stream<'a>(
        self,
        store: &'a impl BlockStore,
    ) -> impl Stream<Item = Result<Block, Error>> + Unpin + 'a {
        Box::pin(try_unfold(self, move |mut this| async move {
            let item = this.next(store).await?;
            Ok(item.map(|b| (b, this)))
        }))
    }

    /// Turn this traversal into a stream that takes ownership of the store.
    ///
    /// This helps with creating streams that are `: 'static`, which is useful for
    /// anything that ends up being put into e.g. a tokio task.
    pub fn stream_owned(
        self,
        store: impl BlockStore,
    ) -> impl Stream<Item = Result<Block, Error>> + Unpin {
        Box::pin(try_unfold((self, store), move |(mut this, store)| async move {
            let item = this.next(&store).await?;
            Ok(item.map(|b| (b, (this, store))))
        }))
    }

    /// Find out whether the traversal is finished.
    ///
    /// The next call to `next` would result in `None` if this returns true.
    pub fn is_finished(&self) -> bool {
        self.ready.is_empty()
            && self.frontier.is_empty()
            && self
                .unexpanded
                .as_ref()
                .is_none_or(|block| self.children(block).is_ok_and(|links| links.is_empty()))
    }

    fn expand(&mut self, block: &Block) -> Result<(), Error> {
        let children = self.children(block)?;
        trace!(cid = %block.cid, children = children.len(), "expanding block");

        if self.breadth_first {
            self.frontier.extend(children);
        } else {
            for child in children.into_iter().rev() {
                self.frontier.push_front(child);
            }
        }
        Ok(())
    }

    fn children(&self, block: &Block) -> Result<Vec<Cid>, Error> {
        match self.filter {
            LinkFilter::All => codecs::references(&block.cid, &block.bytes),
            LinkFilter::HamtShards => {
                let node = codecs::decode(&block.cid, &block.bytes)?;
                child_shards(&block.cid, &node)
            }
        }
    }
}

/// The links of a HAMT shard that point to further shards.
pub(crate) fn child_shards(cid: &Cid, node: &Node) -> Result<Vec<Cid>, Error> {
    let Some(data) = unixfs::unixfs_data(cid, node)? else {
        return Ok(Vec::new());
    };
    if !data.is_hamt_shard() {
        return Ok(Vec::new());
    }

    let layout = ShardLayout::from_data(cid, &data)?;
    Ok(node
        .links()
        .iter()
        .filter(|link| {
            link.name
                .as_deref()
                .and_then(|name| layout.split_name(name))
                .is_some_and(|(_, entry)| entry.is_empty())
        })
        .map(|link| link.cid)
        .collect())
}

async fn fetch(cid: Cid, store: &impl BlockStore) -> Result<Block, Error> {
    let bytes = store.get_block(&cid).await?;
    Ok(Block { cid, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestDag, put_hamt_directory, put_raw};
    use assert_matches::assert_matches;
    use futures::{StreamExt, TryStreamExt};
    use ipld_core::ipld::Ipld;
    use testresult::TestResult;
    use wnfs_common::{CODEC_DAG_CBOR, MemoryBlockStore};

    async fn cids(walk: DagWalk, store: &impl BlockStore) -> Result<Vec<Cid>, Error> {
        walk.stream(store).map_ok(|block| block.cid).try_collect().await
    }

    #[test_log::test(async_std::test)]
    async fn test_walk_dag_breadth_first() -> TestResult {
        let store = &MemoryBlockStore::new();
        let dag = TestDag::two_levels(store).await?;

        let cids = cids(DagWalk::breadth_first([dag.root]), store).await?;
        assert_eq!(cids, vec![dag.root, dag.wrap, dag.two, dag.three, dag.one]);
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn test_walk_dag_depth_first() -> TestResult {
        let store = &MemoryBlockStore::new();
        let dag = TestDag::two_levels(store).await?;

        let cids = cids(DagWalk::depth_first([dag.root]), store).await?;
        assert_eq!(cids, vec![dag.root, dag.wrap, dag.one, dag.two, dag.three]);
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn duplicate_links_are_walked_twice() -> TestResult {
        let store = &MemoryBlockStore::new();
        let leaf = store
            .put_block(
                serde_ipld_dagcbor::to_vec(&Ipld::String("leaf".into()))?,
                CODEC_DAG_CBOR,
            )
            .await?;
        let root = store
            .put_block(
                serde_ipld_dagcbor::to_vec(&Ipld::List(vec![
                    Ipld::Link(leaf),
                    Ipld::Link(leaf),
                ]))?,
                CODEC_DAG_CBOR,
            )
            .await?;

        let cids = cids(DagWalk::breadth_first([root]), store).await?;
        assert_eq!(cids, vec![root, leaf, leaf]);
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn yields_unsupported_block_before_failing() -> TestResult {
        let store = &MemoryBlockStore::new();
        let git_object = store.put_block(b"tree 0".to_vec(), 0x78).await?;
        let root = store
            .put_block(
                serde_ipld_dagcbor::to_vec(&Ipld::List(vec![Ipld::Link(git_object)]))?,
                CODEC_DAG_CBOR,
            )
            .await?;

        let mut stream = DagWalk::breadth_first([root]).stream(store);
        assert_eq!(stream.next().await.transpose()?.map(|b| b.cid), Some(root));
        assert_eq!(
            stream.next().await.transpose()?.map(|b| b.cid),
            Some(git_object)
        );
        assert_matches!(stream.next().await, Some(Err(Error::UnsupportedCodec { .. })));
        assert_matches!(stream.next().await, None);
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn missing_blocks_end_the_walk() -> TestResult {
        let store = &MemoryBlockStore::new();
        let absent = crate::hash::cid_for(crate::codecs::RAW, b"absent")?;
        let root = store
            .put_block(
                serde_ipld_dagcbor::to_vec(&Ipld::List(vec![Ipld::Link(absent)]))?,
                CODEC_DAG_CBOR,
            )
            .await?;

        let results = DagWalk::breadth_first([root])
            .stream(store)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(results.len(), 2);
        assert_matches!(&results[0], Ok(block) if block.cid == root);
        assert_matches!(
            results[1].as_ref().map_err(Error::as_fetch_error),
            Err(Some(crate::FetchError::BlockUnavailable { .. }))
        );
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn hamt_filter_skips_entries() -> TestResult {
        let store = &MemoryBlockStore::new();
        let mut entries = Vec::new();
        for i in 0..200 {
            let name = format!("file-{i}.txt");
            let cid = put_raw(store, name.as_bytes()).await?;
            entries.push((name, cid));
        }
        let dir = put_hamt_directory(store, &entries, 16).await?;

        let walk = DagWalk::breadth_first([dir.root]).with_filter(LinkFilter::HamtShards);
        let mut cids = cids(walk, store).await?;
        cids.sort();
        let mut shards = dir.shards.clone();
        shards.sort();
        assert_eq!(cids, shards);
        Ok(())
    }

    #[test_log::test(async_std::test)]
    async fn finished_after_last_leaf() -> TestResult {
        let store = &MemoryBlockStore::new();
        let dag = TestDag::two_levels(store).await?;

        let mut walk = DagWalk::depth_first([dag.root]);
        assert!(!walk.is_finished());
        while walk.next(store).await?.is_some() {}
        assert!(walk.is_finished());
        Ok(())
    }
}
