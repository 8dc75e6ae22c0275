use crate::{
    Block,
    codecs::{self, DAG_PB, Node},
    dag_walk::{DagWalk, LinkFilter, child_shards},
    error::Error,
    hamt::{ShardLookup, ShardStep},
    unixfs::{self, Data},
};
use async_stream::try_stream;
use futures::Stream;
use ipld_core::ipld::Ipld;
use std::{collections::VecDeque, fmt, str::FromStr};
use tracing::debug;
use wnfs_common::{BlockStore, Cid};

/// How much of the DAG below the path's target gets yielded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DagScope {
    /// The target and everything it links to
    #[default]
    All,
    /// Everything needed to reconstruct the target: a whole file, or a
    /// directory's own blocks without its entries
    Entity,
    /// Only the blocks needed to resolve the path, ending with the target block
    Block,
}

/// In which order the blocks of a file get yielded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Order {
    /// Level by level, fetching each level concurrently
    #[default]
    Unknown,
    /// Each child's subtree completely before its next sibling, one block at a time
    DepthFirst,
}

/// Options for [`get_path`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PathOptions {
    /// See [`DagScope`]
    pub scope: DagScope,
    /// See [`Order`]
    pub order: Order,
}

impl FromStr for DagScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "entity" => Ok(Self::Entity),
            "block" => Ok(Self::Block),
            _ => Err(Error::InvalidOption {
                option: "dag scope",
                value: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for DagScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Entity => "entity",
            Self::Block => "block",
        })
    }
}

impl FromStr for Order {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unk" | "unknown" => Ok(Self::Unknown),
            "dfs" => Ok(Self::DepthFirst),
            _ => Err(Error::InvalidOption {
                option: "order",
                value: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unk",
            Self::DepthFirst => "dfs",
        })
    }
}

/// Split `[/ipfs/]<cid>[/segment...]` into the root CID and its path segments.
///
/// Empty segments are ignored.
pub fn parse_path(path: &str) -> Result<(Cid, Vec<String>), Error> {
    let trimmed = path.trim_start_matches('/');
    let trimmed = trimmed.strip_prefix("ipfs/").unwrap_or(trimmed);
    let mut parts = trimmed.split('/').filter(|segment| !segment.is_empty());

    let root = parts.next().ok_or_else(|| Error::InvalidPath {
        path: path.to_owned(),
        reason: "missing root CID".into(),
    })?;
    let root = Cid::try_from(root).map_err(|e| Error::InvalidPath {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;

    Ok((root, parts.map(str::to_owned).collect()))
}

/// Where resolving segments inside a single block leads.
enum Resolved {
    /// All remaining segments lie in the linked block
    Link(Cid),
    /// The segments ran out within this block, it's the target
    Here,
}

/// Resolve `path` and yield every block visited on the way, then the blocks
/// `options.scope` asks for.
///
/// Blocks yielded before an error are still delivered, so if a segment can't
/// be found, all traversed blocks are yielded before `Error::PathNotFound`.
pub fn get_path<'a>(
    store: &'a impl BlockStore,
    path: &str,
    options: PathOptions,
) -> impl Stream<Item = Result<Block, Error>> + Send + Unpin + 'a {
    let path = path.to_owned();
    Box::pin(try_stream! {
        let (mut cid, segments) = parse_path(&path)?;
        let mut segments = VecDeque::from(segments);
        debug!(%cid, ?segments, scope = %options.scope, order = %options.order, "resolving path");

        let (target, node) = loop {
            let block = fetch(cid, store).await?;
            yield block.clone();
            if segments.is_empty() && options.scope == DagScope::Block {
                return;
            }
            let node = codecs::decode(&block.cid, &block.bytes)?;

            if segments.is_empty() {
                break (block, node);
            }

            let resolved = match &node {
                Node::Raw => Err(not_found(&block.cid, &segments))?,
                Node::DagPb { links, .. } => {
                    let data = unixfs::unixfs_data(&block.cid, &node)?;
                    match data {
                        Some(data) if data.is_hamt_shard() => {
                            let segment = segments.pop_front().unwrap_or_default();
                            let mut lookup = ShardLookup::new(segment);
                            let mut shard_cid = block.cid;
                            let mut shard_data = data;
                            let mut shard_links = links.clone();

                            loop {
                                match lookup.step(&shard_cid, &shard_data, &shard_links)? {
                                    ShardStep::Entry(entry) => break Resolved::Link(entry),
                                    ShardStep::NotFound => Err(Error::PathNotFound {
                                        cid: shard_cid,
                                        segment: lookup.name().to_owned(),
                                    })?,
                                    ShardStep::Shard(child) => {
                                        let shard = fetch(child, store).await?;
                                        yield shard.clone();
                                        let child_node = codecs::decode(&shard.cid, &shard.bytes)?;
                                        shard_data = unixfs::unixfs_data(&shard.cid, &child_node)?
                                            .filter(Data::is_hamt_shard)
                                            .ok_or_else(|| Error::PathNotFound {
                                                cid: shard.cid,
                                                segment: lookup.name().to_owned(),
                                            })?;
                                        shard_links = child_node.links().to_vec();
                                        shard_cid = shard.cid;
                                    }
                                }
                            }
                        }
                        _ => {
                            let segment = segments.front().map(String::as_str);
                            let link = links
                                .iter()
                                .find(|link| link.name.as_deref() == segment)
                                .ok_or_else(|| not_found(&block.cid, &segments))?;
                            segments.pop_front();
                            Resolved::Link(link.cid)
                        }
                    }
                }
                Node::Ipld { value, .. } => resolve_ipld(&block.cid, value, &mut segments)?,
            };

            match resolved {
                Resolved::Link(next) => cid = next,
                Resolved::Here => break (block, node),
            }
        };

        if options.scope == DagScope::Block {
            return;
        }

        let data = unixfs::unixfs_data(&target.cid, &node)?;
        let is_file = target.cid.codec() == DAG_PB && data.as_ref().is_some_and(Data::is_file);
        let is_hamt = data.as_ref().is_some_and(Data::is_hamt_shard);

        let walk = if is_file {
            let children = node.link_cids();
            Some(match options.order {
                Order::Unknown => DagWalk::breadth_first(children),
                Order::DepthFirst => DagWalk::depth_first(children),
            })
        } else if options.scope == DagScope::Entity && is_hamt {
            Some(
                DagWalk::breadth_first(child_shards(&target.cid, &node)?)
                    .with_filter(LinkFilter::HamtShards),
            )
        } else if options.scope == DagScope::All {
            Some(DagWalk::breadth_first(node.link_cids()))
        } else {
            None
        };

        if let Some(mut walk) = walk {
            while let Some(block) = walk.next(store).await? {
                yield block;
            }
        }
    })
}

/// Index into a dag-cbor or dag-json value, consuming segments until a link
/// is reached or the segments run out.
fn resolve_ipld(
    cid: &Cid,
    value: &Ipld,
    segments: &mut VecDeque<String>,
) -> Result<Resolved, Error> {
    let mut current = value;
    loop {
        if let Ipld::Link(link) = current {
            return Ok(Resolved::Link(*link));
        }
        let Some(segment) = segments.front() else {
            return Ok(Resolved::Here);
        };

        let next = match current {
            Ipld::Map(map) => map.get(segment),
            Ipld::List(list) => segment.parse::<usize>().ok().and_then(|i| list.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| not_found(cid, segments))?;
        segments.pop_front();
    }
}

fn not_found(cid: &Cid, segments: &VecDeque<String>) -> Error {
    Error::PathNotFound {
        cid: *cid,
        segment: segments.front().cloned().unwrap_or_default(),
    }
}

async fn fetch(cid: Cid, store: &impl BlockStore) -> Result<Block, Error> {
    let bytes = store.get_block(&cid).await?;
    Ok(Block { cid, bytes })
}
