use crate::{
    codecs::{DAG_PB, RAW},
    hamt::{HashBits, ShardLayout},
    hash::{MURMUR3_X64_64, cid_for},
    unixfs::{Data, DataType},
};
use anyhow::{Result, anyhow};
use bytes::Bytes;
use ipld_core::{codec::Codec, ipld::Ipld};
use ipld_dagpb::DagPbCodec;
use prost::Message;
use std::collections::BTreeMap;
use wnfs_common::{BlockStore, Cid};

/// Empty UnixFS data of given type
pub fn unixfs_data(kind: DataType) -> Data {
    Data {
        r#type: kind as i32,
        ..Default::default()
    }
}

/// Encode a dag-pb node with UnixFS data and named links.
pub fn dag_pb_node(data: Data, links: &[(&str, Cid)]) -> Result<(Cid, Bytes)> {
    let links = links
        .iter()
        .map(|(name, cid)| {
            Ipld::Map(BTreeMap::from([
                ("Hash".to_owned(), Ipld::Link(*cid)),
                ("Name".to_owned(), Ipld::String((*name).to_owned())),
                ("Tsize".to_owned(), Ipld::Integer(0)),
            ]))
        })
        .collect();

    let node = Ipld::Map(BTreeMap::from([
        ("Data".to_owned(), Ipld::Bytes(data.encode_to_vec())),
        ("Links".to_owned(), Ipld::List(links)),
    ]));

    let bytes = Bytes::from(DagPbCodec::encode_to_vec(&node)?);
    let cid = cid_for(DAG_PB, &bytes)?;
    Ok((cid, bytes))
}

/// Store some raw bytes under a sha2-256 CID.
pub async fn put_raw(store: &impl BlockStore, bytes: &[u8]) -> Result<Cid> {
    let cid = cid_for(RAW, bytes)?;
    store.put_block_keyed(cid, Bytes::copy_from_slice(bytes)).await?;
    Ok(cid)
}

/// Store a dag-pb node with UnixFS data of given type.
pub async fn put_dag_pb(
    store: &impl BlockStore,
    kind: DataType,
    links: &[(&str, Cid)],
) -> Result<Cid> {
    put_node(store, unixfs_data(kind), links).await
}

/// Store a plain UnixFS directory.
pub async fn put_directory(store: &impl BlockStore, entries: &[(&str, Cid)]) -> Result<Cid> {
    put_dag_pb(store, DataType::Directory, entries).await
}

async fn put_node(store: &impl BlockStore, data: Data, links: &[(&str, Cid)]) -> Result<Cid> {
    let (cid, bytes) = dag_pb_node(data, links)?;
    store.put_block_keyed(cid, bytes).await?;
    Ok(cid)
}

/// A stored HAMT-sharded directory
#[derive(Debug, Clone)]
pub struct HamtDirectory {
    /// The root shard
    pub root: Cid,
    /// All shards, including the root
    pub shards: Vec<Cid>,
}

/// Store a HAMT-sharded directory with given entries & fanout.
///
/// Buckets with a single entry link to it directly, all others get a child shard.
pub async fn put_hamt_directory(
    store: &impl BlockStore,
    entries: &[(String, Cid)],
    fanout: u64,
) -> Result<HamtDirectory> {
    let layout =
        ShardLayout::from_fanout(fanout).ok_or_else(|| anyhow!("Invalid fanout {fanout}"))?;
    let entries = entries
        .iter()
        .map(|(name, cid)| (name.clone(), HashBits::new(name), *cid))
        .collect();

    let mut shards = Vec::new();
    let root = put_shard(store, layout, fanout, entries, &mut shards).await?;
    Ok(HamtDirectory { root, shards })
}

async fn put_shard(
    store: &impl BlockStore,
    layout: ShardLayout,
    fanout: u64,
    entries: Vec<(String, HashBits, Cid)>,
    shards: &mut Vec<Cid>,
) -> Result<Cid> {
    let mut buckets = BTreeMap::<u64, Vec<_>>::new();
    for (name, mut bits, cid) in entries {
        let index = bits
            .take(layout.bits())
            .ok_or_else(|| anyhow!("Ran out of hash bits for {name}"))?;
        buckets.entry(index).or_default().push((name, bits, cid));
    }

    let mut links = Vec::with_capacity(buckets.len());
    for (index, mut bucket) in buckets {
        let prefix = layout.prefix(index);
        if bucket.len() == 1 {
            let (name, _, cid) = bucket.remove(0);
            links.push((format!("{prefix}{name}"), cid));
        } else {
            let child = Box::pin(put_shard(store, layout, fanout, bucket, shards)).await?;
            links.push((prefix, child));
        }
    }

    let data = Data {
        r#type: DataType::HamtShard as i32,
        hash_type: Some(MURMUR3_X64_64),
        fanout: Some(fanout),
        ..Default::default()
    };
    let links = links
        .iter()
        .map(|(name, cid)| (name.as_str(), *cid))
        .collect::<Vec<_>>();
    let cid = put_node(store, data, &links).await?;
    // Root shard first
    shards.insert(0, cid);
    Ok(cid)
}

/// A file chunked into two levels below a directory:
///
/// ```text
/// dir --foo--> root ---> sub1 ---> part1, part2
///          |         '-> sub2 ---> part3, part4
///          '-other--> (a raw block)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct LargeFile {
    /// The directory containing the file at `foo`
    pub dir: Cid,
    /// The file root
    pub root: Cid,
    /// The first intermediate file node
    pub sub1: Cid,
    /// The second intermediate file node
    pub sub2: Cid,
    /// A leaf
    pub part1: Cid,
    /// A leaf
    pub part2: Cid,
    /// A leaf
    pub part3: Cid,
    /// A leaf
    pub part4: Cid,
}

impl LargeFile {
    /// Store all blocks of the file & its directory
    pub async fn build(store: &impl BlockStore) -> Result<Self> {
        let part1 = put_raw(store, b"MORE TEST DATA").await?;
        let part2 = put_raw(store, b"EVEN MORE TEST DATA").await?;
        let part3 = put_raw(store, b"SO MUCH TEST DATA").await?;
        let part4 = put_raw(store, b"TEST DATA DOING THE MOST").await?;
        let sub1 = put_dag_pb(store, DataType::File, &[("0", part1), ("1", part2)]).await?;
        let sub2 = put_dag_pb(store, DataType::File, &[("0", part3), ("1", part4)]).await?;
        let root = put_dag_pb(store, DataType::File, &[("0", sub1), ("1", sub2)]).await?;
        let other = put_raw(store, b"not part of the file").await?;
        let dir = put_directory(store, &[("foo", root), ("other", other)]).await?;

        Ok(Self {
            dir,
            root,
            sub1,
            sub2,
            part1,
            part2,
            part3,
            part4,
        })
    }
}
