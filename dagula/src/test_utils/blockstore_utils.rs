use crate::codecs::RAW;
use anyhow::Result;
use bytes::Bytes;
use ipld_core::ipld::Ipld;
use wnfs_common::{BlockStore, CODEC_DAG_CBOR, Cid, MemoryBlockStore};

/// Take a list of IPLD blocks and store all of them in a `MemoryBlockStore`
/// under their given CIDs & return it.
///
/// Blocks with a raw CID need to be `Ipld::Bytes`, everything else is encoded as dag-cbor.
pub async fn setup_blockstore(blocks: Vec<(Cid, Ipld)>) -> Result<MemoryBlockStore> {
    let store = MemoryBlockStore::new();
    for (cid, ipld) in blocks.into_iter() {
        let bytes = match ipld {
            Ipld::Bytes(bytes) if cid.codec() == RAW => Bytes::from(bytes),
            ipld => encode(&ipld)?,
        };
        store.put_block_keyed(cid, bytes).await?;
    }

    Ok(store)
}

/// Encode some IPLD as dag-cbor.
pub fn encode(ipld: &Ipld) -> Result<Bytes> {
    Ok(Bytes::from(serde_ipld_dagcbor::to_vec(ipld)?))
}

/// A small dag-cbor DAG:
///
/// ```text
/// root ---> wrap ---> one
///       |-> two
///       '-> three
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TestDag {
    /// The root, linking to `wrap`, `two` and `three`
    pub root: Cid,
    /// Links to `one`
    pub wrap: Cid,
    /// A leaf
    pub one: Cid,
    /// A leaf
    pub two: Cid,
    /// A leaf
    pub three: Cid,
}

impl TestDag {
    /// Store the DAG's blocks
    pub async fn two_levels(store: &impl BlockStore) -> Result<Self> {
        let put = |ipld: Ipld| async move {
            Ok::<_, anyhow::Error>(store.put_block(encode(&ipld)?, CODEC_DAG_CBOR).await?)
        };

        let one = put(Ipld::String("1".into())).await?;
        let two = put(Ipld::String("2".into())).await?;
        let three = put(Ipld::String("3".into())).await?;
        let wrap = put(Ipld::List(vec![Ipld::Link(one)])).await?;
        let root = put(Ipld::List(vec![
            Ipld::Link(wrap),
            Ipld::Link(two),
            Ipld::Link(three),
        ]))
        .await?;

        Ok(Self {
            root,
            wrap,
            one,
            two,
            three,
        })
    }
}
