use crate::error::Error;
use bytes::Bytes;
use ipld_core::{codec::Codec, ipld::Ipld};
use ipld_dagpb::DagPbCodec;
use wnfs_common::Cid;

/// The multicodec for raw bytes
pub const RAW: u64 = 0x55;
/// The multicodec for dag-pb
pub const DAG_PB: u64 = 0x70;
/// The multicodec for dag-cbor
pub const DAG_CBOR: u64 = 0x71;
/// The multicodec for dag-json
pub const DAG_JSON: u64 = 0x0129;

type Decoder = fn(&Cid, &Bytes) -> Result<Node, Error>;

/// All formats blocks can be decoded from, keyed by their multicodec.
const DECODERS: [(u64, Decoder); 4] = [
    (RAW, decode_raw),
    (DAG_PB, decode_dag_pb),
    (DAG_CBOR, decode_dag_cbor),
    (DAG_JSON, decode_dag_json),
];

/// A link from one block to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// The dag-pb link name, or the map key a link was found under
    pub name: Option<String>,
    /// The linked CID
    pub cid: Cid,
}

/// A decoded block.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Raw bytes, which never link anywhere
    Raw,
    /// A dag-pb node with its (usually UnixFS) data and its links in encoded order.
    DagPb {
        /// The `Data` field
        data: Option<Bytes>,
        /// The `Links` field
        links: Vec<Link>,
    },
    /// A dag-cbor or dag-json value with all links contained anywhere within it.
    Ipld {
        /// The decoded value
        value: Ipld,
        /// Every `Ipld::Link` within `value`, in iteration order
        links: Vec<Link>,
    },
}

impl Node {
    /// All links in this node, in order.
    pub fn links(&self) -> &[Link] {
        match self {
            Self::Raw => &[],
            Self::DagPb { links, .. } | Self::Ipld { links, .. } => links,
        }
    }

    /// The CIDs of all links in this node, in order.
    pub fn link_cids(&self) -> Vec<Cid> {
        self.links().iter().map(|link| link.cid).collect()
    }
}

/// Returns whether blocks with given multicodec can be decoded.
pub fn is_supported(codec: u64) -> bool {
    DECODERS.iter().any(|(code, _)| *code == codec)
}

/// Decode a block according to the codec in its CID.
///
/// This will error out if
/// - the codec is not supported
/// - the block can't be parsed.
pub fn decode(cid: &Cid, bytes: &Bytes) -> Result<Node, Error> {
    let (_, decoder) = DECODERS
        .iter()
        .find(|(code, _)| *code == cid.codec())
        .ok_or(Error::UnsupportedCodec { cid: *cid })?;

    decoder(cid, bytes)
}

/// Find all CIDs that a block references, in order.
pub fn references(cid: &Cid, bytes: &Bytes) -> Result<Vec<Cid>, Error> {
    Ok(decode(cid, bytes)?.link_cids())
}

fn decode_raw(_: &Cid, _: &Bytes) -> Result<Node, Error> {
    Ok(Node::Raw)
}

fn decode_dag_pb(_: &Cid, bytes: &Bytes) -> Result<Node, Error> {
    let ipld: Ipld = DagPbCodec::decode_from_slice(bytes)
        .map_err(|e| Error::ParsingError(anyhow::Error::new(e)))?;

    let Ipld::Map(mut node) = ipld else {
        return Err(Error::ParsingError(anyhow::anyhow!(
            "dag-pb node didn't decode to a map"
        )));
    };

    let data = match node.remove("Data") {
        Some(Ipld::Bytes(data)) => Some(Bytes::from(data)),
        _ => None,
    };

    let mut links = Vec::new();
    if let Some(Ipld::List(pb_links)) = node.remove("Links") {
        for pb_link in pb_links {
            let Ipld::Map(mut pb_link) = pb_link else {
                continue;
            };
            let Some(Ipld::Link(cid)) = pb_link.remove("Hash") else {
                return Err(Error::ParsingError(anyhow::anyhow!(
                    "dag-pb link without a Hash"
                )));
            };
            let name = match pb_link.remove("Name") {
                Some(Ipld::String(name)) => Some(name),
                _ => None,
            };
            links.push(Link { name, cid });
        }
    }

    Ok(Node::DagPb { data, links })
}

fn decode_dag_cbor(_: &Cid, bytes: &Bytes) -> Result<Node, Error> {
    let value: Ipld = serde_ipld_dagcbor::from_slice(bytes)
        .map_err(|e| Error::ParsingError(anyhow::Error::new(e)))?;
    Ok(ipld_node(value))
}

fn decode_dag_json(_: &Cid, bytes: &Bytes) -> Result<Node, Error> {
    let value: Ipld = serde_ipld_dagjson::from_slice(bytes)
        .map_err(|e| Error::ParsingError(anyhow::Error::new(e)))?;
    Ok(ipld_node(value))
}

fn ipld_node(value: Ipld) -> Node {
    let mut links = Vec::new();
    collect_links(&value, None, &mut links);
    Node::Ipld { value, links }
}

/// Collect all links within an IPLD value, independent of the keys they're stored under.
pub(crate) fn collect_links(ipld: &Ipld, name: Option<&str>, links: &mut Vec<Link>) {
    match ipld {
        Ipld::Link(cid) => links.push(Link {
            name: name.map(str::to_owned),
            cid: *cid,
        }),
        Ipld::List(list) => list.iter().for_each(|item| collect_links(item, None, links)),
        Ipld::Map(map) => map
            .iter()
            .for_each(|(key, value)| collect_links(value, Some(key), links)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hash::{self, cid_for},
        test_utils::{dag_pb_node, unixfs_data},
        unixfs::DataType,
    };
    use assert_matches::assert_matches;
    use ipld_core::cid::Cid;
    use std::collections::BTreeMap;
    use testresult::TestResult;

    #[test]
    fn raw_blocks_have_no_links() -> TestResult {
        let bytes = Bytes::from_static(b"raw data");
        let cid = cid_for(RAW, &bytes)?;
        assert_eq!(decode(&cid, &bytes)?, Node::Raw);
        assert!(references(&cid, &bytes)?.is_empty());
        Ok(())
    }

    #[test]
    fn dag_pb_links_keep_names_and_order() -> TestResult {
        let one = cid_for(RAW, b"one")?;
        let two = cid_for(RAW, b"two")?;
        let (cid, bytes) = dag_pb_node(
            unixfs_data(DataType::Directory),
            &[("b-second", two), ("a-first", one)],
        )?;

        let node = decode(&cid, &bytes)?;
        assert_matches!(&node, Node::DagPb { data: Some(_), .. });
        assert_eq!(
            node.links(),
            &[
                Link {
                    name: Some("b-second".into()),
                    cid: two
                },
                Link {
                    name: Some("a-first".into()),
                    cid: one
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn structured_formats_find_nested_links() -> TestResult {
        let foo = cid_for(RAW, b"foo")?;
        let deep = cid_for(RAW, b"deep")?;
        let value = Ipld::Map(BTreeMap::from([
            ("foo".to_owned(), Ipld::Link(foo)),
            (
                "nested".to_owned(),
                Ipld::List(vec![Ipld::Integer(1), Ipld::Link(deep)]),
            ),
        ]));

        let cbor = Bytes::from(serde_ipld_dagcbor::to_vec(&value)?);
        let cbor_cid = cid_for(DAG_CBOR, &cbor)?;
        let json = Bytes::from(serde_ipld_dagjson::to_vec(&value)?);
        let json_cid = cid_for(DAG_JSON, &json)?;

        for (cid, bytes) in [(cbor_cid, cbor), (json_cid, json)] {
            let node = decode(&cid, &bytes)?;
            assert_eq!(node.link_cids(), vec![foo, deep]);
            assert_eq!(node.links()[0].name.as_deref(), Some("foo"));
            assert_eq!(node.links()[1].name, None);
        }
        Ok(())
    }

    #[test]
    fn identity_hashed_blocks_decode_by_codec() -> TestResult {
        let foo = cid_for(RAW, b"foo")?;
        let value = Ipld::Map(BTreeMap::from([("foo".to_owned(), Ipld::Link(foo))]));
        let bytes = Bytes::from(serde_ipld_dagcbor::to_vec(&value)?);
        let cid = Cid::new_v1(DAG_CBOR, hash::digest(hash::IDENTITY, &bytes)?);

        assert_eq!(references(&cid, &bytes)?, vec![foo]);
        Ok(())
    }

    #[test]
    fn unknown_codec_is_an_error() -> TestResult {
        let bytes = Bytes::from_static(b"git object");
        let cid = cid_for(0x78, &bytes)?;
        assert!(!is_supported(0x78));
        assert_matches!(decode(&cid, &bytes), Err(Error::UnsupportedCodec { cid: c }) if c == cid);
        Ok(())
    }
}
