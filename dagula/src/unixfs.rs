use crate::{
    codecs::{DAG_PB, Node},
    error::UnixFsError,
};
use bytes::Bytes;
use prost::Message;
use wnfs_common::Cid;

/// The UnixFS `Data` protobuf stored in the `Data` field of dag-pb nodes.
#[derive(Clone, PartialEq, Message)]
pub struct Data {
    /// See `DataType`. Use `Data::kind` for the parsed value.
    #[prost(enumeration = "DataType", required, tag = "1")]
    pub r#type: i32,
    /// Inline file content, or nothing for directories
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub data: Option<Bytes>,
    /// The total size of the file in bytes
    #[prost(uint64, optional, tag = "3")]
    pub filesize: Option<u64>,
    /// The content sizes of each linked child, for files
    #[prost(uint64, repeated, packed = "false", tag = "4")]
    pub blocksizes: Vec<u64>,
    /// The multihash code used to bucket names in HAMT shards
    #[prost(uint64, optional, tag = "5")]
    pub hash_type: Option<u64>,
    /// The number of buckets per HAMT shard
    #[prost(uint64, optional, tag = "6")]
    pub fanout: Option<u64>,
    /// Unix permission bits
    #[prost(uint32, optional, tag = "7")]
    pub mode: Option<u32>,
}

/// The kinds of UnixFS nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum DataType {
    /// Raw bytes, not part of a file
    Raw = 0,
    /// A directory with one link per entry
    Directory = 1,
    /// A file, possibly chunked into linked children
    File = 2,
    /// Metadata wrapper (unused in practice)
    Metadata = 3,
    /// A symbolic link, with the target path as data
    Symlink = 4,
    /// One shard of a HAMT-sharded directory
    HamtShard = 5,
}

impl Data {
    /// Parse UnixFS data from a dag-pb `Data` field.
    pub fn decode_for(cid: &Cid, bytes: &Bytes) -> Result<Self, UnixFsError> {
        Self::decode(bytes.clone()).map_err(|source| UnixFsError::InvalidData { cid: *cid, source })
    }

    /// The node kind, if it's one we know of.
    pub fn kind(&self) -> Option<DataType> {
        DataType::try_from(self.r#type).ok()
    }

    /// Files and raw UnixFS leaves are both file content
    pub fn is_file(&self) -> bool {
        matches!(self.kind(), Some(DataType::File | DataType::Raw))
    }

    /// Whether this is a HAMT shard
    pub fn is_hamt_shard(&self) -> bool {
        self.kind() == Some(DataType::HamtShard)
    }
}

/// Get the UnixFS data of a decoded block.
///
/// Returns `None` for anything but dag-pb nodes with a `Data` field.
pub fn unixfs_data(cid: &Cid, node: &Node) -> Result<Option<Data>, UnixFsError> {
    match node {
        Node::DagPb {
            data: Some(bytes), ..
        } if cid.codec() == DAG_PB => Ok(Some(Data::decode_for(cid, bytes)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codecs::RAW, hash::cid_for};
    use assert_matches::assert_matches;
    use testresult::TestResult;

    #[test]
    fn parses_hamt_parameters() -> TestResult {
        let data = Data {
            r#type: DataType::HamtShard as i32,
            hash_type: Some(0x22),
            fanout: Some(256),
            ..Default::default()
        };
        let bytes = Bytes::from(data.encode_to_vec());
        let cid = cid_for(DAG_PB, &bytes)?;

        let parsed = Data::decode_for(&cid, &bytes)?;
        assert!(parsed.is_hamt_shard());
        assert!(!parsed.is_file());
        assert_eq!(parsed.fanout, Some(256));
        assert_eq!(parsed.hash_type, Some(0x22));
        Ok(())
    }

    #[test]
    fn unknown_types_have_no_kind() {
        let data = Data {
            r#type: 42,
            ..Default::default()
        };
        assert_eq!(data.kind(), None);
        assert!(!data.is_file());
    }

    #[test]
    fn rejects_garbage() -> TestResult {
        let bytes = Bytes::from_static(&[0xff, 0xff, 0xff]);
        let cid = cid_for(DAG_PB, &bytes)?;
        assert_matches!(
            Data::decode_for(&cid, &bytes),
            Err(UnixFsError::InvalidData { .. })
        );
        Ok(())
    }

    #[test]
    fn only_dag_pb_carries_unixfs() -> TestResult {
        let cid = cid_for(RAW, b"raw")?;
        assert_eq!(unixfs_data(&cid, &Node::Raw)?, None);
        Ok(())
    }
}
