use crate::{Block, error::Error};
use futures::{Stream, TryStreamExt};
use iroh_car::{CarHeader, CarWriter};
use tokio::io::AsyncWrite;
use tracing::debug;
use wnfs_common::Cid;

/// Write a stream of blocks as CARv1 to `writer`, in the order they're yielded.
///
/// Returns the writer and the number of blocks written.
/// The first error from the stream aborts the export after the blocks before it were written.
pub async fn write_car<W: AsyncWrite + Send + Unpin>(
    roots: Vec<Cid>,
    blocks: impl Stream<Item = Result<Block, Error>>,
    writer: W,
) -> Result<(W, usize), Error> {
    let mut writer = CarWriter::new(CarHeader::new_v1(roots), writer);
    writer.write_header().await?;

    let mut blocks = std::pin::pin!(blocks);
    let mut count = 0;
    while let Some(block) = blocks.try_next().await? {
        writer.write(block.cid, &block.bytes).await?;
        count += 1;
    }

    debug!(blocks = count, "wrote CAR file");
    Ok((writer.finish().await?, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dagula, test_utils::TestDag};
    use iroh_car::CarReader;
    use std::io::Cursor;
    use testresult::TestResult;
    use wnfs_common::MemoryBlockStore;

    #[test_log::test(async_std::test)]
    async fn exported_blocks_read_back_in_order() -> TestResult {
        let store = MemoryBlockStore::new();
        let dag = TestDag::two_levels(&store).await?;
        let dagula = Dagula::new(store);
        let expected = dagula.get(dag.root).try_collect::<Vec<_>>().await?;

        let (car, count) = write_car(vec![dag.root], dagula.get(dag.root), Vec::new()).await?;
        assert_eq!(count, expected.len());

        let mut reader = CarReader::new(Cursor::new(car)).await?;
        assert_eq!(reader.header().roots(), &[dag.root]);
        let mut read = Vec::new();
        while let Some((cid, bytes)) = reader.next_block().await? {
            read.push(Block {
                cid,
                bytes: bytes.into(),
            });
        }
        assert_eq!(read, expected);
        Ok(())
    }
}
