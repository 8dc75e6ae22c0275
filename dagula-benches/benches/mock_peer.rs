use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use dagula::{
    Config, Dagula,
    test_utils::{MockPeer, arb_ipld_dag, links_to_dag_cbor},
};
use futures::TryStreamExt;
use std::time::Duration;

pub fn get_over_bitswap(c: &mut Criterion) {
    let mut rvg = dagula::test_utils::Rvg::deterministic();
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("get whole DAG from a mock peer, 1ms latency", |b| {
        b.iter_batched(
            || {
                let (blocks, root) =
                    rvg.sample(&arb_ipld_dag(60..64, 0.9, |cids, _| links_to_dag_cbor(cids)));
                let peer = MockPeer::new().with_latency(Duration::from_millis(1));
                for (cid, bytes) in blocks {
                    peer.insert(cid, bytes);
                }
                (peer, root)
            },
            |(peer, root)| {
                runtime
                    .block_on(async move {
                        let dagula = Dagula::new(peer.connect(Config::default()));
                        let result = dagula.get(root).try_for_each(|_| async { Ok(()) }).await;
                        dagula.destroy().await;
                        result
                    })
                    .unwrap();
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, get_over_bitswap);
criterion_main!(benches);
