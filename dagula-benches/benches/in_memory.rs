use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use dagula::{
    Dagula, DagScope, PathOptions,
    test_utils::{arb_ipld_dag, links_to_padded_ipld, setup_blockstore},
};
use futures::TryStreamExt;

pub fn get(c: &mut Criterion) {
    let mut rvg = dagula::test_utils::Rvg::deterministic();

    c.bench_function("get whole DAG", |b| {
        b.iter_batched(
            || {
                let (blocks, root) = rvg.sample(&arb_ipld_dag(
                    250..256,
                    0.9, // Very highly connected
                    links_to_padded_ipld(10 * 1024),
                ));
                let store = async_std::task::block_on(setup_blockstore(blocks)).unwrap();
                (Dagula::new(store), root)
            },
            |(dagula, root)| {
                async_std::task::block_on(async move {
                    dagula.get(root).try_for_each(|_| async { Ok(()) }).await
                })
                .unwrap();
            },
            BatchSize::LargeInput,
        )
    });
}

pub fn get_path_block_scope(c: &mut Criterion) {
    let mut rvg = dagula::test_utils::Rvg::deterministic();

    c.bench_function("get_path root with block scope", |b| {
        b.iter_batched(
            || {
                let (blocks, root) = rvg.sample(&arb_ipld_dag(
                    250..256,
                    0.9,
                    links_to_padded_ipld(10 * 1024), // 10KiB random data per block
                ));
                let store = async_std::task::block_on(setup_blockstore(blocks)).unwrap();
                (Dagula::new(store), root)
            },
            |(dagula, root)| {
                let options = PathOptions {
                    scope: DagScope::Block,
                    ..Default::default()
                };
                async_std::task::block_on(async move {
                    dagula
                        .get_path(&root.to_string(), options)
                        .try_for_each(|_| async { Ok(()) })
                        .await
                })
                .unwrap();
            },
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, get, get_path_block_scope);
criterion_main!(benches);
