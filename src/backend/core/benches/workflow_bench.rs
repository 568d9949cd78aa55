//! Benchmarks for workflow materialization and store propagation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::path::Path;

use runmanager_core::jobs::{JobFactory, JobParams, JobTree, JobType, Workflow};
use runmanager_core::store::{Completion, JobStore};

fn simulation_workflow(split: u32) -> Workflow {
    let mut workflow = Workflow::parse("ModelToIdf->ExpandObjects->EnergyPlus->ReadVars").unwrap();
    if split > 1 {
        workflow.parallelize(&JobType::EnergyPlus, split).unwrap();
    }
    workflow
}

fn wide_tree(width: usize) -> JobTree {
    let mut tree = JobTree::new(JobFactory::null_job());
    let root = tree.root_id();
    let mut branches = Vec::with_capacity(width);
    for _ in 0..width {
        branches.push(tree.add_child(root, JobFactory::custom("Step", JobParams::new()).unwrap()).unwrap());
    }
    let join = tree.add_child(root, JobFactory::join()).unwrap();
    for branch in branches { tree.add_join_dependency(join, branch).unwrap(); }
    tree
}

fn bench_workflow_parse(c: &mut Criterion) {
    c.bench_function("workflow_parse", |b| {
        b.iter(|| black_box(Workflow::parse(black_box("ModelToIdf->ExpandObjects->EnergyPlus->ReadVars")).unwrap()));
    });
}

fn bench_workflow_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("workflow_create");
    for split in [1u32, 4, 12, 52] {
        let workflow = simulation_workflow(split);
        group.bench_with_input(BenchmarkId::from_parameter(split), &workflow, |b, workflow| {
            b.iter(|| black_box(workflow.create(Path::new("/tmp/bench"), "/tmp/bench/model.osm", &[]).unwrap()));
        });
    }
    group.finish();
}

fn bench_tree_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_validate");
    for width in [10, 100, 1_000] {
        let tree = wide_tree(width);
        group.throughput(Throughput::Elements(tree.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(width), &tree, |b, tree| {
            b.iter(|| tree.validate().unwrap());
        });
    }
    group.finish();
}

fn bench_store_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_propagation");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for width in [10, 100] {
        group.throughput(Throughput::Elements(width as u64 + 2));
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, &width| {
            b.iter(|| { rt.block_on(async {
                let store = JobStore::in_memory().await.unwrap();
                let mut ready = store.insert_tree(&wide_tree(width)).await.unwrap().unwrap();
                while let Some(id) = ready.pop() {
                    store.claim(id).await.unwrap().unwrap();
                    let outcome = store.finish(id, Completion::Succeeded(Vec::new())).await.unwrap().unwrap();
                    ready.extend(outcome.ready);
                }
                store.close().await;
            }); });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_workflow_parse, bench_workflow_create, bench_tree_validate, bench_store_propagation);
criterion_main!(benches);
