//! Readiness and cancellation propagation over random trees.
//!
//! Each case builds a random tree (parent edges plus join edges pointing at
//! earlier jobs), then drives the store directly: claim a random ready job,
//! finish it with a random outcome, repeat. The seed is fixed per case so a
//! failure reproduces.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};

use runmanager_core::jobs::{FileRef, Job, JobError, JobFactory, JobId, JobParams, JobState, JobTree};
use runmanager_core::store::{Completion, JobStore};

fn random_tree(rng: &mut StdRng, size: usize) -> JobTree {
    let mut tree = JobTree::new(job());
    let mut ids = vec![tree.root_id()];
    for _ in 1..size {
        let parent = ids[rng.gen_range(0..ids.len())];
        let id = tree.add_child(parent, job()).unwrap();
        if ids.len() > 1 && rng.gen_bool(0.3) {
            let dep = ids[rng.gen_range(0..ids.len())];
            if dep != parent {
                tree.add_join_dependency(id, dep).unwrap();
            }
        }
        ids.push(id);
    }
    tree
}

fn job() -> Job {
    JobFactory::custom("Step", JobParams::new()).unwrap()
}

fn prerequisites(tree: &JobTree) -> HashMap<JobId, Vec<JobId>> {
    tree.iter()
        .map(|job| {
            let mut prereqs: Vec<JobId> = job.parent_id.into_iter().collect();
            prereqs.extend(job.join_dependencies.iter().copied());
            (job.id, prereqs)
        })
        .collect()
}

async fn states(store: &JobStore, root: JobId) -> HashMap<JobId, JobState> {
    store
        .tree_jobs(root)
        .await
        .unwrap()
        .into_iter()
        .map(|job| (job.id, job.state))
        .collect()
}

async fn run_case(seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let size = rng.gen_range(1..40);
    let tree = random_tree(&mut rng, size);
    let prereqs = prerequisites(&tree);

    let store = JobStore::in_memory().await.unwrap();
    let mut ready: Vec<JobId> = store.insert_tree(&tree).await.unwrap().unwrap();
    assert_eq!(ready, vec![tree.root_id()], "seed {}", seed);

    let mut claimed = HashSet::new();
    while !ready.is_empty() {
        let id = ready.swap_remove(rng.gen_range(0..ready.len()));

        let before = states(&store, tree.root_id()).await;
        let job = store.claim(id).await.unwrap().expect("ready job claims");
        assert!(claimed.insert(id), "seed {}: {} claimed twice", seed, id);
        assert!(store.claim(id).await.unwrap().is_none(), "seed {}: double claim", seed);
        for prereq in &prereqs[&id] {
            assert_eq!(before[prereq], JobState::Succeeded, "seed {}: claimed early", seed);
        }
        assert_eq!(job.state, JobState::Running);

        let completion = if rng.gen_bool(0.8) {
            Completion::Succeeded(vec![FileRef::new(format!("{}.out", id.short()))])
        } else {
            Completion::Failed(JobError::execution("random failure"))
        };
        let outcome = store.finish(id, completion).await.unwrap().unwrap();
        for promoted in &outcome.ready {
            assert!(!ready.contains(promoted), "seed {}: promoted twice", seed);
        }
        ready.extend(outcome.ready);
    }

    let finals = states(&store, tree.root_id()).await;
    assert!(!store.has_pending_work().await.unwrap(), "seed {}: work left", seed);
    for (id, state) in &finals {
        assert!(state.is_terminal(), "seed {}: {} is {}", seed, id, state);
        let prereqs_ok = prereqs[id].iter().all(|p| finals[p] == JobState::Succeeded);
        match state {
            JobState::Canceled => assert!(!prereqs_ok, "seed {}: needless cancel of {}", seed, id),
            _ => assert!(prereqs_ok, "seed {}: {} ran without prerequisites", seed, id),
        }
    }

    let stats = store.stats(Some(tree.root_id())).await.unwrap();
    assert_eq!(stats.total as usize, tree.len());
    assert_eq!(stats.unfinished(), 0);
}

#[tokio::test]
async fn test_random_trees_propagate_consistently() {
    for seed in 0..40 {
        run_case(seed).await;
    }
}

#[tokio::test]
async fn test_cancel_mid_run_leaves_no_live_descendants() {
    let mut rng = StdRng::seed_from_u64(7);
    let tree = random_tree(&mut rng, 30);
    let store = JobStore::in_memory().await.unwrap();
    let mut ready = store.insert_tree(&tree).await.unwrap().unwrap();

    // Run a few jobs, then cancel the root while one is running.
    for _ in 0..3 {
        let Some(id) = ready.pop() else { break };
        store.claim(id).await.unwrap().unwrap();
        let outcome = store
            .finish(id, Completion::Succeeded(Vec::new()))
            .await
            .unwrap()
            .unwrap();
        ready.extend(outcome.ready);
    }
    let running = ready.pop();
    if let Some(id) = running {
        store.claim(id).await.unwrap().unwrap();
    }

    let outcome = store.cancel(tree.root_id()).await.unwrap();
    assert_eq!(outcome.running, running.into_iter().collect::<Vec<_>>());

    if let Some(id) = running {
        let finished = store
            .finish(id, Completion::Succeeded(Vec::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.state, Some(JobState::Canceled));
        assert!(finished.ready.is_empty());
    }

    assert!(!store.has_pending_work().await.unwrap());
    for id in ready {
        assert!(store.claim(id).await.unwrap().is_none());
    }
}
