//! Randomized dependency graphs.

use std::collections::HashSet;

use proptest::prelude::*;
use serde_json::json;

use switchboard::core::{capabilities, FailureReason, RequestStatus, RequesterContext, TaskStatus};
use switchboard::worker::WorkerRegistry;
use switchboard::{DecompositionError, Error};

use crate::fixtures::{as_worker, start_with_registry, test_config, Mark, Recording};

/// A random DAG: `deps[j]` lists earlier steps that step `j` waits for.
#[derive(Debug, Clone)]
struct RandomDag {
    deps: Vec<Vec<usize>>,
    failing: Vec<bool>,
}

impl RandomDag {
    fn len(&self) -> usize {
        self.deps.len()
    }

    fn step(i: usize) -> String {
        format!("t{}", i)
    }

    fn plan(&self, extra: &[(usize, usize)]) -> String {
        let steps: Vec<serde_json::Value> = (0..self.len())
            .map(|j| {
                let mut deps: Vec<String> = self.deps[j].iter().map(|&i| Self::step(i)).collect();
                for &(from, to) in extra {
                    if to == j {
                        deps.push(Self::step(from));
                    }
                }
                json!({
                    "id": Self::step(j),
                    "capability": capabilities::BUILTIN[j % capabilities::BUILTIN.len()],
                    "depends_on": deps,
                })
            })
            .collect();
        json!({ "steps": steps, "query": "random" }).to_string()
    }

    /// Steps that cannot run because something upstream fails.
    fn doomed(&self) -> Vec<bool> {
        let mut doomed = vec![false; self.len()];
        for j in 0..self.len() {
            doomed[j] = self.deps[j].iter().any(|&i| self.failing[i] || doomed[i]);
        }
        doomed
    }
}

fn random_dag(max: usize) -> impl Strategy<Value = RandomDag> {
    (1..=max).prop_flat_map(|n| {
        (
            proptest::collection::vec(any::<bool>(), n * (n - 1) / 2),
            proptest::collection::vec(proptest::bool::weighted(0.2), n),
        )
            .prop_map(move |(edges, failing)| {
                let mut deps = vec![Vec::new(); n];
                let mut k = 0;
                for (j, slot) in deps.iter_mut().enumerate() {
                    for i in 0..j {
                        if edges[k] {
                            slot.push(i);
                        }
                        k += 1;
                    }
                }
                RandomDag { deps, failing }
            })
    })
}

fn recording_registry(worker: &std::sync::Arc<Recording>) -> WorkerRegistry {
    let registry = WorkerRegistry::new();
    for capability in capabilities::BUILTIN {
        registry.register(capability, as_worker(worker));
    }
    registry
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// No step starts before all of its dependencies have finished, and a
    /// step downstream of a failure never starts.
    #[test]
    fn prop_dependencies_finish_before_dependents_start(dag in random_dag(7)) {
        let failing: Vec<String> = (0..dag.len())
            .filter(|&i| dag.failing[i])
            .map(RandomDag::step)
            .collect();
        let worker = Recording::new(failing);
        let doomed = dag.doomed();

        tokio_test::block_on(async {
            let orchestrator = start_with_registry(test_config(0), recording_registry(&worker));
            let response = orchestrator
                .run(&dag.plan(&[]), RequesterContext::default())
                .await
                .unwrap();

            let log = worker.log();
            let position = |mark: &Mark| log.iter().position(|m| m == mark);

            for j in 0..dag.len() {
                let step = RandomDag::step(j);
                let start = position(&Mark::Start(step.clone()));
                assert_eq!(start.is_some(), !doomed[j], "step {} started: {:?}", step, start);

                if let Some(start) = start {
                    for &i in &dag.deps[j] {
                        let end = position(&Mark::End(RandomDag::step(i)))
                            .expect("dependency ran");
                        assert!(end < start, "t{} ended after {} started", i, step);
                    }
                }
            }

            let tasks = orchestrator.tasks(&response.request_id).await.unwrap();
            for (j, task) in tasks.iter().enumerate() {
                assert_eq!(task.step, RandomDag::step(j));
                if doomed[j] {
                    assert!(matches!(task.failure(), Some(FailureReason::UpstreamFailure { .. })));
                    assert_eq!(task.attempts, 0);
                } else if dag.failing[j] {
                    assert!(matches!(task.failure(), Some(FailureReason::Permanent { .. })));
                } else {
                    assert_eq!(task.status, TaskStatus::Succeeded);
                }
            }

            let succeeded = tasks.iter().filter(|t| t.status == TaskStatus::Succeeded).count();
            let expected = if succeeded == dag.len() {
                RequestStatus::Succeeded
            } else if succeeded == 0 {
                RequestStatus::Failed
            } else {
                RequestStatus::Partial
            };
            assert_eq!(response.status, expected);
            assert_eq!(response.completed.len(), succeeded);

            orchestrator.shutdown().await;
        });
    }

    /// A plan with a back edge is rejected and nothing runs.
    #[test]
    fn prop_cyclic_plan_rejected_before_dispatch(
        dag in random_dag(6).prop_filter("needs two steps", |d| d.len() >= 2),
        pick in any::<proptest::sample::Index>(),
    ) {
        let n = dag.len();
        let j = 1 + pick.index(n - 1);
        let i = pick.index(j);
        let worker = Recording::new(Vec::new());

        tokio_test::block_on(async {
            let orchestrator = start_with_registry(test_config(0), recording_registry(&worker));

            // j waits for i and i waits for j
            let err = orchestrator
                .submit(&dag.plan(&[(i, j), (j, i)]), RequesterContext::default())
                .await
                .unwrap_err();
            assert!(
                matches!(err, Error::Decomposition(DecompositionError::CyclicDependency(_))),
                "unexpected error: {}",
                err
            );
            assert!(orchestrator.tracker().active_requests().await.is_empty());
            orchestrator.shutdown().await;
        });

        prop_assert!(worker.log().is_empty());
    }
}

/// Capabilities referenced by the generated plans exist.
#[test]
fn test_recording_registry_covers_builtins() {
    let worker = Recording::new(Vec::new());
    let registry = recording_registry(&worker);
    let names: HashSet<String> = registry.capabilities().iter().map(|c| c.to_string()).collect();
    assert_eq!(names.len(), capabilities::BUILTIN.len());
}
