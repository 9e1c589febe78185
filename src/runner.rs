use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{BoxError, ErrorList, Executor, JobError, JobStatus, NodeError, Plan, Work};

/// Holds a node back until all of its precursors succeeded.
struct PrecursorGate<N, W> {
    executor: Executor<String>,
    nodes: HashMap<String, (Arc<N>, Vec<String>)>,
    work: W,
}

impl<N, W> PrecursorGate<N, W> {
    fn fail(id: &str, cause: JobError) -> BoxError {
        Box::new(NodeError::new(cause).with_node_ids([id]))
    }
}

#[async_trait]
impl<N, W> Work<String> for PrecursorGate<N, W>
where
    N: Send + Sync + 'static,
    W: Work<Arc<N>>,
{
    async fn call(&self, ctx: CancellationToken, id: String) -> Result<(), BoxError> {
        let Some((node, precursors)) = self.nodes.get(&id) else {
            return Err(Self::fail(&id, JobError::UnknownNode(id.clone())));
        };

        for precursor in precursors {
            match self.executor.wait_for(precursor, &ctx).await {
                Ok(JobStatus::Success) => {}
                Ok(JobStatus::Failure(_)) => {
                    debug!(node = %id, precursor = %precursor, "skipping node after failed precursor");
                    return Err(Self::fail(&id, JobError::DependencyFailed(precursor.clone())));
                }
                Ok(JobStatus::Pending) => {
                    return Err(Self::fail(&id, JobError::NotFound));
                }
                Err(err) => return Err(Self::fail(&id, err)),
            }
        }

        self.work.call(ctx, Arc::clone(node)).await
    }
}

impl<N: Send + Sync + 'static> Plan<N> {
    /// Runs `work` for every planned node on up to `parallelism` workers.
    ///
    /// A node starts only after each of its precursors finished successfully.
    /// If a precursor failed the node fails with
    /// [`JobError::DependencyFailed`] and `work` is not called for it; other
    /// branches keep running. Returns every failure, each attributed to its
    /// node id.
    pub async fn run<W>(
        &self,
        ctx: CancellationToken,
        parallelism: usize,
        work: W,
    ) -> Result<(), ErrorList>
    where
        W: Work<Arc<N>>,
    {
        // Jobs are queued in plan order: whichever unfinished job was dequeued
        // first has all its precursors done, so workers never all block.
        let jobs: Vec<String> = self.nodes.iter().map(|n| n.id().to_string()).collect();
        let nodes = self
            .nodes
            .iter()
            .map(|n| {
                (
                    n.id().to_string(),
                    (Arc::clone(n.node()), n.precursors().to_vec()),
                )
            })
            .collect();

        let executor = Executor::new();
        let gate = PrecursorGate {
            executor: executor.clone(),
            nodes,
            work,
        };

        if let Err(err) = executor.start(ctx, parallelism, gate, jobs).await {
            return Err(std::iter::once(NodeError::new(err)).collect());
        }
        executor.wait_for_completion().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Graph;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn chain(ids: &[&'static str]) -> Graph<&'static str> {
        let mut g = Graph::new();
        g.add_nodes(ids.iter().copied());
        for pair in ids.windows(2) {
            g.set_precursors(pair[1], [pair[0]]).unwrap();
        }
        g
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_precursor_short_circuits_dependents() {
        let g = chain(&["a", "b", "c"]);
        let plan = g.plan(["c"]).unwrap();
        let invoked = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&invoked);
        let errors = plan
            .run(
                CancellationToken::new(),
                3,
                move |_ctx: CancellationToken, node: Arc<&'static str>| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().unwrap().push(*node);
                        if *node == "b" {
                            return Err::<(), BoxError>("broken".into());
                        }
                        Ok(())
                    }
                },
            )
            .await
            .unwrap_err();

        assert_eq!(*invoked.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.for_node("b").unwrap().to_string(), "broken: b");
        assert_eq!(
            errors.for_node("c").unwrap().job_error(),
            Some(&JobError::DependencyFailed("b".into()))
        );
        assert!(errors.for_node("a").is_none());
    }

    #[tokio::test]
    async fn panicking_precursor_counts_as_failure() {
        let g = chain(&["a", "b"]);
        let errors = g
            .plan(["b"])
            .unwrap()
            .run(
                CancellationToken::new(),
                2,
                |_ctx: CancellationToken, node: Arc<&'static str>| async move {
                    if *node == "a" {
                        panic!("a panicked");
                    }
                    Ok::<(), BoxError>(())
                },
            )
            .await
            .unwrap_err();

        assert!(errors.for_node("a").unwrap().is_panic());
        assert_eq!(
            errors.for_node("b").unwrap().job_error(),
            Some(&JobError::DependencyFailed("a".into()))
        );
    }

    #[tokio::test]
    async fn single_worker_runs_a_diamond() {
        let mut g = Graph::new();
        g.add_nodes(["top", "l", "r", "bottom"]);
        g.set_precursors("l", ["top"]).unwrap();
        g.set_precursors("r", ["top"]).unwrap();
        g.set_precursors("bottom", ["l", "r"]).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        g.plan(["bottom"])
            .unwrap()
            .run(
                CancellationToken::new(),
                1,
                move |_ctx: CancellationToken, _node: Arc<&'static str>| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), BoxError>(())
                    }
                },
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_releases_waiting_dependents() {
        let g = chain(&["slow", "after"]);
        let plan = g.plan(["after"]).unwrap();
        let ctx = CancellationToken::new();
        let release = CancellationToken::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let hold = release.clone();
        let ran_after = Arc::new(AtomicUsize::new(0));
        let after_counter = Arc::clone(&ran_after);
        let run = plan.run(
            ctx,
            2,
            move |_ctx: CancellationToken, node: Arc<&'static str>| {
                let (hold, after_counter) = (hold.clone(), Arc::clone(&after_counter));
                async move {
                    if *node == "slow" {
                        hold.cancelled().await;
                    } else {
                        after_counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok::<(), BoxError>(())
                }
            },
        );

        let releaser = release.clone();
        let (result, _) = tokio::join!(run, async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            releaser.cancel();
        });

        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors.for_node("after").unwrap().job_error(),
            Some(&JobError::Cancelled)
        );
        assert_eq!(ran_after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_plan_succeeds() {
        let g: Graph<&'static str> = Graph::new();
        let plan = g.plan(Vec::<&str>::new()).unwrap();
        assert!(plan.is_empty());
        plan.run(
            CancellationToken::new(),
            4,
            |_ctx: CancellationToken, _node: Arc<&'static str>| async { Ok::<(), BoxError>(()) },
        )
        .await
        .unwrap();
    }
}
