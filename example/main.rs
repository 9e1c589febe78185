use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use jobgraph::*;
use tokio_util::sync::CancellationToken;

struct Step {
    name: &'static str,
    flaky: bool,
}

impl Node for Step {
    fn id(&self) -> &str {
        self.name
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(std::io::stderr)
        .init();

    let mut graph = Graph::new();
    graph.add_nodes([
        Step { name: "task1", flaky: false },
        Step { name: "task2", flaky: false },
        Step { name: "task3", flaky: true },
        Step { name: "task4", flaky: false },
        Step { name: "task5", flaky: false },
        Step { name: "task6", flaky: false },
    ]);
    graph.set_precursors("task2", ["task1"])?;
    graph.set_precursors("task3", ["task1"])?;
    graph.set_precursors("task4", ["task2", "task3"])?;
    graph.set_precursors("task5", ["task2"])?;
    graph.set_precursors("task6", ["task1", "task4", "task5"])?;

    let plan = graph.plan(["task6"])?;
    println!("=== plan ===\n{}", plan);

    let retry: RetryHelper = serde_json::from_str(
        r#"{ "max_attempts": 3, "interval": "50ms 100ms", "timeout": "10s", "fast_fail": ["^fatal"] }"#,
    )?;
    println!("retry policy: {}", retry);

    let failures = Arc::new(AtomicU32::new(0));
    let retry = Arc::new(retry);
    let started = std::time::Instant::now();
    let result = plan
        .run(CancellationToken::new(), 2, move |ctx: CancellationToken, step: Arc<Step>| {
            let retry = Arc::clone(&retry);
            let failures = Arc::clone(&failures);
            async move {
                retry
                    .retry(&ctx, |_ctx, attempt| {
                        let failures = Arc::clone(&failures);
                        let step = Arc::clone(&step);
                        async move {
                            println!("running {} (attempt {})", step.name, attempt);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            if step.flaky && failures.fetch_add(1, Ordering::SeqCst) == 0 {
                                return Err::<(), BoxError>("connection reset".into());
                            }
                            Ok(())
                        }
                    })
                    .await
            }
        })
        .await;

    println!("=== done in {:?} ===", started.elapsed());
    match result {
        Ok(()) => println!("all nodes succeeded"),
        Err(errors) => println!("failures: {}", errors),
    }
    Ok(())
}
