use async_trait::async_trait;
use dagflow::logging::init_logging;
use dagflow::*;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Runs an external command and returns its stdout.
struct Command {
    program: &'static str,
    args: Vec<&'static str>,
}

fn sh(script: &'static str) -> Command {
    Command {
        program: "sh",
        args: vec!["-c", script],
    }
}

#[async_trait]
impl Operator for Command {
    async fn run(&self, _ctx: CancellationToken) -> OperatorResult {
        let output = tokio::process::Command::new(self.program)
            .args(&self.args)
            .output()
            .await?;

        if !output.status.success() {
            return Err(format!("{} exited with {}", self.program, output.status).into());
        }
        Ok(json!(String::from_utf8_lossy(&output.stdout).trim()))
    }
}

fn analytics_job() -> Result<Job> {
    let mut job = Job::new("example-complex-analytics").with_store(Arc::new(MemoryStore::new()));

    job.add(Task::new("sleep-one", Command { program: "sleep", args: vec!["1"] }))?;
    job.add(Task::new("add-one-one", sh("echo $((1 + 1))")))?;
    job.add(Task::new("sleep-two", Command { program: "sleep", args: vec!["2"] }))?;
    job.add(Task::new("add-two-four", sh("echo $((2 + 4))")))?;
    job.add(Task::new("add-three-four", sh("echo $((3 + 4))")))?;
    job.add(
        Task::new("whoops-with-constant-delay", Command { program: "whoops", args: vec![] })
            .retries(5)
            .retry_policy(ConstantDelay::from_secs(1)),
    )?;
    job.add(
        Task::new("whoops-with-exponential-backoff", Command { program: "whoops", args: vec![] })
            .retries(1)
            .retry_policy(ExponentialBackoff::default()),
    )?;
    job.add(
        Task::new("totally-skippable", sh("echo 'everything succeeded'"))
            .trigger_rule(TriggerRule::AllSuccessful),
    )?;
    job.add(
        Task::new("clean-up", sh("echo 'cleaning up now'")).trigger_rule(TriggerRule::AllDone),
    )?;

    job.set_downstream("sleep-one", "add-one-one")?;
    job.set_downstream("add-one-one", "sleep-two")?;
    job.set_downstream("sleep-two", "add-two-four")?;
    job.set_downstream("add-one-one", "add-three-four")?;
    job.set_downstream("sleep-one", "whoops-with-constant-delay")?;
    job.set_downstream("sleep-one", "whoops-with-exponential-backoff")?;
    job.set_downstream("whoops-with-constant-delay", "totally-skippable")?;
    job.set_downstream("whoops-with-exponential-backoff", "totally-skippable")?;
    job.set_downstream("totally-skippable", "clean-up")?;

    Ok(job)
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_logging()?;

    let job = analytics_job()?;

    println!("=== task graph ===");
    job.graph().print();

    println!("=== running ===");
    let start = std::time::Instant::now();
    match job.run().await {
        Ok(execution) => println!("execution {} succeeded", execution.id),
        Err(e) => println!("{}", e),
    }
    println!("elapsed: {:?}", start.elapsed());

    let snapshot = job.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    Ok(())
}
