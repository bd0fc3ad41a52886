//! Worker binary entry point.
//!
//! Stdout belongs to the pool protocol, so all diagnostics go to stderr;
//! the pool re-emits them through its own tracing layer.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use reflow_core::RemoteError;
use reflow_worker::{task_fn, run, TaskModule};
use serde_json::{json, Value};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reflow-worker", about = "Reflow task pool worker process")]
struct Args {
    /// Name of the task module to serve.
    #[arg(long)]
    task_module: String,

    /// Spool directory shared with the pool's payload channel.
    #[arg(long)]
    spool_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let Some(module) = load_module(&args.task_module) else {
        // Exiting before the initialization frame makes the pool fail the
        // startup instead of waiting out the init timeout.
        error!(module = %args.task_module, "Unknown task module");
        return ExitCode::from(2);
    };

    match run(module, args.spool_dir, tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Worker run loop failed");
            ExitCode::FAILURE
        }
    }
}

/// Resolve a task module by name. Hosts embedding the worker crate build
/// their own modules; the binary ships one built-in set.
fn load_module(name: &str) -> Option<TaskModule> {
    match name {
        "default" => Some(default_module()),
        _ => None,
    }
}

fn default_module() -> TaskModule {
    let mut module = TaskModule::new("default");

    module
        .register(
            "echo",
            task_fn(|args, kwargs, _| async move {
                Ok(json!({ "args": args, "kwargs": kwargs }))
            }),
        )
        .expect("fresh module");

    module
        .register(
            "sum",
            task_fn(|args, _, _| async move {
                let mut total = 0.0;
                for arg in &args {
                    total += arg
                        .as_f64()
                        .ok_or_else(|| RemoteError::new("sum expects numbers", String::new()))?;
                }
                Ok(json!(total))
            }),
        )
        .expect("fresh module");

    module
        .register(
            "sleep_ms",
            task_fn(|args, _, progress| async move {
                let total = args.first().and_then(Value::as_u64).unwrap_or(0);
                let step = total / 4;
                for i in 1..=4u64 {
                    tokio::time::sleep(std::time::Duration::from_millis(step)).await;
                    progress.report(i as f64 / 4.0, format!("slept {}ms", step * i)).await;
                }
                Ok(json!(total))
            }),
        )
        .expect("fresh module");

    module
}
