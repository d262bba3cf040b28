use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use octave_engine::{Supervisor, ALL_EVENTS};
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "octave-tools", about = "Drive the engine worker from a terminal")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Start the worker, send one command and print the response.
    Request {
        command: String,
        /// JSON object sent as the payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Start the worker and print the status snapshot.
    Status,
    /// Start the worker and print its events until the duration elapses.
    Watch {
        /// Event name to follow; all events when omitted.
        #[arg(long)]
        event: Option<String>,
        #[arg(long, default_value_t = 10_000)]
        duration_ms: u64,
    },
    /// Print the launch candidates in the order they would be tried.
    Candidates,
}

fn print_json(v: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v).context("encode output failed")?);
    Ok(())
}

fn status_json(sup: &Supervisor) -> Value {
    json!({
        "status": sup.status_snapshot(),
        "command": sup.worker_command(),
        "runtime": sup.last_runtime(),
    })
}

async fn run(sup: &Supervisor, cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Request {
            command,
            payload,
            timeout_ms,
        } => {
            let payload: Value =
                serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let res = match timeout_ms {
                Some(ms) => {
                    sup.request_with_timeout(&command, payload, Duration::from_millis(ms))
                        .await
                }
                None => sup.request(&command, payload).await,
            };
            let data = res.with_context(|| format!("request {command} failed"))?;
            print_json(&data)
        }
        Cmd::Status => {
            if let Err(e) = sup.ensure_started().await {
                eprintln!("start failed: {e}");
            }
            print_json(&status_json(sup))
        }
        Cmd::Watch { event, duration_ms } => {
            let topic = event.as_deref().unwrap_or(ALL_EVENTS);
            let mut sub = sup.subscribe(topic);
            sup.ensure_started().await.context("start engine failed")?;

            let deadline = tokio::time::sleep(Duration::from_millis(duration_ms));
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    ev = sub.recv() => {
                        let Some(ev) = ev else { break };
                        let ts = chrono::Local::now().format("%H:%M:%S%.3f");
                        println!("{ts} {} {}", ev.name, ev.data);
                    }
                    _ = &mut deadline => break,
                }
            }
            Ok(())
        }
        Cmd::Candidates => {
            let list = serde_json::to_value(sup.candidates()).context("encode candidates failed")?;
            print_json(&list)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let sup = Supervisor::from_env().context("load engine config failed")?;
    let res = run(&sup, cli.cmd).await;
    sup.stop().await;
    res
}
