//! Minimal interactive harness for exercising a [`cdbx_session::Session`]
//! end to end against a real CDB binary. Not the outer RPC/JSON dispatcher
//! a production tool-calling surface would sit behind — just enough to
//! smoke-test process lifecycle, queueing, and caching by hand.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use cdbx_core::SessionConfig;
use cdbx_session::Session;

#[derive(Parser, Debug)]
#[command(name = "cdbx", about = "Supervise an interactive CDB session from the command line")]
struct Cli {
    /// Path to cdb.exe (or a compatible stand-in). Overrides any configured path.
    #[arg(long)]
    cdb: Option<PathBuf>,

    /// Extra arguments passed to the debugger on launch (e.g. `-z dump.dmp`).
    #[arg(long = "arg", value_name = "ARG")]
    target_args: Vec<String>,

    /// Per-command timeout in seconds.
    #[arg(long, default_value_t = 30)]
    command_timeout_secs: u64,

    /// Commands to run, in order, then exit. With none given, reads commands
    /// from stdin line by line until EOF.
    commands: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();

    let file_config = cdbx_config::SessionConfigFile::load_default()?;
    let mut builder = SessionConfig::builder();
    if let Some(file_config) = &file_config {
        builder = file_config.apply_to(builder);
    }
    builder = builder.command_timeout(Duration::from_secs(cli.command_timeout_secs));
    if let Some(cdb) = &cli.cdb {
        builder = builder.executable_path_override(cdb);
    }
    let config = builder.build()?;

    let session = Session::builder(config).build();
    if !session.start(&cli.target_args).await {
        anyhow::bail!("failed to start debugger process");
    }

    if cli.commands.is_empty() {
        run_stdin_loop(&session).await?;
    } else {
        for command in &cli.commands {
            run_one(&session, command).await?;
        }
    }

    session.stop().await;
    Ok(())
}

async fn run_stdin_loop(session: &Session) -> Result<()> {
    use std::io::BufRead;
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        run_one(session, &line).await?;
    }
    Ok(())
}

async fn run_one(session: &Session, command_text: &str) -> Result<()> {
    let id = session.submit(command_text).await?;
    loop {
        let text = session.get_result(&id).await?;
        if text == cdbx_queue::STILL_EXECUTING_SENTINEL {
            tokio::time::sleep(Duration::from_millis(25)).await;
            continue;
        }
        println!("{text}");
        break;
    }
    Ok(())
}
