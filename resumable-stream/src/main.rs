use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use resumable_stream_cluster::{
    ExistingStream, ResumableStream, ResumableStreamContext, SentinelState, TrackedKeepAlive,
};
use resumable_stream_core::logging::init_logging;
use resumable_stream_core::{Config, Error};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "resumable-stream")]
#[command(about = "Produce, follow and cancel resumable streams", long_about = None)]
struct Args {
    /// Config file (YAML or TOML)
    #[arg(long, env = "RESUMABLE_STREAM_CONFIG")]
    config: Option<String>,

    /// Redis connection URL, overrides the config file
    #[arg(long)]
    redis_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a stream, producing it from stdin (one chunk per line) if nobody else does
    Produce {
        stream_id: String,
    },
    /// Follow a stream another process is producing
    Resume {
        stream_id: String,

        /// Characters already seen
        #[arg(long)]
        skip: Option<usize>,
    },
    /// Print whether a stream is absent, active or done
    Status {
        stream_id: String,
    },
    /// Ask the producer of a stream to stop
    Cancel {
        stream_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(url) = args.redis_url {
        config.redis.url = url;
    }
    if let Err(errors) = config.validate() {
        anyhow::bail!("Invalid configuration:\n  {}", errors.join("\n  "));
    }

    init_logging(&config.logging)?;
    check_transport(&args.command, &config)?;

    let keep_alive = TrackedKeepAlive::new();
    let context = ResumableStreamContext::from_config(&config, Arc::new(keep_alive.clone()))?;

    match args.command {
        Command::Produce { stream_id } => {
            let stream = context
                .resumable_stream(&stream_id, stdin_chunks, None)
                .await?;
            match stream {
                Some(stream) => print_stream(stream).await?,
                None => info!(stream_id = %stream_id, "Stream already finished"),
            }

            if keep_alive.pending() > 0 {
                info!("Waiting for producer to finish");
            }
            tokio::select! {
                () = keep_alive.wait() => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("Received shutdown signal, abandoning producer");
                }
            }
        }
        Command::Resume { stream_id, skip } => {
            match context.resume_existing_stream(&stream_id, skip).await? {
                ExistingStream::Live(stream) => print_stream(stream).await?,
                ExistingStream::Done => info!(stream_id = %stream_id, "Stream already finished"),
                ExistingStream::Absent => anyhow::bail!("Stream {stream_id} does not exist"),
            }
        }
        Command::Status { stream_id } => {
            let state = match context.has_existing_stream(&stream_id).await? {
                SentinelState::Absent => "absent",
                SentinelState::Active => "active",
                SentinelState::Done => "done",
            };
            println!("{state}");
        }
        Command::Cancel { stream_id } => {
            context.send_cancellation_signal(&stream_id).await?;
            info!(stream_id = %stream_id, "Cancellation sent");
        }
    }

    Ok(())
}

/// Without Redis only this process can see its streams
fn check_transport(command: &Command, config: &Config) -> Result<()> {
    if config.redis_url().is_some() {
        return Ok(());
    }
    match command {
        Command::Produce { .. } => {
            warn!("Redis not configured, the stream is only visible to this process");
            Ok(())
        }
        Command::Resume { .. } | Command::Status { .. } | Command::Cancel { .. } => {
            anyhow::bail!(
                "'{}' needs a shared Redis transport, set --redis-url or redis.url",
                command.name()
            )
        }
    }
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::Produce { .. } => "produce",
            Self::Resume { .. } => "resume",
            Self::Status { .. } => "status",
            Self::Cancel { .. } => "cancel",
        }
    }
}

/// Lines of stdin, newline included, as a chunk source
fn stdin_chunks() -> impl futures::Stream<Item = resumable_stream_core::Result<String>> + Send + 'static
{
    let lines = BufReader::new(tokio::io::stdin()).lines();
    futures::stream::unfold(Some(lines), |lines| async move {
        let mut lines = lines?;
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(format!("{line}\n")), Some(lines))),
            Ok(None) => None,
            Err(e) => Some((Err(Error::Source(e.to_string())), None)),
        }
    })
}

/// Copy a stream to stdout until it ends or ctrl-c
async fn print_stream(mut stream: ResumableStream) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, leaving stream");
                break;
            }
        };
        match chunk {
            Some(Ok(chunk)) => {
                stdout.write_all(chunk.as_bytes()).await?;
                stdout.flush().await?;
            }
            Some(Err(e)) => {
                error!(error = %e, "Stream failed");
                return Err(e.into());
            }
            None => break,
        }
    }
    Ok(())
}
