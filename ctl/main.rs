#![forbid(unsafe_code)]

//! `live-harness-ctl` — operator CLI for `live-harness`.
//!
//! Compiles image manifests, pushes images to a running host, lists their
//! entry points, and runs one while answering checkpoint prompts from the
//! terminal.

use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};

use live_harness::client::Client;
use live_harness::config::TOKEN_ENV_VAR;
use live_harness::engine::{CheckpointDecision, TimeFlow};
use live_harness::loader::ImageManifest;
use live_harness::wire::messages::{CheckpointAnswer, CheckpointPrompt, Message, RunResult};
use live_harness::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "live-harness-ctl",
    about = "Operator CLI for live-harness",
    version,
    long_about = None
)]
struct Cli {
    /// Host address.
    #[arg(long, default_value = "127.0.0.1:7878")]
    addr: SocketAddr,

    /// Largest frame accepted from the host.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    max_frame_bytes: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum FlowArg {
    Normal,
    Accelerated,
    FrameSkipping,
    Frozen,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compile a TOML manifest into an image (and symbols).
    Compile {
        /// Manifest path.
        manifest: PathBuf,
        /// Output image path.
        #[arg(short, long)]
        output: PathBuf,
        /// Output path for debug symbols, if the manifest produces any.
        #[arg(long)]
        symbols: Option<PathBuf>,
    },

    /// Push an image and print its entry-point catalog.
    Catalog {
        /// Image path.
        image: PathBuf,
        /// Debug symbols path.
        #[arg(long)]
        symbols: Option<PathBuf>,
        /// Print the catalog as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Push an image and run one entry point.
    Run {
        /// Image path.
        image: PathBuf,
        /// Catalog index of the entry point.
        index: u32,
        /// Debug symbols path.
        #[arg(long)]
        symbols: Option<PathBuf>,
        /// Time-flow policy for the run.
        #[arg(long, value_enum, default_value_t = FlowArg::Normal)]
        flow: FlowArg,
        /// Scale for `accelerated`.
        #[arg(long, default_value_t = 4.0)]
        scale: f32,
        /// Logical milliseconds per tick for `frame-skipping`.
        #[arg(long, default_value_t = 500)]
        step_ms: u32,
    },
}

fn main() {
    let args = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(dispatch(args)) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

/// Returns whether the command succeeded.
async fn dispatch(args: Cli) -> Result<bool> {
    match args.command {
        Command::Compile {
            manifest,
            output,
            symbols,
        } => {
            let built = ImageManifest::load_from_path(&manifest)?.to_builder()?.build()?;
            write_file(&output, &built.image)?;
            println!("wrote {} ({} bytes)", output.display(), built.image.len());
            match (symbols, built.symbols) {
                (Some(path), Some(bytes)) => {
                    write_file(&path, &bytes)?;
                    println!("wrote {} ({} bytes)", path.display(), bytes.len());
                }
                (Some(_), None) => println!("manifest has no source lines; no symbols written"),
                _ => {}
            }
            Ok(true)
        }
        Command::Catalog {
            image,
            symbols,
            json,
        } => {
            let mut client = connect(args.addr, args.max_frame_bytes).await?;
            let catalog = client
                .push_image(read_file(&image)?, symbols.map(|p| read_file(&p)).transpose()?)
                .await?;
            if json {
                let text = serde_json::to_string_pretty(&catalog)
                    .map_err(|err| AppError::Protocol(format!("cannot render catalog: {err}")))?;
                println!("{text}");
            } else {
                println!("{} ({})", catalog.image, catalog.digest);
                for entry in &catalog.entries {
                    println!(
                        "  [{}] {:>6}  {}.{}  {}",
                        entry.index, entry.order, entry.type_name, entry.method, entry.summary
                    );
                }
                for skipped in &catalog.skipped {
                    println!("  skipped: {skipped}");
                }
            }
            client.disconnect("done").await?;
            Ok(true)
        }
        Command::Run {
            image,
            index,
            symbols,
            flow,
            scale,
            step_ms,
        } => {
            let time_flow = match flow {
                FlowArg::Normal => TimeFlow::Normal,
                FlowArg::Accelerated => TimeFlow::Accelerated { scale },
                FlowArg::FrameSkipping => TimeFlow::FrameSkipping { step_ms },
                FlowArg::Frozen => TimeFlow::Frozen,
            };
            let mut client = connect(args.addr, args.max_frame_bytes).await?;
            client
                .push_image(read_file(&image)?, symbols.map(|p| read_file(&p)).transpose()?)
                .await?;
            client.run(index, time_flow).await?;
            let result = follow_run(&mut client).await?;
            client.disconnect("done").await?;
            Ok(result.completed)
        }
    }
}

async fn connect(addr: SocketAddr, max_frame_bytes: usize) -> Result<Client> {
    let token = std::env::var(TOKEN_ENV_VAR)
        .map_err(|_| AppError::Config(format!("{TOKEN_ENV_VAR} is not set")))?;
    Client::connect(addr, "live-harness-ctl", &token, max_frame_bytes).await
}

/// Print run output and answer prompts until the run's result arrives.
async fn follow_run(client: &mut Client) -> Result<RunResult> {
    loop {
        let Some(message) = client.recv().await? else {
            return Err(AppError::Network("host closed the connection".into()));
        };
        match message {
            Message::RunStarted(started) => {
                println!("run {} started: {}", started.run_id, started.entry);
            }
            Message::Log(log) => println!("[{:?}] {}", log.level, log.line),
            Message::CheckpointPrompt(prompt) => {
                let decision = ask_operator(prompt.clone()).await?;
                client
                    .send(CheckpointAnswer {
                        prompt_id: prompt.prompt_id,
                        decision,
                    })
                    .await?;
            }
            Message::RunResult(result) => {
                println!(
                    "run {} {:?} in {} ms{}",
                    result.run_id,
                    result.status,
                    result.duration_ms,
                    result
                        .message
                        .as_deref()
                        .map(|m| format!(": {m}"))
                        .unwrap_or_default()
                );
                return Ok(result);
            }
            Message::Disconnect(disconnect) => {
                return Err(AppError::Network(disconnect.reason));
            }
            other => println!("unexpected {:?} frame", other.kind()),
        }
    }
}

async fn ask_operator(prompt: CheckpointPrompt) -> Result<CheckpointDecision> {
    tokio::task::spawn_blocking(move || -> std::io::Result<CheckpointDecision> {
        let menu: Vec<String> = prompt.choices.iter().map(ToString::to_string).collect();
        let stdin = std::io::stdin();
        loop {
            print!("checkpoint: {} [{}] > ", prompt.message, menu.join("/"));
            std::io::stdout().flush()?;
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Ok(CheckpointDecision::Abort);
            }
            match line.parse::<CheckpointDecision>() {
                Ok(decision) if prompt.choices.contains(&decision) => return Ok(decision),
                Ok(decision) => println!("'{decision}' is not offered here"),
                Err(err) => println!("{err}"),
            }
        }
    })
    .await
    .map_err(|err| AppError::Io(format!("prompt task failed: {err}")))?
    .map_err(AppError::from)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|err| AppError::Io(format!("cannot read {}: {err}", path.display())))
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)
        .map_err(|err| AppError::Io(format!("cannot write {}: {err}", path.display())))
}
