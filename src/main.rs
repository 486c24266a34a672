use std::{fs, path::PathBuf};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use nats_bridge::{apps::App, config::BridgeConfig, logger::init_tracing};
use schemars::schema_for;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "nats_bridge",
    about = "Moves messages between NATS subjects and a pack pipeline",
    version = "0.2.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every configured input and output until Ctrl-C
    Run(RunArgs),

    /// Emit the JSON-Schema of the config file
    Schema(SchemaArgs),

    /// Parse the config and initialize every adapter without connecting
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, short, default_value = "nats_bridge.yaml")]
    config: PathBuf,

    /// Overrides `log.level` from the config (e.g. error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Write to this file instead of stdout
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[arg(long, short, default_value = "nats_bridge.yaml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run(RunArgs {
        config: PathBuf::from("nats_bridge.yaml"),
        log_level: None,
    })) {
        Commands::Run(args) => run(args).await,
        Commands::Schema(args) => {
            let schema = serde_json::to_string_pretty(&schema_for!(BridgeConfig))?;
            match args.out {
                Some(path) => {
                    fs::write(&path, schema)
                        .with_context(|| format!("could not write {}", path.display()))?;
                    println!("Schema written to {}", path.display());
                }
                None => println!("{schema}"),
            }
            Ok(())
        }
        Commands::Validate(args) => {
            let config = BridgeConfig::load(&args.config)?;
            App::bootstrap(&config, None)?;
            println!(
                "✅ {} is valid: {} input(s), {} output(s)",
                args.config.display(),
                config.inputs.len(),
                config.outputs.len()
            );
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = BridgeConfig::load(&args.config)?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    let _guards = init_tracing(&config.log)?;

    let mut app = App::bootstrap(&config, None)?;
    if app.adapter_count() == 0 {
        bail!("{} defines no inputs or outputs", args.config.display());
    }
    app.start()?;
    info!("nats bridge running; press Ctrl-C to exit");
    println!("nats bridge running; press Ctrl-C to exit");

    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            None
        }
        exited = app.next_exit() => exited,
    };

    let mut failed = false;
    if let Some((name, result)) = early_exit {
        match result {
            Ok(()) => warn!("{name} exited, shutting down the bridge"),
            Err(err) => {
                error!("{name} failed: {err}");
                failed = true;
            }
        }
    }

    println!("\nShutting down…");
    info!("nats bridge shutting down");
    for (name, result) in app.shutdown().await {
        if let Err(err) = result {
            error!("{name} failed: {err}");
            failed = true;
        }
    }

    if failed {
        bail!("one or more adapters failed");
    }
    println!("Goodbye!");
    Ok(())
}
