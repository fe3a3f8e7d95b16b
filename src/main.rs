use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zbus::zvariant::Value;

use buskit::config::BusConfig;
use buskit::demo;
use buskit::dispatch::DispatchTable;
use buskit::registrar::ServiceRegistrar;
use buskit::client::{CallError, RemoteHandle};

#[derive(Parser)]
#[command(name = "buskit")]
#[command(author, version, about = "Declarative D-Bus service and client demo", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Well-known bus name (overrides the config file)
    #[arg(long, global = true)]
    name: Option<String>,

    /// Attach to the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim the bus name, export the demo interface and serve until Ctrl-C
    Serve {
        /// Signal emission period in seconds (overrides the config file)
        #[arg(long)]
        period: Option<u64>,
    },

    /// Call a method on the running service
    Call {
        /// Member name (e.g. "Driver", "Echo")
        member: String,

        /// String arguments passed in order
        args: Vec<String>,
    },

    /// Subscribe to a signal and print broadcasts until Ctrl-C
    Listen {
        /// Signal name
        #[arg(default_value = demo::RECORD_SIGNAL)]
        signal: String,
    },

    /// Check whether the service name currently has an owner
    Status,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("buskit=debug,zbus=info")
    } else {
        EnvFilter::new("buskit=info,zbus=warn")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn effective_config(cli: &Cli) -> anyhow::Result<BusConfig> {
    let mut config = BusConfig::load()?;
    if let Some(name) = &cli.name {
        config.service_name = name.clone();
    }
    if cli.system {
        config.bus = buskit::config::BusKind::System;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::Serve { period } => {
            let mut config = effective_config(&cli)?;
            if let Some(period) = period {
                config.emit_period_secs = *period;
                config.validate()?;
            }
            serve(config).await?;
        }

        Commands::Call { member, args } => {
            let config = effective_config(&cli)?;
            call(config, member, args).await?;
        }

        Commands::Listen { signal } => {
            let config = effective_config(&cli)?;
            listen(config, signal).await?;
        }

        Commands::Status => {
            let config = effective_config(&cli)?;
            status(config).await?;
        }
    }

    Ok(())
}

async fn serve(config: BusConfig) -> anyhow::Result<()> {
    let connection = config
        .connect()
        .await
        .context("could not connect to the bus")?;

    let descriptor = demo::demo_interface(&config.service_name)?;
    let table = DispatchTable::new(config.object_path(), Arc::new(descriptor));
    let mut registrar = ServiceRegistrar::new(&config.service_name, Arc::new(table));

    // Name rejection is fatal: no partial service under a name we do not own.
    registrar.register(connection).await?;

    let mut emitter = registrar.emitter(demo::RECORD_SIGNAL, demo::record_payload())?;
    emitter.start(config.emit_period());
    info!(
        "Broadcasting '{}' every {}s",
        demo::RECORD_SIGNAL,
        config.emit_period_secs
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    emitter.stop();
    registrar.shutdown().await;
    Ok(())
}

async fn call(config: BusConfig, member: &str, args: &[String]) -> anyhow::Result<()> {
    let connection = config
        .connect()
        .await
        .context("could not connect to the bus")?;
    let handle = RemoteHandle::resolve(
        &connection,
        &config.service_name,
        &config.object_path(),
        &config.service_name,
    )
    .await?;

    let args = args
        .iter()
        .map(|arg| Value::from(arg.as_str()).try_to_owned())
        .collect::<Result<Vec<_>, _>>()?;

    match handle.call(member, args).await {
        Ok(output) => {
            for value in &output {
                println!("{}", Value::from(value.clone()));
            }
            Ok(())
        }
        Err(CallError::Remote { name, message }) => {
            anyhow::bail!("service returned {}: {}", name, message)
        }
        Err(err @ CallError::Transport(_)) => Err(err).context("call did not complete"),
    }
}

async fn listen(config: BusConfig, signal: &str) -> anyhow::Result<()> {
    let connection = config
        .connect()
        .await
        .context("could not connect to the bus")?;
    let handle = RemoteHandle::resolve(
        &connection,
        &config.service_name,
        &config.object_path(),
        &config.service_name,
    )
    .await?;

    let name = signal.to_string();
    let subscription = handle
        .subscribe(signal, move |payload| {
            let rendered: Vec<String> = payload
                .iter()
                .map(|value| Value::from(value.clone()).to_string())
                .collect();
            println!("{}: {}", name, rendered.join(", "));
        })
        .await?;

    info!("Listening for '{}' (Ctrl-C to stop)", signal);
    tokio::signal::ctrl_c().await?;
    subscription.unsubscribe();
    Ok(())
}

async fn status(config: BusConfig) -> anyhow::Result<()> {
    let connection = config
        .connect()
        .await
        .context("could not connect to the bus")?;
    match RemoteHandle::resolve(
        &connection,
        &config.service_name,
        &config.object_path(),
        &config.service_name,
    )
    .await
    {
        Ok(_) => println!("{} is running", config.service_name),
        Err(_) => println!("{} is not running", config.service_name),
    }
    Ok(())
}
