use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use skyrelay_config::{Keyring, SecretsProvider};
use skyrelay_gateway::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use skyrelay_gateway::upstream::{BoundingBox, StatesQuery};
use skyrelay_gateway::Services;

#[derive(Debug, Parser)]
#[command(name = "skyrelay", version, about = "Cached access to airport and flight-state APIs")]
struct Cli {
    /// Path to the configuration file [default: skyrelay.toml]
    #[arg(long, global = true, env = "SKYRELAY_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Look up an airport by IATA or ICAO code
    Airport { code: String },
    /// Current state vectors
    States {
        #[arg(long)]
        icao24: Option<String>,
        /// lamin,lomin,lamax,lomax
        #[arg(long)]
        bbox: Option<BoundingBox>,
    },
    /// Track of one aircraft
    Track {
        icao24: String,
        /// Unix seconds; 0 for the live track
        #[arg(long, default_value_t = 0)]
        time: i64,
    },
    /// Flights that arrived at an airport
    Arrivals {
        airport: String,
        #[arg(long)]
        begin: i64,
        #[arg(long)]
        end: i64,
    },
    /// Flights that departed from an airport
    Departures {
        airport: String,
        #[arg(long)]
        begin: i64,
        #[arg(long)]
        end: i64,
    },
    /// Cache statistics per namespace
    Stats,
    /// Remove cached payloads, e.g. `airport:*`; locks and budgets are kept
    Clear { pattern: Option<String> },
    /// Print the effective configuration with secrets masked
    Config,
    /// Encrypt secrets for the config file
    Secrets {
        #[command(subcommand)]
        command: SecretsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SecretsCommand {
    /// Encrypt a value with SKYRELAY_SECRETS_KEY
    Encrypt { value: String },
    /// Print a new random 256-bit key (hex)
    GenerateKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(
            e,
            dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound
        ) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    // Initialize tracing early with the default level
    skyrelay_gateway::observability::init_tracing_with_level("warn");

    let cli = Cli::parse();

    // Secret tooling needs neither configuration nor a backend.
    if let Command::Secrets { command } = &cli.command {
        return run_secrets(command).await;
    }

    let cfg = match load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(
        path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH),
        "Configuration loaded"
    );
    skyrelay_gateway::observability::apply_logging_level(&cfg.logging.level);

    if let Command::Config = cli.command {
        print!("{}", toml::to_string_pretty(&cfg.redacted())?);
        return Ok(());
    }

    let secrets = SecretsProvider::from_config(&cfg.secrets).context("secrets provider")?;
    let services = Services::initialize(&cfg, secrets)
        .await
        .context("service initialization failed")?;

    let outcome = tokio::select! {
        result = run(&services, cli.command) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted");
            Ok(())
        }
    };

    services.shutdown().await;
    outcome
}

async fn run(services: &Services, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Airport { code } => print_result(services.airports.lookup(&code).await),
        Command::States { icao24, bbox } => {
            print_result(services.flights.states(StatesQuery { icao24, bbox }).await)
        }
        Command::Track { icao24, time } => {
            print_result(services.flights.track(&icao24, time).await)
        }
        Command::Arrivals { airport, begin, end } => {
            print_result(services.flights.arrivals(&airport, begin, end).await)
        }
        Command::Departures { airport, begin, end } => {
            print_result(services.flights.departures(&airport, begin, end).await)
        }
        Command::Stats => print_json(&services.stats().await),
        Command::Clear { pattern } => print_result(
            services
                .clear(pattern.as_deref())
                .await
                .map(|removed| serde_json::json!({ "removed": removed })),
        ),
        Command::Config | Command::Secrets { .. } => Ok(()),
    }
}

async fn run_secrets(command: &SecretsCommand) -> anyhow::Result<()> {
    match command {
        SecretsCommand::GenerateKey => {
            println!("{}", hex::encode(Keyring::generate_key()));
        }
        SecretsCommand::Encrypt { value } => {
            let Some(keyring) = Keyring::from_env()? else {
                bail!("SKYRELAY_SECRETS_KEY is not set");
            };
            println!("{}", keyring.encrypt(value).await?.encode());
        }
    }
    Ok(())
}

fn print_result<T: Serialize>(result: skyrelay_cache::Result<T>) -> anyhow::Result<()> {
    match result {
        Ok(value) => print_json(&value),
        Err(e) => match e.retry_after_seconds() {
            Some(secs) => bail!("{e} (status {}, retry after {secs}s)", e.status_code()),
            None => bail!("{e} (status {})", e.status_code()),
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
