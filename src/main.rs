use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use vault_agent::agent::build_client;
use vault_agent::config::VaultConfig;
use vault_agent::generate::generate_config;
use vault_agent::logging::LoggingBuilder;
use vault_agent::{Agent, AgentError, Config};

const APPLICATION: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "vault-agent", version, about = "Keeps a Vault token fresh and delivers it where it is needed")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the agent
    Run {
        /// Path to the JSON5 configuration file
        #[arg(short, long, env = "VAULT_AGENT_CONFIG")]
        config: PathBuf,

        /// Address of the secret service, overriding config and VAULT_ADDR
        #[arg(long)]
        address: Option<String>,

        /// Log level when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Print an exec configuration built from existing KV secrets
    GenerateConfig {
        /// Secret paths; a trailing `/*` includes everything below
        #[arg(short, long = "path", required = true)]
        paths: Vec<String>,

        /// Command the generated config runs
        #[arg(long, num_args = 1.., required = true, allow_hyphen_values = true)]
        exec: Vec<String>,

        #[arg(long, env = "VAULT_ADDR")]
        address: Option<String>,
    },
    /// Print the version
    Version,
}

async fn shutdown_signal(cancel: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}

async fn run(config_path: PathBuf, address: Option<String>, log_level: Option<String>) -> Result<(), AgentError> {
    let mut config = Config::load(&config_path)?;
    config.apply_env(|name| std::env::var(name).ok());
    if let Some(address) = address {
        config.vault.address = Some(address);
    }
    config.validate()?;

    let level = log_level.or_else(|| config.log_level.clone()).unwrap_or_default();
    let _guard = LoggingBuilder::new(APPLICATION, VERSION)
        .level(level)
        .json_from_env()
        .format(config.log_format.as_deref())
        .init()
        .map_err(|e| AgentError::Config(e.to_string()))?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    Agent::new(config).run(cancel).await
}

async fn generate(paths: Vec<String>, exec: Vec<String>, address: Option<String>) -> Result<(), AgentError> {
    let _guard = LoggingBuilder::new(APPLICATION, VERSION)
        .level("warn")
        .json_from_env()
        .init()
        .map_err(|e| AgentError::Config(e.to_string()))?;

    let mut vault = VaultConfig {
        address,
        ..Default::default()
    };
    vault.namespace = std::env::var("VAULT_NAMESPACE").ok().filter(|ns| !ns.is_empty());
    let mut client = build_client(&vault)?;
    if client.token().is_none() {
        if let Some(token) = std::env::var("HOME")
            .ok()
            .and_then(|home| std::fs::read_to_string(PathBuf::from(home).join(".vault-token")).ok())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
        {
            client.set_token(token);
        }
    }

    let rendered = generate_config(&client, &paths, &exec).await?;
    print!("{}", rendered);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Version => {
            println!("{} v{}", APPLICATION, VERSION);
            Ok(())
        }
        Command::Run {
            config,
            address,
            log_level,
        } => run(config, address, log_level).await,
        Command::GenerateConfig { paths, exec, address } => generate(paths, exec, address).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.exit_code();
            if !matches!(e, AgentError::ProcessExit { .. }) {
                eprintln!("vault-agent: {}", e);
            }
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
