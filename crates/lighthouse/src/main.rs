//! `lh`: operate a Lighthouse coordination core instance.
//!
//! Thin wrapper over `lighthouse-core`; all behavior lives in the library.
//!
//! Exit codes: 0 clean shutdown, 10 config error, 20 storage recovery
//! failure, 30 integrity violation detected at startup, 40 authentication
//! secret unavailable.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use lighthouse_core::config::CoreConfig;
use lighthouse_core::error::Error;
use lighthouse_core::expert::NullExpertClient;
use lighthouse_core::identity::Role;
use lighthouse_core::logging::{LogConfig, LogFormat, init_logging};
use lighthouse_core::speed::pattern::NullClassifier;
use lighthouse_core::CoreService;

#[derive(Parser)]
#[command(name = "lh", about = "Lighthouse coordination core", version)]
struct Cli {
    /// Path to lighthouse.toml.
    #[arg(long, global = true, default_value = "lighthouse.toml")]
    config: PathBuf,

    /// Emit JSON log lines instead of pretty output.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the core and keep it running until interrupted.
    Serve,
    /// Validate the configuration and exit.
    Check,
    /// Verify the integrity chain across the whole log.
    VerifyLog,
    /// Append an explicit bootstrap event creating an agent identity.
    Bootstrap {
        #[arg(long)]
        agent: String,
        /// guest | agent | expert | system_admin
        #[arg(long, default_value = "agent")]
        role: String,
        #[arg(long)]
        credential: String,
        /// Expert capability tags.
        #[arg(long)]
        capability: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: "info".to_string(),
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
    };
    if let Err(err) = init_logging(&log_config) {
        eprintln!("error: {err}");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Error> {
    let config = CoreConfig::load_from(&cli.config)?;

    if matches!(cli.command, Command::Check) {
        // Config parsed, validated, and the secret is present.
        config.auth_secret()?;
        println!("config ok: {}", cli.config.display());
        return Ok(ExitCode::SUCCESS);
    }

    let service = CoreService::open(
        config,
        Arc::new(NullExpertClient),
        Arc::new(NullClassifier),
    )
    .await?;

    match cli.command {
        Command::Check => unreachable!("handled before opening the store"),
        Command::Serve => {
            let (head, tag) = service.store().head().await;
            tracing::info!(head, tag = %tag, "serving; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            Ok(ExitCode::SUCCESS)
        }
        Command::VerifyLog => {
            if service.verify_log().await? {
                let (head, _) = service.store().head().await;
                println!("chain verified through sequence {head}");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("integrity violation detected");
                Ok(ExitCode::from(30))
            }
        }
        Command::Bootstrap {
            agent,
            role,
            credential,
            capability,
        } => {
            let role = Role::parse(&role).ok_or_else(|| {
                Error::Config(lighthouse_core::error::ConfigError::Validation(format!(
                    "unknown role `{role}`"
                )))
            })?;
            let receipt = service
                .bootstrap_agent(&agent, role, &credential, capability)
                .await?;
            println!(
                "bootstrapped `{agent}` as {role} at sequence {}",
                receipt.sequence
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
