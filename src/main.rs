//! agent-sandbox - stateful sandboxed command execution.
//!
//! Usage:
//!   agent-sandbox agent [--port 8080] [--watch chrome=9222]   # In-container agent API
//!   agent-sandbox exec [--session s1] -- <command>           # Run through the selected backend
//!   agent-sandbox check-launch -- <command>                  # Validate a server launch command
//!   agent-sandbox job-exec                                    # Managed-job entry point

use agent_sandbox::config::{BackendKind, SandboxConfig};
use agent_sandbox::http_server::{self, AgentConfig, AgentState};
use agent_sandbox::security::LaunchValidator;
use agent_sandbox::{job_exec, selector};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "agent-sandbox")]
#[command(about = "Stateful sandboxed command execution for agents")]
struct Args {
    /// JSON configuration file
    #[arg(long, env = "SANDBOX_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Backend override: container or managed_job
    #[arg(long, env = "SANDBOX_BACKEND", global = true)]
    backend: Option<BackendKind>,

    /// Address of a running container agent
    #[arg(long, env = "SANDBOX_ADDRESS", global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the in-container agent API
    Agent {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Extra service to report as name=port
        #[arg(long, value_parser = http_server::parse_watch)]
        watch: Vec<(String, u16)>,

        /// Maximum number of open files for executed scripts
        #[arg(long, default_value = "1024")]
        nofile: u64,

        /// Directory for temporary script files
        #[arg(long)]
        scratch_dir: Option<PathBuf>,
    },
    /// Run a command in a session
    Exec {
        #[arg(long, default_value = "default")]
        session: String,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Check a server launch command against the launch policy
    CheckLaunch {
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Execute one managed job described by the environment
    JobExec,
}

fn load_config(args: &Args) -> SandboxConfig {
    let mut config = match SandboxConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(2);
        }
    };
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(address) = &args.address {
        config.container.address = Some(address.clone());
    }
    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match &args.command {
        Commands::Agent {
            port,
            watch,
            nofile,
            scratch_dir,
        } => {
            let config = AgentConfig {
                scratch_dir: scratch_dir.clone().unwrap_or_else(std::env::temp_dir),
                nofile: *nofile,
                watch: watch.clone(),
            };
            if let Err(e) = http_server::run_server(*port, AgentState::new(config)).await {
                error!(error = %e, "Agent stopped");
                exit(1);
            }
        }
        Commands::Exec {
            session,
            timeout,
            json,
            command,
        } => {
            let config = load_config(&args);
            let sandbox = match selector::create_sandbox(config).await {
                Ok(sandbox) => sandbox,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            };
            let ready = sandbox.ensure_ready().await;
            if !ready.success {
                eprintln!("Error: {}", ready.message);
                exit(1);
            }

            let result = sandbox
                .execute(session, &command.join(" "), timeout.map(Duration::from_secs))
                .await;
            if *json {
                match serde_json::to_string_pretty(&result) {
                    Ok(text) => println!("{}", text),
                    Err(e) => eprintln!("Error: {}", e),
                }
            } else {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
            }
            exit(result.exit_code);
        }
        Commands::CheckLaunch { command } => {
            let config = load_config(&args);
            let validator = LaunchValidator::from_config(&config.launch);
            match validator.validate(&command.join(" ")) {
                Ok(validated) => println!("allowed: {} {}", validated.program, validated.args.join(" ")),
                Err(rejection) => {
                    eprintln!("rejected: {}", rejection);
                    exit(1);
                }
            }
        }
        Commands::JobExec => match job_exec::run_from_env().await {
            Ok(record) => exit(record.exit_code.clamp(0, 255)),
            Err(e) => {
                error!(error = %e, "Job execution failed");
                exit(1);
            }
        },
    }
}
