//! devorch CLI

mod config;
mod roster;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::FileConfig;
use devorch_core::database::Database;
use devorch_core::repo_controller::{RepoController, WorkflowRegistry};
use devorch_core::stateful_entity::NoopMirror;
use devorch_github::auth::{AppCredentials, InstallationAuth};
use devorch_github::client::GitHubClient;
use devorch_sandbox::{SandboxClient, SandboxClientConfig};
use devorch_web::AppState;
use roster::StaticAgentRoster;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("devorch={level}")));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 1)
        .with_file(verbose >= 2)
        .with_line_number(verbose >= 2);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "devorch")]
#[command(about = "Autonomous software-development orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to an optional TOML config file layered under defaults.
    #[arg(long, env = "DEVORCH_CONFIG", default_value = "~/.devorch/config.toml")]
    config: String,

    /// SQLite database path.
    #[arg(long, env = "DEVORCH_DB_PATH", default_value = "~/.devorch/devorch.db")]
    db_path: String,

    /// GitHub repo, e.g. "owner/repo".
    #[arg(long, env = "DEVORCH_REPO")]
    repo: Option<String>,

    /// GitHub App ID.
    #[arg(long, env = "DEVORCH_GITHUB_APP_ID")]
    github_app_id: Option<String>,

    /// Path to the GitHub App private key PEM.
    #[arg(long, env = "DEVORCH_GITHUB_PRIVATE_KEY_PATH")]
    github_private_key_path: Option<String>,

    /// GitHub App installation ID.
    #[arg(long, env = "DEVORCH_GITHUB_INSTALLATION_ID")]
    github_installation_id: Option<i64>,

    /// Sandbox RPC base URL.
    #[arg(long, env = "DEVORCH_SANDBOX_BASE_URL")]
    sandbox_base_url: Option<String>,

    /// Sandbox bearer credential.
    #[arg(long, env = "DEVORCH_SANDBOX_CREDENTIAL")]
    sandbox_credential: Option<String>,

    /// Path to the static agent roster TOML file.
    #[arg(long, env = "DEVORCH_ROSTER_PATH", default_value = "~/.devorch/roster.toml")]
    roster_path: String,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the axum HTTP server (webhooks + per-entity surfaces + /ws).
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Import a backlog JSON-lines file and reconcile against the store.
    Import {
        /// Path to a `.beads/issues.jsonl`-shaped file.
        path: PathBuf,
    },
    /// Print the current backlog export (JSON-lines).
    Export,
    /// List issues.
    List {
        #[arg(long)]
        ready: bool,
        #[arg(long)]
        blocked: bool,
    },
    /// Show a single issue by id.
    Show { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_json)?;

    let config_path = PathBuf::from(shellexpand::tilde(&cli.config).to_string());
    let file_config = FileConfig::load(&config_path)?;

    let db_path = shellexpand::tilde(
        file_config.db_path.as_deref().unwrap_or(&cli.db_path),
    )
    .to_string();
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let db = Database::new(&db_path).await.context("opening database")?;

    let repo_full_name = cli.repo.clone().context("--repo (or DEVORCH_REPO) is required")?;
    let roster_path = PathBuf::from(shellexpand::tilde(&cli.roster_path).to_string());
    let roster: Arc<dyn devorch_core::ports::AgentRoster> = Arc::new(StaticAgentRoster::load(&roster_path)?);

    let host = build_host_client(&cli, &file_config)?;
    let sandbox = build_sandbox_client(&cli, &file_config)?;
    let workflows = Arc::new(WorkflowRegistry::new());
    let repo_controller = Arc::new(RepoController::new(db.clone(), host.clone(), repo_full_name, workflows));

    match cli.command {
        Commands::Serve { bind } => {
            let bind_addr = file_config.bind_addr.unwrap_or(bind);
            let state = Arc::new(AppState::new(
                db,
                repo_controller,
                host,
                sandbox,
                roster,
                Arc::new(NoopMirror),
                None,
            ));
            let app = devorch_web::create_router(state);
            info!(bind_addr, "starting devorch web server");
            let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
            axum::serve(listener, app).await?;
        }
        Commands::Import { path } => {
            let jsonl = std::fs::read_to_string(&path).context("reading backlog file")?;
            let result = repo_controller.import_from_backlog(&jsonl).await?;
            println!(
                "created: {}, updated: {}, deleted: {}",
                result.created.len(),
                result.updated.len(),
                result.deleted.len()
            );
        }
        Commands::Export => {
            print!("{}", repo_controller.export_backlog().await?);
        }
        Commands::List { ready, blocked } => {
            let issues = if ready {
                repo_controller.list_ready().await?
            } else if blocked {
                repo_controller.list_blocked().await?
            } else {
                repo_controller.list().await?
            };
            for issue in issues {
                println!("{}\t{}\t{}", issue.id, issue.status, issue.title);
            }
        }
        Commands::Show { id } => match repo_controller.get(&id).await? {
            Some(issue) => println!("{}", serde_json::to_string_pretty(&issue)?),
            None => println!("not found: {id}"),
        },
    }

    Ok(())
}

fn build_host_client(cli: &Cli, file_config: &FileConfig) -> Result<Arc<dyn devorch_core::ports::HostApi>> {
    let app_id = cli
        .github_app_id
        .clone()
        .or_else(|| file_config.github_app_id.clone())
        .context("github app id is required to reach the host API")?;
    let key_path = cli
        .github_private_key_path
        .clone()
        .or_else(|| file_config.github_private_key_path.clone())
        .context("github private key path is required")?;
    let installation_id = cli.github_installation_id.context("github installation id is required")?;

    let pem = std::fs::read_to_string(shellexpand::tilde(&key_path).to_string())
        .context("reading github app private key")?;
    let credentials = AppCredentials::new(app_id, &pem)?;
    let auth = Arc::new(InstallationAuth::new(credentials, installation_id));
    Ok(Arc::new(GitHubClient::new(auth)))
}

fn build_sandbox_client(cli: &Cli, file_config: &FileConfig) -> Result<Arc<dyn devorch_core::ports::SandboxRpc>> {
    let base_url = cli
        .sandbox_base_url
        .clone()
        .or_else(|| file_config.sandbox_base_url.clone())
        .unwrap_or_else(|| "http://localhost:8787".to_string());
    let credential = cli.sandbox_credential.clone().unwrap_or_default();
    let client = SandboxClient::with_config(credential, SandboxClientConfig { base_url, ..Default::default() });
    Ok(Arc::new(client))
}
