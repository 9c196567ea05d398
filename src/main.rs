use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use playbox::cache::WorkspaceCache;
use playbox::config::Config;
use playbox::sandbox::{build_provider, SandboxRuntimeClient};
use playbox::share::{AlphabetEncoder, InitialContentSource, RestoreOptions, ShareService, SqliteStore};
use playbox::terminal::{TerminalChannel, TerminalSurface};
use playbox::types::{HttpDeclarationRegistry, InMemoryTypeEnvironment, TypeAcquisition};
use playbox::workspace::Workspace;

#[derive(Parser)]
#[command(name = "playbox", about = "Sandboxed code playgrounds: run, share and restore workspaces")]
enum Cli {
    /// Snapshot a directory and print its share handle
    Share {
        dir: PathBuf,
        /// Workspace name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Restore a shared workspace into a directory
    Open {
        /// `#handle`, bare handle, or a URL ending in `#handle`
        handle: String,
        #[arg(long)]
        out: PathBuf,
        /// Only restore these paths (repeatable)
        #[arg(long = "allow")]
        allow: Vec<String>,
    },
    /// Mount a directory in a sandbox and attach this terminal to it
    Run {
        dir: PathBuf,
        /// Startup command; repeat for several shells
        #[arg(long = "shell")]
        shells: Vec<String>,
    },
    /// Fetch type declarations for a directory's dependencies and imports
    Types { dir: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("playbox=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_writer(std::io::stderr)
                .with_targets(true)
                .with_bracketed_fields(false),
        )
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        config.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(config.environment.clone().into()),
            traces_sample_rate: 0.2,
            ..Default::default()
        },
    ));

    match cli {
        Cli::Share { dir, name } => share(&config, &dir, name).await,
        Cli::Open { handle, out, allow } => open(&config, &handle, &out, allow).await,
        Cli::Run { dir, shells } => run(&config, &dir, shells).await,
        Cli::Types { dir } => types(&config, &dir).await,
    }
}

fn load_workspace(dir: &Path, name: Option<String>) -> Result<Workspace> {
    let name = name
        .or_else(|| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "workspace".to_string());
    Workspace::load_dir(name, dir).with_context(|| format!("failed to read {}", dir.display()))
}

fn share_service(config: &Config) -> Result<ShareService> {
    let store = SqliteStore::open(&config.store_path)
        .with_context(|| format!("failed to open share store at {}", config.store_path.display()))?;
    Ok(ShareService::new(
        Arc::new(store),
        Arc::new(AlphabetEncoder::default()),
        config.share_max_attempts,
    ))
}

async fn share(config: &Config, dir: &Path, name: Option<String>) -> Result<()> {
    let workspace = load_workspace(dir, name)?;
    let handle = share_service(config)?
        .share(&workspace, &InitialContentSource)
        .await
        .context("failed to share workspace")?;
    println!("#{handle}");
    Ok(())
}

async fn open(config: &Config, fragment: &str, out: &Path, allow: Vec<String>) -> Result<()> {
    let handle = playbox::share::parse_fragment(fragment).context("empty share handle")?;
    let options = if allow.is_empty() {
        RestoreOptions::default()
    } else {
        RestoreOptions::allow(allow)
    };
    let workspace = share_service(config)?
        .resolve(&handle, &options)
        .await
        .with_context(|| format!("failed to restore #{handle}"))?;

    for entry in workspace.files() {
        let target = out.join(entry.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, &entry.file.content)
            .await
            .with_context(|| format!("failed to write {}", target.display()))?;
    }
    tracing::info!(
        workspace = %workspace.name(),
        files = workspace.paths().len(),
        out = %out.display(),
        "workspace restored"
    );
    Ok(())
}

struct StdoutSurface;

impl TerminalSurface for StdoutSurface {
    fn write(&self, bytes: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }
}

async fn run(config: &Config, dir: &Path, shells: Vec<String>) -> Result<()> {
    let mut workspace = load_workspace(dir, None)?;
    if !shells.is_empty() {
        workspace = workspace.with_shells(shells);
    }

    let client = Arc::new(SandboxRuntimeClient::new(build_provider(config.sandbox())));
    let cache = WorkspaceCache::new(client, config.cache());
    let lease = cache.get(&workspace).await.context("failed to mount workspace")?;
    let terminal = TerminalChannel::attach(&lease, &workspace, Arc::new(StdoutSurface), config.terminal())
        .await
        .context("failed to attach terminal")?;

    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            read = stdin.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = terminal.send_input(&buf[..n]).await {
                        tracing::warn!(error = %e, "shell input failed");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "stdin read failed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    terminal.dispose().await;
    drop(lease);
    cache.shutdown().await;
    Ok(())
}

async fn types(config: &Config, dir: &Path) -> Result<()> {
    let workspace = load_workspace(dir, None)?;
    let http_client = Arc::new(
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?,
    );
    let environment = Arc::new(InMemoryTypeEnvironment::default());
    let acquisition = TypeAcquisition::new(
        Arc::new(HttpDeclarationRegistry::new(http_client, config.registry_url.clone())),
        environment.clone(),
    );

    acquisition.acquire_dependencies(&workspace.dependencies()).await;
    for entry in workspace.files() {
        acquisition.acquire_for_source(&entry.file.content).await;
    }

    for (path, code) in environment.libs() {
        println!("{path} ({} bytes)", code.len());
    }
    Ok(())
}
