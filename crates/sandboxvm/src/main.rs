use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, error, info, warn};
use tokio::net::TcpListener;

use sandboxvm::api::{self, AppState};
use sandboxvm::config::{
    APP_NAME, AppConfig, AppPaths, load_or_init_config, write_default_config,
};
use sandboxvm::db::Database;
use sandboxvm::runtime::{BackendKind, build_runtime};
use sandboxvm::session::{
    NoopSessionStore, Reaper, SessionService, SessionStore, SqliteSessionStore,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_reconcile(ctx: RuntimeContext) -> Result<()> {
    handle_reconcile(&ctx).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Reconcile => async_reconcile(ctx),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sandboxvm - ephemeral sandbox session manager.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON (logs and command output)
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve(ServeCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Reconcile checkpointed sessions with the runtime once and exit
    Reconcile,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
    /// Runtime backend: container or local (overrides runtime.backend)
    #[arg(long)]
    backend: Option<BackendKind>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Error);
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.effective_log_level() >= LevelFilter::Debug),
                )
                .try_init()
                .ok();
        }

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            return LevelFilter::Error;
        }
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match (self.common.verbose, self.config.logging.level.as_str()) {
                (0, "error") => LevelFilter::Error,
                (0, "warn") => LevelFilter::Warn,
                (0, "debug") => LevelFilter::Debug,
                (0, "trace") => LevelFilter::Trace,
                (0, _) => LevelFilter::Info,
                (1, _) => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    // load_or_init_config already wrote the defaults on first run.
    if ctx.paths.config_file.exists() && cmd.force {
        write_default_config(&ctx.paths.config_file)?;
    }
    println!("{}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

/// Build the session service from configuration.
async fn build_service(ctx: &RuntimeContext, config: &AppConfig) -> Result<Arc<SessionService>> {
    config.validate().context("invalid configuration")?;

    let runtime = build_runtime(&config.runtime).context("initializing runtime backend")?;
    match runtime.health_check().await {
        Ok(version) => debug!("runtime backend {} is available: {}", config.runtime.backend, version.trim()),
        Err(e) => warn!("runtime backend {} health check failed: {}", config.runtime.backend, e),
    }

    let store: Arc<dyn SessionStore> = if config.checkpoint.enabled {
        let path = ctx.paths.checkpoint_path(config)?;
        info!("Checkpointing sessions to {}", path.display());
        let db = Database::new(&path).await?;
        Arc::new(SqliteSessionStore::new(&db))
    } else {
        Arc::new(NoopSessionStore)
    };

    Ok(Arc::new(SessionService::new(config, runtime, store)))
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(host) = cmd.host {
        config.server.host = host;
    }
    if let Some(port) = cmd.port {
        config.server.port = port;
    }
    if let Some(backend) = cmd.backend {
        config.runtime.backend = backend;
    }

    if config.runtime.backend == BackendKind::Local {
        warn!("Local runtime backend in use: sandboxes are NOT isolated from the host");
    }

    let service = build_service(ctx, &config).await?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;

    // Connections queue in the backlog until serve() starts accepting.
    let reaper = Reaper::new(Arc::clone(&service)).start().await;

    let state = AppState::new(Arc::clone(&service))
        .with_trust_forwarded_for(config.server.trust_forwarded_for);
    let app = api::create_router(state);

    info!("Listening on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running server")?;

    reaper.shutdown().await;

    if config.server.drain_on_shutdown {
        let stopped = service.drain().await;
        info!("Stopped {} session(s)", stopped);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn handle_reconcile(ctx: &RuntimeContext) -> Result<()> {
    let service = build_service(ctx, &ctx.config).await?;
    let report = service
        .reconcile_on_startup()
        .await
        .map_err(|e| anyhow!("reconciliation failed: {}", e))?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing report to JSON")?
        );
    } else if ctx.common.yaml {
        println!(
            "{}",
            serde_yaml::to_string(&report).context("serializing report to YAML")?
        );
    } else {
        println!(
            "restored: {}, sessions destroyed: {}, orphans destroyed: {}, failed: {}",
            report.restored, report.sessions_destroyed, report.orphans_destroyed, report.failed
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
