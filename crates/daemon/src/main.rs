//! svnbridge daemon entry point.
//!
//! Loads configuration, opens the configured repositories, and runs the
//! svn:// TCP accept loop: one task per connection, each driving the
//! session engine from greeting through command loop to disconnect.

mod signals;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use svnbridge_core::acl::{AclOracle, PathPrefixAclOracle};
use svnbridge_core::config::AppConfig;
use svnbridge_core::identity::IdentityMapper;
use svnbridge_core::repo::RepositoryRegistry;
use svnbridge_core::session::auth::Authenticator;
use svnbridge_core::session::Session;

/// svnbridge daemon: serves a Git repository over the svn:// wire protocol.
#[derive(Parser, Debug)]
#[command(
    name = "svnbridged",
    version,
    about = "Serve Git repositories over the native svn:// protocol"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;
    config
        .validate()
        .context("configuration validation failed")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    info!("========================================");
    info!("  svnbridge daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Listen        : {}", config.daemon.listen);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Auth mode     : {:?}", config.auth.mode);
    info!(
        "Repositories  : {}",
        config
            .repositories
            .iter()
            .map(|r| r.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    info!("Log level     : {}", log_level);
    info!("========================================");

    let registry =
        Arc::new(RepositoryRegistry::open_all(&config).context("failed to open repositories")?);
    let identity = Arc::new(
        IdentityMapper::new(&config.identity).context("failed to initialize identity mapper")?,
    );
    let authenticator = Arc::new(
        Authenticator::new(&config.auth).context("failed to initialize authenticator")?,
    );
    // No per-path ACL rule file is wired in yet (see config.rs / acl::AclRule) --
    // the default oracle allows open read and gates write/admin to any
    // authenticated user, same as svnserve's no-authz-file behavior.
    let acl: Arc<dyn AclOracle> = Arc::new(PathPrefixAclOracle::open_read());

    let listener = TcpListener::bind(&config.daemon.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.daemon.listen))?;
    info!(addr = %config.daemon.listen, "listening for svn:// connections");

    let config = Arc::new(config);
    let mut shutdown = std::pin::pin!(signals::wait_for_shutdown());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                if let Err(e) = socket.set_nodelay(true) {
                    warn!(error = %e, "failed to set TCP_NODELAY");
                }

                let registry = registry.clone();
                let identity = identity.clone();
                let acl = acl.clone();
                let authenticator = authenticator.clone();
                let config = config.clone();

                tokio::spawn(async move {
                    info!(%peer, "connection accepted");
                    let (read_half, write_half) = socket.into_split();
                    let session = Session::new(
                        read_half,
                        write_half,
                        registry,
                        identity,
                        acl,
                        authenticator,
                        &config.daemon,
                    );
                    match session.run().await {
                        Ok(()) => info!(%peer, "connection closed"),
                        Err(e) => error!(%peer, error = %e, "session ended with error"),
                    }
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, no longer accepting new connections");
                break;
            }
        }
    }

    info!("svnbridge daemon stopped.");
    Ok(())
}
