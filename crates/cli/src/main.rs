//! svnbridge admin CLI.
//!
//! A side channel onto a running (or stopped) svnbridge deployment: inspect
//! the revision index, administer locks, scaffold a configuration file, and
//! run a health check over the same collaborators the daemon opens at
//! startup. Talks directly to the on-disk repositories and SQLite state --
//! it does not speak to `svnbridged` over the network.

mod style;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing_subscriber::EnvFilter;

use svnbridge_core::config::AppConfig;
use svnbridge_core::identity::IdentityMapper;
use svnbridge_core::repo::{Repository, RepositoryRegistry};

#[derive(Parser, Debug)]
#[command(
    name = "svnbridge-admin",
    version,
    about = "Inspect and administer a svnbridge deployment"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/svnbridge/config.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./svnbridge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Inspect configured repositories.
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },

    /// Inspect the revision index.
    Log {
        /// Repository name.
        #[arg(short, long)]
        repo: String,

        /// Only show revisions touching this path.
        #[arg(short, long)]
        path: Option<String>,

        /// Maximum number of entries.
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Show a single revision in full.
    Show {
        /// Repository name.
        #[arg(short, long)]
        repo: String,

        /// Revision number.
        rev: u64,
    },

    /// Manage the path lock table.
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },

    /// Test mapping an SVN user to a Git identity.
    Identity {
        /// SVN username to look up.
        svn_user: String,
    },

    /// Run a health check against every configured collaborator.
    Doctor,
}

#[derive(Subcommand, Debug)]
enum RepoAction {
    /// List configured repositories and their revision-index watermark.
    List,
}

#[derive(Subcommand, Debug)]
enum LocksAction {
    /// List active locks.
    List {
        /// Repository name.
        #[arg(short, long)]
        repo: String,

        /// Only show locks under this path prefix.
        #[arg(short, long, default_value = "/")]
        path_prefix: String,
    },
    /// Forcibly release a lock regardless of owner or token.
    Break {
        /// Repository name.
        #[arg(short, long)]
        repo: String,

        /// Locked path.
        path: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn"))
        .with_target(false)
        .without_time()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Identity { svn_user } => cmd_identity(&cli.config, &svn_user),
        Commands::Doctor => cmd_doctor(&cli.config),
        Commands::Repo { action } => cmd_repo(&cli.config, action),
        Commands::Log { repo, path, limit } => cmd_log(&cli.config, &repo, path, limit),
        Commands::Show { repo, rev } => cmd_show(&cli.config, &repo, rev),
        Commands::Locks { action } => cmd_locks(&cli.config, action),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &PathBuf) -> Result<AppConfig> {
    let mut config =
        AppConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    config.validate().context("configuration validation failed")?;
    Ok(config)
}

fn open_repo(config: &AppConfig, name: &str) -> Result<std::sync::Arc<Repository>> {
    let registry = RepositoryRegistry::open_all(config).context("failed to open repositories")?;
    registry
        .get(name)
        .with_context(|| format!("repository '{}' is not configured", name))
}

// ---------------------------------------------------------------------------
// init / validate
// ---------------------------------------------------------------------------

fn cmd_init(output: &PathBuf) -> Result<()> {
    let default_config = r#"# svnbridge configuration
# See DESIGN.md / SPEC_FULL.md for the full field reference.

[daemon]
listen = "0.0.0.0:3690"
log_level = "info"
data_dir = "/var/lib/svnbridge"
idle_timeout_secs = 60
editor_timeout_secs = 600
max_rebase_retries = 3

[[repositories]]
name = "main"
git_path = "/srv/git/main.git"
tracked_ref = "refs/heads/master"

[auth]
mode = "simple"
password_file = "/etc/svnbridge/passwd"
allow_anonymous_read = true

[identity]
mapping_file = "/etc/svnbridge/authors.toml"
email_domain = "example.com"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Point [[repositories]] at a real Git repository");
    println!("  2. Create the password file referenced by auth.password_file (bcrypt hashes,");
    println!("     one 'user:hash' per line -- see svnbridge-core's session::auth tests)");
    println!(
        "  3. Validate with: svnbridge-admin validate --config {}",
        output.display()
    );
    println!(
        "  4. Start the daemon: svnbridged --config {}",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    let _ = config.resolve_env_vars();
    println!("  [OK] Environment variable references processed");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Listen        : {}", config.daemon.listen);
    println!("  Data directory: {}", config.daemon.data_dir.display());
    println!("  Auth mode     : {:?}", config.auth.mode);
    println!("  Repositories  :");
    for repo in &config.repositories {
        println!(
            "    - {} -> {} (ref {})",
            repo.name,
            repo.git_path.display(),
            repo.tracked_ref
        );
    }
    println!();
    println!("Configuration is valid.");

    Ok(())
}

// ---------------------------------------------------------------------------
// repo / log / show
// ---------------------------------------------------------------------------

fn cmd_repo(config_path: &PathBuf, action: RepoAction) -> Result<()> {
    let config = load_config(config_path)?;
    match action {
        RepoAction::List => {
            let registry =
                RepositoryRegistry::open_all(&config).context("failed to open repositories")?;

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["NAME", "UUID", "LATEST REV", "TRACKED REF"]);

            let mut names: Vec<&str> = registry.names().collect();
            names.sort();
            for name in names {
                let repo = registry.get(name)?;
                let latest = repo.revindex().latest().unwrap_or(0);
                let tracked_ref = config
                    .repository(name)
                    .map(|r| r.tracked_ref.as_str())
                    .unwrap_or("?");
                table.add_row(vec![
                    repo.name().to_string(),
                    repo.uuid().to_string(),
                    latest.to_string(),
                    tracked_ref.to_string(),
                ]);
            }

            println!("{table}");
            Ok(())
        }
    }
}

fn cmd_log(config_path: &PathBuf, repo_name: &str, path: Option<String>, limit: u32) -> Result<()> {
    let config = load_config(config_path)?;
    let repo = open_repo(&config, repo_name)?;

    let paths = path.into_iter().collect::<Vec<_>>();
    let latest = repo.revindex().latest().context("failed to read latest revision")?;
    // `log` returns strictly increasing revision order; take the newest
    // `limit` of them and reverse so the table reads most-recent-first,
    // the way `svn log`/`git log` present by default.
    let mut entries = repo
        .revindex()
        .log(&paths, 1, latest, u32::MAX)
        .context("failed to read revision log")?;

    if entries.is_empty() {
        println!("No revisions found.");
        return Ok(());
    }

    if limit > 0 && (entries.len() as u32) > limit {
        entries.drain(..entries.len() - limit as usize);
    }
    entries.reverse();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["REV", "AUTHOR", "DATE", "MESSAGE"]);
    for entry in &entries {
        table.add_row(vec![
            entry.rev.to_string(),
            entry.author.clone(),
            entry.date.to_rfc3339(),
            truncate(&entry.message, 60),
        ]);
    }
    println!("{table}");
    println!();
    println!("{} revision(s) shown (latest: r{})", entries.len(), latest);

    Ok(())
}

fn cmd_show(config_path: &PathBuf, repo_name: &str, rev: u64) -> Result<()> {
    let config = load_config(config_path)?;
    let repo = open_repo(&config, repo_name)?;

    let meta = repo
        .revindex()
        .lookup_by_rev(rev)
        .with_context(|| format!("revision {} not found", rev))?;

    println!("Revision: {}", meta.rev);
    println!("=========={}", "=".repeat(meta.rev.to_string().len()));
    println!();
    println!("  Author  : {}", meta.author);
    println!("  Date    : {}", meta.date.to_rfc3339());
    println!(
        "  Commit  : {}",
        meta.commit_sha.as_deref().unwrap_or("(synthetic root)")
    );
    println!("  Message : {}", meta.message);

    let changed = repo
        .revindex()
        .changed_paths(rev)
        .context("failed to read changed paths")?;
    if !changed.is_empty() {
        println!();
        println!("  Changed paths:");
        for c in &changed {
            let extra = match (&c.copy_from_path, c.copy_from_rev) {
                (Some(p), Some(r)) => format!(" (from {} r{})", p, r),
                _ => String::new(),
            };
            println!("    {:?}  {}{}", c.action, c.path, extra);
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// locks
// ---------------------------------------------------------------------------

fn cmd_locks(config_path: &PathBuf, action: LocksAction) -> Result<()> {
    let config = load_config(config_path)?;
    match action {
        LocksAction::List { repo, path_prefix } => {
            let repo = open_repo(&config, &repo)?;
            let locks = repo
                .list_locks(&path_prefix)
                .context("failed to list locks")?;

            if locks.is_empty() {
                println!("No active locks under '{}'.", path_prefix);
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["PATH", "OWNER", "CREATED", "COMMENT"]);
            for lock in &locks {
                table.add_row(vec![
                    lock.path.clone(),
                    lock.owner.clone(),
                    lock.created_at.to_rfc3339(),
                    lock.comment.clone().unwrap_or_default(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        LocksAction::Break { repo, path } => {
            let repo = open_repo(&config, &repo)?;
            repo.unlock(&path, "", "$admin", true)
                .context("failed to break lock")?;
            println!("{}", style::success(&format!("Lock on '{}' released", path)));
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// identity
// ---------------------------------------------------------------------------

fn cmd_identity(config_path: &PathBuf, svn_user: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let mapper =
        IdentityMapper::new(&config.identity).context("failed to initialize identity mapper")?;

    match mapper.svn_to_git(svn_user) {
        Ok(identity) => {
            println!("SVN user : {}", svn_user);
            println!("Git name : {}", identity.name);
            println!("Git email: {}", identity.email);
        }
        Err(e) => {
            println!("No mapping found for SVN user '{}': {}", svn_user, e);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// doctor
// ---------------------------------------------------------------------------

fn cmd_doctor(config_path: &PathBuf) -> Result<()> {
    println!();
    println!("{}", style::header("svnbridge doctor"));
    println!("{}", "=".repeat(16));
    println!();

    let mut issues = Vec::new();

    let config = match AppConfig::load_from_file(config_path) {
        Ok(mut c) => {
            let _ = c.resolve_env_vars();
            match c.validate() {
                Ok(()) => println!("  {}", style::success("Configuration      Valid")),
                Err(e) => {
                    println!("  {}", style::error(&format!("Configuration      {}", e)));
                    issues.push("Fix configuration errors".to_string());
                }
            }
            c
        }
        Err(e) => {
            println!("  {}", style::error(&format!("Configuration      {}", e)));
            println!();
            println!("  {} 1 issue(s) found. Cannot continue without a valid config.", console::style("!").yellow().bold());
            return Ok(());
        }
    };

    if config.daemon.data_dir.exists() {
        println!(
            "  {}",
            style::success(&format!("Data directory     {}", config.daemon.data_dir.display()))
        );
    } else {
        println!(
            "  {}",
            style::warn(&format!(
                "Data directory     {} (missing, created on first run)",
                config.daemon.data_dir.display()
            ))
        );
    }

    for repo_cfg in &config.repositories {
        if !repo_cfg.git_path.exists() {
            println!(
                "  {}",
                style::error(&format!(
                    "Repository '{}'    git_path {} does not exist",
                    repo_cfg.name,
                    repo_cfg.git_path.display()
                ))
            );
            issues.push(format!("Create or fix git_path for repository '{}'", repo_cfg.name));
            continue;
        }

        match Repository::open(repo_cfg, &config.daemon.data_dir) {
            Ok(repo) => {
                let latest = repo.revindex().latest().unwrap_or(0);
                println!(
                    "  {}",
                    style::success(&format!(
                        "Repository '{}'    OK (uuid {}, latest r{})",
                        repo_cfg.name,
                        repo.uuid(),
                        latest
                    ))
                );
            }
            Err(e) => {
                println!(
                    "  {}",
                    style::error(&format!("Repository '{}'    {}", repo_cfg.name, e))
                );
                issues.push(format!("Repository '{}' failed to open: {}", repo_cfg.name, e));
            }
        }
    }

    match &config.auth.mode {
        svnbridge_core::config::AuthMode::Simple => match &config.auth.password_file {
            Some(path) if path.exists() => {
                println!("  {}", style::success(&format!("Password file      {}", path.display())));
            }
            Some(path) => {
                println!("  {}", style::error(&format!("Password file      {} (missing)", path.display())));
                issues.push("Create the configured password file".to_string());
            }
            None => unreachable!("validate() requires password_file for simple auth"),
        },
        svnbridge_core::config::AuthMode::Ldap => {
            println!("  {}", style::dim("Password file      n/a (ldap auth mode)"));
        }
        svnbridge_core::config::AuthMode::Anonymous => {
            println!("  {}", style::dim("Password file      n/a (anonymous auth mode)"));
        }
    }

    if let Some(path) = &config.identity.mapping_file {
        if path.exists() {
            println!("  {}", style::success(&format!("Identity mapping   {}", path.display())));
        } else {
            println!("  {}", style::warn(&format!("Identity mapping   {} (missing, fallback rules apply)", path.display())));
        }
    } else {
        println!("  {}", style::dim("Identity mapping   not configured (fallback rules apply)"));
    }

    println!();
    if issues.is_empty() {
        println!("  {} All checks passed!", console::style("✓").green().bold());
    } else {
        println!(
            "  {} {} issue(s) found:",
            console::style("!").yellow().bold(),
            issues.len()
        );
        for (i, issue) in issues.iter().enumerate() {
            println!("    {}. {}", i + 1, issue);
        }
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Utilities
// ---------------------------------------------------------------------------

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let cut = max_len.saturating_sub(3);
    let boundary = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= cut)
        .last()
        .unwrap_or(0);
    format!("{}...", &s[..boundary])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_short_string_unchanged() {
        assert_eq!(truncate("hello", 60), "hello");
    }

    #[test]
    fn test_truncate_long_ascii_string() {
        let s = "a".repeat(80);
        let out = truncate(&s, 60);
        assert_eq!(out.len(), 60);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn test_truncate_does_not_split_multibyte_char() {
        // Every "a" is multi-byte (2 bytes), so a byte-index cut landing
        // mid-character must back off to the previous char boundary.
        let s = "a".repeat(40).replace('a', "\u{e9}");
        truncate(&s, 57);
    }
}
