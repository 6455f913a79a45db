use anyhow::Context;
use clap::{Parser, Subcommand};
use lw_core::{
    Caller, ChainRuleStore, DEFAULT_CONFIG_PATH, DaemonConfig, DirectConfig, Family,
    LockdownPolicy, LockdownWhitelist,
};
use lw_ipt::{IptablesBackend, render_table};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod serve;

#[derive(Parser)]
#[command(name = "lockwall")]
#[command(version, about = "Direct firewall rules with lockdown", long_about = None)]
struct Cli {
    /// Debug logging unless RUST_LOG is set
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON requests on stdin, one per line
    Serve {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Expose Prometheus metrics on 127.0.0.1:<port>
        #[arg(long)]
        metrics_port: Option<u16>,
        /// Record backend calls instead of running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the restore payloads for a direct configuration
    Render {
        #[arg(short, long, default_value = "direct.yaml")]
        file: PathBuf,
    },
    /// Compare a direct configuration with the live tables
    Diff {
        #[arg(short, long, default_value = "direct.yaml")]
        file: PathBuf,
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Run a raw backend command
    Passthrough {
        #[arg(long, default_value = "ipv4")]
        ipv: Family,
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
    /// Check whether a caller would pass the lockdown whitelist
    CheckAccess {
        #[arg(short, long)]
        whitelist: PathBuf,
        #[arg(long)]
        context: Option<String>,
        #[arg(long)]
        uid: Option<u32>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        command: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            config,
            metrics_port,
            dry_run,
        } => {
            tokio::runtime::Runtime::new()?.block_on(async {
                serve::serve(&config, metrics_port, dry_run).await
            })?;
        }
        Commands::Render { file } => render(&file)?,
        Commands::Diff { file, config } => {
            tokio::runtime::Runtime::new()?.block_on(async { diff(&file, &config).await })?;
        }
        Commands::Passthrough { ipv, config, args } => {
            tokio::runtime::Runtime::new()?.block_on(async {
                passthrough(ipv, &config, &args).await
            })?;
        }
        Commands::CheckAccess {
            whitelist,
            context,
            uid,
            user,
            command,
        } => {
            let caller = Caller {
                context,
                uid,
                user,
                command,
            };
            tokio::runtime::Runtime::new()?.block_on(async {
                check_access(&whitelist, &caller).await
            })?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout carries responses
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_store(file: &Path) -> anyhow::Result<ChainRuleStore> {
    let config = DirectConfig::from_file(file)?;
    ChainRuleStore::from_config(&config)
        .with_context(|| format!("Invalid direct configuration {:?}", file))
}

fn render(file: &Path) -> anyhow::Result<()> {
    let store = load_store(file)?;
    if store.is_empty() {
        println!("# {} holds no chains or rules", file.display());
        return Ok(());
    }

    for (key, state) in store.tables() {
        let plan = render_table(key.family, &key.table, state, None);
        println!("# {} {}", key.family, key.table);
        print!("{}", plan.payload);
    }
    Ok(())
}

async fn diff(file: &Path, config: &Path) -> anyhow::Result<()> {
    let store = load_store(file)?;
    let config = DaemonConfig::load_or_default(config)?;
    let backend = IptablesBackend::new(config.backend);

    let mut drifted = 0;
    for (key, state) in store.tables() {
        let diff = backend.diff_table(key.family, &key.table, state).await?;
        if diff.matches {
            println!("✅ {} {}: in sync", diff.family, diff.table);
        } else {
            drifted += 1;
            println!("⚠️  {} {}: live rules differ", diff.family, diff.table);
            if let Some(text) = diff.diff {
                print!("{}", text);
            }
        }
    }

    if drifted > 0 {
        anyhow::bail!("{} table(s) differ from {}", drifted, file.display());
    }
    Ok(())
}

async fn passthrough(ipv: Family, config: &Path, args: &[String]) -> anyhow::Result<()> {
    let config = DaemonConfig::load_or_default(config)?;
    let engine = lw_core::DirectEngine::new(IptablesBackend::new(config.backend));
    let output = engine.passthrough(ipv, args).await?;
    print!("{}", output);
    Ok(())
}

async fn check_access(whitelist: &Path, caller: &Caller) -> anyhow::Result<()> {
    let checks = caller.access_checks();
    if checks.is_empty() {
        anyhow::bail!("Give at least one of --context, --uid, --user or --command");
    }

    let policy = LockdownPolicy::new(Arc::new(LockdownWhitelist::from_file(whitelist)?));
    let mut allowed = false;
    for check in &checks {
        let matched = policy.access_check(check).await;
        println!(
            "{} {}: {}",
            if matched { "✅" } else { "❌" },
            check.key(),
            check_value(check)
        );
        allowed |= matched;
    }

    if allowed {
        println!("allowed under lockdown");
        Ok(())
    } else {
        anyhow::bail!("denied under lockdown")
    }
}

fn check_value(check: &lw_core::AccessCheck) -> String {
    match check {
        lw_core::AccessCheck::Context(v)
        | lw_core::AccessCheck::User(v)
        | lw_core::AccessCheck::Command(v) => v.clone(),
        lw_core::AccessCheck::Uid(uid) => uid.to_string(),
    }
}
