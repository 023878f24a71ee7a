//! portly - port forwarding and filter rules for firewalld, nftables and pf
//!
//! # Usage
//!
//! ```bash
//! portly nat add 8080 10.0.0.5 80              # forward 8080/tcp to 10.0.0.5:80
//! portly nat add 5353 10.0.0.7 53 -p udp --id dns-fwd
//! portly nat remove dns-fwd
//! portly port open 53 -p udp                   # open a port to everyone
//! portly port allow 22 192.0.2.7               # open a port to one source
//! portly port trust 203.0.113.5                # accept everything from a source
//! portly status --active
//! portly backend                               # show which backend would be used
//! ```

use clap::{Args, Parser, Subcommand};
use portly::audit::{AUDIT_FILE_NAME, AuditLog};
use portly::config::{self, Settings};
use portly::core::exec::{OpContext, SystemRunner};
use portly::core::ledger::{Ledger, OsDescriptor};
use portly::platform::{self, OsInfo};
use portly::{Error, FilterRule, NatRule, Protocol, ProviderFactory, Result, RuleManager};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

shadow_rs::shadow!(build);

const LONG_VERSION: &str = shadow_rs::formatcp!(
    "{} ({} {})",
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME
);

#[derive(Parser)]
#[command(name = "portly")]
#[command(about = "Port forwarding and filter rules over the native firewall", long_about = None)]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Upper bound for the whole operation in seconds (default from config)
    #[arg(long, value_name = "SECONDS", global = true)]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Port forwarding (destination NAT) rules
    #[command(subcommand)]
    Nat(NatCommand),
    /// Inbound filter rules
    #[command(subcommand)]
    Port(PortCommand),
    /// Show rules recorded in the ledger
    Status {
        /// Only rules owned by this product
        #[arg(long)]
        product: Option<String>,
        /// Only active rules
        #[arg(long)]
        active: bool,
    },
    /// Drop removed rules from the ledger
    Cleanup,
    /// Show the detected OS and the backend that would be used
    Backend,
    /// Probe a product binary and record its version
    Product {
        name: String,
    },
    /// Inspect or create the config file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum NatCommand {
    /// Forward an external port to an internal address
    Add {
        external_port: u16,
        internal_ip: String,
        internal_port: u16,
        #[arg(short, long, default_value = "tcp", value_parser = parse_protocol)]
        protocol: Protocol,
        #[command(flatten)]
        meta: RuleMeta,
    },
    /// Remove a forwarding rule by ledger or backend ID
    Remove { id: String },
    /// List forwarding rules as the backend reports them
    List,
}

#[derive(Subcommand)]
enum PortCommand {
    /// Open a port to everyone
    Open {
        port: u16,
        #[arg(short, long, default_value = "tcp", value_parser = parse_protocol)]
        protocol: Protocol,
        #[command(flatten)]
        meta: RuleMeta,
    },
    /// Open a port to a single source address
    Allow {
        port: u16,
        source: String,
        #[arg(short, long, default_value = "tcp", value_parser = parse_protocol)]
        protocol: Protocol,
        #[command(flatten)]
        meta: RuleMeta,
    },
    /// Accept all traffic from a source address
    Trust {
        source: String,
        #[command(flatten)]
        meta: RuleMeta,
    },
    /// Remove a filter rule by ledger or backend ID
    Close { id: String },
    /// List filter rules as the backend reports them
    List,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective settings
    Show,
    /// Write the default settings to the config file
    Init,
}

#[derive(Args)]
struct RuleMeta {
    /// Rule ID (generated if omitted)
    #[arg(long)]
    id: Option<String>,
    /// Product that owns the rule
    #[arg(long)]
    product: Option<String>,
    #[arg(long)]
    description: Option<String>,
}

impl RuleMeta {
    fn id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            let uuid = uuid::Uuid::new_v4().simple().to_string();
            format!("portly-{}", &uuid[..8])
        })
    }
}

fn parse_protocol(s: &str) -> std::result::Result<Protocol, String> {
    Protocol::parse(s).map_err(|e| e.to_string())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn report(error: &Error) {
    let translation = error.translate();
    eprintln!("Error: {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  hint: {suggestion}");
    }
    if let Some(url) = &translation.help_url {
        eprintln!("  see: {url}");
    }
}

/// Context bounded by the timeout and cancelled on Ctrl-C.
fn operation_context(timeout: Duration) -> OpContext {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });
    OpContext::with_timeout(timeout).with_token(token)
}

fn factory(settings: &Settings, os: &OsInfo) -> ProviderFactory {
    ProviderFactory::new(settings, os, Arc::new(SystemRunner))
}

async fn open_manager(settings: &Settings, os: &OsInfo) -> Result<RuleManager> {
    let provider = factory(settings, os).select()?;
    let ledger_path = settings.ledger_path().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "State directory not found; set state_file in the config",
        ))
    })?;
    let ledger = Ledger::load(&ledger_path, OsDescriptor::from(os)).await?;
    let audit = AuditLog::at(ledger_path.with_file_name(AUDIT_FILE_NAME));
    Ok(RuleManager::new(provider, ledger).with_audit(audit))
}

async fn run(cli: Cli) -> Result<()> {
    let settings = config::load_config().await;

    if let Commands::Config(command) = &cli.command {
        return run_config(command, &settings).await;
    }

    let os = platform::detect_os();
    let timeout = cli
        .timeout
        .map_or_else(|| settings.command_timeout(), Duration::from_secs);
    let ctx = operation_context(timeout);

    match cli.command {
        Commands::Backend => {
            let factory = factory(&settings, &os);
            println!(
                "OS: {} {} ({})",
                os.distribution, os.version, os.family
            );
            let available = factory.available();
            if available.is_empty() {
                println!("Available backends: none");
            } else {
                let names: Vec<String> = available.iter().map(ToString::to_string).collect();
                println!("Available backends: {}", names.join(", "));
            }
            let selected = factory.select()?;
            println!("Selected: {}", selected.name());
        }
        Commands::Nat(command) => run_nat(command, &settings, &os, &ctx).await?,
        Commands::Port(command) => run_port(command, &settings, &os, &ctx).await?,
        Commands::Status { product, active } => {
            let manager = open_manager(&settings, &os).await?;
            let records = manager.status(product.as_deref(), active);
            if records.is_empty() {
                println!("No rules recorded.");
            }
            for record in records {
                print!("{:<8} {}", record.status.to_string(), record.rule);
                if let Some(error) = &record.error {
                    print!("  ({error})");
                }
                println!();
            }
        }
        Commands::Cleanup => {
            let mut manager = open_manager(&settings, &os).await?;
            let dropped = manager.cleanup().await?;
            println!("Removed {dropped} record(s) from the ledger.");
        }
        Commands::Product { name } => {
            let mut manager = open_manager(&settings, &os).await?;
            let info = manager.record_product(&name).await?;
            if info.is_installed {
                println!("{}: {} ({})", info.name, info.version, info.path);
            } else {
                println!("{}: not installed", info.name);
            }
        }
        Commands::Config(_) => {}
    }
    Ok(())
}

async fn run_nat(command: NatCommand, settings: &Settings, os: &OsInfo, ctx: &OpContext) -> Result<()> {
    let mut manager = open_manager(settings, os).await?;
    match command {
        NatCommand::Add {
            external_port,
            internal_ip,
            internal_port,
            protocol,
            meta,
        } => {
            let mut rule = NatRule::new(meta.id(), external_port, internal_ip, internal_port, protocol);
            if let Some(product) = meta.product {
                rule = rule.with_product(product);
            }
            if let Some(description) = meta.description {
                rule = rule.with_description(description);
            }
            manager.apply_nat(ctx, rule.clone()).await?;
            println!("✓ Added {rule}");
        }
        NatCommand::Remove { id } => {
            manager.remove_nat(ctx, &id).await?;
            println!("✓ Removed {id}");
        }
        NatCommand::List => {
            for rule in manager.list_nat_rules(ctx).await? {
                println!("{rule}");
            }
        }
    }
    Ok(())
}

async fn run_port(command: PortCommand, settings: &Settings, os: &OsInfo, ctx: &OpContext) -> Result<()> {
    let mut manager = open_manager(settings, os).await?;
    let (rule, meta) = match command {
        PortCommand::Open {
            port,
            protocol,
            meta,
        } => (FilterRule::open_port(meta.id(), port, protocol), meta),
        PortCommand::Allow {
            port,
            source,
            protocol,
            meta,
        } => (
            FilterRule::port_restricted(meta.id(), port, protocol, source),
            meta,
        ),
        PortCommand::Trust { source, meta } => (FilterRule::trust_source(meta.id(), source), meta),
        PortCommand::Close { id } => {
            manager.close_port(ctx, &id).await?;
            println!("✓ Removed {id}");
            return Ok(());
        }
        PortCommand::List => {
            for rule in manager.list_filter_rules(ctx).await? {
                println!("{rule}");
            }
            return Ok(());
        }
    };

    let mut rule = rule;
    if let Some(product) = meta.product {
        rule = rule.with_product(product);
    }
    if let Some(description) = meta.description {
        rule = rule.with_description(description);
    }
    manager.apply_filter(ctx, rule.clone()).await?;
    println!("✓ Added {rule}");
    Ok(())
}

async fn run_config(command: &ConfigCommand, settings: &Settings) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if let Some(path) = config::config_path() {
                println!("# {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(settings)?);
        }
        ConfigCommand::Init => {
            let path = config::save_config(&Settings::default()).await?;
            println!("✓ Wrote default config to {}", path.display());
        }
    }
    Ok(())
}
