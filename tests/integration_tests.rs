//! Integration tests for portly
//!
//! These tests drive the full stack (rule manager, ledger, audit log and a real backend
//! driver) against in-memory simulations of `firewall-cmd` and `nft`, and against pf anchor
//! files in a temporary directory. No privileges or native tools are required.
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use async_trait::async_trait;
use portly::audit::{AuditLog, EventType};
use portly::config::{FirewalldSettings, NftablesSettings, PfSettings};
use portly::core::error::ConflictKind;
use portly::core::exec::{CommandOutput, CommandRunner, OpContext};
use portly::core::ledger::{Ledger, OsDescriptor, RuleStatus};
use portly::drivers::firewalld::FirewalldDriver;
use portly::drivers::nftables::NftablesDriver;
use portly::drivers::pf::PfDriver;
use portly::platform::{OsFamily, OsInfo};
use portly::validators;
use portly::{Error, FilterKind, FilterRule, NatRule, Protocol, Provider, RuleManager};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn answer_no() -> CommandOutput {
    CommandOutput {
        stdout: "no\n".to_string(),
        stderr: String::new(),
        exit_code: Some(1),
        success: false,
    }
}

fn no_such_file() -> CommandOutput {
    CommandOutput::failed(1, "Error: No such file or directory")
}

// ═══════════════════════════════════════════════════════════════════════════
// firewall-cmd simulation
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct FwState {
    rich_rules: Vec<String>,
    ports: Vec<String>,
    masquerade: bool,
}

/// Keeps one zone's permanent configuration in memory; `--reload` is a no-op.
#[derive(Default)]
struct FirewallCmdSim {
    state: Mutex<FwState>,
    calls: Mutex<Vec<String>>,
}

impl FirewallCmdSim {
    fn calls_containing(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn add_once(list: &mut Vec<String>, value: String) -> CommandOutput {
    if list.contains(&value) {
        CommandOutput::ok("Warning: ALREADY_ENABLED")
    } else {
        list.push(value);
        CommandOutput::ok("success")
    }
}

fn remove_if_present(list: &mut Vec<String>, value: &str) -> CommandOutput {
    match list.iter().position(|v| v == value) {
        Some(index) => {
            list.remove(index);
            CommandOutput::ok("success")
        }
        None => CommandOutput::ok("Warning: NOT_ENABLED"),
    }
}

#[async_trait]
impl CommandRunner for FirewallCmdSim {
    async fn run(
        &self,
        _ctx: &OpContext,
        program: &str,
        args: &[String],
    ) -> portly::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));

        if program == "sysctl" {
            return Ok(CommandOutput::ok("1\n"));
        }

        let mut action = None;
        let mut value = None;
        let mut iter = args.iter().map(String::as_str);
        while let Some(arg) = iter.next() {
            match arg {
                "--permanent" => {}
                "--zone" => {
                    iter.next();
                }
                a if action.is_none() => action = Some(a),
                a => value = Some(a.to_string()),
            }
        }

        let mut state = self.state.lock().unwrap();
        let value = value.unwrap_or_default();
        let output = match action {
            Some("--list-rich-rules") => CommandOutput::ok(state.rich_rules.join("\n")),
            Some("--list-ports") => CommandOutput::ok(state.ports.join(" ")),
            Some("--get-default-zone") => CommandOutput::ok("public\n"),
            Some("--query-masquerade") if state.masquerade => CommandOutput::ok("yes\n"),
            Some("--query-masquerade") => answer_no(),
            Some("--add-masquerade") => {
                state.masquerade = true;
                CommandOutput::ok("success")
            }
            Some("--query-port") if state.ports.contains(&value) => CommandOutput::ok("yes\n"),
            Some("--query-port") => answer_no(),
            Some("--add-rich-rule") => add_once(&mut state.rich_rules, value),
            Some("--remove-rich-rule") => remove_if_present(&mut state.rich_rules, &value),
            Some("--add-port") => add_once(&mut state.ports, value),
            Some("--remove-port") => remove_if_present(&mut state.ports, &value),
            Some("--reload") => CommandOutput::ok("success"),
            _ => CommandOutput::failed(2, "usage: see firewall-cmd --help"),
        };
        Ok(output)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// nft simulation
// ═══════════════════════════════════════════════════════════════════════════

struct SimChain {
    name: String,
    spec: String,
    rules: Vec<(u64, String)>,
}

struct SimTable {
    name: String,
    chains: Vec<SimChain>,
}

/// Tables in the `inet` family with kernel-style handles.
struct NftSim {
    tables: Mutex<Vec<SimTable>>,
    next_handle: Mutex<u64>,
    /// Extra ruleset text owned by someone else (e.g. a container runtime)
    foreign: String,
    calls: Mutex<Vec<String>>,
}

impl NftSim {
    fn new() -> Self {
        Self::with_foreign("")
    }

    fn with_foreign(foreign: &str) -> Self {
        Self {
            tables: Mutex::new(Vec::new()),
            next_handle: Mutex::new(2),
            foreign: foreign.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls_containing(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    fn render_table(table: &SimTable, annotate: bool) -> String {
        let mut out = format!("table inet {} {{\n", table.name);
        for chain in &table.chains {
            if annotate {
                out.push_str(&format!("\tchain {} {{ # handle 1\n", chain.name));
            } else {
                out.push_str(&format!("\tchain {} {{\n", chain.name));
            }
            out.push_str(&format!("\t\t{}\n", chain.spec));
            for (handle, statement) in &chain.rules {
                if annotate {
                    out.push_str(&format!("\t\t{statement} # handle {handle}\n"));
                } else {
                    out.push_str(&format!("\t\t{statement}\n"));
                }
            }
            out.push_str("\t}\n");
        }
        out.push_str("}\n");
        out
    }

    fn handle(&self, args: &[&str]) -> CommandOutput {
        let mut tables = self.tables.lock().unwrap();
        match args {
            ["add", "table", "inet", name] => {
                if !tables.iter().any(|t| t.name == *name) {
                    tables.push(SimTable {
                        name: (*name).to_string(),
                        chains: Vec::new(),
                    });
                }
                CommandOutput::ok("")
            }
            ["add", "chain", "inet", table, chain, spec @ ..] => {
                let Some(table) = tables.iter_mut().find(|t| t.name == *table) else {
                    return no_such_file();
                };
                if !table.chains.iter().any(|c| c.name == *chain) {
                    let spec = spec.join(" ");
                    table.chains.push(SimChain {
                        name: (*chain).to_string(),
                        spec: spec.trim_matches(|c: char| c == '{' || c == '}' || c == ' ').to_string(),
                        rules: Vec::new(),
                    });
                }
                CommandOutput::ok("")
            }
            ["add", "rule", "inet", table, chain, statement @ ..] => {
                let Some(chain) = tables
                    .iter_mut()
                    .find(|t| t.name == *table)
                    .and_then(|t| t.chains.iter_mut().find(|c| c.name == *chain))
                else {
                    return no_such_file();
                };
                let mut next = self.next_handle.lock().unwrap();
                chain.rules.push((*next, statement.join(" ")));
                *next += 1;
                CommandOutput::ok("")
            }
            ["-a", "list", "chain", "inet", table, chain] => {
                match tables.iter().find(|t| t.name == *table) {
                    Some(t) if t.chains.iter().any(|c| c.name == *chain) => {
                        let only = SimTable {
                            name: t.name.clone(),
                            chains: t
                                .chains
                                .iter()
                                .filter(|c| c.name == *chain)
                                .map(|c| SimChain {
                                    name: c.name.clone(),
                                    spec: c.spec.clone(),
                                    rules: c.rules.clone(),
                                })
                                .collect(),
                        };
                        CommandOutput::ok(Self::render_table(&only, true))
                    }
                    _ => no_such_file(),
                }
            }
            ["list", "table", "inet", table] => match tables.iter().find(|t| t.name == *table) {
                Some(t) => CommandOutput::ok(Self::render_table(t, false)),
                None => no_such_file(),
            },
            ["list", "ruleset"] => {
                let mut out: String = tables.iter().map(|t| Self::render_table(t, false)).collect();
                out.push_str(&self.foreign);
                CommandOutput::ok(out)
            }
            ["delete", "rule", "inet", table, chain, "handle", handle] => {
                let handle: u64 = handle.parse().unwrap_or_default();
                let Some(chain) = tables
                    .iter_mut()
                    .find(|t| t.name == *table)
                    .and_then(|t| t.chains.iter_mut().find(|c| c.name == *chain))
                else {
                    return no_such_file();
                };
                match chain.rules.iter().position(|(h, _)| *h == handle) {
                    Some(index) => {
                        chain.rules.remove(index);
                        CommandOutput::ok("")
                    }
                    None => no_such_file(),
                }
            }
            _ => CommandOutput::failed(1, "Error: syntax error, unexpected junk"),
        }
    }
}

#[async_trait]
impl CommandRunner for NftSim {
    async fn run(
        &self,
        _ctx: &OpContext,
        program: &str,
        args: &[String],
    ) -> portly::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));

        if program == "sysctl" {
            return Ok(CommandOutput::ok("1\n"));
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(self.handle(&args))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// pfctl stand-in (pf state itself lives in the anchor files)
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct PfctlSim {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for PfctlSim {
    async fn run(
        &self,
        _ctx: &OpContext,
        program: &str,
        args: &[String],
    ) -> portly::Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(match (program, args.as_slice()) {
            ("sysctl", _) => CommandOutput::ok("1\n"),
            (_, ["-s", "info"]) => CommandOutput::ok("Status: Enabled for 0 days 01:00:00\n"),
            _ => CommandOutput::ok(""),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

fn ctx() -> OpContext {
    OpContext::with_timeout(Duration::from_secs(10))
}

async fn manager_with(provider: Box<dyn Provider>, dir: &Path) -> RuleManager {
    let ledger = Ledger::load(dir.join("state.json"), OsDescriptor::default())
        .await
        .unwrap();
    RuleManager::new(provider, ledger).with_audit(AuditLog::at(dir.join("audit.log")))
}

fn firewalld(sim: &Arc<FirewallCmdSim>) -> Box<dyn Provider> {
    Box::new(FirewalldDriver::new(
        Arc::clone(sim) as Arc<dyn CommandRunner>,
        OsInfo::of_family(OsFamily::Rhel),
        FirewalldSettings::default(),
    ))
}

fn nftables(sim: &Arc<NftSim>, dir: &Path) -> Box<dyn Provider> {
    Box::new(NftablesDriver::new(
        Arc::clone(sim) as Arc<dyn CommandRunner>,
        OsInfo::of_family(OsFamily::Debian),
        NftablesSettings {
            fragment_path: dir.join("nftables.d/portly.conf"),
            main_config: dir.join("nftables.conf"),
            ..NftablesSettings::default()
        },
    ))
}

fn pf(sim: &Arc<PfctlSim>, dir: &Path) -> Box<dyn Provider> {
    Box::new(
        PfDriver::new(
            Arc::clone(sim) as Arc<dyn CommandRunner>,
            OsInfo::of_family(OsFamily::Darwin),
            PfSettings {
                pfctl: "pfctl".to_string(),
                pf_conf: dir.join("pf.conf"),
                anchor_dir: dir.join("anchors"),
                ..PfSettings::default()
            },
        )
        .with_root_check(|| true),
    )
}

/// Map 8080/tcp, reject a second mapping of the same port, then remove it again.
async fn nat_lifecycle(mgr: &mut RuleManager) {
    let ctx = ctx();
    let web = NatRule::new("web", 8080, "10.0.0.5", 80, Protocol::Tcp).with_product("nginx");

    mgr.apply_nat(&ctx, web.clone()).await.unwrap();
    let listed = mgr.list_nat_rules(&ctx).await.unwrap();
    assert_eq!(listed.len(), 1, "listed: {listed:?}");
    assert!(listed[0].same_mapping(&web));
    assert_eq!(mgr.ledger().get("web").unwrap().status, RuleStatus::Active);

    let err = mgr
        .apply_nat(
            &ctx,
            NatRule::new("web-2", 8080, "10.0.0.6", 8080, Protocol::Tcp),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::Conflict {
                port: 8080,
                protocol: Protocol::Tcp,
                kind: ConflictKind::Mapped { .. }
            }
        ),
        "unexpected error: {err:?}"
    );
    assert_eq!(mgr.ledger().get("web-2").unwrap().status, RuleStatus::Failed);

    // Same port over the other protocol does not conflict
    mgr.apply_nat(
        &ctx,
        NatRule::new("web-udp", 8080, "10.0.0.5", 80, Protocol::Udp),
    )
    .await
    .unwrap();

    mgr.remove(&ctx, "web").await.unwrap();
    let listed = mgr.list_nat_rules(&ctx).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].protocol, Protocol::Udp);
    assert_eq!(mgr.ledger().get("web").unwrap().status, RuleStatus::Removed);

    assert!(matches!(
        mgr.remove(&ctx, "no-such-rule").await,
        Err(Error::NotFound(id)) if id == "no-such-rule"
    ));
}

/// Open 53/udp twice, trust a source, then close the port.
async fn filter_lifecycle(mgr: &mut RuleManager) {
    let ctx = ctx();

    mgr.apply_filter(&ctx, FilterRule::open_port("dns", 53, Protocol::Udp))
        .await
        .unwrap();
    mgr.apply_filter(&ctx, FilterRule::open_port("dns-again", 53, Protocol::Udp))
        .await
        .unwrap();

    let open: Vec<FilterRule> = mgr
        .list_filter_rules(&ctx)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.kind == FilterKind::OpenPort)
        .collect();
    assert_eq!(open.len(), 1, "duplicate open port: {open:?}");
    assert_eq!(open[0].port, Some(53));
    assert_eq!(open[0].protocol, Some(Protocol::Udp));

    mgr.apply_filter(&ctx, FilterRule::trust_source("office", "203.0.113.5"))
        .await
        .unwrap();
    let trusted: Vec<FilterRule> = mgr
        .list_filter_rules(&ctx)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.kind == FilterKind::TrustSource)
        .collect();
    assert_eq!(trusted.len(), 1);
    assert_eq!(trusted[0].source.as_deref(), Some("203.0.113.5"));
    assert_eq!(trusted[0].port, None);
    assert_eq!(trusted[0].protocol, None);

    mgr.apply_filter(
        &ctx,
        FilterRule::port_restricted("ssh", 22, Protocol::Tcp, "192.0.2.7"),
    )
    .await
    .unwrap();

    // dns-again still relies on the single native open port
    mgr.remove(&ctx, "dns").await.unwrap();
    let remaining = mgr.list_filter_rules(&ctx).await.unwrap();
    assert_eq!(remaining.len(), 3);
    assert!(remaining.iter().any(|r| r.kind == FilterKind::OpenPort && r.port == Some(53)));
    assert_eq!(mgr.ledger().get("dns").unwrap().status, RuleStatus::Removed);
    assert_eq!(mgr.ledger().get("dns-again").unwrap().status, RuleStatus::Active);

    mgr.remove(&ctx, "dns-again").await.unwrap();
    let remaining = mgr.list_filter_rules(&ctx).await.unwrap();
    assert!(remaining.iter().all(|r| r.kind != FilterKind::OpenPort));
    assert_eq!(remaining.len(), 2);
    assert_eq!(mgr.ledger().get("dns-again").unwrap().status, RuleStatus::Removed);
}

// ═══════════════════════════════════════════════════════════════════════════
// firewalld
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_firewalld_nat_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(FirewallCmdSim::default());
    let mut mgr = manager_with(firewalld(&sim), dir.path()).await;

    nat_lifecycle(&mut mgr).await;

    // Masquerade is only enabled once
    assert_eq!(sim.calls_containing("--add-masquerade"), 1);
    assert!(sim.state.lock().unwrap().masquerade);
}

#[tokio::test]
async fn test_firewalld_filter_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(FirewallCmdSim::default());
    let mut mgr = manager_with(firewalld(&sim), dir.path()).await;

    filter_lifecycle(&mut mgr).await;

    assert_eq!(sim.calls_containing("--add-port 53/udp"), 1);
}

#[tokio::test]
async fn test_firewalld_port_opened_outside_portly_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(FirewallCmdSim::default());
    sim.state.lock().unwrap().ports.push("443/tcp".to_string());
    let mut mgr = manager_with(firewalld(&sim), dir.path()).await;

    let err = mgr
        .apply_nat(&ctx(), NatRule::new("https", 443, "10.0.0.5", 8443, Protocol::Tcp))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Conflict { kind: ConflictKind::OpenExternally, .. }
    ));
    assert_eq!(sim.calls_containing("--add-rich-rule"), 0);
}

#[tokio::test]
async fn test_validation_rejects_before_any_command() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(FirewallCmdSim::default());
    let mut mgr = manager_with(firewalld(&sim), dir.path()).await;
    let ctx = ctx();

    assert!(matches!(
        mgr.apply_nat(&ctx, NatRule::new("zero", 0, "10.0.0.5", 80, Protocol::Tcp))
            .await,
        Err(Error::Validation { field, .. }) if field == "external_port"
    ));
    assert!(matches!(
        mgr.apply_nat(&ctx, NatRule::new("bad-ip", 8080, "not-an-ip", 80, Protocol::Tcp))
            .await,
        Err(Error::Validation { field, .. }) if field == "internal_ip"
    ));
    assert!(matches!(
        mgr.apply_filter(&ctx, FilterRule::trust_source("bad-src", "not-an-ip"))
            .await,
        Err(Error::Validation { .. })
    ));
    assert!(validators::parse_port("65536").is_err());
    assert!(validators::parse_port("0").is_err());
    assert!(matches!(
        Protocol::parse("icmp"),
        Err(Error::Validation { field, .. }) if field == "protocol"
    ));

    assert_eq!(sim.call_count(), 0);
    assert!(mgr.ledger().records().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// nftables
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_nftables_nat_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(NftSim::new());
    let mut mgr = manager_with(nftables(&sim, dir.path()), dir.path()).await;

    nat_lifecycle(&mut mgr).await;

    // The fragment mirrors the live tables and is included from the main config
    let fragment = std::fs::read_to_string(dir.path().join("nftables.d/portly.conf")).unwrap();
    assert!(fragment.contains("udp dport 8080 dnat ip to 10.0.0.5:80"));
    assert!(!fragment.contains("tcp dport 8080"));
    let main = std::fs::read_to_string(dir.path().join("nftables.conf")).unwrap();
    assert_eq!(main.matches("include").count(), 1);
}

#[tokio::test]
async fn test_nftables_filter_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(NftSim::new());
    let mut mgr = manager_with(nftables(&sim, dir.path()), dir.path()).await;

    filter_lifecycle(&mut mgr).await;

    assert_eq!(sim.calls_containing("udp dport 53 accept"), 1);
}

#[tokio::test]
async fn test_nftables_shared_open_port_outlives_first_record() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(NftSim::new());
    let mut mgr = manager_with(nftables(&sim, dir.path()), dir.path()).await;
    let ctx = ctx();

    mgr.apply_filter(&ctx, FilterRule::open_port("a", 8443, Protocol::Tcp))
        .await
        .unwrap();
    mgr.apply_filter(&ctx, FilterRule::open_port("b", 8443, Protocol::Tcp))
        .await
        .unwrap();

    mgr.remove(&ctx, "a").await.unwrap();
    let listed = mgr.list_filter_rules(&ctx).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].port, Some(8443));
    assert_eq!(mgr.ledger().get("b").unwrap().status, RuleStatus::Active);
    assert_eq!(sim.calls_containing("delete rule"), 0);

    mgr.remove(&ctx, "b").await.unwrap();
    assert!(mgr.list_filter_rules(&ctx).await.unwrap().is_empty());
    assert_eq!(mgr.ledger().get("b").unwrap().status, RuleStatus::Removed);

    // Every ledger record agrees with the backend again
    assert!(mgr.status(None, true).is_empty());
}

#[tokio::test]
async fn test_family_scoped_removal_leaves_other_family_alone() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(NftSim::new());
    let mut mgr = manager_with(nftables(&sim, dir.path()), dir.path()).await;
    let ctx = ctx();

    mgr.apply_nat(&ctx, NatRule::new("web", 8080, "10.0.0.5", 80, Protocol::Tcp))
        .await
        .unwrap();

    assert!(matches!(
        mgr.close_port(&ctx, "web").await,
        Err(Error::Validation { field, .. }) if field == "id"
    ));
    assert_eq!(mgr.list_nat_rules(&ctx).await.unwrap().len(), 1);
    assert_eq!(mgr.ledger().get("web").unwrap().status, RuleStatus::Active);

    mgr.remove_nat(&ctx, "web").await.unwrap();
    assert!(mgr.list_nat_rules(&ctx).await.unwrap().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn test_nftables_main_config_keeps_its_mode() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("nftables.conf");
    std::fs::write(&main, "#!/usr/sbin/nft -f\n").unwrap();
    std::fs::set_permissions(&main, std::fs::Permissions::from_mode(0o640)).unwrap();

    let sim = Arc::new(NftSim::new());
    let mut mgr = manager_with(nftables(&sim, dir.path()), dir.path()).await;
    mgr.apply_filter(&ctx(), FilterRule::open_port("dns", 53, Protocol::Udp))
        .await
        .unwrap();

    let contents = std::fs::read_to_string(&main).unwrap();
    assert!(contents.contains("include"));
    let mode = std::fs::metadata(&main).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o640);
}

#[tokio::test]
async fn test_nftables_rule_ids_survive_listing() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(NftSim::new());
    let mut mgr = manager_with(nftables(&sim, dir.path()), dir.path()).await;
    let ctx = ctx();

    mgr.apply_nat(&ctx, NatRule::new("game", 27015, "10.0.0.9", 27015, Protocol::Udp))
        .await
        .unwrap();
    let listed = mgr.list_nat_rules(&ctx).await.unwrap();
    assert_eq!(listed[0].id, "game");

    // Removing by backend ID works without going through the ledger record
    mgr.provider().remove_nat(&ctx, "game").await.unwrap();
    assert!(mgr.list_nat_rules(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_nftables_foreign_dnat_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(NftSim::with_foreign(
        "table ip docker {\n\tchain PREROUTING {\n\t\ttcp dport 8443 dnat to 172.17.0.2:443\n\t}\n}\n",
    ));
    let mut mgr = manager_with(nftables(&sim, dir.path()), dir.path()).await;

    let err = mgr
        .apply_nat(&ctx(), NatRule::new("https", 8443, "10.0.0.5", 443, Protocol::Tcp))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Conflict { kind: ConflictKind::OpenExternally, .. }
    ));
    assert_eq!(sim.calls_containing("add rule"), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// pf
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_pf_nat_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(PfctlSim::default());
    let mut mgr = manager_with(pf(&sim, dir.path()), dir.path()).await;

    nat_lifecycle(&mut mgr).await;

    let conf = std::fs::read_to_string(dir.path().join("pf.conf")).unwrap();
    assert_eq!(conf.matches("rdr-anchor \"com.portly.nat\"").count(), 1);
    assert_eq!(conf.matches("load anchor \"com.portly.nat\"").count(), 1);
}

#[tokio::test]
async fn test_pf_filter_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(PfctlSim::default());
    let mut mgr = manager_with(pf(&sim, dir.path()), dir.path()).await;

    filter_lifecycle(&mut mgr).await;

    let anchor = std::fs::read_to_string(dir.path().join("anchors/com.portly.rules")).unwrap();
    assert!(anchor.contains("# ID: office"));
    assert!(anchor.contains("# Type: port_restricted"));
    assert!(!anchor.contains("# ID: dns"));
}

// ═══════════════════════════════════════════════════════════════════════════
// Ledger and audit
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_ledger_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(FirewallCmdSim::default());
    {
        let mut mgr = manager_with(firewalld(&sim), dir.path()).await;
        mgr.apply_nat(
            &ctx(),
            NatRule::new("web", 8080, "10.0.0.5", 80, Protocol::Tcp).with_product("nginx"),
        )
        .await
        .unwrap();
    }

    let ledger = Ledger::load(dir.path().join("state.json"), OsDescriptor::default())
        .await
        .unwrap();
    let records = ledger.by_product("nginx");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RuleStatus::Active);
    assert!(dir.path().join("state.json.sha256").exists());

    let events = AuditLog::at(dir.path().join("audit.log"))
        .read_recent(10)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::ApplyNat);
    assert_eq!(events[0].backend, "firewalld");
    assert!(events[0].success);
}

#[tokio::test]
async fn test_cleanup_drops_removed_records() {
    let dir = tempfile::tempdir().unwrap();
    let sim = Arc::new(NftSim::new());
    let mut mgr = manager_with(nftables(&sim, dir.path()), dir.path()).await;
    let ctx = ctx();

    mgr.apply_filter(&ctx, FilterRule::open_port("http", 80, Protocol::Tcp))
        .await
        .unwrap();
    mgr.apply_filter(&ctx, FilterRule::open_port("https", 443, Protocol::Tcp))
        .await
        .unwrap();
    mgr.remove(&ctx, "http").await.unwrap();

    assert_eq!(mgr.status(None, true).len(), 1);
    assert_eq!(mgr.cleanup().await.unwrap(), 1);
    assert!(mgr.ledger().get("http").is_none());
    assert_eq!(mgr.ledger().get("https").unwrap().status, RuleStatus::Active);
}
