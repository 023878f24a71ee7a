//! Firewall backend drivers
//!
//! Every backend implements [`Provider`]. Exactly one provider is active per process; the
//! [`ProviderFactory`] probes the candidates in order (firewalld, nftables, pf) and returns
//! the first whose [`Provider::is_available`] succeeds.
//!
//! All mutating operations follow the same sequence:
//!
//! 1. validate the rule
//! 2. re-list native state and reject conflicts (or skip identical filter rules)
//! 3. run prerequisite steps, the native mutation, and the activation step
//!
//! The steps are not transactional. A prerequisite that succeeded (IP forwarding,
//! masquerade, PF enabled) stays in effect if the rule add that follows fails.
//!
//! Each driver keeps its native text grammar in a pure `codec` module that is unit-tested
//! against captured tool output.

pub mod firewalld;
pub mod nftables;
pub mod pf;

use crate::config::Settings;
use crate::core::error::{ConflictKind, Error, Result};
use crate::core::exec::{Classifier, CommandRunner, OpContext, Outcome, exit_status};
use crate::core::rule::{FilterKind, FilterRule, NatRule, Protocol, RuleKey};
use crate::platform::{OsFamily, OsInfo};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identifies a backend
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    Firewalld,
    Nftables,
    Pf,
}

impl BackendKind {
    /// OS family on which the backend is offered.
    pub const fn os_family(self) -> OsFamily {
        match self {
            BackendKind::Firewalld => OsFamily::Rhel,
            BackendKind::Nftables => OsFamily::Debian,
            BackendKind::Pf => OsFamily::Darwin,
        }
    }
}

/// Backend-neutral contract implemented by every driver
///
/// All async operations are bounded by the [`OpContext`]; when it expires the spawned
/// process is killed and the call returns [`Error::Cancelled`].
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> BackendKind;

    /// OS family match plus presence of the native control utility.
    fn is_available(&self) -> bool;

    /// Adds a port forwarding rule after a conflict check.
    async fn apply_nat(&self, ctx: &OpContext, rule: &NatRule) -> Result<()>;

    /// Removes the NAT rule with the given backend ID.
    async fn remove_nat(&self, ctx: &OpContext, id: &str) -> Result<()>;

    /// Decodes the backend's current NAT rules.
    async fn list_nat_rules(&self, ctx: &OpContext) -> Result<Vec<NatRule>>;

    /// Fails with [`Error::Conflict`] if `port`/`protocol` is already mapped or open.
    async fn check_conflict(&self, ctx: &OpContext, port: u16, protocol: Protocol) -> Result<()>;

    async fn open_port(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()>;

    async fn open_port_for_source(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()>;

    async fn trust_source(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()>;

    /// Removes the filter rule with the given backend ID.
    async fn close_port(&self, ctx: &OpContext, id: &str) -> Result<()>;

    /// Decodes the backend's current filter rules.
    async fn list_filter_rules(&self, ctx: &OpContext) -> Result<Vec<FilterRule>>;

    /// Dispatches a filter rule to the operation matching its kind.
    async fn apply_filter(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()> {
        match rule.kind {
            FilterKind::OpenPort => self.open_port(ctx, rule).await,
            FilterKind::PortRestricted => self.open_port_for_source(ctx, rule).await,
            FilterKind::TrustSource => self.trust_source(ctx, rule).await,
        }
    }
}

/// Selects the single active provider
pub struct ProviderFactory {
    candidates: Vec<Box<dyn Provider>>,
}

impl ProviderFactory {
    /// Builds the three drivers from `settings`.
    ///
    /// When the settings force a backend, only that driver is a candidate and it is told
    /// the OS belongs to the backend's family, so only its binary probe remains.
    pub fn new(settings: &Settings, os: &OsInfo, runner: Arc<dyn CommandRunner>) -> Self {
        let forced = settings.backend.forced();
        let os_for = |kind: BackendKind| match forced {
            Some(_) => OsInfo {
                family: kind.os_family(),
                ..os.clone()
            },
            None => os.clone(),
        };

        let mut candidates: Vec<Box<dyn Provider>> = vec![
            Box::new(firewalld::FirewalldDriver::new(
                Arc::clone(&runner),
                os_for(BackendKind::Firewalld),
                settings.firewalld.clone(),
            )),
            Box::new(nftables::NftablesDriver::new(
                Arc::clone(&runner),
                os_for(BackendKind::Nftables),
                settings.nftables.clone(),
            )),
            Box::new(pf::PfDriver::new(
                runner,
                os_for(BackendKind::Pf),
                settings.pf.clone(),
            )),
        ];

        if let Some(kind) = forced {
            candidates.retain(|p| p.kind() == kind);
        }

        Self { candidates }
    }

    /// A factory over explicit candidates, probed in order.
    pub fn with_candidates(candidates: Vec<Box<dyn Provider>>) -> Self {
        Self { candidates }
    }

    /// Names of all candidates whose probe succeeds.
    pub fn available(&self) -> Vec<BackendKind> {
        self.candidates
            .iter()
            .filter(|p| p.is_available())
            .map(|p| p.kind())
            .collect()
    }

    /// Returns the first available provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendUnavailable`] if no candidate's probe succeeds.
    pub fn select(self) -> Result<Box<dyn Provider>> {
        let tried: Vec<&'static str> = self.candidates.iter().map(|p| p.name()).collect();

        for provider in self.candidates {
            if provider.is_available() {
                info!("Using {} backend", provider.name());
                return Ok(provider);
            }
            debug!("{} backend not available", provider.name());
        }

        Err(Error::BackendUnavailable(format!(
            "none of [{}] is usable on this host",
            tried.join(", ")
        )))
    }
}

/// Runs one native command and classifies its output.
///
/// `Outcome::Failure` becomes [`Error::ExternalTool`] with the captured diagnostics; every
/// other outcome is returned for the caller to interpret.
pub(crate) async fn invoke(
    runner: &dyn CommandRunner,
    ctx: &OpContext,
    program: &str,
    args: &[String],
    classify: Classifier,
) -> Result<Outcome> {
    let output = runner.run(ctx, program, args).await?;
    let outcome = classify(&output);
    debug!("{program} {} -> {outcome:?}", args.join(" "));

    if outcome == Outcome::Failure {
        let message = output.combined();
        warn!("{program} failed: {message}");
        return Err(Error::ExternalTool {
            program: program.to_string(),
            message: if message.is_empty() {
                format!("exited with {:?}", output.exit_code)
            } else {
                message
            },
            exit_code: output.exit_code,
        });
    }
    Ok(outcome)
}

/// Enables kernel IP forwarding for the target's address family if it is off.
///
/// Idempotent; left enabled even if the rule that needed it fails to apply.
pub(crate) async fn ensure_ip_forwarding(
    runner: &dyn CommandRunner,
    ctx: &OpContext,
    ipv6: bool,
) -> Result<()> {
    let key = if ipv6 {
        "net.ipv6.conf.all.forwarding"
    } else {
        "net.ipv4.ip_forward"
    };
    ensure_sysctl_on(runner, ctx, key).await
}

/// Sets a boolean sysctl to 1 unless it already is.
pub(crate) async fn ensure_sysctl_on(
    runner: &dyn CommandRunner,
    ctx: &OpContext,
    key: &str,
) -> Result<()> {
    let current = runner
        .run(ctx, "sysctl", &["-n".to_string(), key.to_string()])
        .await?;
    if current.success && current.stdout.trim() == "1" {
        return Ok(());
    }

    info!("Enabling {key}");
    invoke(
        runner,
        ctx,
        "sysctl",
        &["-w".to_string(), format!("{key}=1")],
        exit_status,
    )
    .await?;
    Ok(())
}

/// Fails with a `Mapped` conflict if any rule already forwards `port`/`protocol`.
pub(crate) fn conflict_in(rules: &[NatRule], port: u16, protocol: Protocol) -> Result<()> {
    match rules
        .iter()
        .find(|r| r.external_port == port && r.protocol == protocol)
    {
        Some(existing) => Err(Error::Conflict {
            port,
            protocol,
            kind: ConflictKind::Mapped {
                rule_id: existing.id.clone(),
            },
        }),
        None => Ok(()),
    }
}

/// True if a rule with the same semantic identity is already listed.
pub(crate) fn already_present(rules: &[FilterRule], key: &RuleKey) -> bool {
    rules.iter().any(|r| &r.key() == key)
}

/// Validates `rule` and checks it is of the kind the operation handles.
pub(crate) fn validate_filter(rule: &FilterRule, expected: FilterKind) -> Result<()> {
    if rule.kind != expected {
        return Err(Error::Validation {
            field: "kind".to_string(),
            message: format!("expected a {expected} rule, got {}", rule.kind),
        });
    }
    rule.validate()
}

/// Keeps the first rule for each key, preserving order.
pub(crate) fn dedup_by_key<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + std::hash::Hash,
    F: Fn(&T) -> K,
{
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|item| seen.insert(key(item))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::FakeRunner;
    use crate::core::exec::CommandOutput;

    struct StubProvider {
        kind: BackendKind,
        available: bool,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &'static str {
            match self.kind {
                BackendKind::Firewalld => "firewalld",
                BackendKind::Nftables => "nftables",
                BackendKind::Pf => "pf",
            }
        }
        fn kind(&self) -> BackendKind {
            self.kind
        }
        fn is_available(&self) -> bool {
            self.available
        }
        async fn apply_nat(&self, _: &OpContext, _: &NatRule) -> Result<()> {
            Ok(())
        }
        async fn remove_nat(&self, _: &OpContext, _: &str) -> Result<()> {
            Ok(())
        }
        async fn list_nat_rules(&self, _: &OpContext) -> Result<Vec<NatRule>> {
            Ok(Vec::new())
        }
        async fn check_conflict(&self, _: &OpContext, _: u16, _: Protocol) -> Result<()> {
            Ok(())
        }
        async fn open_port(&self, _: &OpContext, _: &FilterRule) -> Result<()> {
            Ok(())
        }
        async fn open_port_for_source(&self, _: &OpContext, _: &FilterRule) -> Result<()> {
            Ok(())
        }
        async fn trust_source(&self, _: &OpContext, _: &FilterRule) -> Result<()> {
            Ok(())
        }
        async fn close_port(&self, _: &OpContext, _: &str) -> Result<()> {
            Ok(())
        }
        async fn list_filter_rules(&self, _: &OpContext) -> Result<Vec<FilterRule>> {
            Ok(Vec::new())
        }
    }

    fn stub(kind: BackendKind, available: bool) -> Box<dyn Provider> {
        Box::new(StubProvider { kind, available })
    }

    #[test]
    fn test_factory_picks_first_available() {
        let factory = ProviderFactory::with_candidates(vec![
            stub(BackendKind::Firewalld, false),
            stub(BackendKind::Nftables, true),
            stub(BackendKind::Pf, true),
        ]);
        assert_eq!(
            factory.available(),
            vec![BackendKind::Nftables, BackendKind::Pf]
        );
        assert_eq!(factory.select().unwrap().kind(), BackendKind::Nftables);
    }

    #[test]
    fn test_factory_reports_unavailable() {
        let factory = ProviderFactory::with_candidates(vec![
            stub(BackendKind::Firewalld, false),
            stub(BackendKind::Pf, false),
        ]);
        let err = factory.select().err().unwrap();
        assert!(matches!(err, Error::BackendUnavailable(msg) if msg.contains("firewalld, pf")));
    }

    #[test]
    fn test_factory_forced_backend_keeps_single_candidate() {
        let mut settings = Settings::default();
        settings.backend = crate::config::BackendChoice::Pf;
        let runner: Arc<dyn CommandRunner> = Arc::new(FakeRunner::default());
        let factory = ProviderFactory::new(&settings, &OsInfo::default(), runner);
        assert_eq!(factory.candidates.len(), 1);
        assert_eq!(factory.candidates[0].kind(), BackendKind::Pf);
    }

    #[test]
    fn test_conflict_in_reports_owner() {
        let rules = vec![NatRule::new("web", 8080, "10.0.0.5", 80, Protocol::Tcp)];
        assert!(conflict_in(&rules, 8080, Protocol::Udp).is_ok());
        let err = conflict_in(&rules, 8080, Protocol::Tcp).unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict { kind: ConflictKind::Mapped { rule_id }, .. } if rule_id == "web"
        ));
    }

    #[test]
    fn test_validate_filter_rejects_wrong_kind() {
        let rule = FilterRule::open_port("dns", 53, Protocol::Udp);
        assert!(validate_filter(&rule, FilterKind::OpenPort).is_ok());
        assert!(matches!(
            validate_filter(&rule, FilterKind::TrustSource),
            Err(Error::Validation { field, .. }) if field == "kind"
        ));
    }

    #[test]
    fn test_dedup_by_key_keeps_first() {
        let items = vec![(1, "a"), (2, "b"), (1, "c")];
        let deduped = dedup_by_key(items, |(k, _)| *k);
        assert_eq!(deduped, vec![(1, "a"), (2, "b")]);
    }

    #[tokio::test]
    async fn test_invoke_maps_failure_to_external_tool() {
        let runner = FakeRunner::new(|_, _| CommandOutput::failed(2, "Error: syntax error"));
        let err = invoke(&runner, &OpContext::new(), "nft", &[], exit_status)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalTool { ref message, exit_code: Some(2), .. } if message.contains("syntax")
        ));
    }

    #[tokio::test]
    async fn test_ip_forwarding_skips_write_when_enabled() {
        let runner = FakeRunner::new(|_, _| CommandOutput::ok("1\n"));
        ensure_ip_forwarding(&runner, &OpContext::new(), false)
            .await
            .unwrap();
        assert_eq!(runner.calls(), vec!["sysctl -n net.ipv4.ip_forward"]);
    }

    #[tokio::test]
    async fn test_ip_forwarding_writes_v6_key() {
        let runner = FakeRunner::new(|_, args| {
            if args.first().is_some_and(|a| a == "-n") {
                CommandOutput::ok("0\n")
            } else {
                CommandOutput::ok("")
            }
        });
        ensure_ip_forwarding(&runner, &OpContext::new(), true)
            .await
            .unwrap();
        assert_eq!(
            runner.calls().last().unwrap(),
            "sysctl -w net.ipv6.conf.all.forwarding=1"
        );
    }
}
