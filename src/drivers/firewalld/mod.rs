//! firewalld backend (RHEL family)
//!
//! Rules are added to the permanent configuration and activated with `--reload` after
//! every mutation. Listings merge the runtime and permanent stores, de-duplicated by the
//! derived rule ID.

pub mod codec;

use super::{
    BackendKind, Provider, already_present, conflict_in, dedup_by_key, ensure_ip_forwarding,
    invoke, validate_filter,
};
use crate::config::FirewalldSettings;
use crate::core::error::{ConflictKind, Error, Result};
use crate::core::exec::{CommandRunner, OpContext, Outcome};
use crate::core::rule::{FilterKind, FilterRule, NatRule, Protocol};
use crate::platform::{self, OsInfo};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

const FIREWALL_CMD: &str = "firewall-cmd";

pub struct FirewalldDriver {
    runner: Arc<dyn CommandRunner>,
    os: OsInfo,
    settings: FirewalldSettings,
}

impl FirewalldDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, os: OsInfo, settings: FirewalldSettings) -> Self {
        Self {
            runner,
            os,
            settings,
        }
    }

    /// `--zone <z>` when a zone is configured.
    fn zone_args(&self) -> Vec<String> {
        self.settings
            .zone
            .as_ref()
            .map(|z| vec!["--zone".to_string(), z.clone()])
            .unwrap_or_default()
    }

    fn permanent_args(&self, action: &str, value: String) -> Vec<String> {
        let mut args = vec!["--permanent".to_string()];
        args.extend(self.zone_args());
        args.push(action.to_string());
        args.push(value);
        args
    }

    async fn fw(&self, ctx: &OpContext, args: &[String]) -> Result<Outcome> {
        invoke(self.runner.as_ref(), ctx, FIREWALL_CMD, args, codec::classify).await
    }

    async fn reload(&self, ctx: &OpContext) -> Result<()> {
        self.fw(ctx, &["--reload".to_string()]).await?;
        Ok(())
    }

    /// Lists one store; `permanent` selects the permanent configuration.
    async fn list(&self, ctx: &OpContext, what: &str, permanent: bool) -> Result<String> {
        let mut args = Vec::new();
        if permanent {
            args.push("--permanent".to_string());
        }
        args.extend(self.zone_args());
        args.push(what.to_string());

        let output = self.runner.run(ctx, FIREWALL_CMD, &args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::ExternalTool {
                program: FIREWALL_CMD.to_string(),
                message: output.combined(),
                exit_code: output.exit_code,
            })
        }
    }

    async fn rich_rules(&self, ctx: &OpContext) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for permanent in [false, true] {
            let output = self.list(ctx, "--list-rich-rules", permanent).await?;
            lines.extend(codec::rich_rule_lines(&output).map(str::to_string));
        }
        Ok(lines)
    }

    async fn ensure_masquerade(&self, ctx: &OpContext) -> Result<()> {
        let zone = match &self.settings.zone {
            Some(zone) => zone.clone(),
            None => {
                let output = self.list(ctx, "--get-default-zone", false).await?;
                output.trim().to_string()
            }
        };

        let query = self
            .runner
            .run(
                ctx,
                FIREWALL_CMD,
                &["--zone".to_string(), zone.clone(), "--query-masquerade".to_string()],
            )
            .await?;
        if query.success {
            return Ok(());
        }

        info!("Enabling masquerade on zone {zone}");
        self.fw(
            ctx,
            &[
                "--permanent".to_string(),
                "--zone".to_string(),
                zone,
                "--add-masquerade".to_string(),
            ],
        )
        .await?;
        Ok(())
    }

    /// Adds a rich rule or port, tolerating "already enabled", then reloads.
    async fn add_and_reload(&self, ctx: &OpContext, action: &str, value: String) -> Result<()> {
        let outcome = self.fw(ctx, &self.permanent_args(action, value)).await?;
        if outcome == Outcome::AlreadyExists {
            debug!("firewalld reports rule already enabled");
        }
        self.reload(ctx).await
    }

    /// Removes a rich rule or port, tolerating "not enabled", then reloads.
    async fn remove_and_reload(&self, ctx: &OpContext, action: &str, value: String) -> Result<()> {
        let outcome = self.fw(ctx, &self.permanent_args(action, value)).await?;
        if outcome == Outcome::Missing {
            debug!("Rule was only present in the runtime configuration");
        }
        self.reload(ctx).await
    }

    async fn add_filter(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()> {
        let existing = self.list_filter_rules(ctx).await?;
        if already_present(&existing, &rule.key()) {
            info!("Filter rule {rule} already present, nothing to do");
            return Ok(());
        }

        match (rule.kind, codec::encode_filter(rule), rule.port, rule.protocol) {
            (FilterKind::OpenPort, _, Some(port), Some(protocol)) => {
                self.add_and_reload(ctx, "--add-port", codec::port_spec(port, protocol))
                    .await
            }
            (_, Some(rich), _, _) => self.add_and_reload(ctx, "--add-rich-rule", rich).await,
            _ => Err(Error::Validation {
                field: "kind".to_string(),
                message: format!("cannot encode {rule}"),
            }),
        }
    }
}

#[async_trait]
impl Provider for FirewalldDriver {
    fn name(&self) -> &'static str {
        "firewalld"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Firewalld
    }

    fn is_available(&self) -> bool {
        self.os.is_rhel() && platform::command_exists(FIREWALL_CMD)
    }

    async fn apply_nat(&self, ctx: &OpContext, rule: &NatRule) -> Result<()> {
        rule.validate()?;
        self.check_conflict(ctx, rule.external_port, rule.protocol)
            .await?;

        let ipv6 = rule.target_addr().is_some_and(|ip| ip.is_ipv6());
        ensure_ip_forwarding(self.runner.as_ref(), ctx, ipv6).await?;
        if self.settings.masquerade {
            self.ensure_masquerade(ctx).await?;
        }

        info!("Adding firewalld forward {rule}");
        self.add_and_reload(ctx, "--add-rich-rule", codec::encode_nat(rule))
            .await
    }

    async fn remove_nat(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let rules = self.list_nat_rules(ctx).await?;
        let target = rules
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        info!("Removing firewalld forward {target}");
        self.remove_and_reload(ctx, "--remove-rich-rule", codec::encode_nat(target))
            .await
    }

    async fn list_nat_rules(&self, ctx: &OpContext) -> Result<Vec<NatRule>> {
        let rules: Vec<NatRule> = self
            .rich_rules(ctx)
            .await?
            .iter()
            .filter_map(|line| codec::decode_nat(line))
            .collect();
        Ok(dedup_by_key(rules, |r| r.id.clone()))
    }

    async fn check_conflict(&self, ctx: &OpContext, port: u16, protocol: Protocol) -> Result<()> {
        conflict_in(&self.list_nat_rules(ctx).await?, port, protocol)?;

        let mut args = self.zone_args();
        args.push("--query-port".to_string());
        args.push(codec::port_spec(port, protocol));
        let output = self.runner.run(ctx, FIREWALL_CMD, &args).await?;

        if output.stdout.trim() == "yes" {
            return Err(Error::Conflict {
                port,
                protocol,
                kind: ConflictKind::OpenExternally,
            });
        }
        Ok(())
    }

    async fn open_port(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()> {
        validate_filter(rule, FilterKind::OpenPort)?;
        self.add_filter(ctx, rule).await
    }

    async fn open_port_for_source(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()> {
        validate_filter(rule, FilterKind::PortRestricted)?;
        self.add_filter(ctx, rule).await
    }

    async fn trust_source(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()> {
        validate_filter(rule, FilterKind::TrustSource)?;
        self.add_filter(ctx, rule).await
    }

    async fn close_port(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let rules = self.list_filter_rules(ctx).await?;
        let target = rules
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        info!("Removing firewalld filter {target}");
        match (target.kind, target.port, target.protocol) {
            (FilterKind::OpenPort, Some(port), Some(protocol)) => {
                self.remove_and_reload(ctx, "--remove-port", codec::port_spec(port, protocol))
                    .await
            }
            _ => {
                let rich = codec::encode_filter(target)
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                self.remove_and_reload(ctx, "--remove-rich-rule", rich).await
            }
        }
    }

    async fn list_filter_rules(&self, ctx: &OpContext) -> Result<Vec<FilterRule>> {
        let mut rules = Vec::new();
        for permanent in [false, true] {
            let ports = self.list(ctx, "--list-ports", permanent).await?;
            rules.extend(codec::decode_port_list(&ports));
        }
        rules.extend(
            self.rich_rules(ctx)
                .await?
                .iter()
                .filter_map(|line| codec::decode_filter(line)),
        );
        Ok(dedup_by_key(rules, FilterRule::key))
    }
}
