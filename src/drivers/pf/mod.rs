//! pf backend (macOS)
//!
//! NAT and filter rules live in two anchor files under the anchor directory. `pf.conf` is
//! extended once with the anchor references and `load anchor` lines; after that every
//! mutation rewrites the anchor file and reloads just that anchor with `pfctl -a`.
//!
//! Mutations need root. Listings only read the anchor files.

pub mod codec;

use super::{
    BackendKind, Provider, already_present, conflict_in, dedup_by_key, ensure_sysctl_on, invoke,
    validate_filter,
};
use crate::config::PfSettings;
use crate::core::error::{ConflictKind, Error, Result};
use crate::core::exec::{CommandRunner, OpContext, Outcome, args};
use crate::core::rule::{FilterKind, FilterRule, NatRule, Protocol};
use crate::platform::{self, OsInfo};
use crate::utils::{write_file_atomic, write_file_atomic_keep_mode};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PfDriver {
    runner: Arc<dyn CommandRunner>,
    os: OsInfo,
    settings: PfSettings,
    root_check: fn() -> bool,
}

impl PfDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, os: OsInfo, settings: PfSettings) -> Self {
        Self {
            runner,
            os,
            settings,
            root_check: platform::is_root,
        }
    }

    /// Replaces the privilege probe run before every mutation.
    pub fn with_root_check(mut self, root_check: fn() -> bool) -> Self {
        self.root_check = root_check;
        self
    }

    fn anchor_path(&self, anchor: &str) -> PathBuf {
        self.settings.anchor_dir.join(anchor)
    }

    fn require_root(&self) -> Result<()> {
        if (self.root_check)() {
            Ok(())
        } else {
            Err(Error::Permission(
                "changing pf rules requires root; re-run with sudo".to_string(),
            ))
        }
    }

    async fn pfctl(&self, ctx: &OpContext, args: &[String]) -> Result<Outcome> {
        invoke(
            self.runner.as_ref(),
            ctx,
            &self.settings.pfctl,
            args,
            codec::classify,
        )
        .await
    }

    async fn read_optional(path: &Path) -> Result<Option<String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from_io_at(path, e)),
        }
    }

    async fn read_anchor(&self, anchor: &str) -> Result<String> {
        Ok(Self::read_optional(&self.anchor_path(anchor))
            .await?
            .unwrap_or_default())
    }

    async fn enable_pf(&self, ctx: &OpContext) -> Result<()> {
        let info = self.runner.run(ctx, &self.settings.pfctl, &args(["-s", "info"])).await?;
        if codec::pf_enabled(&info.stdout) {
            return Ok(());
        }
        info!("Enabling pf");
        self.pfctl(ctx, &args(["-e"])).await?;
        Ok(())
    }

    async fn ensure_forwarding(&self, ctx: &OpContext, ipv6: bool) -> Result<()> {
        let key = if ipv6 {
            "net.inet6.ip6.forwarding"
        } else {
            "net.inet.ip.forwarding"
        };
        ensure_sysctl_on(self.runner.as_ref(), ctx, key).await
    }

    /// Writes the anchor file, references it from `pf.conf`, and reloads it.
    async fn commit_anchor(
        &self,
        ctx: &OpContext,
        anchor: &str,
        content: String,
        translation: bool,
    ) -> Result<()> {
        let path = self.anchor_path(anchor);
        write_file_atomic(&path, content.into_bytes(), 0o644)
            .await
            .map_err(|e| Error::from_io_at(&path, e))?;
        debug!("Wrote {}", path.display());

        let pf_conf = &self.settings.pf_conf;
        let current = Self::read_optional(pf_conf).await?;
        if let Some(updated) =
            codec::ensure_anchor_reference(current.as_deref(), anchor, &path, translation)
        {
            info!("Referencing anchor {anchor} from {}", pf_conf.display());
            write_file_atomic_keep_mode(pf_conf, updated.into_bytes(), 0o644)
                .await
                .map_err(|e| Error::from_io_at(pf_conf, e))?;
        }

        let path_arg = path.display().to_string();
        self.pfctl(ctx, &args(["-a", anchor, "-f", path_arg.as_str()]))
            .await?;
        Ok(())
    }

    /// Checks `pfctl -s nat` for redirects outside portly's anchors. Failures are not fatal.
    async fn foreign_conflict(&self, ctx: &OpContext, port: u16, protocol: Protocol) -> Result<bool> {
        match self.runner.run(ctx, &self.settings.pfctl, &args(["-s", "nat"])).await {
            Ok(output) if output.success => {
                Ok(codec::nat_listing_has_port(&output.stdout, port, protocol))
            }
            Ok(output) => {
                warn!("Could not list pf NAT rules: {}", output.combined());
                Ok(false)
            }
            Err(Error::Cancelled(reason)) => Err(Error::Cancelled(reason)),
            Err(e) => {
                warn!("Could not list pf NAT rules: {e}");
                Ok(false)
            }
        }
    }

    async fn add_filter(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()> {
        self.require_root()?;

        let existing = self.list_filter_rules(ctx).await?;
        if already_present(&existing, &rule.key()) {
            info!("Filter rule {rule} already present, nothing to do");
            return Ok(());
        }

        let block = codec::encode_filter_block(rule).ok_or_else(|| Error::Validation {
            field: "kind".to_string(),
            message: format!("cannot encode {rule}"),
        })?;

        self.enable_pf(ctx).await?;
        let anchor = &self.settings.filter_anchor;
        let content = codec::append_block(&self.read_anchor(anchor).await?, &block);
        info!("Adding pf filter {rule}");
        self.commit_anchor(ctx, anchor, content, false).await
    }

    async fn remove_from(&self, ctx: &OpContext, anchor: &str, id: &str, translation: bool) -> Result<()> {
        self.require_root()?;

        let content = self.read_anchor(anchor).await?;
        let updated =
            codec::remove_block(&content, id).ok_or_else(|| Error::NotFound(id.to_string()))?;

        info!("Removing pf rule {id} from anchor {anchor}");
        self.commit_anchor(ctx, anchor, updated, translation).await
    }
}

#[async_trait]
impl Provider for PfDriver {
    fn name(&self) -> &'static str {
        "pf"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Pf
    }

    fn is_available(&self) -> bool {
        self.os.is_darwin() && platform::command_exists(&self.settings.pfctl)
    }

    async fn apply_nat(&self, ctx: &OpContext, rule: &NatRule) -> Result<()> {
        rule.validate()?;
        self.require_root()?;
        self.check_conflict(ctx, rule.external_port, rule.protocol)
            .await?;

        let block = codec::encode_nat_block(rule).ok_or_else(|| Error::Validation {
            field: "internal_ip".to_string(),
            message: format!("'{}' is not an IP address", rule.internal_ip),
        })?;

        let ipv6 = rule.target_addr().is_some_and(|ip| ip.is_ipv6());
        self.ensure_forwarding(ctx, ipv6).await?;
        self.enable_pf(ctx).await?;

        let anchor = &self.settings.nat_anchor;
        let content = codec::append_block(&self.read_anchor(anchor).await?, &block);
        info!("Adding pf forward {rule}");
        self.commit_anchor(ctx, anchor, content, true).await
    }

    async fn remove_nat(&self, ctx: &OpContext, id: &str) -> Result<()> {
        self.remove_from(ctx, &self.settings.nat_anchor, id, true)
            .await
    }

    async fn list_nat_rules(&self, _ctx: &OpContext) -> Result<Vec<NatRule>> {
        let content = self.read_anchor(&self.settings.nat_anchor).await?;
        Ok(dedup_by_key(codec::decode_nat(&content), |r| r.id.clone()))
    }

    async fn check_conflict(&self, ctx: &OpContext, port: u16, protocol: Protocol) -> Result<()> {
        conflict_in(&self.list_nat_rules(ctx).await?, port, protocol)?;

        if self.foreign_conflict(ctx, port, protocol).await? {
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
        self.remove_from(ctx, &self.settings.filter_anchor, id, false)
            .await
    }

    async fn list_filter_rules(&self, _ctx: &OpContext) -> Result<Vec<FilterRule>> {
        let content = self.read_anchor(&self.settings.filter_anchor).await?;
        Ok(dedup_by_key(codec::decode_filter(&content), FilterRule::key))
    }
}
