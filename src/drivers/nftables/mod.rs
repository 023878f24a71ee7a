//! nftables backend (Debian family)
//!
//! Rules live in two portly-owned `inet` tables and are addressed by kernel handle.
//! After every mutation both tables are dumped into a fragment file that the main
//! nftables config includes, so the live ruleset survives a reboot.

pub mod codec;

use super::{
    BackendKind, Provider, already_present, conflict_in, dedup_by_key, ensure_ip_forwarding,
    invoke, validate_filter,
};
use crate::config::NftablesSettings;
use crate::core::error::{ConflictKind, Error, Result};
use crate::core::exec::{CommandRunner, OpContext, Outcome, args};
use crate::core::rule::{FilterKind, FilterRule, NatRule, Protocol};
use crate::platform::{self, OsInfo};
use crate::utils::{write_file_atomic, write_file_atomic_keep_mode};
use async_trait::async_trait;
use codec::Handled;
use std::sync::Arc;
use tracing::{debug, info, warn};

const NFT: &str = "nft";

pub struct NftablesDriver {
    runner: Arc<dyn CommandRunner>,
    os: OsInfo,
    settings: NftablesSettings,
}

impl NftablesDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, os: OsInfo, settings: NftablesSettings) -> Self {
        Self {
            runner,
            os,
            settings,
        }
    }

    async fn nft(&self, ctx: &OpContext, args: &[String]) -> Result<Outcome> {
        invoke(self.runner.as_ref(), ctx, NFT, args, codec::classify).await
    }

    /// Creates the table and base chain if absent.
    async fn ensure_chain(&self, ctx: &OpContext, table: &str, chain: &str, spec: &str) -> Result<()> {
        self.nft(ctx, &args(["add", "table", "inet", table])).await?;

        let mut chain_args = args(["add", "chain", "inet", table, chain]);
        chain_args.extend(codec::statement_args(spec));
        self.nft(ctx, &chain_args).await?;
        Ok(())
    }

    /// Text output of an nft listing; an absent table or chain lists as empty.
    async fn listing(&self, ctx: &OpContext, list_args: &[String]) -> Result<String> {
        let output = self.runner.run(ctx, NFT, list_args).await?;
        match codec::classify(&output) {
            Outcome::Success | Outcome::AlreadyExists => Ok(output.stdout),
            Outcome::Missing => Ok(String::new()),
            Outcome::Failure => Err(Error::ExternalTool {
                program: NFT.to_string(),
                message: output.combined(),
                exit_code: output.exit_code,
            }),
        }
    }

    async fn chain_listing(&self, ctx: &OpContext, table: &str, chain: &str) -> Result<String> {
        self.listing(ctx, &args(["-a", "list", "chain", "inet", table, chain]))
            .await
    }

    async fn handled_nat(&self, ctx: &OpContext) -> Result<Vec<Handled<NatRule>>> {
        let output = self
            .chain_listing(ctx, &self.settings.nat_table, codec::NAT_CHAIN)
            .await?;
        Ok(codec::decode_nat_listing(&output))
    }

    async fn handled_filter(&self, ctx: &OpContext) -> Result<Vec<Handled<FilterRule>>> {
        let output = self
            .chain_listing(ctx, &self.settings.filter_table, codec::FILTER_CHAIN)
            .await?;
        Ok(codec::decode_filter_listing(&output))
    }

    async fn add_rule(&self, ctx: &OpContext, table: &str, chain: &str, statement: &str) -> Result<()> {
        let mut rule_args = args(["add", "rule", "inet", table, chain]);
        rule_args.extend(codec::statement_args(statement));
        self.nft(ctx, &rule_args).await?;
        Ok(())
    }

    async fn delete_handle(&self, ctx: &OpContext, table: &str, chain: &str, handle: u64) -> Result<()> {
        let handle_arg = handle.to_string();
        let outcome = self
            .nft(
                ctx,
                &args(["delete", "rule", "inet", table, chain, "handle", handle_arg.as_str()]),
            )
            .await?;
        if outcome == Outcome::Missing {
            debug!("Handle {handle} already gone from {table}/{chain}");
        }
        Ok(())
    }

    /// Writes both tables to the fragment and makes sure the main config includes it.
    async fn persist(&self, ctx: &OpContext) -> Result<()> {
        let mut tables = Vec::new();
        for table in [&self.settings.nat_table, &self.settings.filter_table] {
            let listing = self
                .listing(ctx, &args(["list", "table", "inet", table.as_str()]))
                .await?;
            if !listing.trim().is_empty() {
                tables.push(listing);
            }
        }

        let fragment_path = &self.settings.fragment_path;
        write_file_atomic(
            fragment_path,
            codec::render_fragment(&tables).into_bytes(),
            0o644,
        )
        .await
        .map_err(|e| Error::from_io_at(fragment_path, e))?;
        debug!("Wrote {}", fragment_path.display());

        let main_path = &self.settings.main_config;
        let main_config = match tokio::fs::read_to_string(main_path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::from_io_at(main_path, e)),
        };

        if let Some(updated) = codec::ensure_include(main_config.as_deref(), fragment_path) {
            info!("Adding include for {} to {}", fragment_path.display(), main_path.display());
            write_file_atomic_keep_mode(main_path, updated.into_bytes(), 0o644)
                .await
                .map_err(|e| Error::from_io_at(main_path, e))?;
        }
        Ok(())
    }

    /// Scans the full ruleset for a foreign DNAT. Listing failures are not fatal.
    async fn foreign_conflict(&self, ctx: &OpContext, port: u16, protocol: Protocol) -> Result<bool> {
        match self.listing(ctx, &args(["list", "ruleset"])).await {
            Ok(ruleset) => Ok(codec::foreign_dnat(
                &ruleset,
                &self.settings.nat_table,
                port,
                protocol,
            )),
            Err(Error::Cancelled(reason)) => Err(Error::Cancelled(reason)),
            Err(e) => {
                warn!("Could not scan full ruleset for conflicts: {e}");
                Ok(false)
            }
        }
    }

    async fn add_filter(&self, ctx: &OpContext, rule: &FilterRule) -> Result<()> {
        let existing = self.list_filter_rules(ctx).await?;
        if already_present(&existing, &rule.key()) {
            info!("Filter rule {rule} already present, nothing to do");
            return Ok(());
        }

        let statement = codec::encode_filter(rule).ok_or_else(|| Error::Validation {
            field: "kind".to_string(),
            message: format!("cannot encode {rule}"),
        })?;

        let table = &self.settings.filter_table;
        self.ensure_chain(ctx, table, codec::FILTER_CHAIN, codec::FILTER_CHAIN_SPEC)
            .await?;
        info!("Adding nftables filter {rule}");
        self.add_rule(ctx, table, codec::FILTER_CHAIN, &statement)
            .await?;
        self.persist(ctx).await
    }
}

#[async_trait]
impl Provider for NftablesDriver {
    fn name(&self) -> &'static str {
        "nftables"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Nftables
    }

    fn is_available(&self) -> bool {
        self.os.is_debian() && platform::command_exists(NFT)
    }

    async fn apply_nat(&self, ctx: &OpContext, rule: &NatRule) -> Result<()> {
        rule.validate()?;
        self.check_conflict(ctx, rule.external_port, rule.protocol)
            .await?;

        let ipv6 = rule.target_addr().is_some_and(|ip| ip.is_ipv6());
        ensure_ip_forwarding(self.runner.as_ref(), ctx, ipv6).await?;

        let statement = codec::encode_nat(rule).ok_or_else(|| Error::Validation {
            field: "internal_ip".to_string(),
            message: format!("'{}' is not an IP address", rule.internal_ip),
        })?;

        let table = &self.settings.nat_table;
        self.ensure_chain(ctx, table, codec::NAT_CHAIN, codec::NAT_CHAIN_SPEC)
            .await?;
        info!("Adding nftables forward {rule}");
        self.add_rule(ctx, table, codec::NAT_CHAIN, &statement)
            .await?;
        self.persist(ctx).await
    }

    async fn remove_nat(&self, ctx: &OpContext, id: &str) -> Result<()> {
        let rules = self.handled_nat(ctx).await?;
        let target = rules
            .iter()
            .find(|h| h.rule.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        info!("Removing nftables forward {}", target.rule);
        self.delete_handle(ctx, &self.settings.nat_table, codec::NAT_CHAIN, target.handle)
            .await?;
        self.persist(ctx).await
    }

    async fn list_nat_rules(&self, ctx: &OpContext) -> Result<Vec<NatRule>> {
        let rules: Vec<NatRule> = self
            .handled_nat(ctx)
            .await?
            .into_iter()
            .map(|h| h.rule)
            .collect();
        Ok(dedup_by_key(rules, |r| r.id.clone()))
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
        let rules = self.handled_filter(ctx).await?;
        let target = rules
            .iter()
            .find(|h| h.rule.id == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        info!("Removing nftables filter {}", target.rule);
        self.delete_handle(
            ctx,
            &self.settings.filter_table,
            codec::FILTER_CHAIN,
            target.handle,
        )
        .await?;
        self.persist(ctx).await
    }

    async fn list_filter_rules(&self, ctx: &OpContext) -> Result<Vec<FilterRule>> {
        let rules: Vec<FilterRule> = self
            .handled_filter(ctx)
            .await?
            .into_iter()
            .map(|h| h.rule)
            .collect();
        Ok(dedup_by_key(rules, FilterRule::key))
    }
}
