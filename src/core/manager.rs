//! Caller-facing rule lifecycle
//!
//! [`RuleManager`] pairs the active [`Provider`] with the [`Ledger`]: a rule is validated,
//! recorded as `Pending`, handed to the backend, then marked `Active` or `Failed` with the
//! backend's message. Every mutation is also written to the audit log when one is attached.
//!
//! The manager takes `&mut self` for every mutation, so one manager never runs two
//! mutations at once.

use crate::audit::{AuditLog, EventType};
use crate::core::error::{Error, Result};
use crate::core::exec::OpContext;
use crate::core::ledger::{
    AppliedRuleRecord, Ledger, ManagedRule, ProductInfo, RuleFamily, RuleStatus,
};
use crate::core::rule::{FilterKind, FilterRule, NatRule};
use crate::drivers::Provider;
use crate::platform;
use tracing::{info, warn};

pub struct RuleManager {
    provider: Box<dyn Provider>,
    ledger: Ledger,
    audit: Option<AuditLog>,
}

/// Where a removal request points on the backend
enum RemovalTarget {
    Nat(String),
    Filter(String),
}

impl RuleManager {
    pub fn new(provider: Box<dyn Provider>, ledger: Ledger) -> Self {
        Self {
            provider,
            ledger,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    async fn audit(
        &self,
        event_type: EventType,
        rule: &ManagedRule,
        result: &Result<()>,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        audit
            .record(
                event_type,
                self.provider.name(),
                result.is_ok(),
                serde_json::json!({
                    "rule": rule,
                    "error_kind": result.as_ref().err().map(Error::kind_name),
                }),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
    }

    /// Records `rule` as `Pending`, reusing the slot of a removed or failed record.
    async fn begin(&mut self, rule: ManagedRule) -> Result<()> {
        match self.ledger.get(rule.id()).map(|r| r.status) {
            None => self.ledger.add_record(AppliedRuleRecord::pending(rule)).await,
            Some(RuleStatus::Removed | RuleStatus::Failed) => {
                info!("Re-applying {rule} over its previous record");
                self.ledger
                    .update_record(AppliedRuleRecord::pending(rule))
                    .await
            }
            Some(RuleStatus::Pending | RuleStatus::Active) => {
                Err(Error::DuplicateId(rule.id().to_string()))
            }
        }
    }

    /// Moves the pending record to its final state and hands back the backend result.
    async fn finish(&mut self, id: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.ledger.mark_active(id).await,
            Err(e) => {
                if let Err(save_err) = self.ledger.mark_failed(id, e.to_string()).await {
                    warn!("Could not record failure of {id}: {save_err}");
                }
                Err(e)
            }
        }
    }

    /// Validates, records, and applies a port forwarding rule.
    ///
    /// # Errors
    ///
    /// Validation, conflict and backend errors are returned unchanged; in the latter two
    /// cases the ledger record is left `Failed` with the error message.
    pub async fn apply_nat(&mut self, ctx: &OpContext, rule: NatRule) -> Result<()> {
        rule.validate()?;
        let managed = ManagedRule::Nat(rule.clone());
        self.begin(managed.clone()).await?;

        let result = self.provider.apply_nat(ctx, &rule).await;
        self.audit(EventType::ApplyNat, &managed, &result).await;
        self.finish(&rule.id, result).await
    }

    /// Validates, records, and applies a filter rule of any kind.
    pub async fn apply_filter(&mut self, ctx: &OpContext, rule: FilterRule) -> Result<()> {
        rule.validate()?;
        let managed = ManagedRule::Filter(rule.clone());
        self.begin(managed.clone()).await?;

        let result = self.provider.apply_filter(ctx, &rule).await;
        let event_type = match rule.kind {
            FilterKind::OpenPort => EventType::OpenPort,
            FilterKind::PortRestricted => EventType::OpenPortForSource,
            FilterKind::TrustSource => EventType::TrustSource,
        };
        self.audit(event_type, &managed, &result).await;
        self.finish(&rule.id, result).await
    }

    /// Finds the backend ID for a ledger record by ID or by semantic match.
    async fn resolve(&self, ctx: &OpContext, rule: &ManagedRule) -> Result<Option<RemovalTarget>> {
        Ok(match rule {
            ManagedRule::Nat(nat) => self
                .provider
                .list_nat_rules(ctx)
                .await?
                .into_iter()
                .find(|r| r.id == nat.id || r.same_mapping(nat))
                .map(|r| RemovalTarget::Nat(r.id)),
            ManagedRule::Filter(filter) => {
                let key = filter.key();
                self.provider
                    .list_filter_rules(ctx)
                    .await?
                    .into_iter()
                    .find(|r| r.id == filter.id || r.key() == key)
                    .map(|r| RemovalTarget::Filter(r.id))
            }
        })
    }

    /// Looks a bare backend ID up in the listings of `family` (both when `None`).
    async fn resolve_native(
        &self,
        ctx: &OpContext,
        id: &str,
        family: Option<RuleFamily>,
    ) -> Result<Option<(RemovalTarget, ManagedRule)>> {
        if family != Some(RuleFamily::Filter)
            && let Some(rule) = self
                .provider
                .list_nat_rules(ctx)
                .await?
                .into_iter()
                .find(|r| r.id == id)
        {
            return Ok(Some((RemovalTarget::Nat(id.to_string()), ManagedRule::Nat(rule))));
        }
        if family != Some(RuleFamily::Nat)
            && let Some(rule) = self
                .provider
                .list_filter_rules(ctx)
                .await?
                .into_iter()
                .find(|r| r.id == id)
        {
            return Ok(Some((
                RemovalTarget::Filter(id.to_string()),
                ManagedRule::Filter(rule),
            )));
        }
        Ok(None)
    }

    /// IDs of active ledger records, other than `except`, enforced by the same native rule.
    fn active_sharing(&self, rule: &ManagedRule, except: Option<&str>) -> Vec<String> {
        self.ledger
            .records()
            .iter()
            .filter(|r| r.status == RuleStatus::Active)
            .filter(|r| Some(r.id()) != except)
            .filter(|r| r.rule.same_native(rule))
            .map(|r| r.id().to_string())
            .collect()
    }

    /// Removes a rule of either family by ledger or backend ID.
    ///
    /// Filter rules are idempotent on every backend, so several ledger IDs can share one
    /// native rule. The native rule is only deleted together with the last active record
    /// that uses it; earlier removals just mark their record `Removed`. Removing by backend
    /// ID deletes the native rule and marks every active record using it `Removed`.
    ///
    /// A ledger rule whose native counterpart has already disappeared is marked `Removed`
    /// without touching the backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if neither the ledger nor the backend knows `id`, or if
    /// the ledger record was already removed.
    pub async fn remove(&mut self, ctx: &OpContext, id: &str) -> Result<()> {
        self.remove_in(ctx, id, None).await
    }

    /// Removes a port forwarding rule; filter rules are refused.
    pub async fn remove_nat(&mut self, ctx: &OpContext, id: &str) -> Result<()> {
        self.remove_in(ctx, id, Some(RuleFamily::Nat)).await
    }

    /// Removes a filter rule; port forwarding rules are refused.
    pub async fn close_port(&mut self, ctx: &OpContext, id: &str) -> Result<()> {
        self.remove_in(ctx, id, Some(RuleFamily::Filter)).await
    }

    async fn remove_in(&mut self, ctx: &OpContext, id: &str, family: Option<RuleFamily>) -> Result<()> {
        let record = self.ledger.get(id).cloned();

        let Some(record) = record else {
            let (target, native) = self
                .resolve_native(ctx, id, family)
                .await?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            self.remove_native(ctx, &target).await?;
            for shared in self.active_sharing(&native, None) {
                info!("Rule {shared} was enforced by {id}, marking it removed");
                self.ledger.mark_removed(&shared).await?;
            }
            return Ok(());
        };

        let actual = record.rule.family();
        if let Some(wanted) = family
            && wanted != actual
        {
            return Err(Error::Validation {
                field: "id".to_string(),
                message: format!("'{id}' is a {actual} rule, not a {wanted} rule"),
            });
        }

        if record.status == RuleStatus::Removed {
            return Err(Error::NotFound(id.to_string()));
        }

        let sharing = self.active_sharing(&record.rule, Some(id));
        if !sharing.is_empty() {
            info!(
                "Native rule of {id} is still used by {}; only the ledger record is removed",
                sharing.join(", ")
            );
            return self.ledger.mark_removed(id).await;
        }

        let Some(target) = self.resolve(ctx, &record.rule).await? else {
            warn!("{} is no longer present on the backend", record.rule);
            return self.ledger.mark_removed(id).await;
        };

        let result = self.remove_native(ctx, &target).await;
        if result.is_ok() {
            self.ledger.mark_removed(id).await?;
        }
        result
    }

    async fn remove_native(&self, ctx: &OpContext, target: &RemovalTarget) -> Result<()> {
        let (event_type, result, native_id) = match target {
            RemovalTarget::Nat(native_id) => (
                EventType::RemoveNat,
                self.provider.remove_nat(ctx, native_id).await,
                native_id,
            ),
            RemovalTarget::Filter(native_id) => (
                EventType::ClosePort,
                self.provider.close_port(ctx, native_id).await,
                native_id,
            ),
        };

        if let Some(audit) = &self.audit {
            audit
                .record(
                    event_type,
                    self.provider.name(),
                    result.is_ok(),
                    serde_json::json!({ "native_id": native_id }),
                    result.as_ref().err().map(ToString::to_string),
                )
                .await;
        }
        result
    }

    pub async fn list_nat_rules(&self, ctx: &OpContext) -> Result<Vec<NatRule>> {
        self.provider.list_nat_rules(ctx).await
    }

    pub async fn list_filter_rules(&self, ctx: &OpContext) -> Result<Vec<FilterRule>> {
        self.provider.list_filter_rules(ctx).await
    }

    /// Ledger records, optionally narrowed to one product and/or to active rules.
    pub fn status(&self, product: Option<&str>, active_only: bool) -> Vec<&AppliedRuleRecord> {
        self.ledger
            .records()
            .iter()
            .filter(|r| product.is_none_or(|p| r.rule.product() == p))
            .filter(|r| !active_only || r.status == RuleStatus::Active)
            .collect()
    }

    /// Drops removed records from the ledger.
    pub async fn cleanup(&mut self) -> Result<usize> {
        let dropped = self.ledger.cleanup().await;
        if let Some(audit) = &self.audit {
            audit
                .record(
                    EventType::Cleanup,
                    self.provider.name(),
                    dropped.is_ok(),
                    serde_json::json!({ "dropped": dropped.as_ref().ok() }),
                    dropped.as_ref().err().map(ToString::to_string),
                )
                .await;
        }
        dropped
    }

    /// Probes a product binary and stores what was found in the ledger.
    pub async fn record_product(&mut self, name: &str) -> Result<ProductInfo> {
        let owned = name.to_string();
        let info = tokio::task::spawn_blocking(move || platform::probe_product(&owned))
            .await
            .map_err(std::io::Error::other)?;
        self.ledger.set_product_info(info.clone()).await?;
        Ok(info)
    }
}
