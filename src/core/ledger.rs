//! Persistent ledger of rules applied by portly
//!
//! The native firewall is the source of truth for what is *enforced*; the ledger records
//! what portly itself *did*, including things the native listing cannot recover (owning
//! product, failures with their message, removal history).
//!
//! The ledger never talks to a backend. It is saved atomically after every mutation
//! (temporary file + rename) together with a SHA-256 sidecar. There is no inter-process
//! locking: two concurrent portly processes race and the last save wins.

use crate::core::error::{Error, Result};
use crate::core::rule::{FilterRule, NatRule};
use crate::platform::OsInfo;
use crate::utils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Schema version written into new ledgers
pub const LEDGER_VERSION: &str = "1.0.0";

/// Lifecycle of an applied rule
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuleStatus {
    Pending,
    Active,
    Failed,
    Removed,
}

/// Which of the two rule families a rule belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RuleFamily {
    Nat,
    Filter,
}

/// Either rule family, as stored in the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ManagedRule {
    Nat(NatRule),
    Filter(FilterRule),
}

impl ManagedRule {
    pub fn id(&self) -> &str {
        match self {
            ManagedRule::Nat(rule) => &rule.id,
            ManagedRule::Filter(rule) => &rule.id,
        }
    }

    pub fn product(&self) -> &str {
        match self {
            ManagedRule::Nat(rule) => &rule.product,
            ManagedRule::Filter(rule) => &rule.product,
        }
    }

    pub const fn family(&self) -> RuleFamily {
        match self {
            ManagedRule::Nat(_) => RuleFamily::Nat,
            ManagedRule::Filter(_) => RuleFamily::Filter,
        }
    }

    /// True if both rules are enforced by the same native rule, whatever their IDs.
    pub fn same_native(&self, other: &ManagedRule) -> bool {
        match (self, other) {
            (ManagedRule::Nat(a), ManagedRule::Nat(b)) => a.same_mapping(b),
            (ManagedRule::Filter(a), ManagedRule::Filter(b)) => a.key() == b.key(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ManagedRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManagedRule::Nat(rule) => write!(f, "nat {rule}"),
            ManagedRule::Filter(rule) => write!(f, "filter {rule}"),
        }
    }
}

/// A rule plus its lifecycle status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedRuleRecord {
    pub rule: ManagedRule,
    pub status: RuleStatus,
    pub applied_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppliedRuleRecord {
    /// A new record in `Pending` state, stamped now.
    pub fn pending(rule: ManagedRule) -> Self {
        Self {
            rule,
            status: RuleStatus::Pending,
            applied_at: Utc::now(),
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        self.rule.id()
    }
}

/// OS descriptor captured when the ledger was created
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsDescriptor {
    pub family: String,
    #[serde(default)]
    pub distribution: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub codename: String,
}

impl From<&OsInfo> for OsDescriptor {
    fn from(os: &OsInfo) -> Self {
        Self {
            family: os.family.to_string(),
            distribution: os.distribution.clone(),
            version: os.version.clone(),
            codename: os.codename.clone(),
        }
    }
}

/// Last-seen installation metadata of a product
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProductInfo {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub is_installed: bool,
}

/// On-disk aggregate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    pub version: String,
    pub os: OsDescriptor,
    #[serde(default)]
    pub rules: Vec<AppliedRuleRecord>,
    #[serde(default)]
    pub products: BTreeMap<String, ProductInfo>,
    pub last_updated: DateTime<Utc>,
}

impl State {
    pub fn new(os: OsDescriptor) -> Self {
        Self {
            version: LEDGER_VERSION.to_string(),
            os,
            rules: Vec::new(),
            products: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.id() == id)
    }
}

/// File-backed rule ledger
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    state: State,
}

impl Ledger {
    /// Loads the ledger at `path`, initializing (and saving) a fresh one if it does not exist.
    ///
    /// A checksum sidecar that does not match is only logged; the ledger may have been
    /// edited by hand.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or parsed, or if a fresh ledger
    /// cannot be written.
    pub async fn load(path: impl AsRef<Path>, os: OsDescriptor) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No ledger at {}, initializing", path.display());
                return Self::initialize(path, os).await;
            }
            Err(e) => return Err(Error::from_io_at(&path, e)),
        };

        if let Ok(expected) = tokio::fs::read_to_string(checksum_path(&path)).await {
            let actual = utils::sha256_hex(json.as_bytes());
            if expected.trim() != actual {
                warn!(
                    "Ledger {} checksum mismatch (expected: {}, got: {})",
                    path.display(),
                    expected.trim(),
                    actual
                );
            }
        }

        let state: State = serde_json::from_str(&json)?;
        debug!("Loaded ledger with {} records", state.rules.len());
        Ok(Self { path, state })
    }

    /// Creates a new empty ledger at `path` and saves it.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file cannot be written.
    pub async fn initialize(path: impl AsRef<Path>, os: OsDescriptor) -> Result<Self> {
        let mut ledger = Self {
            path: path.as_ref().to_path_buf(),
            state: State::new(os),
        };
        ledger.save().await?;
        Ok(ledger)
    }

    /// Atomically writes the ledger and its checksum sidecar.
    ///
    /// # Errors
    ///
    /// Returns `Err` if serialization or the write fails.
    pub async fn save(&mut self) -> Result<()> {
        self.state.last_updated = Utc::now();
        let json = serde_json::to_string_pretty(&self.state)?;

        utils::write_file_atomic(&self.path, json.clone().into_bytes(), 0o600)
            .await
            .map_err(|e| Error::from_io_at(&self.path, e))?;

        let checksum = utils::sha256_hex(json.as_bytes());
        let sidecar = checksum_path(&self.path);
        if let Err(e) = tokio::fs::write(&sidecar, checksum).await {
            warn!("Failed to write ledger checksum {}: {e}", sidecar.display());
        }

        debug!("Saved ledger to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// All records in insertion order.
    pub fn records(&self) -> &[AppliedRuleRecord] {
        &self.state.rules
    }

    pub fn get(&self, id: &str) -> Option<&AppliedRuleRecord> {
        self.state.rules.iter().find(|r| r.id() == id)
    }

    pub fn by_product(&self, product: &str) -> Vec<&AppliedRuleRecord> {
        self.state
            .rules
            .iter()
            .filter(|r| r.rule.product() == product)
            .collect()
    }

    pub fn active(&self) -> Vec<&AppliedRuleRecord> {
        self.state
            .rules
            .iter()
            .filter(|r| r.status == RuleStatus::Active)
            .collect()
    }

    /// Appends a record and saves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateId`] if a record with the same ID exists.
    pub async fn add_record(&mut self, record: AppliedRuleRecord) -> Result<()> {
        if self.state.position(record.id()).is_some() {
            return Err(Error::DuplicateId(record.id().to_string()));
        }
        self.state.rules.push(record);
        self.save().await
    }

    /// Replaces the record with the same ID in place and saves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no record has that ID.
    pub async fn update_record(&mut self, record: AppliedRuleRecord) -> Result<()> {
        let index = self
            .state
            .position(record.id())
            .ok_or_else(|| Error::NotFound(record.id().to_string()))?;
        self.state.rules[index] = record;
        self.save().await
    }

    /// Deletes the record and saves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no record has that ID.
    pub async fn remove_record(&mut self, id: &str) -> Result<AppliedRuleRecord> {
        let index = self
            .state
            .position(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let record = self.state.rules.remove(index);
        self.save().await?;
        Ok(record)
    }

    async fn set_status(&mut self, id: &str, status: RuleStatus, error: Option<String>) -> Result<()> {
        let record = self
            .state
            .rules
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.status = status;
        record.error = error;
        if status == RuleStatus::Active {
            record.applied_at = Utc::now();
        }
        self.save().await
    }

    /// Transitions a record to `Active` and saves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no record has that ID.
    pub async fn mark_active(&mut self, id: &str) -> Result<()> {
        self.set_status(id, RuleStatus::Active, None).await
    }

    /// Transitions a record to `Failed` with `message` and saves immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no record has that ID.
    pub async fn mark_failed(&mut self, id: &str, message: impl Into<String>) -> Result<()> {
        self.set_status(id, RuleStatus::Failed, Some(message.into()))
            .await
    }

    /// Transitions a record to `Removed` and saves.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no record has that ID.
    pub async fn mark_removed(&mut self, id: &str) -> Result<()> {
        self.set_status(id, RuleStatus::Removed, None).await
    }

    /// Drops every `Removed` record and saves. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the save fails.
    pub async fn cleanup(&mut self) -> Result<usize> {
        let before = self.state.rules.len();
        self.state.rules.retain(|r| r.status != RuleStatus::Removed);
        let dropped = before - self.state.rules.len();
        self.save().await?;
        Ok(dropped)
    }

    pub fn product_info(&self, name: &str) -> Option<&ProductInfo> {
        self.state.products.get(name)
    }

    /// Stores product metadata under its name and saves.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the save fails.
    pub async fn set_product_info(&mut self, info: ProductInfo) -> Result<()> {
        self.state.products.insert(info.name.clone(), info);
        self.save().await
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}
