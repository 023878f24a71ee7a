//! Backend-neutral rule model
//!
//! Callers describe intent with a [`NatRule`] (port forwarding) or a [`FilterRule`]
//! (inbound port/address filtering). Every driver validates its input with
//! [`NatRule::validate`] / [`FilterRule::validate`] before issuing any external command.
//!
//! # Example
//!
//! ```
//! use portly::core::rule::{FilterRule, NatRule, Protocol};
//!
//! let nat = NatRule::new("web", 8080, "10.0.0.5", 80, Protocol::Tcp);
//! assert!(nat.validate().is_ok());
//!
//! let dns = FilterRule::open_port("dns", 53, Protocol::Udp);
//! assert!(dns.validate().is_ok());
//! ```

use crate::core::error::{Error, Result};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Transport protocol of a rule
///
/// Only TCP and UDP are representable; anything else is rejected when parsed.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    /// Lowercase name as used by every native tool
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// Parses a protocol name, returning a validation error for anything but tcp/udp.
    pub fn parse(input: &str) -> Result<Self> {
        input.trim().parse().map_err(|_| Error::Validation {
            field: "protocol".to_string(),
            message: format!("protocol must be 'tcp' or 'udp', got '{input}'"),
        })
    }
}

/// A port forwarding (destination NAT) rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NatRule {
    pub id: String,
    #[serde(default)]
    pub product: String,
    pub external_port: u16,
    pub internal_ip: String,
    pub internal_port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub description: String,
}

impl NatRule {
    pub fn new(
        id: impl Into<String>,
        external_port: u16,
        internal_ip: impl Into<String>,
        internal_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            id: id.into(),
            product: String::new(),
            external_port,
            internal_ip: internal_ip.into(),
            internal_port,
            protocol,
            description: String::new(),
        }
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Checks every field without side effects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        validators::validate_rule_id(&self.id).map_err(|m| invalid("id", m))?;
        validators::validate_port(self.external_port).map_err(|m| invalid("external_port", m))?;
        validators::validate_port(self.internal_port).map_err(|m| invalid("internal_port", m))?;
        validators::validate_ip(&self.internal_ip).map_err(|m| invalid("internal_ip", m))?;
        Ok(())
    }

    /// Parsed target address. Only meaningful after [`NatRule::validate`] succeeded.
    pub fn target_addr(&self) -> Option<IpAddr> {
        self.internal_ip.parse().ok()
    }

    /// True when both rules forward the same external port/protocol to the same target.
    pub fn same_mapping(&self, other: &NatRule) -> bool {
        self.external_port == other.external_port
            && self.protocol == other.protocol
            && self.internal_port == other.internal_port
            && same_address(&self.internal_ip, &other.internal_ip)
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}/{}) -> {}:{}",
            self.id, self.external_port, self.protocol, self.internal_ip, self.internal_port
        )
    }
}

/// What a filter rule allows
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FilterKind {
    /// Port open to everyone
    OpenPort,
    /// Port open to a single source address
    PortRestricted,
    /// All traffic from a source address
    TrustSource,
}

/// An inbound filter rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterRule {
    pub id: String,
    pub kind: FilterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub description: String,
}

/// Identity of a filter rule derived from its semantic fields.
///
/// Used to de-duplicate listings that merge several native stores and to match a
/// ledger record against a backend listing when the backend does not keep IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey {
    pub kind: FilterKind,
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub source: Option<String>,
}

impl FilterRule {
    pub fn open_port(id: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            id: id.into(),
            kind: FilterKind::OpenPort,
            port: Some(port),
            protocol: Some(protocol),
            source: None,
            product: String::new(),
            description: String::new(),
        }
    }

    pub fn port_restricted(
        id: impl Into<String>,
        port: u16,
        protocol: Protocol,
        source: impl Into<String>,
    ) -> Self {
        Self {
            kind: FilterKind::PortRestricted,
            source: Some(source.into()),
            ..Self::open_port(id, port, protocol)
        }
    }

    pub fn trust_source(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: FilterKind::TrustSource,
            port: None,
            protocol: None,
            source: Some(source.into()),
            product: String::new(),
            description: String::new(),
        }
    }

    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Checks every field required by the rule's kind.
    ///
    /// Port and protocol are ignored for [`FilterKind::TrustSource`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        validators::validate_rule_id(&self.id).map_err(|m| invalid("id", m))?;

        if self.kind != FilterKind::TrustSource {
            let port = self
                .port
                .ok_or_else(|| invalid("port", "port is required".to_string()))?;
            validators::validate_port(port).map_err(|m| invalid("port", m))?;
            if self.protocol.is_none() {
                return Err(invalid("protocol", "protocol is required".to_string()));
            }
        }

        match (self.kind, self.source.as_deref()) {
            (FilterKind::OpenPort, Some(_)) => Err(invalid(
                "source",
                "open-port rules do not take a source address".to_string(),
            )),
            (FilterKind::OpenPort, None) => Ok(()),
            (_, Some(source)) => validators::validate_ip(source)
                .map(drop)
                .map_err(|m| invalid("source", m)),
            (_, None) => Err(invalid("source", "source address is required".to_string())),
        }
    }

    /// Parsed source address, if any.
    pub fn source_addr(&self) -> Option<IpAddr> {
        self.source.as_deref().and_then(|s| s.parse().ok())
    }

    /// The (kind, port, protocol, source) identity of this rule.
    pub fn key(&self) -> RuleKey {
        let trust = self.kind == FilterKind::TrustSource;
        RuleKey {
            kind: self.kind,
            port: if trust { None } else { self.port },
            protocol: if trust { None } else { self.protocol },
            source: self.source.as_deref().map(canonical_address),
        }
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.kind)?;
        if let (Some(port), Some(proto)) = (self.port, self.protocol)
            && self.kind != FilterKind::TrustSource
        {
            write!(f, " {port}/{proto}")?;
        }
        if let Some(source) = &self.source {
            write!(f, " from {source}")?;
        }
        Ok(())
    }
}

fn invalid(field: &str, message: String) -> Error {
    Error::Validation {
        field: field.to_string(),
        message,
    }
}

/// Normalises an address literal so `2001:DB8::1` and `2001:db8::1` compare equal.
fn canonical_address(addr: &str) -> String {
    addr.parse::<IpAddr>()
        .map_or_else(|_| addr.to_string(), |ip| ip.to_string())
}

fn same_address(a: &str, b: &str) -> bool {
    canonical_address(a) == canonical_address(b)
}
