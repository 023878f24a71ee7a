//! firewalld rich-rule grammar
//!
//! Rich rules are single lines of quoted `key="value"` attributes, e.g.
//!
//! ```text
//! rule family="ipv4" forward-port port="8080" protocol="tcp" to-port="80" to-addr="10.0.0.5"
//! rule family="ipv4" source address="192.0.2.7" port port="22" protocol="tcp" accept
//! rule family="ipv4" source address="203.0.113.5" accept
//! ```
//!
//! firewalld keeps no identity for a rule, so removal re-encodes the exact rule string and
//! IDs are derived deterministically from the rule's fields.

use crate::core::exec::{CommandOutput, Outcome};
use crate::core::rule::{FilterKind, FilterRule, NatRule, Protocol};
use std::net::IpAddr;

/// Address family attribute for an address literal.
fn family(addr: Option<IpAddr>) -> &'static str {
    match addr {
        Some(IpAddr::V6(_)) => "ipv6",
        _ => "ipv4",
    }
}

pub fn nat_id(port: u16, protocol: Protocol) -> String {
    format!("fw-nat-{port}-{protocol}")
}

pub fn port_id(port: u16, protocol: Protocol) -> String {
    format!("fw-port-{port}-{protocol}")
}

pub fn limit_id(source: &str, port: u16, protocol: Protocol) -> String {
    format!("fw-limit-{source}-{port}-{protocol}")
}

pub fn trust_id(source: &str) -> String {
    format!("fw-trust-{source}")
}

/// Rich rule forwarding the rule's external port to its target.
pub fn encode_nat(rule: &NatRule) -> String {
    let target = rule
        .target_addr()
        .map_or_else(|| rule.internal_ip.clone(), |ip| ip.to_string());
    format!(
        r#"rule family="{}" forward-port port="{}" protocol="{}" to-port="{}" to-addr="{}""#,
        family(rule.target_addr()),
        rule.external_port,
        rule.protocol,
        rule.internal_port,
        target
    )
}

/// Rich rule for a source-restricted or trusted-source filter.
///
/// Returns `None` for plain open ports, which use `--add-port` instead.
pub fn encode_filter(rule: &FilterRule) -> Option<String> {
    let source = rule.source_addr()?;
    match rule.kind {
        FilterKind::OpenPort => None,
        FilterKind::PortRestricted => Some(format!(
            r#"rule family="{}" source address="{}" port port="{}" protocol="{}" accept"#,
            family(Some(source)),
            source,
            rule.port?,
            rule.protocol?
        )),
        FilterKind::TrustSource => Some(format!(
            r#"rule family="{}" source address="{}" accept"#,
            family(Some(source)),
            source
        )),
    }
}

/// `--add-port` argument for an open-port rule, e.g. `53/udp`.
pub fn port_spec(port: u16, protocol: Protocol) -> String {
    format!("{port}/{protocol}")
}

/// Finds the quoted value of `key` in a rich rule.
///
/// The key must start the line or follow whitespace, so `port` never matches `to-port`.
pub fn extract_attr<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("{key}=\"");
    let mut search_from = 0;

    while let Some(offset) = line[search_from..].find(&pattern) {
        let start = search_from + offset;
        let at_boundary = line[..start]
            .chars()
            .next_back()
            .is_none_or(char::is_whitespace);
        let value_start = start + pattern.len();
        if at_boundary {
            let end = line[value_start..].find('"')?;
            return Some(&line[value_start..value_start + end]);
        }
        search_from = value_start;
    }
    None
}

fn parse_protocol(value: Option<&str>) -> Option<Protocol> {
    value.and_then(|p| p.parse().ok())
}

/// Decodes a `forward-port` rich rule; rules without a target address or port are skipped.
pub fn decode_nat(line: &str) -> Option<NatRule> {
    let line = line.trim();
    if !line.starts_with("rule ") || !line.contains(" forward-port ") {
        return None;
    }

    let port: u16 = extract_attr(line, "port")?.parse().ok()?;
    let protocol = parse_protocol(extract_attr(line, "protocol"))?;
    let to_port: u16 = extract_attr(line, "to-port")?.parse().ok()?;
    let to_addr = extract_attr(line, "to-addr")?;
    if port == 0 || to_port == 0 || to_addr.parse::<IpAddr>().is_err() {
        return None;
    }

    Some(NatRule::new(
        nat_id(port, protocol),
        port,
        to_addr,
        to_port,
        protocol,
    ))
}

/// Decodes an accepting `source address` rich rule into a restricted or trusted filter.
pub fn decode_filter(line: &str) -> Option<FilterRule> {
    let line = line.trim();
    if !line.starts_with("rule ") || !line.ends_with(" accept") || line.contains(" forward-port ")
    {
        return None;
    }
    // Service, icmp and masquerade elements are not ours to decode
    if line.contains(" service ") || line.contains(" icmp-") || line.contains(" masquerade") {
        return None;
    }

    let source = extract_attr(line, "source address")?;
    source.parse::<IpAddr>().ok()?;

    if line.contains(" port port=") {
        let port: u16 = extract_attr(line, "port")?.parse().ok()?;
        if port == 0 {
            return None;
        }
        let protocol = parse_protocol(extract_attr(line, "protocol"))?;
        Some(FilterRule::port_restricted(
            limit_id(source, port, protocol),
            port,
            protocol,
            source,
        ))
    } else if line.contains(" port ") || line.contains(" protocol ") {
        None
    } else {
        Some(FilterRule::trust_source(trust_id(source), source))
    }
}

/// Decodes `--list-ports` output (`80/tcp 53/udp ...`); ranges and other protocols are skipped.
pub fn decode_port_list(output: &str) -> Vec<FilterRule> {
    output
        .split_whitespace()
        .filter_map(|token| {
            let (port, protocol) = token.split_once('/')?;
            let port: u16 = port.parse().ok()?;
            let protocol: Protocol = protocol.parse().ok()?;
            (port != 0).then(|| FilterRule::open_port(port_id(port, protocol), port, protocol))
        })
        .collect()
}

/// Rich rule lines of `--list-rich-rules` output.
pub fn rich_rule_lines(output: &str) -> impl Iterator<Item = &str> {
    output.lines().map(str::trim).filter(|l| !l.is_empty())
}

/// Maps `firewall-cmd` diagnostics to an outcome.
///
/// Recent versions print `Warning: ALREADY_ENABLED` with exit 0, older ones fail with
/// `Error: ALREADY_ENABLED`; both count as already present.
pub fn classify(output: &CommandOutput) -> Outcome {
    let text = output.combined();
    if text.contains("ALREADY_ENABLED") || text.contains("already enabled") {
        Outcome::AlreadyExists
    } else if text.contains("NOT_ENABLED") {
        Outcome::Missing
    } else if output.success {
        Outcome::Success
    } else {
        Outcome::Failure
    }
}
