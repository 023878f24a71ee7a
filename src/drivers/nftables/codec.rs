//! nftables rule grammar
//!
//! portly owns two tables in the `inet` family, a NAT table with a `prerouting` chain and
//! a filter table with an `input` chain. Every rule carries `comment "portly:<id>"` so the
//! caller's ID survives a round trip; rules without it get `nft-<handle>` (NAT) or
//! `nft-filter-<handle>` (filter) IDs.
//!
//! Annotated listings (`nft -a list chain ...`) look like
//!
//! ```text
//! table inet portly_nat {
//!     chain prerouting { # handle 1
//!         type nat hook prerouting priority dstnat; policy accept;
//!         tcp dport 8080 dnat ip to 10.0.0.5:80 comment "portly:web" # handle 4
//!     }
//! }
//! ```

use crate::core::exec::{CommandOutput, Outcome};
use crate::core::rule::{FilterKind, FilterRule, NatRule, Protocol};
use std::net::IpAddr;
use std::path::Path;

pub const NAT_CHAIN: &str = "prerouting";
pub const FILTER_CHAIN: &str = "input";
pub const NAT_CHAIN_SPEC: &str = "{ type nat hook prerouting priority dstnat; policy accept; }";
pub const FILTER_CHAIN_SPEC: &str = "{ type filter hook input priority 0; policy accept; }";

const COMMENT_PREFIX: &str = "portly:";

/// A decoded rule together with its kernel handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled<T> {
    pub rule: T,
    pub handle: u64,
}

fn comment(id: &str) -> String {
    format!("comment \"{COMMENT_PREFIX}{id}\"")
}

fn saddr_match(source: IpAddr) -> String {
    match source {
        IpAddr::V4(ip) => format!("ip saddr {ip}"),
        IpAddr::V6(ip) => format!("ip6 saddr {ip}"),
    }
}

/// Statement for `nft add rule inet <table> prerouting ...`.
pub fn encode_nat(rule: &NatRule) -> Option<String> {
    let target = match rule.target_addr()? {
        IpAddr::V4(ip) => format!("dnat ip to {ip}:{}", rule.internal_port),
        IpAddr::V6(ip) => format!("dnat ip6 to [{ip}]:{}", rule.internal_port),
    };
    Some(format!(
        "{} dport {} {target} {}",
        rule.protocol,
        rule.external_port,
        comment(&rule.id)
    ))
}

/// Statement for `nft add rule inet <table> input ...`.
pub fn encode_filter(rule: &FilterRule) -> Option<String> {
    let statement = match rule.kind {
        FilterKind::OpenPort => format!("{} dport {} accept", rule.protocol?, rule.port?),
        FilterKind::PortRestricted => format!(
            "{} {} dport {} accept",
            saddr_match(rule.source_addr()?),
            rule.protocol?,
            rule.port?
        ),
        FilterKind::TrustSource => format!("{} accept", saddr_match(rule.source_addr()?)),
    };
    Some(format!("{statement} {}", comment(&rule.id)))
}

/// Splits a statement into argv tokens. IDs never contain whitespace, so a plain split
/// keeps the quoted comment intact.
pub fn statement_args(statement: &str) -> Vec<String> {
    statement.split_whitespace().map(str::to_string).collect()
}

fn token_after<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == key)
        .and_then(|i| tokens.get(i + 1).copied())
}

fn handle_of(tokens: &[&str]) -> Option<u64> {
    token_after(tokens, "handle")?.parse().ok()
}

/// The ID carried in `comment "portly:<id>"`, if any.
fn comment_id(line: &str) -> Option<&str> {
    let start = line.find("comment \"")? + "comment \"".len();
    let end = line[start..].find('"')?;
    line[start..start + end].strip_prefix(COMMENT_PREFIX)
}

/// Protocol and port of a `tcp dport N` / `udp dport N` match.
fn dport(tokens: &[&str]) -> Option<(Protocol, u16)> {
    let i = tokens.iter().position(|t| *t == "dport")?;
    let protocol: Protocol = tokens.get(i.checked_sub(1)?)?.parse().ok()?;
    let port: u16 = tokens.get(i + 1)?.parse().ok()?;
    (port != 0).then_some((protocol, port))
}

/// Splits `10.0.0.5:80` or `[2001:db8::5]:80` into address and port.
fn split_target(target: &str) -> Option<(IpAddr, u16)> {
    let (addr, port) = if let Some(rest) = target.strip_prefix('[') {
        let (addr, port) = rest.split_once("]:")?;
        (addr, port)
    } else {
        target.rsplit_once(':')?
    };
    let port: u16 = port.parse().ok()?;
    (port != 0).then_some((addr.parse().ok()?, port))
}

/// Decodes one annotated `dnat` rule line. Lines without a handle, target address or
/// target port are skipped.
pub fn decode_nat_line(line: &str) -> Option<Handled<NatRule>> {
    let line = line.trim();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if !tokens.contains(&"dnat") {
        return None;
    }

    let handle = handle_of(&tokens)?;
    let (protocol, external_port) = dport(&tokens)?;
    let dnat_at = tokens.iter().position(|t| *t == "dnat")?;
    let target = token_after(&tokens[dnat_at..], "to")?;
    let (addr, internal_port) = split_target(target)?;

    let id = comment_id(line).map_or_else(|| format!("nft-{handle}"), str::to_string);
    Some(Handled {
        rule: NatRule::new(id, external_port, addr.to_string(), internal_port, protocol),
        handle,
    })
}

/// Decodes one annotated accept rule line of the filter chain.
pub fn decode_filter_line(line: &str) -> Option<Handled<FilterRule>> {
    let line = line.trim();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if !tokens.contains(&"accept") || tokens.contains(&"ct") || tokens.contains(&"iifname") {
        return None;
    }

    let handle = handle_of(&tokens)?;
    // A saddr that is a set or a prefix is not ours
    let source = match token_after(&tokens, "saddr") {
        Some(s) => Some(s.parse::<IpAddr>().ok()?),
        None => None,
    };
    let has_dport = tokens.contains(&"dport");
    let port = if has_dport { Some(dport(&tokens)?) } else { None };
    let id = comment_id(line).map_or_else(|| format!("nft-filter-{handle}"), str::to_string);

    let rule = match (source, port) {
        (None, Some((protocol, port))) => FilterRule::open_port(id, port, protocol),
        (Some(src), Some((protocol, port))) => {
            FilterRule::port_restricted(id, port, protocol, src.to_string())
        }
        (Some(src), None) => FilterRule::trust_source(id, src.to_string()),
        (None, None) => return None,
    };
    Some(Handled { rule, handle })
}

pub fn decode_nat_listing(output: &str) -> Vec<Handled<NatRule>> {
    output.lines().filter_map(decode_nat_line).collect()
}

pub fn decode_filter_listing(output: &str) -> Vec<Handled<FilterRule>> {
    output.lines().filter_map(decode_filter_line).collect()
}

/// Scans `nft list ruleset` for a `dnat` on `port`/`protocol` outside portly's own table.
pub fn foreign_dnat(ruleset: &str, own_table: &str, port: u16, protocol: Protocol) -> bool {
    let mut in_own_table = false;
    for line in ruleset.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("table ") {
            in_own_table = rest.split_whitespace().nth(1) == Some(own_table);
            continue;
        }
        if in_own_table || !line.split_whitespace().any(|t| t == "dnat") {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if dport(&tokens) == Some((protocol, port)) {
            return true;
        }
    }
    false
}

/// Fragment file contents from the (non-annotated) table listings.
pub fn render_fragment(tables: &[String]) -> String {
    let mut out = String::from("#!/usr/sbin/nft -f\n# Managed by portly. Do not edit.\n\n");
    for table in tables {
        out.push_str(table.trim_end());
        out.push_str("\n\n");
    }
    out
}

/// Main config with an `include` for `fragment`, or `None` if it is already included.
///
/// A missing main config (`None`) gets a minimal one that flushes and includes the fragment.
pub fn ensure_include(main_config: Option<&str>, fragment: &Path) -> Option<String> {
    let include = format!("include \"{}\"", fragment.display());
    match main_config {
        None => Some(format!("#!/usr/sbin/nft -f\n\nflush ruleset\n\n{include}\n")),
        Some(content) if content.lines().any(|l| l.trim() == include) => None,
        Some(content) => {
            let mut updated = content.to_string();
            if !updated.is_empty() && !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push('\n');
            updated.push_str(&include);
            updated.push('\n');
            Some(updated)
        }
    }
}

/// Maps `nft` diagnostics to an outcome.
pub fn classify(output: &CommandOutput) -> Outcome {
    if output.success {
        return Outcome::Success;
    }
    let text = output.combined();
    if text.contains("File exists") {
        Outcome::AlreadyExists
    } else if text.contains("No such file or directory") || text.contains("does not exist") {
        Outcome::Missing
    } else {
        Outcome::Failure
    }
}
