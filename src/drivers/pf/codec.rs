//! pf anchor file grammar
//!
//! Each rule is a block of metadata comments followed by one pf statement:
//!
//! ```text
//! # ID: web
//! # Type: nat
//! # Product: nginx
//! # Description: public web
//! rdr pass inet proto tcp from any to any port 8080 -> 10.0.0.5 port 80
//! ```
//!
//! The comments carry the fields pf itself forgets. Blocks are separated by a blank line.

use crate::core::exec::{CommandOutput, Outcome};
use crate::core::rule::{FilterKind, FilterRule, NatRule, Protocol};
use crate::validators::sanitize_comment;
use std::net::IpAddr;
use std::path::Path;

const NAT_TYPE: &str = "nat";

fn family(addr: IpAddr) -> &'static str {
    if addr.is_ipv6() { "inet6" } else { "inet" }
}

pub fn nat_statement(rule: &NatRule) -> Option<String> {
    let target = rule.target_addr()?;
    Some(format!(
        "rdr pass {} proto {} from any to any port {} -> {target} port {}",
        family(target),
        rule.protocol,
        rule.external_port,
        rule.internal_port
    ))
}

pub fn filter_statement(rule: &FilterRule) -> Option<String> {
    Some(match rule.kind {
        // No address family: the port opens for IPv4 and IPv6 alike
        FilterKind::OpenPort => format!(
            "pass in proto {} to any port {}",
            rule.protocol?,
            rule.port?
        ),
        FilterKind::PortRestricted => {
            let src = rule.source_addr()?;
            format!(
                "pass in {} proto {} from {src} to any port {}",
                family(src),
                rule.protocol?,
                rule.port?
            )
        }
        FilterKind::TrustSource => {
            let src = rule.source_addr()?;
            format!("pass in {} from {src} to any", family(src))
        }
    })
}

fn block(id: &str, kind: &str, product: &str, description: &str, statement: &str) -> String {
    let mut out = format!("# ID: {id}\n# Type: {kind}\n");
    if !product.is_empty() {
        out.push_str(&format!("# Product: {}\n", sanitize_comment(product)));
    }
    if !description.is_empty() {
        out.push_str(&format!("# Description: {}\n", sanitize_comment(description)));
    }
    out.push_str(statement);
    out.push('\n');
    out
}

pub fn encode_nat_block(rule: &NatRule) -> Option<String> {
    let statement = nat_statement(rule)?;
    Some(block(
        &rule.id,
        NAT_TYPE,
        &rule.product,
        &rule.description,
        &statement,
    ))
}

pub fn encode_filter_block(rule: &FilterRule) -> Option<String> {
    let statement = filter_statement(rule)?;
    Some(block(
        &rule.id,
        &rule.kind.to_string(),
        &rule.product,
        &rule.description,
        &statement,
    ))
}

/// Appends a block to anchor file content, keeping one blank line between blocks.
pub fn append_block(content: &str, block: &str) -> String {
    let trimmed = content.trim_end();
    if trimmed.is_empty() {
        block.to_string()
    } else {
        format!("{trimmed}\n\n{block}")
    }
}

#[derive(Debug, Default)]
struct Pending {
    id: String,
    kind: Option<String>,
    product: String,
    description: String,
}

fn words(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

fn value_after<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == key)
        .and_then(|i| tokens.get(i + 1).copied())
}

fn port_after(tokens: &[&str]) -> Option<u16> {
    let port: u16 = value_after(tokens, "port")?.parse().ok()?;
    (port != 0).then_some(port)
}

fn decode_nat_statement(meta: &Pending, line: &str) -> Option<NatRule> {
    let tokens = words(line);
    if tokens.first() != Some(&"rdr") {
        return None;
    }
    let arrow = tokens.iter().position(|t| *t == "->")?;
    let (before, after) = tokens.split_at(arrow);

    let protocol: Protocol = value_after(before, "proto")?.parse().ok()?;
    let external_port = port_after(before)?;
    let target: IpAddr = after.get(1)?.parse().ok()?;
    let internal_port = port_after(after)?;

    Some(
        NatRule::new(meta.id.clone(), external_port, target.to_string(), internal_port, protocol)
            .with_product(meta.product.clone())
            .with_description(meta.description.clone()),
    )
}

fn decode_filter_statement(meta: &Pending, line: &str) -> Option<FilterRule> {
    let tokens = words(line);
    if tokens.first() != Some(&"pass") {
        return None;
    }
    let source = match value_after(&tokens, "from") {
        Some("any") | None => None,
        Some(addr) => Some(addr.parse::<IpAddr>().ok()?),
    };
    let protocol = value_after(&tokens, "proto").and_then(|p| p.parse::<Protocol>().ok());
    let port = port_after(&tokens);

    let kind = match meta.kind.as_deref() {
        Some(kind) => kind.parse::<FilterKind>().ok()?,
        None => match (source, port) {
            (None, Some(_)) => FilterKind::OpenPort,
            (Some(_), Some(_)) => FilterKind::PortRestricted,
            (Some(_), None) => FilterKind::TrustSource,
            (None, None) => return None,
        },
    };

    let id = meta.id.clone();
    let rule = match kind {
        FilterKind::OpenPort => FilterRule::open_port(id, port?, protocol?),
        FilterKind::PortRestricted => {
            FilterRule::port_restricted(id, port?, protocol?, source?.to_string())
        }
        FilterKind::TrustSource => FilterRule::trust_source(id, source?.to_string()),
    };
    Some(
        rule.with_product(meta.product.clone())
            .with_description(meta.description.clone()),
    )
}

/// Walks anchor content, pairing each `# ID:` header with the next statement line.
fn decode_blocks<T>(content: &str, decode: impl Fn(&Pending, &str) -> Option<T>) -> Vec<T> {
    let mut rules = Vec::new();
    let mut pending: Option<Pending> = None;

    for line in content.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if let Some(id) = line.strip_prefix("# ID:") {
            pending = Some(Pending {
                id: id.trim().to_string(),
                ..Pending::default()
            });
            continue;
        }
        let Some(meta) = pending.as_mut() else {
            continue;
        };
        if let Some(kind) = line.strip_prefix("# Type:") {
            meta.kind = Some(kind.trim().to_string());
        } else if let Some(product) = line.strip_prefix("# Product:") {
            meta.product = product.trim().to_string();
        } else if let Some(description) = line.strip_prefix("# Description:") {
            meta.description = description.trim().to_string();
        } else if line.starts_with('#') {
            continue;
        } else {
            rules.extend(decode(&*meta, line));
            pending = None;
        }
    }
    rules
}

pub fn decode_nat(content: &str) -> Vec<NatRule> {
    decode_blocks(content, |meta, line| {
        if meta.kind.as_deref().is_some_and(|k| k != NAT_TYPE) {
            return None;
        }
        decode_nat_statement(meta, line)
    })
}

pub fn decode_filter(content: &str) -> Vec<FilterRule> {
    decode_blocks(content, |meta, line| {
        if meta.kind.as_deref() == Some(NAT_TYPE) {
            return None;
        }
        decode_filter_statement(meta, line)
    })
}

/// Content with the block for `id` removed, or `None` if no such block exists.
pub fn remove_block(content: &str, id: &str) -> Option<String> {
    let mut kept: Vec<&str> = Vec::new();
    let mut in_target = false;
    let mut found = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(block_id) = trimmed.strip_prefix("# ID:") {
            in_target = block_id.trim() == id;
            found |= in_target;
        }
        if in_target {
            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                in_target = false;
            }
            continue;
        }
        kept.push(line);
    }

    if !found {
        return None;
    }

    // Collapse the blank lines left behind
    let mut out = String::new();
    let mut blank = true;
    for line in kept {
        let is_blank = line.trim().is_empty();
        if is_blank && blank {
            continue;
        }
        out.push_str(line);
        out.push('\n');
        blank = is_blank;
    }
    Some(out.trim_end().to_string() + if out.trim().is_empty() { "" } else { "\n" })
}

/// Updated `pf.conf` referencing the anchor, or `None` if it already does.
///
/// A translation anchor (`rdr-anchor`) goes after the last existing translation anchor
/// line, since pf requires translation rules before filter rules. A filter anchor is
/// appended. In both cases a matching `load anchor` line is appended once.
pub fn ensure_anchor_reference(
    pf_conf: Option<&str>,
    anchor: &str,
    file: &Path,
    translation: bool,
) -> Option<String> {
    let reference = if translation {
        format!("rdr-anchor \"{anchor}\"")
    } else {
        format!("anchor \"{anchor}\"")
    };
    let load = format!("load anchor \"{anchor}\" from \"{}\"", file.display());

    let content = pf_conf.unwrap_or_default();
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let has = |lines: &[String], wanted: &str| lines.iter().any(|l| l.trim() == wanted);

    let mut changed = pf_conf.is_none();
    if !has(&lines, &reference) {
        let insert_at = if translation {
            lines
                .iter()
                .rposition(|l| {
                    let t = l.trim_start();
                    t.starts_with("scrub-anchor")
                        || t.starts_with("nat-anchor")
                        || t.starts_with("rdr-anchor")
                })
                .map_or(lines.len(), |i| i + 1)
        } else {
            lines.len()
        };
        lines.insert(insert_at, reference);
        changed = true;
    }
    if !has(&lines, &load) {
        lines.push(load);
        changed = true;
    }

    changed.then(|| {
        let mut out = lines.join("\n");
        out.push('\n');
        out
    })
}

/// True if `pfctl -s nat` output already redirects `port`/`protocol`.
pub fn nat_listing_has_port(listing: &str, port: u16, protocol: Protocol) -> bool {
    let wanted = port.to_string();
    listing.lines().any(|line| {
        let tokens = words(line);
        if tokens.first() != Some(&"rdr") {
            return false;
        }
        let Some(arrow) = tokens.iter().position(|t| *t == "->") else {
            return false;
        };
        let before = &tokens[..arrow];
        if value_after(before, "proto") != Some(protocol.as_str()) {
            return false;
        }
        before.windows(3).any(|w| w[0] == "port" && w[1] == "=" && w[2] == wanted)
            || before.windows(2).any(|w| w[0] == "port" && w[1] == wanted)
    })
}

/// True if `pfctl -s info` reports the packet filter as enabled.
pub fn pf_enabled(info: &str) -> bool {
    info.lines()
        .any(|l| l.trim_start().starts_with("Status: Enabled"))
}

/// Maps `pfctl` diagnostics to an outcome.
///
/// `pfctl` prints advisory lines ("No ALTQ support in kernel") on stderr even when it
/// succeeds, so only the exit status and a few known messages are trusted.
pub fn classify(output: &CommandOutput) -> Outcome {
    if output.success {
        return Outcome::Success;
    }
    let text = output.combined();
    if text.contains("already enabled") {
        Outcome::AlreadyExists
    } else if text.contains("No such file or directory") {
        Outcome::Missing
    } else {
        Outcome::Failure
    }
}
