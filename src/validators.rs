//! Input validation and sanitization functions for portly
//!
//! Every value that ends up inside a native command line or a native config file
//! passes through here first. The functions return plain `String` messages; the rule
//! model wraps them into [`crate::Error::Validation`] together with the field name.

use std::net::IpAddr;

/// Maximum length of a rule ID.
///
/// IDs are embedded in nftables comments (max 128 bytes including the `portly:` prefix)
/// and in pf anchor comment lines.
pub const MAX_RULE_ID_LEN: usize = 64;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Parses a port from user input, accepting only 1-65535.
///
/// # Errors
///
/// Returns `Err` for non-numeric input, 0, or anything above 65535.
///
/// # Examples
///
/// ```
/// use portly::validators::parse_port;
///
/// assert_eq!(parse_port("8080"), Ok(8080));
/// assert!(parse_port("0").is_err());
/// assert!(parse_port("65536").is_err());
/// ```
pub fn parse_port(input: &str) -> Result<u16, String> {
    let value: u32 = input
        .trim()
        .parse()
        .map_err(|_| format!("'{input}' is not a port number"))?;
    let port = u16::try_from(value).map_err(|_| "Port must be between 1 and 65535".to_string())?;
    validate_port(port)
}

/// Validates an IPv4 or IPv6 address literal (no CIDR, no hostnames).
///
/// # Errors
///
/// Returns `Err` if the input does not parse as an IP address.
pub fn validate_ip(input: &str) -> Result<IpAddr, String> {
    input
        .parse::<IpAddr>()
        .map_err(|_| format!("'{input}' is not a valid IP address"))
}

/// Validates an opaque rule ID.
///
/// IDs are written verbatim into native comments, so anything that could break out of
/// a comment line or a quoted string is refused.
///
/// # Errors
///
/// Returns `Err` if the ID is empty, too long, or contains whitespace, quotes or
/// control characters.
pub fn validate_rule_id(id: &str) -> Result<&str, String> {
    if id.is_empty() {
        return Err("Rule ID is required".to_string());
    }

    if id.len() > MAX_RULE_ID_LEN {
        return Err(format!("Rule ID too long (max {MAX_RULE_ID_LEN} characters)"));
    }

    if id
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '\\' | '#'))
    {
        return Err("Rule ID contains invalid characters".to_string());
    }

    Ok(id)
}

/// Sanitizes free text (product, description) for a single comment line.
///
/// Control characters (including newlines) become spaces, quotes are dropped and the
/// result is capped at 128 characters.
///
/// # Examples
///
/// ```
/// use portly::validators::sanitize_comment;
///
/// assert_eq!(sanitize_comment("Web\nserver \"prod\""), "Web server prod");
/// ```
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '"' | '\''))
        .map(|c| if c.is_control() { ' ' } else { c })
        .take(128)
        .collect::<String>()
        .trim()
        .to_string()
}
