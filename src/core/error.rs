use crate::core::rule::Protocol;
use std::fmt;
use thiserror::Error;

/// Core error types for portly
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input; never reaches a backend
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// External port/protocol already in use
    #[error("Port {port}/{protocol} is {kind}")]
    Conflict {
        port: u16,
        protocol: Protocol,
        kind: ConflictKind,
    },

    /// Rule ID absent from the backend listing or the ledger
    #[error("Rule not found: {0}")]
    NotFound(String),

    /// Ledger already holds a record with this ID
    #[error("A rule with ID '{0}' is already recorded")]
    DuplicateId(String),

    /// Elevated privileges required but not held
    #[error("Permission denied: {0}")]
    Permission(String),

    /// No driver's probe succeeded
    #[error("No firewall backend available: {0}")]
    BackendUnavailable(String),

    /// A spawned native tool failed
    #[error("{program} failed: {message}")]
    ExternalTool {
        program: String,
        message: String,
        exit_code: Option<i32>,
    },

    /// Deadline expired or caller cancelled; the spawned process was killed
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Who already occupies a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// One of our own NAT rules maps the port
    Mapped { rule_id: String },
    /// The port is open or forwarded outside of portly's knowledge
    OpenExternally,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::Mapped { rule_id } => write!(f, "already mapped by rule {rule_id}"),
            ConflictKind::OpenExternally => write!(f, "already open outside of portly"),
        }
    }
}

impl Error {
    /// Maps an I/O failure on a native config file, surfacing missing privileges.
    pub fn from_io_at(path: &std::path::Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Error::Permission(format!("cannot write {}", path.display()))
        } else {
            Error::Io(std::io::Error::new(
                err.kind(),
                format!("{}: {err}", path.display()),
            ))
        }
    }

    /// Short stable name of the error kind, used in audit records.
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::Conflict { .. } => "conflict",
            Error::NotFound(_) => "not_found",
            Error::DuplicateId(_) => "duplicate_id",
            Error::Permission(_) => "permission",
            Error::BackendUnavailable(_) => "backend_unavailable",
            Error::ExternalTool { .. } => "external_tool",
            Error::Cancelled(_) => "cancelled",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }

    /// Translates this error into a user-facing message with suggestions.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::ExternalTool { program, message, .. } => {
                ToolErrorPattern::match_error(program, message)
            }
            Error::Conflict { port, protocol, kind } => {
                let translation = ErrorTranslation::new(self.to_string());
                match kind {
                    ConflictKind::Mapped { rule_id } => translation
                        .with_suggestion(format!("Remove the existing mapping first: portly nat remove {rule_id}"))
                        .with_suggestion("Or pick a different external port"),
                    ConflictKind::OpenExternally => translation
                        .with_suggestion(format!(
                            "Port {port}/{protocol} is managed outside portly - check the native firewall configuration"
                        ))
                        .with_suggestion("Or pick a different external port"),
                }
            }
            Error::Permission(_) => ErrorTranslation::new(self.to_string())
                .with_suggestion("Run portly as root, e.g. with sudo"),
            Error::BackendUnavailable(_) => ErrorTranslation::new(self.to_string())
                .with_suggestion("Install firewalld (RHEL/Fedora), nftables (Debian/Ubuntu) or use macOS pf")
                .with_suggestion("Or force a backend with \"backend\" in the config file"),
            Error::Cancelled(_) => ErrorTranslation::new(self.to_string())
                .with_suggestion("Increase the timeout with --timeout"),
            _ => ErrorTranslation::new(self.to_string()),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of native tool diagnostics and their translations
pub struct ToolErrorPattern;

impl ToolErrorPattern {
    /// Matches a tool diagnostic against known patterns and returns a user-friendly translation.
    pub fn match_error(program: &str, msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("authorization failed")
        {
            return ErrorTranslation::new(format!(
                "Insufficient permissions to run {program}"
            ))
            .with_suggestion("Run portly as root, e.g. with sudo")
            .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        if lower.contains("not running") {
            return ErrorTranslation::new("The firewall daemon is not running")
                .with_suggestion("Start it: systemctl start firewalld")
                .with_help("https://firewalld.org/documentation/");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new(format!("{program} is not installed or not found in PATH"))
                .with_suggestion("Install firewalld: sudo dnf install firewalld  (Fedora/RHEL)")
                .with_suggestion("Install nftables: sudo apt install nftables  (Debian/Ubuntu)");
        }

        if lower.contains("invalid_rule") || lower.contains("syntax error") {
            return ErrorTranslation::new("The native tool rejected the generated rule")
                .with_suggestion("Verify port numbers are between 1 and 65535")
                .with_suggestion("Ensure IP addresses are valid literals")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Simple_rule_management");
        }

        if lower.contains("netlink") {
            return ErrorTranslation::new("Communication error with kernel netlink interface")
                .with_suggestion("Check kernel modules: lsmod | grep nf_tables")
                .with_suggestion("Load nf_tables module: sudo modprobe nf_tables")
                .with_help("https://wiki.nftables.org/wiki-nftables/index.php/Troubleshooting");
        }

        if lower.contains("resource busy") {
            return ErrorTranslation::new("Firewall resource is busy")
                .with_suggestion("Another process may be modifying the firewall")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("pf not enabled") || lower.contains("pf already") {
            return ErrorTranslation::new("Packet filter state changed unexpectedly")
                .with_suggestion("Check pf status: sudo pfctl -s info");
        }

        ErrorTranslation::new(format!("{program} error: {}", msg.trim()))
            .with_suggestion("Check the detailed error message for more information")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
