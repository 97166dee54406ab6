//! Approval policy engine.
//!
//! Decides per command whether a human must be asked, consulting the set of
//! trusted prefixes the user accumulated with "approve similar".

pub mod intent;

use std::collections::BTreeSet;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::command_tokens::command_prefix;

/// Backend approval policy, as configured or stored per conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalPolicy {
    Never,
    Untrusted,
    OnRequest,
    OnFailure,
    /// Anything unrecognized. Always prompts.
    Other(String),
}

impl ApprovalPolicy {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "never" => Self::Never,
            "untrusted" => Self::Untrusted,
            "on-request" => Self::OnRequest,
            "on-failure" => Self::OnFailure,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Never => "never",
            Self::Untrusted => "untrusted",
            Self::OnRequest => "on-request",
            Self::OnFailure => "on-failure",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for ApprovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ApprovalPolicy {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalCheck {
    pub needs_prompt: bool,
    /// First `prefix_tokens` shell tokens, space-joined. Always computed.
    pub canonical_prefix: String,
}

/// Decide whether `command` needs a human decision under `policy`.
pub fn should_prompt_for_approval(
    policy: &ApprovalPolicy,
    command: &str,
    trusted_prefixes: &BTreeSet<String>,
    prefix_tokens: usize,
) -> ApprovalCheck {
    let canonical_prefix = command_prefix(command, prefix_tokens);
    let needs_prompt = match policy {
        ApprovalPolicy::Never => false,
        // Strict mode ignores cached trust.
        ApprovalPolicy::Untrusted => true,
        ApprovalPolicy::OnRequest => !trusted_prefixes.contains(&canonical_prefix),
        ApprovalPolicy::OnFailure => true,
        ApprovalPolicy::Other(_) => true,
    };
    ApprovalCheck {
        needs_prompt,
        canonical_prefix,
    }
}

/// Short stable tag identifying a command in logs without echoing it.
pub fn command_tag(command: &str) -> String {
    let digest = Sha256::digest(command.as_bytes());
    digest
        .iter()
        .take(6)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
