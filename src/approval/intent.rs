//! Write-intent heuristic used as a second line of defense.
//!
//! Under the strict policy the legacy stream may start tools without ever
//! asking. Commands that look like they mutate the filesystem or a repository
//! are intercepted and routed through a relay-side approval instead.
//!
//! Writes performed indirectly by interpreters (`python script.py`,
//! `node build.js`) are not detected.

use crate::command_tokens::try_split_command;

const WRITE_COMMANDS: &[&str] = &[
    "rm", "rmdir", "mkdir", "mv", "cp", "touch", "chmod", "chown", "ln", "tee", "truncate", "dd",
];

const GIT_WRITE_SUBCOMMANDS: &[&str] = &[
    "add",
    "am",
    "apply",
    "checkout",
    "cherry-pick",
    "clean",
    "clone",
    "commit",
    "init",
    "merge",
    "pull",
    "push",
    "rebase",
    "reset",
    "restore",
    "rm",
    "stash",
    "switch",
];

const SHELL_WRAPPERS: &[&str] = &["bash", "/bin/bash", "sh", "/bin/sh"];

/// Whether `command` likely writes to the filesystem or a repository.
///
/// Unparseable input fails closed.
pub fn needs_write_approval(command: &str) -> bool {
    let command = command.trim();
    if command.is_empty() {
        return false;
    }
    let Some(tokens) = try_split_command(command) else {
        return true;
    };
    if tokens.is_empty() {
        return false;
    }

    // `bash -lc "<inner>"`: judge the inner command.
    if tokens.len() >= 3
        && SHELL_WRAPPERS.contains(&tokens[0].as_str())
        && tokens[1] == "-lc"
        && !tokens[2].trim().is_empty()
    {
        return needs_write_approval(&tokens[2]);
    }

    for (i, token) in tokens.iter().enumerate() {
        if token.contains('>') && token != "2>&1" {
            return true;
        }
        if WRITE_COMMANDS.contains(&token.as_str()) {
            return true;
        }
        if token == "sed" && tokens[i + 1..].iter().any(|t| t.starts_with("-i")) {
            return true;
        }
        if token == "git" {
            if let Some(sub) = tokens.get(i + 1) {
                if GIT_WRITE_SUBCOMMANDS.contains(&sub.as_str()) {
                    return true;
                }
            }
        }
    }
    false
}
