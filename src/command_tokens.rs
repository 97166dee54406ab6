//! Shell-word tokenization and trust-key prefixes for commands.
//!
//! Approval gating runs on attacker-influenced strings, so nothing here
//! returns an error: malformed quoting degrades to whitespace splitting.

/// Split a command line using POSIX shell-word rules.
///
/// Falls back to plain whitespace splitting when quoting is malformed.
pub fn split_command(command: &str) -> Vec<String> {
    match shell_words::split(command) {
        Ok(tokens) => tokens,
        Err(_) => command.split_whitespace().map(str::to_string).collect(),
    }
}

/// Strict variant used by heuristics that must fail closed on bad quoting.
pub fn try_split_command(command: &str) -> Option<Vec<String>> {
    shell_words::split(command).ok()
}

/// Join the first `n` tokens with single spaces.
pub fn prefix_string<S: AsRef<str>>(tokens: &[S], n: usize) -> String {
    tokens
        .iter()
        .take(n)
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical trust key for `command`: its first `prefix_tokens` shell words.
pub fn command_prefix(command: &str, prefix_tokens: usize) -> String {
    prefix_string(&split_command(command), prefix_tokens)
}

/// Render an argv list as one POSIX-quoted command line.
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    shell_words::join(argv.iter().map(AsRef::as_ref))
}
