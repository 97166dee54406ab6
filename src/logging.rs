//! Diagnostic logging setup.
//!
//! Logs go to stderr so they never interleave with assistant text on stdout.
//! The filter comes from `AGENTRELAY_LOG`, then `RUST_LOG`, then the `-v`
//! count on the command line.

use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "AGENTRELAY_LOG";

/// Default directive for a given `-v` count.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "agentrelay=info,warn",
        2 => "agentrelay=debug,info",
        _ => "trace",
    }
}

fn filter_from_sources<F>(verbosity: u8, env_lookup: F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|name| env_lookup(name))
        .filter(|value| !value.trim().is_empty())
        .find_map(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(verbosity)))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(verbosity: u8) {
    let filter = filter_from_sources(verbosity, |name| std::env::var(name).ok());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_crate_level() {
        assert_eq!(default_directive(0), "warn");
        assert!(default_directive(1).starts_with("agentrelay=info"));
        assert_eq!(default_directive(9), "trace");
    }

    #[test]
    fn crate_variable_wins_over_rust_log() {
        let filter = filter_from_sources(0, |name| match name {
            LOG_ENV => Some("debug".into()),
            "RUST_LOG" => Some("error".into()),
            _ => None,
        });
        assert_eq!(filter.to_string(), "debug");
    }

    #[test]
    fn blank_variables_fall_back_to_verbosity() {
        let filter = filter_from_sources(1, |name| match name {
            LOG_ENV => Some("   ".into()),
            _ => None,
        });
        assert_eq!(filter.to_string(), EnvFilter::new(default_directive(1)).to_string());
    }
}
