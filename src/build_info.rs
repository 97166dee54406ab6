//! Identity and build stamps of this relay.

/// Package version, also reported to the backend during `initialize`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name the relay uses when it introduces itself to a backend.
pub const CLIENT_NAME: &str = "agentrelay";

pub const GIT_COMMIT: &str = env!("AGENTRELAY_BUILD_GIT_HASH");
pub const BUILD_TIMESTAMP: &str = env!("AGENTRELAY_BUILD_TIMESTAMP");

/// `--version` text: package version plus where it was built from.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (commit ",
    env!("AGENTRELAY_BUILD_GIT_HASH"),
    ", built ",
    env!("AGENTRELAY_BUILD_TIMESTAMP"),
    ")"
);
