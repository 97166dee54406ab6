//! Handlers for the informational subcommands.

/// `probe` helpers.
pub(crate) mod machine;
/// `sessions` helpers.
pub(crate) mod session;
/// `status` and `cancel` helpers.
pub(crate) mod status;

use std::time::Duration;

/// Coarse age like `45s`, `12m`, `3h` or `2d`.
pub(crate) fn format_age(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3_599 => format!("{}m", secs / 60),
        3_600..=86_399 => format!("{}h", secs / 3_600),
        _ => format!("{}d", secs / 86_400),
    }
}
