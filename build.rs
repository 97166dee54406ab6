//! Stamps the commit and build time into `agentrelay --version`.
//!
//! Both values can be pinned through the environment for reproducible builds;
//! without git or `date` they read "unknown".

use std::env;
use std::process::Command;

const GIT_HASH_VAR: &str = "AGENTRELAY_BUILD_GIT_HASH";
const TIMESTAMP_VAR: &str = "AGENTRELAY_BUILD_TIMESTAMP";

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    if let Some(branch) = std::fs::read_to_string(".git/HEAD")
        .ok()
        .and_then(|head| head.trim().strip_prefix("ref: ").map(str::to_string))
    {
        println!("cargo:rerun-if-changed=.git/{branch}");
    }

    for (var, fallback) in [
        (GIT_HASH_VAR, capture("git", &["rev-parse", "--short=12", "HEAD"])),
        (TIMESTAMP_VAR, capture("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])),
    ] {
        println!("cargo:rerun-if-env-changed={var}");
        let value = env::var(var)
            .ok()
            .or(fallback)
            .unwrap_or_else(|| "unknown".to_string());
        println!("cargo:rustc-env={var}={value}");
    }
}

fn capture(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string()).filter(|value| !value.is_empty())
}
