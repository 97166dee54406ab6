//! CLI argument parsing via clap.

use agentrelay::build_info::LONG_VERSION;
use clap::{ArgAction, Parser, Subcommand};

/// Relay prompts to a coding-agent CLI on local or ssh machines.
#[derive(Debug, Parser)]
#[command(name = "agentrelay", version = LONG_VERSION)]
pub struct Args {
    /// Path to config file (default: ./agentrelay.toml or ~/.config/agentrelay/agentrelay.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    /// Conversation whose thread, machine and approvals are used.
    #[arg(long = "conversation", global = true, default_value = "default")]
    pub conversation: String,

    /// Machine to use; switching machines starts a new thread.
    #[arg(short = 'm', long = "machine", global = true)]
    pub machine: Option<String>,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Disable color output.
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send a message and stream the agent's reply.
    Run {
        /// Message text; joined with spaces.
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,

        /// Forget the current thread before sending.
        #[arg(long = "new-thread", conflicts_with = "followup")]
        new_thread: bool,

        /// Require an existing thread.
        #[arg(long = "followup")]
        followup: bool,

        /// Approval policy for this conversation (untrusted, on-request, on-failure, never).
        #[arg(long = "approval-policy")]
        approval_policy: Option<String>,
    },
    /// Check that configured machines are reachable.
    Probe,
    /// List recent backend sessions on the machine.
    Sessions {
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },
    /// Show the conversation's machine, thread and pending approval.
    Status,
    /// Cancel the conversation's run and clear any pending approval.
    Cancel,
}
