//! Application entry for the agentrelay CLI.

use std::path::PathBuf;
use std::sync::Arc;

use agentrelay::config::{load_config, Config};
use agentrelay::ids::ConversationId;
use agentrelay::orchestrator::Orchestrator;
use agentrelay::store::FileStore;
use tracing::{debug, info};

use crate::app::commands::machine::probe_machines;
use crate::app::commands::session::handle_sessions_command;
use crate::app::commands::status::{handle_cancel_command, handle_status_command};
use crate::app::render::Renderer;
use crate::app::run_mode::{run_message, RunOptions};
use crate::cli::{Args, Command};

const STATE_DIR_NAME: &str = "agentrelay";
const STATE_FILE_NAME: &str = "state.json";

/// Where conversation state lives when the config does not say.
fn default_state_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(STATE_DIR_NAME).join(STATE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{STATE_DIR_NAME}-{STATE_FILE_NAME}")))
}

fn state_path(config: &Config) -> PathBuf {
    config
        .state
        .path
        .as_deref()
        .filter(|path| !path.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_state_path)
}

/// Run the parsed command and return the process exit code.
pub(crate) async fn run(args: Args) -> i32 {
    let color = !args.no_color;
    let renderer = Renderer::new(color);

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            renderer.error(&err.to_string());
            return 1;
        }
    };

    if let Command::Probe = args.command {
        let relay = Orchestrator::from_config(config, Arc::new(agentrelay::store::MemoryStore::new()));
        let timeout = relay.config().liveness.probe_timeout();
        return match probe_machines(&renderer, relay.registry(), args.machine.as_deref(), timeout).await {
            Ok(0) => 0,
            Ok(_) => 1,
            Err(msg) => {
                renderer.error(&msg);
                1
            }
        };
    }

    let path = state_path(&config);
    let store = match FileStore::open(&path) {
        Ok(store) => store,
        Err(err) => {
            renderer.error(&format!("failed to open state file {}: {err}", path.display()));
            return 1;
        }
    };
    debug!(path = %path.display(), "state store opened");
    let relay = Arc::new(Orchestrator::from_config(config, Arc::new(store)));
    let conversation = ConversationId::new(args.conversation.trim());

    let result = match args.command {
        Command::Run {
            prompt,
            new_thread,
            followup,
            approval_policy,
        } => {
            info!(conversation = %conversation, "run requested");
            let options = RunOptions {
                prompt: prompt.join(" "),
                new_thread,
                followup,
                approval_policy,
                machine: args.machine,
            };
            run_message(relay, &conversation, options, renderer, color)
                .await
                .map_err(|err| err.to_string())
        }
        Command::Status => handle_status_command(&renderer, &relay, &conversation)
            .map(|_| 0)
            .map_err(|err| err.to_string()),
        Command::Cancel => handle_cancel_command(&renderer, &relay, &conversation)
            .await
            .map(|_| 0)
            .map_err(|err| err.to_string()),
        Command::Sessions { limit } => sessions(&renderer, &relay, &conversation, args.machine.as_deref(), limit).await,
        Command::Probe => Ok(0),
    };

    match result {
        Ok(code) => code,
        Err(msg) => {
            renderer.error(&msg);
            1
        }
    }
}

async fn sessions(
    renderer: &Renderer,
    relay: &Orchestrator,
    conversation: &ConversationId,
    machine: Option<&str>,
    limit: usize,
) -> Result<i32, String> {
    let state = relay.status(conversation).map_err(|err| err.to_string())?.state;
    let name = machine.unwrap_or(&state.machine);
    let entry = relay
        .registry()
        .get(name)
        .ok_or_else(|| format!("unknown machine `{name}`"))?;
    let current = (name == state.machine)
        .then(|| state.thread_id.as_ref().map(|t| t.as_str()))
        .flatten();
    handle_sessions_command(renderer, relay.config(), entry, current, limit).await?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_state_path_wins() {
        let mut config = Config::default();
        config.state.path = Some("/tmp/relay/state.json".into());
        assert_eq!(state_path(&config), PathBuf::from("/tmp/relay/state.json"));
    }

    #[test]
    fn blank_state_path_uses_default_location() {
        let mut config = Config::default();
        config.state.path = Some("  ".into());
        assert!(state_path(&config).ends_with(STATE_FILE_NAME));
    }
}
