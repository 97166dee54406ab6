//! Reachability checks for configured machines.

use std::time::Instant;

use agentrelay::machine::{self, MachineRegistry};
use tracing::debug;

use crate::app::render::Renderer;

/// Probe `only` (or every machine) and return how many were unreachable.
pub(crate) async fn probe_machines(
    renderer: &Renderer,
    registry: &MachineRegistry,
    only: Option<&str>,
    timeout: std::time::Duration,
) -> Result<usize, String> {
    let names: Vec<String> = match only {
        Some(name) if registry.get(name).is_none() => {
            return Err(format!("unknown machine `{name}`"));
        }
        Some(name) => vec![name.to_string()],
        None => registry.names().map(str::to_string).collect(),
    };

    renderer.section("machines");
    let mut unreachable = 0;
    for name in names {
        let Some(entry) = registry.get(&name) else {
            continue;
        };
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, machine::probe(entry.machine.as_ref())).await;
        debug!(machine = %name, elapsed_ms = started.elapsed().as_millis() as u64, "probe finished");
        let status = match result {
            Ok(Ok(())) => format!("reachable ({} ms)", started.elapsed().as_millis()),
            Ok(Err(err)) => {
                unreachable += 1;
                format!("unreachable: {err}")
            }
            Err(_) => {
                unreachable += 1;
                "unreachable: probe timed out".to_string()
            }
        };
        renderer.field(&format!("{name} ({})", entry.def.kind.as_str()), &status);
    }
    Ok(unreachable)
}
