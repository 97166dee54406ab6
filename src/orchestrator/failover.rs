//! Remote liveness checks and the single per-message failover.
//!
//! Only remote machines are watched. A stalled stream is probed with a
//! cheap `true`; a reachable machine just keeps waiting, an unreachable one
//! gets at most one switch to a local fallback per user message.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::LivenessConfig;
use crate::events::AgentEvent;
use crate::machine::{self, Machine, MachineKind};
use crate::session::AgentRun;
use crate::textutil::truncate_with_suffix_by_chars;

/// Longest machine error detail quoted in a failover notice.
const MAX_FAILURE_DETAIL_CHARS: usize = 240;

/// Result of waiting for the next event under a liveness deadline.
#[derive(Debug)]
pub(crate) enum NextEvent {
    Event(AgentEvent),
    /// The run closed its queue.
    Finished,
    /// No event arrived before the deadline.
    Stalled,
}

/// Per-stream liveness settings; `None` timeouts mean wait forever.
#[derive(Debug, Clone)]
pub(crate) struct Watchdog {
    first_event: Option<Duration>,
    idle: Option<Duration>,
    probe: Duration,
    cancel: Duration,
}

impl Watchdog {
    pub(crate) fn for_machine(kind: MachineKind, liveness: &LivenessConfig) -> Self {
        let remote = kind == MachineKind::Ssh;
        Self {
            first_event: remote.then(|| liveness.first_event_timeout()),
            idle: remote.then(|| liveness.idle_timeout()),
            probe: liveness.probe_timeout(),
            cancel: liveness.cancel_timeout(),
        }
    }

    pub(crate) fn cancel_timeout(&self) -> Duration {
        self.cancel
    }

    /// Wait for the next event; the first event of a run gets the shorter deadline.
    pub(crate) async fn next_event(&self, run: &dyn AgentRun, first: bool) -> NextEvent {
        let deadline = if first { self.first_event } else { self.idle };
        let Some(deadline) = deadline else {
            return match run.next_event().await {
                Some(event) => NextEvent::Event(event),
                None => NextEvent::Finished,
            };
        };
        match tokio::time::timeout(deadline, run.next_event()).await {
            Ok(Some(event)) => NextEvent::Event(event),
            Ok(None) => NextEvent::Finished,
            Err(_) => {
                debug!(
                    run_id = %run.run_id(),
                    first,
                    deadline_ms = deadline.as_millis() as u64,
                    "no event before deadline"
                );
                NextEvent::Stalled
            }
        }
    }

    /// Probe with its own short timeout. A hung probe counts as unreachable.
    pub(crate) async fn is_reachable(&self, machine: &dyn Machine) -> bool {
        match tokio::time::timeout(self.probe, machine::probe(machine)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(machine = machine.name(), error = %err, "liveness probe failed");
                false
            }
            Err(_) => {
                warn!(machine = machine.name(), "liveness probe timed out");
                false
            }
        }
    }
}

/// Cancel `run`, giving up after `timeout`; a dead transport can hang a
/// cancel too. The run is closed either way.
pub(crate) async fn cancel_bounded(run: &dyn AgentRun, timeout: Duration) {
    if tokio::time::timeout(timeout, run.cancel()).await.is_err() {
        warn!(run_id = %run.run_id(), "cancel timed out; closing run");
    }
    run.close();
}

/// Whether a setup or stall failure on `kind` may fail over at all.
pub(crate) fn can_fail_over(kind: MachineKind) -> bool {
    kind == MachineKind::Ssh
}

pub(crate) fn setup_failover_notice(machine: &str, fallback: &str, err: &dyn std::fmt::Display) -> String {
    let detail = err.to_string();
    let detail = detail.trim();
    let detail = if detail.is_empty() { "unknown error" } else { detail };
    format!(
        "Machine '{machine}' could not be reached: {}\n\
         Falling back to local machine '{fallback}' and starting a new thread.",
        truncate_with_suffix_by_chars(detail, MAX_FAILURE_DETAIL_CHARS, "...")
    )
}

pub(crate) fn stall_failover_notice(machine: &str, fallback: &str) -> String {
    format!(
        "Machine '{machine}' could not be reached.\n\
         Falling back to local machine '{fallback}' and starting a new thread."
    )
}

pub(crate) fn unreachable_notice(machine: &str, has_fallback: bool) -> String {
    if has_fallback {
        format!("Machine '{machine}' could not be reached. Switch to a local machine and try again.")
    } else {
        format!("Machine '{machine}' could not be reached, and no local fallback machine is configured.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::events::ApprovalRequest;
    use crate::ids::{RunId, ThreadId};
    use crate::session::{EventQueue, SessionPhase, UserDecision};
    use crate::testsupport::{FakeMachine, FakeProgram};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fast_liveness() -> LivenessConfig {
        LivenessConfig {
            first_event_timeout_ms: 30,
            idle_timeout_ms: 30,
            probe_timeout_ms: 30,
            cancel_timeout_ms: 200,
            kill_grace_ms: 10,
        }
    }

    #[test]
    fn only_remote_machines_are_watched() {
        let liveness = fast_liveness();
        let remote = Watchdog::for_machine(MachineKind::Ssh, &liveness);
        assert_eq!(remote.first_event, Some(Duration::from_millis(30)));
        assert_eq!(remote.idle, Some(Duration::from_millis(30)));
        let local = Watchdog::for_machine(MachineKind::Local, &liveness);
        assert!(local.first_event.is_none() && local.idle.is_none());
        assert!(can_fail_over(MachineKind::Ssh));
        assert!(!can_fail_over(MachineKind::Local));
    }

    #[tokio::test]
    async fn hung_probe_counts_as_unreachable() {
        let machine = FakeMachine::new("remote", MachineKind::Ssh, FakeProgram::Silent);
        let watchdog = Watchdog::for_machine(MachineKind::Ssh, &fast_liveness());
        assert!(watchdog.is_reachable(&machine).await);
        machine.set_reachable(false);
        assert!(!watchdog.is_reachable(&machine).await);
    }

    /// Run whose queue only yields what the test pushes.
    struct QueueRun {
        run_id: RunId,
        queue: EventQueue,
        cancelled: AtomicBool,
    }

    impl QueueRun {
        fn new() -> Self {
            Self {
                run_id: RunId::generate(),
                queue: EventQueue::new(),
                cancelled: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl AgentRun for QueueRun {
        fn run_id(&self) -> &RunId {
            &self.run_id
        }

        fn thread_id(&self) -> Option<ThreadId> {
            None
        }

        fn phase(&self) -> SessionPhase {
            SessionPhase::Active
        }

        async fn next_event(&self) -> Option<AgentEvent> {
            self.queue.next().await
        }

        async fn resolve_approval(
            &self,
            _request: &ApprovalRequest,
            _prefix: &str,
            _decision: UserDecision,
        ) -> Result<(), SessionError> {
            Ok(())
        }

        async fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }

        fn close(&self) {
            self.queue.close();
        }
    }

    #[tokio::test]
    async fn remote_stream_stalls_after_deadline() {
        let run = QueueRun::new();
        let watchdog = Watchdog::for_machine(MachineKind::Ssh, &fast_liveness());
        assert!(matches!(watchdog.next_event(&run, true).await, NextEvent::Stalled));

        run.queue.push(AgentEvent::LogLine { text: "hi".into() });
        assert!(matches!(watchdog.next_event(&run, false).await, NextEvent::Event(_)));
        run.close();
        assert!(matches!(watchdog.next_event(&run, false).await, NextEvent::Finished));
    }

    // Ensures a cancel that never returns can not wedge the caller.
    #[tokio::test]
    async fn hung_cancel_is_bounded_and_still_closes() {
        let run = QueueRun::new();
        cancel_bounded(&run, Duration::from_millis(20)).await;
        assert!(run.cancelled.load(Ordering::SeqCst));
        assert!(run.queue.is_closed());
    }

    #[test]
    fn notices_quote_bounded_detail() {
        let long = "x".repeat(500);
        let notice = setup_failover_notice("remote", "local", &long);
        assert!(notice.starts_with("Machine 'remote' could not be reached: "));
        assert!(notice.contains("xxx..."));
        assert!(notice.ends_with("Falling back to local machine 'local' and starting a new thread."));
        assert!(unreachable_notice("remote", false).contains("no local fallback"));
    }
}
