//! Terminal rendering of one turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use agentrelay::events::AgentEvent;
use agentrelay::ids::RunId;
use agentrelay::orchestrator::TurnObserver;
use agentrelay::store::PendingAction;
use async_trait::async_trait;

use crate::app::approval::render_approval_request;
use crate::app::render::Renderer;

pub(crate) struct TerminalObserver {
    renderer: Renderer,
    color: bool,
    machine: Mutex<String>,
    /// Streamed text is on screen without a trailing newline.
    mid_line: AtomicBool,
    /// A delta arrived, so the final message would repeat it.
    streamed: AtomicBool,
    offer_similar: AtomicBool,
}

impl TerminalObserver {
    pub(crate) fn new(renderer: Renderer, color: bool, machine: &str) -> Self {
        Self {
            renderer,
            color,
            machine: Mutex::new(machine.to_string()),
            mid_line: AtomicBool::new(false),
            streamed: AtomicBool::new(false),
            offer_similar: AtomicBool::new(false),
        }
    }

    /// Whether the last approval prompt allowed trusting the prefix.
    pub(crate) fn offer_similar(&self) -> bool {
        self.offer_similar.load(Ordering::SeqCst)
    }

    pub(crate) fn set_machine(&self, machine: &str) {
        *self.machine.lock().unwrap_or_else(|p| p.into_inner()) = machine.to_string();
    }

    fn machine(&self) -> String {
        self.machine.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// End a streamed line before anything else is printed.
    pub(crate) fn finish_line(&self) {
        if self.mid_line.swap(false, Ordering::SeqCst) {
            println!();
        }
    }
}

#[async_trait]
impl TurnObserver for TerminalObserver {
    async fn on_event(&self, event: &AgentEvent) {
        match event {
            AgentEvent::AgentMessageDelta { text } => {
                self.streamed.store(true, Ordering::SeqCst);
                self.mid_line.store(!text.ends_with('\n'), Ordering::SeqCst);
                self.renderer.assistant_delta(text);
            }
            AgentEvent::AgentMessage { text } => {
                if !self.streamed.swap(false, Ordering::SeqCst) {
                    self.renderer.assistant_message(text);
                }
            }
            AgentEvent::ReasoningDelta { text } => {
                self.finish_line();
                self.renderer.detail(text);
            }
            AgentEvent::ToolStarted { command } => {
                self.finish_line();
                self.renderer.activity(&format!("$ {command}"));
            }
            AgentEvent::ExecEnd {
                exit_code,
                aggregated_output,
            } => {
                self.finish_line();
                if let Some(code) = exit_code.filter(|code| *code != 0) {
                    self.renderer.warn(&format!("command exited with {code}"));
                }
                if let Some(output) = aggregated_output {
                    self.renderer.output_block(output);
                }
            }
            AgentEvent::LogLine { text } => {
                self.finish_line();
                self.renderer.detail(text);
            }
            AgentEvent::Error { message } | AgentEvent::TurnFailed { message } => {
                self.finish_line();
                self.renderer.error(message);
            }
            _ => {}
        }
    }

    async fn on_notice(&self, text: &str) {
        self.finish_line();
        self.renderer.activity(text);
    }

    async fn on_approval_required(&self, _run_id: &RunId, pending: &PendingAction, offer_similar: bool) {
        self.finish_line();
        self.offer_similar.store(offer_similar, Ordering::SeqCst);
        render_approval_request(self.color, &self.renderer, &self.machine(), pending, offer_similar);
    }
}
