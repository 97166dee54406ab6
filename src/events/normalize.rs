//! Legacy streaming-JSON dialect → [`AgentEvent`].
//!
//! Rules are evaluated top to bottom and the first rule that claims an
//! object decides its events. A rule returns `None` to pass the object on.

use serde_json::{Map, Value};
use tracing::trace;

use super::{
    first_str, opt_exit_code, opt_int, opt_number, opt_object, opt_str, AgentEvent,
    ApprovalKind, ApprovalRequest, RateLimitWindow, RateLimits, TokenUsageSnapshot, TurnUsage,
};
use crate::command_tokens::shell_join;
use crate::ids::{RequestId, ThreadId};

/// Object under inspection plus envelope metadata.
struct Frame<'a> {
    obj: &'a Map<String, Value>,
    kind: Option<&'a str>,
    outer_id: Option<String>,
}

type Rule = fn(&Frame<'_>) -> Option<Vec<AgentEvent>>;

const RULES: &[(&str, Rule)] = &[
    ("legacy_wrapper", legacy_wrapper),
    ("session_meta", session_meta),
    ("item_completed", item_completed),
    ("item_started", item_started),
    ("thread_started", thread_started),
    ("turn_started", turn_started),
    ("turn_completed", turn_completed),
    ("turn_failed", turn_failed),
    ("error", error),
    ("agent_message_delta", agent_message_delta),
    ("agent_message", agent_message),
    ("reasoning_delta", reasoning_delta),
    ("token_count", token_count),
    ("function_call", function_call),
    ("function_call_output", function_call_output),
    ("exec_approval_request", exec_approval_request),
    ("exec_command_output_delta", exec_command_output_delta),
    ("exec_command_end", exec_command_end),
    ("assistant_message", assistant_message),
];

/// Map one decoded wire object to zero or more events. Never fails.
pub fn parse_event_obj(obj: &Map<String, Value>) -> Vec<AgentEvent> {
    let frame = unwrap_envelope(obj);
    for (name, rule) in RULES {
        if let Some(events) = rule(&frame) {
            trace!(rule = *name, count = events.len(), "wire rule matched");
            return events;
        }
    }
    Vec::new()
}

/// Decode a stdout line. Returns the raw text when it is not a JSON object.
pub fn parse_json_line(line: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(line.to_string()),
    }
}

/// `{id, msg: {...}}` envelopes: inspect `msg`, remember the outer id.
fn unwrap_envelope(obj: &Map<String, Value>) -> Frame<'_> {
    if let Some(inner) = opt_object(obj, "msg") {
        let outer_id = opt_str(obj, "id").filter(|id| !id.is_empty());
        return Frame {
            obj: inner,
            kind: inner.get("type").and_then(Value::as_str),
            outer_id,
        };
    }
    Frame {
        obj,
        kind: obj.get("type").and_then(Value::as_str),
        outer_id: None,
    }
}

fn is_kind(frame: &Frame<'_>, kinds: &[&str]) -> bool {
    frame.kind.is_some_and(|kind| kinds.contains(&kind))
}

/// `command` as a string, or an argv list joined with POSIX quoting.
fn command_field(value: Option<&Value>) -> Option<(String, Option<Vec<String>>)> {
    match value? {
        Value::String(s) => Some((s.clone(), None)),
        Value::Array(items) => {
            let argv: Vec<String> = items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Some((shell_join(&argv), Some(argv)))
        }
        _ => None,
    }
}

fn call_id(obj: &Map<String, Value>) -> Option<RequestId> {
    opt_str(obj, "call_id").map(RequestId::Str)
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

fn legacy_wrapper(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["event_msg", "response_item"]) {
        return None;
    }
    let payload = opt_object(frame.obj, "payload")?;
    Some(parse_event_obj(payload))
}

fn session_meta(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["session_meta"]) {
        return None;
    }
    let id = first_str(opt_object(frame.obj, "payload")?, &["id"])?;
    Some(vec![AgentEvent::ThreadStarted {
        thread_id: ThreadId::new(id),
    }])
}

fn item_completed(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["item.completed", "item_completed"]) {
        return None;
    }
    Some(match opt_object(frame.obj, "item") {
        Some(item) => parse_item(item, frame.outer_id.as_deref()),
        None => Vec::new(),
    })
}

fn item_started(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["item.started", "item_started"]) {
        return None;
    }
    let Some(item) = opt_object(frame.obj, "item") else {
        return Some(Vec::new());
    };
    // Approval requests may arrive on item.started; the agent pauses for them.
    let parsed = parse_item(item, frame.outer_id.as_deref());
    if !parsed.is_empty() {
        return Some(parsed);
    }
    if item.get("type").and_then(Value::as_str) == Some("command_execution") {
        let command = match item.get("command") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        };
        if !command.is_empty() {
            return Some(vec![AgentEvent::ToolStarted { command }]);
        }
    }
    Some(Vec::new())
}

fn thread_started(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["thread.started"]) {
        return None;
    }
    let id = opt_str(frame.obj, "thread_id")?;
    Some(vec![AgentEvent::ThreadStarted {
        thread_id: ThreadId::new(id),
    }])
}

fn turn_started(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    is_kind(frame, &["turn.started"]).then(|| vec![AgentEvent::TurnStarted { turn_id: None }])
}

fn turn_completed(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["turn.completed"]) {
        return None;
    }
    let usage = opt_object(frame.obj, "usage").map(|usage| TurnUsage {
        input_tokens: opt_int(usage, "input_tokens"),
        output_tokens: opt_int(usage, "output_tokens"),
        cached_input_tokens: opt_int(usage, "cached_input_tokens"),
    });
    Some(vec![AgentEvent::TurnCompleted { usage }])
}

fn turn_failed(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["turn.failed"]) {
        return None;
    }
    let message = opt_object(frame.obj, "error")
        .and_then(|err| opt_str(err, "message"))
        .or_else(|| opt_str(frame.obj, "message"))
        .unwrap_or_else(|| "turn failed".to_string());
    Some(vec![AgentEvent::TurnFailed { message }])
}

fn error(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["error", "stream_error"]) {
        return None;
    }
    let message = first_str(frame.obj, &["message", "error_description", "error"])
        .or_else(|| {
            opt_object(frame.obj, "error").and_then(|err| first_str(err, &["message"]))
        })
        .unwrap_or_else(|| "error".to_string());
    Some(vec![AgentEvent::Error { message }])
}

fn agent_message_delta(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["agent_message_delta", "agent_message_content_delta"]) {
        return None;
    }
    let text = first_str(frame.obj, &["delta", "text", "message"])?;
    Some(vec![AgentEvent::AgentMessageDelta { text }])
}

fn agent_message(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["agent_message"]) {
        return None;
    }
    let text = first_str(frame.obj, &["message", "text"])?;
    Some(vec![AgentEvent::AgentMessage { text }])
}

fn reasoning_delta(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(
        frame,
        &[
            "agent_reasoning_delta",
            "reasoning_content_delta",
            "reasoning_raw_content_delta",
        ],
    ) {
        return None;
    }
    let text = first_str(frame.obj, &["delta", "text", "content"])?;
    Some(vec![AgentEvent::ReasoningDelta { text }])
}

fn token_count(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["token_count"]) {
        return None;
    }
    let mut usage = TokenUsageSnapshot::default();
    if let Some(info) = opt_object(frame.obj, "info") {
        usage.model_context_window = opt_int(info, "model_context_window");
        // Cumulative totals are not context occupancy; prefer the last request.
        let breakdown = opt_object(info, "last_token_usage")
            .filter(|last| !last.is_empty())
            .or_else(|| opt_object(info, "total_token_usage"));
        if let Some(counts) = breakdown {
            usage.total_tokens = opt_int(counts, "total_tokens");
            usage.input_tokens = opt_int(counts, "input_tokens");
            usage.output_tokens = opt_int(counts, "output_tokens");
            usage.cached_input_tokens = opt_int(counts, "cached_input_tokens");
            usage.reasoning_output_tokens = opt_int(counts, "reasoning_output_tokens");
        }
    }
    if let Some(limits) = opt_object(frame.obj, "rate_limits") {
        usage.rate_limits = RateLimits {
            primary: opt_object(limits, "primary").map(rate_limit_window),
            secondary: opt_object(limits, "secondary").map(rate_limit_window),
        };
    }
    Some(vec![AgentEvent::TokenUsage { usage }])
}

fn rate_limit_window(window: &Map<String, Value>) -> RateLimitWindow {
    RateLimitWindow {
        used_percent: opt_number(window, "used_percent"),
        window_minutes: opt_int(window, "window_minutes"),
        resets_at: opt_int(window, "resets_at"),
    }
}

/// Generic tool call; only `exec_command` is surfaced.
fn function_call(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["function_call"]) {
        return None;
    }
    if frame.obj.get("name").and_then(Value::as_str) != Some("exec_command") {
        return None;
    }
    let args = match frame.obj.get("arguments")? {
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            _ => return None,
        },
        Value::Object(map) => map.clone(),
        _ => return None,
    };
    let (command, argv) = command_field(args.get("cmd"))?;
    if command.is_empty() {
        return None;
    }
    let escalated = args
        .get("sandbox_permissions")
        .and_then(Value::as_str)
        .is_some_and(|perm| perm.starts_with("require"));
    if !escalated {
        return Some(vec![AgentEvent::ToolStarted { command }]);
    }
    let mut request = ApprovalRequest::new(ApprovalKind::LegacyExec, command);
    request.command_argv = argv;
    request.cwd = opt_str(&args, "cwd");
    request.reason = opt_str(&args, "justification");
    request.correlation_id = call_id(frame.obj);
    request.outer_id = frame.outer_id.clone();
    Some(vec![AgentEvent::ExecApprovalRequest { request }])
}

fn function_call_output(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["function_call_output"]) {
        return None;
    }
    let output = opt_str(frame.obj, "output")?;
    Some(vec![AgentEvent::ExecEnd {
        exit_code: None,
        aggregated_output: Some(output),
    }])
}

fn exec_approval_request(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["exec_approval_request"]) {
        return None;
    }
    let obj = frame.obj;
    let (command, argv) = match command_field(obj.get("command")) {
        Some(parsed) => parsed,
        None => (first_str(obj, &["codex_command", "cmd"])?, None),
    };
    if command.is_empty() {
        return None;
    }
    let mut request = ApprovalRequest::new(ApprovalKind::LegacyExec, command);
    request.command_argv = argv;
    request.cwd = first_str(obj, &["cwd", "codex_cwd", "working_directory"]);
    request.reason = first_str(obj, &["reason", "codex_reason"]);
    request.correlation_id = call_id(obj);
    request.outer_id = frame.outer_id.clone();
    Some(vec![AgentEvent::ExecApprovalRequest { request }])
}

fn exec_command_output_delta(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["exec_command_output_delta"]) {
        return None;
    }
    let text = first_str(
        frame.obj,
        &["chunk", "text", "output", "delta", "aggregated_output"],
    )?;
    Some(vec![AgentEvent::ExecOutputDelta { text }])
}

fn exec_command_end(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["exec_command_end"]) {
        return None;
    }
    Some(vec![AgentEvent::ExecEnd {
        exit_code: opt_exit_code(frame.obj, "exit_code"),
        aggregated_output: first_str(
            frame.obj,
            &["aggregated_output", "formatted_output", "output"],
        ),
    }])
}

/// `response_item` assistant messages made of `output_text` parts.
fn assistant_message(frame: &Frame<'_>) -> Option<Vec<AgentEvent>> {
    if !is_kind(frame, &["message"]) {
        return None;
    }
    if frame.obj.get("role").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    let parts = frame.obj.get("content").and_then(Value::as_array)?;
    let text: String = parts
        .iter()
        .filter_map(Value::as_object)
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        return None;
    }
    Some(vec![AgentEvent::AgentMessage { text }])
}

// ---------------------------------------------------------------------------
// Items (item.started / item.completed payloads)
// ---------------------------------------------------------------------------

fn parse_item(item: &Map<String, Value>, outer_id: Option<&str>) -> Vec<AgentEvent> {
    match item.get("type").and_then(Value::as_str) {
        Some("agent_message") => first_str(item, &["text", "message"])
            .map(|text| vec![AgentEvent::AgentMessage { text }])
            .unwrap_or_default(),
        Some("reasoning") => {
            let text = first_str(item, &["text"]).unwrap_or_else(|| reasoning_summary(item));
            if text.is_empty() {
                Vec::new()
            } else {
                vec![AgentEvent::ReasoningDelta { text }]
            }
        }
        Some("command_execution")
            if item.get("status").and_then(Value::as_str) == Some("completed") =>
        {
            vec![AgentEvent::ExecEnd {
                exit_code: opt_exit_code(item, "exit_code"),
                aggregated_output: opt_str(item, "aggregated_output"),
            }]
        }
        Some("exec_approval_request") => {
            let Some((command, argv)) = command_field(item.get("command")) else {
                return Vec::new();
            };
            if command.is_empty() {
                return Vec::new();
            }
            let mut request = ApprovalRequest::new(ApprovalKind::LegacyExec, command);
            request.command_argv = argv;
            request.cwd = opt_str(item, "cwd");
            request.reason = opt_str(item, "reason");
            request.correlation_id = call_id(item);
            request.outer_id = outer_id.map(str::to_string);
            vec![AgentEvent::ExecApprovalRequest { request }]
        }
        _ => Vec::new(),
    }
}

fn reasoning_summary(item: &Map<String, Value>) -> String {
    let Some(summary) = item.get("summary").and_then(Value::as_array) else {
        return String::new();
    };
    summary
        .iter()
        .filter_map(Value::as_object)
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("summary_text"))
        .map(|part| part.get("text").and_then(Value::as_str).unwrap_or(""))
        .collect::<Vec<_>>()
        .join(" ")
}


#[cfg(all(test, feature = "fuzz-tests"))]
mod fuzz {
    use super::*;
    use proptest::prelude::*;

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z_.]{0,24}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map(
                    prop_oneof![
                        Just("type".to_string()),
                        Just("msg".to_string()),
                        Just("payload".to_string()),
                        Just("item".to_string()),
                        Just("command".to_string()),
                        "[a-z_]{1,12}"
                    ],
                    inner,
                    0..6
                )
                .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn normalizer_never_panics(value in arb_json()) {
            if let Value::Object(map) = value {
                let _ = parse_event_obj(&map);
            }
        }

        #[test]
        fn arbitrary_lines_never_panic(line in ".{0,200}") {
            if let Ok(map) = parse_json_line(&line) {
                let _ = parse_event_obj(&map);
            }
        }
    }
}
