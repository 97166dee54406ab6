//! App-server RPC dialect → [`AgentEvent`].

use serde_json::{Map, Value};

use super::{
    first_str, opt_exit_code, opt_int, opt_number, opt_object, opt_str, AgentEvent,
    ApprovalKind, ApprovalRequest, RateLimitWindow, RateLimits, TokenUsageSnapshot,
    FILE_CHANGE_COMMAND,
};
use crate::ids::{RequestId, ThreadId, TurnId};

pub const METHOD_COMMAND_APPROVAL: &str = "item/commandExecution/requestApproval";
pub const METHOD_FILE_CHANGE_APPROVAL: &str = "item/fileChange/requestApproval";

/// Map a notification to events. Unknown methods map to nothing.
pub fn map_notification(method: &str, params: &Map<String, Value>) -> Vec<AgentEvent> {
    let event = match method {
        "thread/started" => opt_object(params, "thread")
            .and_then(|thread| first_str(thread, &["id"]))
            .map(|id| AgentEvent::ThreadStarted {
                thread_id: ThreadId::new(id),
            }),
        "turn/started" => Some(AgentEvent::TurnStarted {
            turn_id: opt_object(params, "turn")
                .and_then(|turn| first_str(turn, &["id"]))
                .map(TurnId::new),
        }),
        "turn/completed" => Some(turn_completed(params)),
        "item/agentMessage/delta" => first_str(params, &["delta"])
            .map(|text| AgentEvent::AgentMessageDelta { text }),
        "item/reasoning/textDelta" => {
            first_str(params, &["delta"]).map(|text| AgentEvent::ReasoningDelta { text })
        }
        "item/commandExecution/outputDelta" => {
            first_str(params, &["delta"]).map(|text| AgentEvent::ExecOutputDelta { text })
        }
        "item/started" => command_item(params)
            .and_then(|item| first_str(item, &["command"]))
            .map(|command| AgentEvent::ToolStarted { command }),
        "item/completed" => command_item(params).map(|item| AgentEvent::ExecEnd {
            exit_code: opt_exit_code(item, "exitCode"),
            aggregated_output: opt_str(item, "aggregatedOutput"),
        }),
        "thread/tokenUsage/updated" => opt_object(params, "tokenUsage").map(token_usage),
        "account/rateLimits/updated" => Some(rate_limits(params)),
        "error" => Some(AgentEvent::Error {
            message: opt_object(params, "error")
                .and_then(|err| first_str(err, &["message"]))
                .unwrap_or_else(|| "error".to_string()),
        }),
        _ => None,
    };
    event.into_iter().collect()
}

/// Map a server-initiated request to an approval event.
///
/// `None` means the request is not understood; the caller must still
/// answer it so the backend's turn loop does not stall.
pub fn map_server_request(
    id: &RequestId,
    method: &str,
    params: &Map<String, Value>,
) -> Option<AgentEvent> {
    let mut request = match method {
        METHOD_COMMAND_APPROVAL => {
            let mut request = ApprovalRequest::new(
                ApprovalKind::CommandExecution,
                opt_str(params, "command").unwrap_or_default(),
            );
            request.cwd = opt_str(params, "cwd");
            request
        }
        METHOD_FILE_CHANGE_APPROVAL => {
            ApprovalRequest::new(ApprovalKind::FileChange, FILE_CHANGE_COMMAND)
        }
        _ => return None,
    };
    request.reason = opt_str(params, "reason");
    request.correlation_id = Some(id.clone());
    Some(AgentEvent::ExecApprovalRequest { request })
}

fn turn_completed(params: &Map<String, Value>) -> AgentEvent {
    let Some(turn) = opt_object(params, "turn") else {
        return AgentEvent::TurnCompleted { usage: None };
    };
    if turn.get("status").and_then(Value::as_str) != Some("failed") {
        return AgentEvent::TurnCompleted { usage: None };
    }
    let message = opt_object(turn, "error")
        .and_then(|err| first_str(err, &["message"]))
        .unwrap_or_else(|| "turn failed".to_string());
    AgentEvent::TurnFailed { message }
}

fn command_item(params: &Map<String, Value>) -> Option<&Map<String, Value>> {
    opt_object(params, "item")
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("commandExecution"))
}

fn token_usage(usage: &Map<String, Value>) -> AgentEvent {
    let mut snapshot = TokenUsageSnapshot {
        model_context_window: opt_int(usage, "modelContextWindow"),
        ..TokenUsageSnapshot::default()
    };
    // `last` is the most recent request (context occupancy); `total` is cumulative.
    let breakdown = opt_object(usage, "last")
        .filter(|last| !last.is_empty())
        .or_else(|| opt_object(usage, "total"));
    if let Some(counts) = breakdown {
        snapshot.total_tokens = opt_int(counts, "totalTokens");
        snapshot.input_tokens = opt_int(counts, "inputTokens");
        snapshot.output_tokens = opt_int(counts, "outputTokens");
        snapshot.cached_input_tokens = opt_int(counts, "cachedInputTokens");
        snapshot.reasoning_output_tokens = opt_int(counts, "reasoningOutputTokens");
    }
    AgentEvent::TokenUsage { usage: snapshot }
}

fn rate_limits(params: &Map<String, Value>) -> AgentEvent {
    let limits = opt_object(params, "rateLimits");
    let window = |key: &str| {
        limits
            .and_then(|l| opt_object(l, key))
            .map(|w| RateLimitWindow {
                used_percent: opt_number(w, "usedPercent"),
                window_minutes: opt_int(w, "windowDurationMins"),
                resets_at: opt_int(w, "resetsAt"),
            })
    };
    AgentEvent::TokenUsage {
        usage: TokenUsageSnapshot {
            rate_limits: RateLimits {
                primary: window("primary"),
                secondary: window("secondary"),
            },
            ..TokenUsageSnapshot::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notify(method: &str, params: Value) -> Vec<AgentEvent> {
        let Value::Object(params) = params else {
            panic!("params must be an object");
        };
        map_notification(method, &params)
    }

    #[test]
    fn notification_table() {
        let cases: Vec<(&str, Value, &str)> = vec![
            ("thread/started", json!({"thread":{"id":"t1"}}), "thread_started"),
            ("turn/started", json!({"turn":{"id":"u1"}}), "turn_started"),
            ("turn/completed", json!({"turn":{"status":"completed"}}), "turn_completed"),
            ("turn/completed", json!({}), "turn_completed"),
            ("turn/completed", json!({"turn":{"status":"failed"}}), "turn_failed"),
            ("item/agentMessage/delta", json!({"delta":"hi"}), "agent_message_delta"),
            ("item/reasoning/textDelta", json!({"delta":"why"}), "reasoning_delta"),
            ("item/commandExecution/outputDelta", json!({"delta":"out"}), "exec_output_delta"),
            ("item/started", json!({"item":{"type":"commandExecution","command":"ls"}}), "tool_started"),
            ("item/completed", json!({"item":{"type":"commandExecution","exitCode":1}}), "exec_end"),
            ("thread/tokenUsage/updated", json!({"tokenUsage":{}}), "token_usage"),
            ("account/rateLimits/updated", json!({}), "token_usage"),
            ("error", json!({}), "error"),
        ];
        for (method, params, expected) in cases {
            let events = notify(method, params);
            assert_eq!(events.len(), 1, "{method}: {events:?}");
            assert_eq!(events[0].name(), expected, "{method}");
        }
    }

    #[test]
    fn unknown_and_empty_notifications_map_to_nothing() {
        assert!(notify("item/agentMessage/delta", json!({"delta":""})).is_empty());
        assert!(notify("item/started", json!({"item":{"type":"agentMessage"}})).is_empty());
        assert!(notify("thread/started", json!({"thread":{}})).is_empty());
        assert!(notify("codex/event/whatever", json!({"x":1})).is_empty());
    }

    #[test]
    fn turn_ids_and_failures_are_carried() {
        assert_eq!(
            notify("turn/started", json!({"turn":{"id":"u9"}})),
            vec![AgentEvent::TurnStarted { turn_id: Some(TurnId::new("u9")) }]
        );
        assert_eq!(
            notify(
                "turn/completed",
                json!({"turn":{"status":"failed","error":{"message":"quota"}}})
            ),
            vec![AgentEvent::TurnFailed { message: "quota".into() }]
        );
    }

    #[test]
    fn token_usage_prefers_last_breakdown() {
        let events = notify(
            "thread/tokenUsage/updated",
            json!({"tokenUsage":{
                "modelContextWindow": 1000,
                "total": {"totalTokens": 5000},
                "last": {"totalTokens": 250, "cachedInputTokens": 5}
            }}),
        );
        let AgentEvent::TokenUsage { usage } = &events[0] else {
            panic!("expected token usage");
        };
        assert_eq!(usage.total_tokens, Some(250));
        assert_eq!(usage.cached_input_tokens, Some(5));
        assert_eq!(usage.context_remaining(), Some(750));
    }

    #[test]
    fn rate_limit_windows_map_independently() {
        let events = notify(
            "account/rateLimits/updated",
            json!({"rateLimits":{"primary":{"usedPercent":40,"windowDurationMins":300}}}),
        );
        let AgentEvent::TokenUsage { usage } = &events[0] else {
            panic!("expected token usage");
        };
        let primary = usage.rate_limits.primary.as_ref().unwrap();
        assert_eq!(primary.used_percent, Some(40.0));
        assert_eq!(primary.window_minutes, Some(300));
        assert_eq!(primary.resets_at, None);
        assert!(usage.rate_limits.secondary.is_none());
    }

    #[test]
    fn command_approval_keeps_rpc_id_as_correlation() {
        let Value::Object(params) = json!({"command":"rm -rf tmp/","cwd":"/w","reason":"cleanup"})
        else {
            unreachable!()
        };
        let event = map_server_request(&RequestId::from("c1"), METHOD_COMMAND_APPROVAL, &params)
            .unwrap();
        let AgentEvent::ExecApprovalRequest { request } = event else {
            panic!("expected approval");
        };
        assert_eq!(request.kind, ApprovalKind::CommandExecution);
        assert_eq!(request.command, "rm -rf tmp/");
        assert_eq!(request.cwd.as_deref(), Some("/w"));
        assert_eq!(request.reason.as_deref(), Some("cleanup"));
        assert_eq!(request.correlation_id, Some(RequestId::from("c1")));
    }

    #[test]
    fn file_change_approval_uses_placeholder_command() {
        let params = Map::new();
        let event =
            map_server_request(&RequestId::Int(4), METHOD_FILE_CHANGE_APPROVAL, &params).unwrap();
        let AgentEvent::ExecApprovalRequest { request } = event else {
            panic!("expected approval");
        };
        assert_eq!(request.kind, ApprovalKind::FileChange);
        assert_eq!(request.command, FILE_CHANGE_COMMAND);
        assert_eq!(request.correlation_id, Some(RequestId::Int(4)));
    }

    #[test]
    fn unknown_server_requests_are_not_mapped() {
        assert!(map_server_request(&RequestId::Int(1), "tool/call", &Map::new()).is_none());
    }
}
