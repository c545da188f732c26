//! Dispatch of decoded frames onto the conversation log

use crate::conversation::{Conversation, ToolMeta};
use crate::sse::SseFrame;
use serde_json::Value;

/// Side effects a frame asks for beyond the log itself
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct FrameEffect {
    pub(crate) error: Option<String>,
    pub(crate) clear_history: bool,
}

/// True when a payload carries the `historyCleared` directive
pub(crate) fn history_cleared(data: &Value) -> bool {
    matches!(data.get("historyCleared"), Some(Value::Bool(true)))
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn tool_meta(data: &Value, default_name: &str) -> ToolMeta {
    ToolMeta {
        tool_name: str_field(data, "toolName")
            .unwrap_or(default_name)
            .to_string(),
        tool_call_id: str_field(data, "toolCallId").map(str::to_string),
    }
}

/// Apply one frame to the log
pub(crate) fn route(conversation: &mut Conversation, frame: &SseFrame) -> FrameEffect {
    let data = &frame.data;
    let mut effect = FrameEffect {
        clear_history: history_cleared(data),
        ..Default::default()
    };

    match frame.event.as_str() {
        "token" | "message" => {
            let text = str_field(data, "content")
                .or_else(|| str_field(data, "text"))
                .unwrap_or("");
            conversation.append_assistant(text);
        }
        "tool_call" => {
            let args = data
                .get("args")
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            conversation.push_tool(pretty(&args), tool_meta(data, "toolCall"));
        }
        "tool_result" => {
            let content = match data.get("result") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => pretty(other),
            };
            conversation.push_tool(content, tool_meta(data, "toolResult"));
        }
        "error" => {
            let message = match data {
                Value::String(s) => s.clone(),
                _ => str_field(data, "message").unwrap_or("error").to_string(),
            };
            effect.error = Some(message);
        }
        "done" => conversation.finalize_assistant(),
        _ => {
            let text = match data {
                Value::String(s) => s.as_str(),
                _ => str_field(data, "text").unwrap_or(""),
            };
            conversation.append_assistant(text);
        }
    }

    effect
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use serde_json::json;

    fn frame(event: &str, data: Value) -> SseFrame {
        SseFrame {
            event: event.to_string(),
            data,
        }
    }

    fn open_conversation() -> Conversation {
        let mut conv = Conversation::default();
        conv.push_user("q");
        conv.begin_assistant();
        conv
    }

    #[test]
    fn test_token_and_message_append() {
        let mut conv = open_conversation();
        route(&mut conv, &frame("token", json!({ "content": "Hel" })));
        route(&mut conv, &frame("message", json!({ "text": "lo" })));
        route(&mut conv, &frame("token", json!({ "content": 7 })));
        route(&mut conv, &frame("token", json!({ "content": "!", "text": "ignored" })));
        assert_eq!(conv.messages()[1].content, "Hello!");
        assert!(!conv.messages()[1].finalized);
    }

    #[test]
    fn test_tool_call_pretty_prints_args() {
        let mut conv = open_conversation();
        route(
            &mut conv,
            &frame(
                "tool_call",
                json!({ "toolName": "lookup", "toolCallId": "c1", "args": { "id": 3 } }),
            ),
        );
        let tool = &conv.messages()[2];
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.content, "{\n  \"id\": 3\n}");
        assert_eq!(
            tool.meta,
            Some(ToolMeta {
                tool_name: "lookup".to_string(),
                tool_call_id: Some("c1".to_string()),
            })
        );
    }

    #[test]
    fn test_tool_call_defaults() {
        let mut conv = open_conversation();
        route(&mut conv, &frame("tool_call", json!({})));
        let tool = &conv.messages()[2];
        assert_eq!(tool.content, "{}");
        assert_eq!(tool.meta.as_ref().unwrap().tool_name, "toolCall");
        assert_eq!(tool.meta.as_ref().unwrap().tool_call_id, None);
    }

    #[test]
    fn test_tool_result_text_and_json() {
        let mut conv = open_conversation();
        route(&mut conv, &frame("tool_result", json!({ "result": "plain" })));
        route(
            &mut conv,
            &frame("tool_result", json!({ "toolName": "db", "result": [1] })),
        );
        assert_eq!(conv.messages()[2].content, "plain");
        assert_eq!(conv.messages()[2].meta.as_ref().unwrap().tool_name, "toolResult");
        assert_eq!(conv.messages()[3].content, "[\n  1\n]");
        assert_eq!(conv.messages()[3].meta.as_ref().unwrap().tool_name, "db");
    }

    #[test]
    fn test_error_does_not_finalize() {
        let mut conv = open_conversation();
        let effect = route(&mut conv, &frame("error", json!({ "message": "rate limited" })));
        assert_eq!(effect.error.as_deref(), Some("rate limited"));
        let effect = route(&mut conv, &frame("error", json!("bare")));
        assert_eq!(effect.error.as_deref(), Some("bare"));
        let effect = route(&mut conv, &frame("error", json!({})));
        assert_eq!(effect.error.as_deref(), Some("error"));
        assert_eq!(conv.open_assistant_count(), 1);
    }

    #[test]
    fn test_done_finalizes() {
        let mut conv = open_conversation();
        route(&mut conv, &frame("done", json!({})));
        assert_eq!(conv.open_assistant_count(), 0);
    }

    #[test]
    fn test_unknown_event_appends_text() {
        let mut conv = open_conversation();
        route(&mut conv, &frame("status", json!({ "text": "a" })));
        route(&mut conv, &frame("status", json!("b")));
        route(&mut conv, &frame("status", json!({ "content": "ignored" })));
        assert_eq!(conv.messages()[1].content, "ab");
    }

    #[test]
    fn test_history_cleared_directive() {
        let mut conv = open_conversation();
        let effect = route(
            &mut conv,
            &frame("done", json!({ "historyCleared": true })),
        );
        assert!(effect.clear_history);
        assert!(!history_cleared(&json!({ "historyCleared": false })));
        assert!(!history_cleared(&json!("historyCleared")));
    }
}
