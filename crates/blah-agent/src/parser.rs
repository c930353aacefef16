//! Lenient extraction of structured tool invocations from model output.
//!
//! Three explicit strategies, tried in order: the whole trimmed output as
//! JSON, the contents of a fenced code block, and a best-effort slice from
//! the first `{` to the last `}`. Anything that fails all three is a
//! terminal assistant answer.

use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub tool: String,
    pub arguments: Value,
}

pub fn extract_tool_call(text: &str) -> Option<ParsedToolCall> {
    let trimmed = text.trim();
    if let Some(call) = parse_candidate(trimmed) {
        return Some(call);
    }
    if let Some(inner) = fenced_block(trimmed)
        && let Some(call) = parse_candidate(inner.trim())
    {
        return Some(call);
    }
    brace_slice(trimmed).and_then(parse_candidate)
}

/// A candidate must be a JSON object of shape
/// `{"type":"tool_call","tool":<name>,"arguments":<object>}`. A missing or
/// non-object `arguments` defaults to `{}`.
fn parse_candidate(candidate: &str) -> Option<ParsedToolCall> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let obj = value.as_object()?;
    if obj.get("type")?.as_str()? != "tool_call" {
        return None;
    }
    let tool = obj.get("tool")?.as_str()?.to_string();
    let arguments = match obj.get("arguments") {
        Some(v) if v.is_object() => v.clone(),
        _ => json!({}),
    };
    Some(ParsedToolCall { tool, arguments })
}

/// Contents of the first ```-fence (with or without a language tag).
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(&body[..end])
}

fn brace_slice(text: &str) -> Option<&str> {
    let first = text.find('{')?;
    let last = text.rfind('}')?;
    if last <= first {
        return None;
    }
    Some(&text[first..=last])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn raw_json_object_parses() {
        let call = extract_tool_call(
            r#"{"type":"tool_call","tool":"read_file","arguments":{"path":"a.rs"}}"#,
        )
        .expect("parsed");
        assert_eq!(call.tool, "read_file");
        assert_eq!(call.arguments["path"], "a.rs");
    }

    #[test]
    fn missing_arguments_default_to_empty_object() {
        let call =
            extract_tool_call(r#"{"type":"tool_call","tool":"list_files"}"#).expect("parsed");
        assert_eq!(call.tool, "list_files");
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn non_object_arguments_default_to_empty_object() {
        let call = extract_tool_call(r#"{"type":"tool_call","tool":"grep","arguments":"x"}"#)
            .expect("parsed");
        assert_eq!(call.arguments, json!({}));
    }

    #[test]
    fn labeled_fence_parses() {
        let text = "Here is the call:\n```json\n{\"type\":\"tool_call\",\"tool\":\"list_files\",\"arguments\":{}}\n```\nDone.";
        let call = extract_tool_call(text).expect("parsed");
        assert_eq!(call.tool, "list_files");
    }

    #[test]
    fn unlabeled_fence_parses() {
        let text = "```\n{\"type\":\"tool_call\",\"tool\":\"list_files\",\"arguments\":{}}\n```";
        let call = extract_tool_call(text).expect("parsed");
        assert_eq!(call.tool, "list_files");
    }

    #[test]
    fn brace_slice_recovers_embedded_call() {
        let text = "I will inspect the directory now. {\"type\":\"tool_call\",\"tool\":\"list_files\",\"arguments\":{\"pattern\":\"*.rs\"}} Let me know.";
        let call = extract_tool_call(text).expect("parsed");
        assert_eq!(call.arguments["pattern"], "*.rs");
    }

    #[test]
    fn plain_prose_is_not_a_tool_call() {
        assert!(extract_tool_call("The answer is 42.").is_none());
        assert!(extract_tool_call("").is_none());
        assert!(extract_tool_call("{} nothing here").is_none());
    }

    #[test]
    fn wrong_type_field_is_rejected() {
        assert!(
            extract_tool_call(r#"{"type":"message","tool":"exec","arguments":{}}"#).is_none()
        );
        assert!(extract_tool_call(r#"{"tool":"exec","arguments":{}}"#).is_none());
    }

    #[test]
    fn malformed_json_in_fence_falls_through() {
        let text = "```json\n{\"type\":\"tool_call\",\n```";
        assert!(extract_tool_call(text).is_none());
    }

    proptest! {
        #[test]
        fn wrapped_calls_survive_every_strategy(
            tool in "[a-z_]{1,12}",
            key in "[a-z]{1,8}",
            value in "[a-zA-Z0-9 ]{0,16}",
        ) {
            let payload = json!({
                "type": "tool_call",
                "tool": tool,
                "arguments": { &key: value }
            })
            .to_string();
            for wrapped in [
                payload.clone(),
                format!("```json\n{payload}\n```"),
                format!("Sure thing.\n{payload}\nHope that helps."),
            ] {
                let call = extract_tool_call(&wrapped);
                prop_assert!(call.is_some(), "failed on: {wrapped}");
                prop_assert_eq!(&call.unwrap().tool, &tool);
            }
        }
    }
}
