use serde_json::Value;

use crate::error::ProtocolError;

/// Normalized event parsed out of one raw upstream stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ContentDelta(String),
    Finish(String),
    UpstreamError(String),
}

pub const DEFAULT_FINISH_REASON: &str = "stop";

/// Parses one framed upstream line: a short type tag, a colon, then a JSON
/// payload. Returns `Ok(None)` for tags this translator does not know —
/// upstream adds tags over time and unknown ones must never kill the stream.
///
/// 已知的标签来自上游的行式流协议：`a0` 文本增量、`ad` 结束数据、`a3` 错误。
pub fn parse_stream_line(raw: &str) -> Result<Option<StreamEvent>, ProtocolError> {
    let line = raw.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some((tag, payload)) = line.split_once(':') else {
        return Err(ProtocolError {
            tag: truncate_tag(line),
            reason: "missing tag separator".to_string(),
        });
    };
    let tag = tag.trim();
    let payload = payload.trim();
    match tag {
        "a0" => {
            let text = parse_json_string(tag, payload)?;
            Ok(Some(StreamEvent::ContentDelta(text)))
        }
        "ad" => {
            let value: Value = serde_json::from_str(payload).map_err(|err| ProtocolError {
                tag: tag.to_string(),
                reason: err.to_string(),
            })?;
            let reason = value
                .get("finishReason")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or(DEFAULT_FINISH_REASON)
                .to_string();
            Ok(Some(StreamEvent::Finish(reason)))
        }
        "a3" => {
            let message = parse_json_string(tag, payload)?;
            Ok(Some(StreamEvent::UpstreamError(message)))
        }
        _ => Ok(None),
    }
}

fn parse_json_string(tag: &str, payload: &str) -> Result<String, ProtocolError> {
    let value: Value = serde_json::from_str(payload).map_err(|err| ProtocolError {
        tag: tag.to_string(),
        reason: err.to_string(),
    })?;
    match value {
        Value::String(text) => Ok(text),
        other => Err(ProtocolError {
            tag: tag.to_string(),
            reason: format!("expected json string, got {other}"),
        }),
    }
}

fn truncate_tag(line: &str) -> String {
    line.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta_line_yields_text() {
        let event = parse_stream_line("a0:\"Hello\"").expect("parse");
        assert_eq!(event, Some(StreamEvent::ContentDelta("Hello".to_string())));
    }

    #[test]
    fn content_delta_preserves_embedded_colons_and_escapes() {
        let event = parse_stream_line(r#"a0:"left: \"right\"""#).expect("parse");
        assert_eq!(
            event,
            Some(StreamEvent::ContentDelta("left: \"right\"".to_string()))
        );
    }

    #[test]
    fn finish_line_extracts_reason() {
        let event = parse_stream_line("ad:{\"finishReason\":\"stop\"}").expect("parse");
        assert_eq!(event, Some(StreamEvent::Finish("stop".to_string())));
    }

    #[test]
    fn finish_line_without_reason_defaults_to_stop() {
        let event = parse_stream_line("ad:{}").expect("parse");
        assert_eq!(event, Some(StreamEvent::Finish("stop".to_string())));
    }

    #[test]
    fn error_line_yields_upstream_error() {
        let event = parse_stream_line("a3:\"rate limited\"").expect("parse");
        assert_eq!(
            event,
            Some(StreamEvent::UpstreamError("rate limited".to_string()))
        );
    }

    #[test]
    fn unknown_tags_are_ignored_not_fatal() {
        assert_eq!(parse_stream_line("b7:{\"whatever\":1}").expect("parse"), None);
        assert_eq!(parse_stream_line("ab:\"reasoning\"").expect("parse"), None);
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_stream_line("   ").expect("parse"), None);
    }

    #[test]
    fn malformed_payload_is_a_recoverable_error() {
        let err = parse_stream_line("a0:not-json").expect_err("malformed");
        assert_eq!(err.tag, "a0");
        let err = parse_stream_line("ad:{truncated").expect_err("malformed");
        assert_eq!(err.tag, "ad");
    }

    #[test]
    fn line_without_separator_is_an_error() {
        assert!(parse_stream_line("garbage").is_err());
    }
}
