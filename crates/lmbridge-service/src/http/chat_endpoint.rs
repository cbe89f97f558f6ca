use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiny_http::{Header, Request, Response, StatusCode};

use lmbridge_core::jobs::{JobHandle, JobRegistry, Popped};
use lmbridge_core::protocol::{parse_stream_line, StreamEvent, DEFAULT_FINISH_REASON};
use lmbridge_core::storage::{now_ts, RequestLog};

use crate::gateway::openai::{
    build_upstream_request, completion_body, new_completion_id, parse_chat_request,
    sse_content_chunk, sse_finish_chunk, sse_initial_chunk, ChatRequest, SSE_DONE,
};
use crate::gateway::{run_cascade, CascadeOutcome};
use crate::state::BridgeState;

const STREAM_POP_SLICE: Duration = Duration::from_secs(1);

fn get_header_value<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers()
        .iter()
        .find(|header| header.field.as_str().as_str().eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str().trim())
        .filter(|value| !value.is_empty())
}

fn caller_authorized(request: &Request) -> bool {
    let Some(expected) = std::env::var("LMBRIDGE_API_KEY")
        .ok()
        .filter(|v| !v.trim().is_empty())
    else {
        // No credential configured: the surface is open (loopback deployments).
        return true;
    };
    let Some(value) = get_header_value(request, "Authorization") else {
        return false;
    };
    let candidate = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    crate::constant_time_eq(expected.trim().as_bytes(), candidate.as_bytes())
}

fn json_response(status: u16, body: String) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_string(body).with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    response
}

fn error_body(message: &str) -> String {
    serde_json::json!({
        "error": { "message": message, "type": "bridge_error" }
    })
    .to_string()
}

fn write_request_log(state: &BridgeState, chat: Option<&ChatRequest>, outcome: &Result<(u16, &str), String>) {
    let record = RequestLog {
        request_path: "/v1/chat/completions".to_string(),
        method: "POST".to_string(),
        model: chat.map(|c| c.model.clone()),
        strategy: outcome.as_ref().ok().map(|(_, name)| name.to_string()),
        status_code: outcome.as_ref().ok().map(|(status, _)| i64::from(*status)),
        error: outcome.as_ref().err().cloned(),
        created_at: now_ts(),
    };
    match state.storage.lock() {
        Ok(storage) => {
            if let Err(err) = storage.insert_request_log(&record) {
                log::warn!("request log write failed: {err}");
            }
        }
        Err(_) => log::warn!("request log skipped: storage lock poisoned"),
    }
}

pub fn handle_chat(state: &BridgeState, mut request: Request) {
    if !caller_authorized(&request) {
        let _ = request.respond(json_response(401, error_body("invalid api key")));
        return;
    }

    let mut body = Vec::new();
    if request.as_reader().read_to_end(&mut body).is_err() {
        let _ = request.respond(json_response(400, error_body("unreadable request body")));
        return;
    }
    let chat = match parse_chat_request(&body) {
        Ok(chat) => chat,
        Err(err) => {
            let _ = request.respond(json_response(400, error_body(&err)));
            return;
        }
    };

    let upstream = build_upstream_request(&chat);
    let outcome = match run_cascade(state, &upstream) {
        Ok(outcome) => outcome,
        Err(err) => {
            write_request_log(state, Some(&chat), &Err(err.to_string()));
            let _ = request.respond(json_response(err.client_status(), error_body(&err.to_string())));
            return;
        }
    };
    write_request_log(
        state,
        Some(&chat),
        &Ok((outcome.status, outcome.strategy)),
    );

    if chat.stream {
        respond_streaming(state, request, &chat, outcome);
    } else {
        respond_buffered(state, request, &chat, outcome);
    }
}

/// Drains the committed job into one buffered completion body. The drain is
/// bounded: a producer that vanishes after committing must not hang the
/// caller past the overall budget.
fn respond_buffered(
    state: &BridgeState,
    request: Request,
    chat: &ChatRequest,
    outcome: CascadeOutcome,
) {
    let deadline = Instant::now() + state.timeouts.overall;
    let (content, finish_reason) = drain_completion(&outcome.job, STREAM_POP_SLICE, deadline);
    state.registry.remove(outcome.job.id());

    let id = new_completion_id();
    let body = completion_body(&id, &chat.model, &content, &finish_reason);
    let _ = request.respond(json_response(200, body.to_string()));
}

fn drain_completion(job: &JobHandle, slice: Duration, deadline: Instant) -> (String, String) {
    let mut content = String::new();
    let mut finish_reason = DEFAULT_FINISH_REASON.to_string();
    loop {
        match job.pop_line(slice) {
            Popped::Line(line) => match parse_stream_line(&line) {
                Ok(Some(StreamEvent::ContentDelta(delta))) => content.push_str(&delta),
                Ok(Some(StreamEvent::Finish(reason))) => {
                    finish_reason = reason;
                    break;
                }
                Ok(Some(StreamEvent::UpstreamError(message))) => {
                    log::warn!("upstream error line mid-stream: {message}");
                    content.push_str(&message);
                    break;
                }
                Ok(None) => {}
                Err(err) => log::warn!("skipping malformed stream line: {err}"),
            },
            Popped::TimedOut => {
                if job.is_done() {
                    break;
                }
                if Instant::now() >= deadline {
                    log::warn!("gave up draining a silent producer: job={}", job.id());
                    break;
                }
            }
            Popped::EndOfStream => break,
        }
    }
    (content, finish_reason)
}

fn respond_streaming(
    state: &BridgeState,
    request: Request,
    chat: &ChatRequest,
    outcome: CascadeOutcome,
) {
    let reader = JobStreamReader::new(
        outcome.job,
        Arc::clone(&state.registry),
        chat.model.clone(),
        Instant::now() + state.timeouts.overall,
    );
    let headers = [
        ("Content-Type", "text/event-stream; charset=utf-8"),
        ("Cache-Control", "no-cache"),
    ]
    .iter()
    .filter_map(|(name, value)| Header::from_bytes(name.as_bytes(), value.as_bytes()).ok())
    .collect::<Vec<_>>();
    let response = Response::new(StatusCode(200), headers, reader, None, None);
    let _ = request.respond(response);
}

/// Pulls raw upstream lines off the committed job and serves them to
/// tiny_http as SSE bytes. Translation happens line by line; malformed lines
/// are logged and skipped, never fatal.
struct JobStreamReader {
    job: JobHandle,
    registry: Arc<JobRegistry>,
    model: String,
    completion_id: String,
    deadline: Instant,
    buffer: Vec<u8>,
    cursor: usize,
    sent_role: bool,
    finished: bool,
}

impl JobStreamReader {
    fn new(job: JobHandle, registry: Arc<JobRegistry>, model: String, deadline: Instant) -> Self {
        Self {
            job,
            registry,
            model,
            completion_id: new_completion_id(),
            deadline,
            buffer: Vec::new(),
            cursor: 0,
            sent_role: false,
            finished: false,
        }
    }

    fn queue(&mut self, frame: String) {
        self.buffer.extend_from_slice(frame.as_bytes());
    }

    fn finish(&mut self, reason: &str) {
        let frame = sse_finish_chunk(&self.completion_id, &self.model, reason);
        self.queue(frame);
        self.queue(SSE_DONE.to_string());
        self.finished = true;
    }

    fn refill(&mut self) {
        if !self.sent_role {
            self.sent_role = true;
            let frame = sse_initial_chunk(&self.completion_id, &self.model);
            self.queue(frame);
            return;
        }
        loop {
            match self.job.pop_line(STREAM_POP_SLICE) {
                Popped::Line(line) => match parse_stream_line(&line) {
                    Ok(Some(StreamEvent::ContentDelta(delta))) => {
                        let frame = sse_content_chunk(&self.completion_id, &self.model, &delta);
                        self.queue(frame);
                        return;
                    }
                    Ok(Some(StreamEvent::Finish(reason))) => {
                        self.finish(&reason);
                        return;
                    }
                    Ok(Some(StreamEvent::UpstreamError(message))) => {
                        log::warn!("upstream error line mid-stream: {message}");
                        let frame = sse_content_chunk(&self.completion_id, &self.model, &message);
                        self.queue(frame);
                        self.finish(DEFAULT_FINISH_REASON);
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => log::warn!("skipping malformed stream line: {err}"),
                },
                Popped::TimedOut => {
                    if self.job.is_done() || Instant::now() >= self.deadline {
                        self.finish(DEFAULT_FINISH_REASON);
                        return;
                    }
                }
                Popped::EndOfStream => {
                    self.finish(DEFAULT_FINISH_REASON);
                    return;
                }
            }
        }
    }
}

impl Read for JobStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cursor >= self.buffer.len() {
            self.buffer.clear();
            self.cursor = 0;
            if self.finished {
                return Ok(0);
            }
            self.refill();
            if self.buffer.is_empty() {
                return Ok(0);
            }
        }
        let available = &self.buffer[self.cursor..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.cursor += n;
        Ok(n)
    }
}

impl Drop for JobStreamReader {
    fn drop(&mut self) {
        // Client disconnects included: the record must not outlive the reader.
        self.registry.remove(self.job.id());
    }
}
