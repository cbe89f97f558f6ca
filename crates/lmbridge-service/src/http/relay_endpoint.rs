use serde_json::Value;
use std::io::Read;
use tiny_http::{Header, Request, Response};

use lmbridge_core::jobs::{JobHandle, Phase};

use crate::gateway::metrics::record_relay_claim;
use crate::state::BridgeState;

fn json_response(status: u16, body: String) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_string(body).with_status_code(status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    response
}

fn ok_body() -> String {
    "{\"ok\":true}".to_string()
}

fn error_json(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

/// Producer poll: hand out the next pending relay claim, 204 when idle.
/// Polling itself advances the liveness watermark even when nothing is
/// pending.
pub fn handle_poll(state: &BridgeState, request: Request) {
    match state.relay_queue.claim_next(&state.registry) {
        Some(claim) => {
            record_relay_claim();
            let _ = request.respond(json_response(200, claim.to_string()));
        }
        None => {
            let _ = request.respond(Response::from_string("").with_status_code(204));
        }
    }
}

fn read_json_body(request: &mut Request) -> Result<Value, String> {
    let mut body = Vec::new();
    request
        .as_reader()
        .read_to_end(&mut body)
        .map_err(|err| format!("unreadable body: {err}"))?;
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&body).map_err(|err| format!("invalid json body: {err}"))
}

/// `/relay/jobs/{id}/{action}` producer reports. Unknown job → 404; a job the
/// cascade has already abandoned → 410, telling the producer to stop.
pub fn handle_job_report(state: &BridgeState, mut request: Request, path: &str) {
    let mut segments = path
        .trim_start_matches("/relay/jobs/")
        .splitn(2, '/');
    let (Some(job_id), Some(action)) = (segments.next(), segments.next()) else {
        let _ = request.respond(json_response(400, error_json("malformed relay path")));
        return;
    };
    let job_id = job_id.to_string();
    let action = action.to_string();

    state.relay_queue.note_activity();
    let Some(job) = state.registry.get(&job_id) else {
        let _ = request.respond(json_response(404, error_json("unknown job")));
        return;
    };
    if job.is_abandoned() {
        let _ = request.respond(json_response(410, error_json("job gone")));
        return;
    }

    let body = match read_json_body(&mut request) {
        Ok(body) => body,
        Err(err) => {
            let _ = request.respond(json_response(400, error_json(&err)));
            return;
        }
    };

    let result = match action.as_str() {
        "phase" => apply_phase_report(&job, &body),
        "status" => apply_status_report(&job, &body),
        "lines" => apply_lines_report(&job, &body),
        "done" => apply_done_report(&job, &body),
        _ => Err(format!("unknown relay action: {action}")),
    };
    match result {
        Ok(()) => {
            let _ = request.respond(json_response(200, ok_body()));
        }
        Err(err) => {
            let _ = request.respond(json_response(400, error_json(&err)));
        }
    }
}

fn apply_phase_report(job: &JobHandle, body: &Value) -> Result<(), String> {
    let raw = body
        .get("phase")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing phase".to_string())?;
    let phase = Phase::parse(raw).ok_or_else(|| format!("unknown phase: {raw}"))?;
    job.transition_phase(phase).map_err(|err| err.to_string())?;
    if body
        .get("upstream_fetch_started")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        job.mark_upstream_fetch_started();
    }
    Ok(())
}

fn apply_status_report(job: &JobHandle, body: &Value) -> Result<(), String> {
    let status = body
        .get("status")
        .and_then(Value::as_u64)
        .filter(|v| *v <= u64::from(u16::MAX))
        .ok_or_else(|| "missing or invalid status".to_string())?;
    job.set_status(status as u16);
    Ok(())
}

fn apply_lines_report(job: &JobHandle, body: &Value) -> Result<(), String> {
    let lines = body
        .get("lines")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing lines".to_string())?;
    for line in lines {
        let Some(text) = line.as_str() else {
            return Err("lines must be strings".to_string());
        };
        // 任务在批量上报中途被放弃时静默丢弃剩余行，不算协议错误。
        if !job.push_line(text.to_string()) {
            break;
        }
    }
    Ok(())
}

fn apply_done_report(job: &JobHandle, body: &Value) -> Result<(), String> {
    match body.get("error").and_then(Value::as_str) {
        Some(reason) if !reason.trim().is_empty() => job.mark_failed(reason),
        _ => {
            job.push_end_of_stream();
            job.mark_done();
        }
    }
    Ok(())
}
