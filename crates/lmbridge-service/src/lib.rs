use std::io::{self, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub mod browser;
pub mod gateway;
pub mod http;
pub mod session;
pub mod state;
mod storage_helpers;
pub mod strategies;

pub use state::BridgeState;

pub const DEFAULT_ADDR: &str = "localhost:48790";

const REGISTRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn start_server(addr: &str) -> io::Result<()> {
    let state = BridgeState::from_env()
        .map(Arc::new)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    ensure_registry_sweeper(Arc::clone(&state));
    http::server::start_http(addr, state)
}

/// Background sweep for jobs whose consumer never came back (disconnects
/// before commit, producers reporting into the void). Terminal jobs are
/// dropped, stragglers force-expired.
fn ensure_registry_sweeper(state: Arc<BridgeState>) {
    let max_age = state.timeouts.overall * 2;
    thread::spawn(move || loop {
        thread::sleep(REGISTRY_SWEEP_INTERVAL);
        if shutdown_requested() {
            break;
        }
        let removed = state.registry.sweep(max_age);
        if removed > 0 {
            log::info!("registry sweep removed {removed} stale jobs");
        }
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

pub fn clear_shutdown_flag() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
}

pub fn request_shutdown(addr: &str) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    // Best-effort wakeups for both loopback stacks so whichever listener is
    // active exits.
    let _ = send_shutdown_request(addr);
    if let Some(port) = addr.trim().strip_prefix("localhost:") {
        let _ = send_shutdown_request(&format!("127.0.0.1:{port}"));
        let _ = send_shutdown_request(&format!("[::1]:{port}"));
    }
}

fn send_shutdown_request(addr: &str) -> io::Result<()> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Ok(());
    }
    let addr = addr.strip_prefix("http://").unwrap_or(addr);
    let addr = addr.strip_prefix("https://").unwrap_or(addr);
    let addr = addr.split('/').next().unwrap_or(addr);
    let mut stream = TcpStream::connect(addr)?;
    let _ = stream.set_write_timeout(Some(Duration::from_millis(200)));
    let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
    let request = format!(
        "GET /__shutdown HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;
    Ok(())
}

pub(crate) fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in left.iter().zip(right.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}
