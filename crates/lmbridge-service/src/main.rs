fn main() {
    env_logger::init();
    let addr = std::env::var("LMBRIDGE_ADDR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| lmbridge_service::DEFAULT_ADDR.to_string());
    log::info!("lmbridge listening on {addr}");
    if let Err(err) = lmbridge_service::start_server(&addr) {
        log::error!("server exited with error: {err}");
        std::process::exit(1);
    }
}
