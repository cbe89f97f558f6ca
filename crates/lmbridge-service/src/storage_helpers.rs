use lmbridge_core::storage::Storage;

const DEFAULT_DB_PATH: &str = "lmbridge.db";

/// Opens (and migrates) the request-log database. Path comes from
/// `LMBRIDGE_DB_PATH`, defaulting to a file next to the binary.
pub fn open_storage() -> Result<Storage, String> {
    let path = std::env::var("LMBRIDGE_DB_PATH")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
    let storage = Storage::open(&path).map_err(|err| format!("open storage {path}: {err}"))?;
    storage
        .init()
        .map_err(|err| format!("migrate storage {path}: {err}"))?;
    Ok(storage)
}
