/// Returns true for DSNs that open an in-memory sqlite database
pub fn is_in_memory(dsn: &str) -> bool {
    dsn == "sqlite::memory:" || dsn.contains("mode=memory")
}

/// Add mode=rwc to a sqlite file DSN so the database file is created if it doesn't exist
pub fn sqlite_dsn_with_create(dsn: &str) -> String {
    if is_in_memory(dsn) || dsn.contains("mode=") {
        dsn.to_string()
    } else if dsn.contains('?') {
        format!("{dsn}&mode=rwc")
    } else {
        format!("{dsn}?mode=rwc")
    }
}
