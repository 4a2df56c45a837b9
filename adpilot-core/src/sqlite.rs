use rusqlite::Connection;

/// Connection setup shared by every store in the pipeline. These are
/// small metadata databases (cache entries, quota counters, experiment
/// and approval rows) written in short bursts by concurrent workers:
/// WAL keeps readers off the writer's lock, a few megabytes of page
/// cache covers the working set, and the busy timeout outlasts any
/// single write burst.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA cache_size = -4096;\n\
         PRAGMA busy_timeout = 2000;\n",
    )
}
