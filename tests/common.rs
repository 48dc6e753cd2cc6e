#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ledgerdb::{Database, Event, PersistedEvent, RegisteredProjector, Result};
use parking_lot::Mutex;
use rusqlite::Connection;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_temp_db(name: &str) -> (tempfile::TempDir, Database) {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let db = Database::open(dir.path().join(name)).expect("open database");
    (dir, db)
}

/// A stream id no other test uses.
pub fn unique_stream(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

pub fn events(event_type: &str, n: usize) -> Vec<Event> {
    (0..n)
        .map(|i| Event::new(event_type, format!("{{\"n\":{i}}}").into_bytes()))
        .collect()
}

/// A projector that records `stream_id@version` for every event it sees.
pub fn recorder() -> (RegisteredProjector, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let projector = RegisteredProjector::basic(
        move |_: &Connection, e: &PersistedEvent| -> Result<()> {
            sink.lock().push(e.stream_id.to_string());
            Ok(())
        },
    );
    (projector, seen)
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
