//! Session model and active-session record stores.

use warden::session::{
    validate_slug, MemorySessionStore, Session, SessionRecord, SessionSource, SessionStore,
    SqliteSessionStore,
};

fn record(id: &str, container: &str) -> SessionRecord {
    SessionRecord::new(id, container, Some("acme".to_owned()))
}

async fn exercise_store(store: &dyn SessionStore) {
    assert_eq!(store.active_count("warden-ws-acme").await.expect("count"), 0);

    store.register(&record("s1", "warden-ws-acme")).await.expect("register");
    store.register(&record("s2", "warden-ws-acme")).await.expect("register");
    store.register(&record("s3", "warden-default")).await.expect("register");
    assert_eq!(store.active_count("warden-ws-acme").await.expect("count"), 2);
    assert_eq!(store.active_count("warden-default").await.expect("count"), 1);

    store.complete("s1").await.expect("complete");
    store.complete("s1").await.expect("completing twice is harmless");
    store.complete("never-registered").await.expect("unknown id is harmless");
    assert_eq!(store.active_count("warden-ws-acme").await.expect("count"), 1);
}

#[tokio::test]
async fn memory_store_tracks_active_sessions() {
    exercise_store(&MemorySessionStore::new()).await;
}

#[tokio::test]
async fn sqlite_store_tracks_active_sessions() {
    let store = SqliteSessionStore::in_memory().await.expect("open");
    exercise_store(&store).await;
}

/// Pid of a process that has already exited and been reaped.
fn exited_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("reap true");
    pid
}

#[tokio::test]
async fn sqlite_store_closes_orphans_from_a_previous_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("state/sessions.db");
    let dead = exited_pid();

    {
        let store = SqliteSessionStore::open(&path).await.expect("open");
        let mut crashed = record("s1", "warden-ws-acme");
        crashed.owner_pid = dead;
        store.register(&crashed).await.expect("register");
        let mut finished = record("s2", "warden-default");
        finished.owner_pid = dead;
        store.register(&finished).await.expect("register");
        store.complete("s2").await.expect("complete");
    }

    let store = SqliteSessionStore::open(&path).await.expect("reopen");
    assert_eq!(store.active_count("warden-ws-acme").await.expect("count"), 1);
    assert_eq!(store.mark_orphaned().await.expect("orphan"), 1);
    assert_eq!(store.active_count("warden-ws-acme").await.expect("count"), 0);
    assert_eq!(store.mark_orphaned().await.expect("orphan"), 0);
}

#[tokio::test]
async fn sessions_of_a_live_concurrent_run_are_not_orphaned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sessions.db");

    let mut other_run = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep");
    let store = SqliteSessionStore::open(&path).await.expect("open");
    let mut live = record("live", "warden-ws-acme");
    live.owner_pid = other_run.id();
    store.register(&live).await.expect("register");
    let mut crashed = record("crashed", "warden-ws-acme");
    crashed.owner_pid = exited_pid();
    store.register(&crashed).await.expect("register");
    store.register(&record("mine", "warden-ws-acme")).await.expect("register");

    let orphaned = store.mark_orphaned().await.expect("orphan");
    other_run.kill().expect("kill sleep");
    other_run.wait().expect("reap sleep");

    assert_eq!(orphaned, 1);
    assert_eq!(store.active_count("warden-ws-acme").await.expect("count"), 2);
}

#[tokio::test]
async fn records_from_before_owner_tracking_are_orphaned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("legacy.db");
    let url = format!("sqlite://{}?mode=rwc", path.display());
    {
        let pool = sqlx::SqlitePool::connect(&url).await.expect("connect");
        sqlx::query(
            "CREATE TABLE session_records (id TEXT PRIMARY KEY, container TEXT NOT NULL, \
             workspace TEXT, status TEXT NOT NULL, started_at TEXT NOT NULL, ended_at TEXT)",
        )
        .execute(&pool)
        .await
        .expect("legacy schema");
        sqlx::query(
            "INSERT INTO session_records VALUES ('old', 'warden-default', NULL, 'active', '2024-01-01T00:00:00Z', NULL)",
        )
        .execute(&pool)
        .await
        .expect("legacy row");
        pool.close().await;
    }

    let store = SqliteSessionStore::open(&path).await.expect("open migrates");
    assert_eq!(store.active_count("warden-default").await.expect("count"), 1);
    assert_eq!(store.mark_orphaned().await.expect("orphan"), 1);
    assert_eq!(store.active_count("warden-default").await.expect("count"), 0);
}

#[test]
fn slugs_must_be_filesystem_safe() {
    for ok in ["acme", "a", "team-1", "x_y", "0day"] {
        assert!(validate_slug(ok).is_ok(), "{ok} should be accepted");
    }
    let too_long = "a".repeat(64);
    for bad in ["", "Acme", "../etc", "a/b", "-lead", "with space", too_long.as_str()] {
        assert!(validate_slug(bad).is_err(), "{bad:?} should be rejected");
    }
}

#[test]
fn sources_parse_and_classify() {
    assert_eq!("telegram".parse::<SessionSource>(), Ok(SessionSource::Telegram));
    assert_eq!("Interactive".parse::<SessionSource>(), Ok(SessionSource::App));
    assert!("sms".parse::<SessionSource>().is_err());
    assert!(SessionSource::Discord.is_bot());
    assert!(!SessionSource::App.is_bot());
}

#[test]
fn sessions_get_unique_ids_and_a_type() {
    let a = Session::new(Some(SessionSource::Matrix));
    let b = Session::new(None);
    assert_ne!(a.id, b.id);
    assert_eq!(a.session_type(), "matrix");
    assert_eq!(b.session_type(), "unknown");
}
