#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use rowflow::{
    DatabaseConfig, DatabaseConnection, DatabaseContext, EntityAdapter, ModelLruCache,
    PrimaryKey, Result, TableId,
};
use rusqlite::Row;

pub const CREATE_NOTES: &str =
    "CREATE TABLE notes (id INTEGER PRIMARY KEY, title TEXT NOT NULL, body TEXT NOT NULL DEFAULT '')";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// A context on a fresh file with the `notes` table.
pub fn open_notes_db(name: &str) -> (tempfile::TempDir, DatabaseContext) {
    init_tracing();
    let (dir, path) = create_temp_db_file(&format!("{name}.db"));
    let ctx = DatabaseContext::builder(DatabaseConfig::file(name, path))
        .create_table(CREATE_NOTES)
        .open()
        .expect("open database");
    (dir, ctx)
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

/// Queues a unit of work that holds the worker until `release` is sent.
///
/// Returns once the blocker is running.
pub fn block_queue(ctx: &DatabaseContext, name: &str) -> mpsc::Sender<()> {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    ctx.begin_transaction_async(move |_: &mut DatabaseConnection| -> Result<()> {
        started_tx.send(()).expect("signal start");
        let _ = release_rx.recv();
        Ok(())
    })
    .name(name)
    .execute()
    .expect("queue blocker");
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("blocker started");
    release_tx
}

pub fn count_notes(ctx: &DatabaseContext) -> i64 {
    ctx.execute_transaction(|conn: &mut DatabaseConnection| -> Result<i64> {
        Ok(conn
            .query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?
            .unwrap_or(0))
    })
    .expect("count notes")
}

// =============================================================================
// Note Entity
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub id: Option<i64>,
    pub title: String,
    pub body: String,
}

impl Note {
    pub fn new(title: &str) -> Self {
        Self {
            id: None,
            title: title.to_string(),
            body: String::new(),
        }
    }
}

pub fn load_note(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get("id")?,
        title: row.get("title")?,
        body: row.get("body")?,
    })
}

#[derive(Default)]
pub struct NoteAdapter {
    pub cache: ModelLruCache<Note>,
}

impl EntityAdapter for NoteAdapter {
    type Entity = Note;

    fn table(&self) -> TableId {
        TableId::new("notes")
    }

    fn primary_key(&self, entity: &Note) -> Option<PrimaryKey> {
        entity.id.map(PrimaryKey::from_raw)
    }

    fn insert(&self, conn: &DatabaseConnection, entity: &mut Note) -> Result<()> {
        conn.execute(
            "INSERT INTO notes (id, title, body) VALUES (?1, ?2, ?3)",
            rusqlite::params![entity.id, entity.title, entity.body],
        )?;
        entity.id = Some(conn.last_insert_rowid());
        Ok(())
    }

    fn update(&self, conn: &DatabaseConnection, entity: &Note) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE notes SET title = ?1, body = ?2 WHERE id = ?3",
            rusqlite::params![entity.title, entity.body, entity.id],
        )?;
        Ok(changed > 0)
    }

    fn delete(&self, conn: &DatabaseConnection, entity: &Note) -> Result<bool> {
        Ok(conn.execute("DELETE FROM notes WHERE id = ?1", [entity.id])? > 0)
    }

    fn exists(&self, conn: &DatabaseConnection, entity: &Note) -> Result<bool> {
        let Some(id) = entity.id else {
            return Ok(false);
        };
        Ok(conn
            .query_row("SELECT 1 FROM notes WHERE id = ?1", [id], |_| Ok(()))?
            .is_some())
    }

    fn load(&self, row: &Row<'_>) -> rusqlite::Result<Note> {
        load_note(row)
    }

    fn cache(&self) -> Option<&ModelLruCache<Note>> {
        Some(&self.cache)
    }
}
