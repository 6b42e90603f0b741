//! Batch and Change Notification Tests
//!
//! Tests the invariants around bulk entity operations:
//! - A batch leaves the table exactly as the equivalent single operations would
//! - A batch publishes one change event, before its success callback runs
//! - A failing batch rolls back and publishes nothing
//! - A panicking observer does not stop other observers or the queue

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Note, NoteAdapter};
use rowflow::{
    BatchExt, ChangeAction, DatabaseConnection, EntityAdapter, PrimaryKey, Result, TableId,
};

fn load_titles(ctx: &rowflow::DatabaseContext) -> Vec<(i64, String)> {
    ctx.execute_transaction(|conn: &mut DatabaseConnection| -> Result<Vec<(i64, String)>> {
        conn.query_list("SELECT id, title FROM notes ORDER BY id", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
    })
    .unwrap()
}

/// Tests that a batch save produces the same rows as saving one by one.
#[test]
fn batch_save_matches_single_saves() {
    let (_dir_a, batch_ctx) = common::open_notes_db("batch_eq_a");
    let (_dir_b, single_ctx) = common::open_notes_db("batch_eq_b");
    let adapter = Arc::new(NoteAdapter::default());
    let notes = vec![Note::new("alpha"), Note::new("beta"), Note::new("gamma")];

    let saved = batch_ctx
        .execute_transaction(notes.clone().fast_save(Arc::clone(&adapter)).build())
        .unwrap();
    assert!(saved.iter().all(|note| note.id.is_some()));

    for note in notes {
        let adapter = Arc::clone(&adapter);
        single_ctx
            .execute_transaction(move |conn: &mut DatabaseConnection| -> Result<()> {
                let mut note = note;
                adapter.save(conn, &mut note)
            })
            .unwrap();
    }

    assert_eq!(load_titles(&batch_ctx), load_titles(&single_ctx));
}

/// Tests that saving stored entities updates them instead of inserting duplicates.
#[test]
fn batch_save_updates_existing_rows() {
    let (_dir, ctx) = common::open_notes_db("batch_update");
    let adapter = Arc::new(NoteAdapter::default());

    let mut saved = ctx
        .execute_transaction(
            vec![Note::new("draft"), Note::new("todo")].fast_insert(Arc::clone(&adapter)).build(),
        )
        .unwrap();
    saved[0].title = "final".to_string();

    ctx.execute_transaction(saved.clone().fast_save(Arc::clone(&adapter)).build())
        .unwrap();

    let titles: Vec<String> = load_titles(&ctx).into_iter().map(|(_, t)| t).collect();
    assert_eq!(titles, vec!["final".to_string(), "todo".to_string()]);

    let key = PrimaryKey::from_raw(saved[0].id.unwrap());
    assert_eq!(adapter.cache.get(key).map(|n| n.title), Some("final".to_string()));

    ctx.execute_transaction(saved.clone().fast_delete(Arc::clone(&adapter)).build())
        .unwrap();
    assert_eq!(common::count_notes(&ctx), 0);
    assert!(adapter.cache.get(key).is_none());
}

/// Tests that a batch publishes one event carrying every key, before its success callback.
#[tokio::test]
async fn batch_change_event_precedes_success_callback() {
    let (_dir, ctx) = common::open_notes_db("batch_order");
    let adapter = Arc::new(NoteAdapter::default());
    let log = Arc::new(Mutex::new(Vec::new()));

    let register = ctx.notifier().new_register();
    register.register("notes");
    {
        let log = Arc::clone(&log);
        register.set_listener(move |table: &TableId, action: ChangeAction| {
            log.lock().unwrap().push(format!("{table}:{action}"));
        });
    }
    let mut subscription = ctx.notifier().subscribe_table("notes");

    {
        let log = Arc::clone(&log);
        ctx.begin_transaction_async(
            vec![Note::new("a"), Note::new("b"), Note::new("c")].fast_insert(Arc::clone(&adapter)).build(),
        )
        .run_callbacks_on_same_thread(true)
        .success(move |notes| {
            log.lock().unwrap().push(format!("success:{}", notes.len()));
        })
        .execute()
        .unwrap();
    }

    let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.table, TableId::new("notes"));
    assert_eq!(event.action, ChangeAction::Insert);
    assert_eq!(event.affected_keys.as_ref().map(|keys| keys.len()), Some(3));

    common::eventually(Duration::from_secs(5), Duration::from_millis(10), || {
        (log.lock().unwrap().len() == 2).then_some(())
    })
    .await;
    assert_eq!(
        *log.lock().unwrap(),
        vec!["notes:insert".to_string(), "success:3".to_string()]
    );
    assert!(subscription.try_next().is_none());
}

/// Tests that a batch which fails midway leaves no rows and publishes nothing.
#[tokio::test]
async fn failed_batch_rolls_back_without_events() {
    let (_dir, ctx) = common::open_notes_db("batch_fail");
    let adapter = Arc::new(NoteAdapter::default());
    let mut subscription = ctx.notifier().subscribe();

    let mut duplicate = Note::new("dup");
    duplicate.id = Some(7);
    let err = ctx
        .transact(
            vec![duplicate.clone(), duplicate].fast_insert(Arc::clone(&adapter)).build(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, rowflow::Error::Sqlite(_)));
    assert_eq!(common::count_notes(&ctx), 0);
    assert!(adapter.cache.is_empty());
    assert!(subscription.try_next().is_none());
}

/// Tests that a batch which succeeded inside a unit of work that later fails
/// leaves no rows, no cached entities and no events.
#[tokio::test]
async fn batch_in_failed_unit_publishes_nothing() {
    let (_dir, ctx) = common::open_notes_db("batch_then_fail");
    let adapter = Arc::new(NoteAdapter::default());
    let mut subscription = ctx.notifier().subscribe();

    let err = {
        let adapter = Arc::clone(&adapter);
        ctx.transact(move |conn: &mut DatabaseConnection| -> Result<()> {
            let mut notes = vec![Note::new("ghost")];
            adapter.insert_all(conn, &mut notes)?;
            Err(rowflow::Error::work("later step failed"))
        })
        .await
        .unwrap_err()
    };

    assert!(matches!(err, rowflow::Error::Work(_)));
    assert_eq!(common::count_notes(&ctx), 0);
    assert!(adapter.cache.is_empty());
    assert!(subscription.try_next().is_none());

    // The same write committed is cached and published once.
    ctx.transact(vec![Note::new("kept")].fast_insert(Arc::clone(&adapter)).build())
        .await
        .unwrap();
    assert_eq!(adapter.cache.len(), 1);
    let event = subscription.try_next().unwrap().unwrap();
    assert_eq!(event.action, ChangeAction::Insert);
}

/// Tests that one panicking observer does not keep others from being notified.
#[tokio::test]
async fn panicking_observer_is_isolated() {
    let (_dir, ctx) = common::open_notes_db("observer_panic");
    let adapter = Arc::new(NoteAdapter::default());
    let calls = Arc::new(AtomicUsize::new(0));

    let faulty = ctx.notifier().new_register();
    faulty.register("notes");
    faulty.set_listener(|_: &TableId, _: ChangeAction| panic!("observer bug"));

    let healthy = ctx.notifier().new_register();
    healthy.register("notes");
    {
        let calls = Arc::clone(&calls);
        healthy.set_listener(move |_: &TableId, _: ChangeAction| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    let saved = ctx
        .transact(vec![Note::new("one")].fast_save(Arc::clone(&adapter)).build())
        .await
        .unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    ctx.transact(vec![Note::new("two")].fast_save(Arc::clone(&adapter)).build())
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(common::count_notes(&ctx), 2);
}

/// Tests that unregistered tables are not delivered and dropping a register stops delivery.
#[test]
fn register_only_hears_its_tables() {
    let (_dir, ctx) = common::open_notes_db("register_tables");
    let calls = Arc::new(AtomicUsize::new(0));

    let register = ctx.notifier().new_register();
    register.register("notes");
    {
        let calls = Arc::clone(&calls);
        register.set_listener(move |_: &TableId, _: ChangeAction| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    ctx.notifier().notify_table_changed("tags", ChangeAction::Change);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    ctx.notifier().notify_table_changed("notes", ChangeAction::Change);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(register);
    ctx.notifier().notify_table_changed("notes", ChangeAction::Change);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.notifier().register_count(), 0);
}
