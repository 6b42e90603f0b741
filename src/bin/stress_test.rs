//! RowFlow Stress Test Binary
//!
//! A standalone binary for stress testing the transaction queue under
//! concurrent submission.
//! Run with: `cargo run --bin stress_test -- [OPTIONS]`
//!
//! This is separate from the regular test suite because:
//! 1. It can take a long time to run
//! 2. It's configurable via command-line arguments
//! 3. It reports throughput
//!
//! # Examples
//!
//! ```bash
//! # Default test: 10 submitting threads, 10000 transactions
//! cargo run --release --bin stress_test
//!
//! # Many small transactions with a cancellation storm
//! cargo run --release --bin stress_test -- --transactions 50000 --threads 32 --cancel-every 7
//!
//! # Bulk inserts through batch units of work
//! cargo run --release --bin stress_test -- --batch-size 100
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rowflow::{
    BatchExt, DatabaseConfig, DatabaseConnection, DatabaseContext, EntityAdapter, PrimaryKey,
    Result, TableId,
};

/// Stress test configuration
struct Config {
    /// Total number of transactions to submit
    num_transactions: usize,
    /// Number of threads submitting concurrently
    threads: usize,
    /// Cancel every Nth transaction before it runs (0 disables)
    cancel_every: usize,
    /// Rows per transaction, inserted as one batch
    batch_size: usize,
    /// Path to database file (or temp if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_transactions: 10_000,
            threads: 10,
            cancel_every: 0,
            batch_size: 1,
            db_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--transactions" | "-t" => {
                i += 1;
                config.num_transactions = args[i].parse().expect("Invalid --transactions value");
            }
            "--threads" | "-c" => {
                i += 1;
                config.threads = args[i].parse().expect("Invalid --threads value");
            }
            "--cancel-every" => {
                i += 1;
                config.cancel_every = args[i].parse().expect("Invalid --cancel-every value");
            }
            "--batch-size" | "-b" => {
                i += 1;
                config.batch_size = args[i].parse().expect("Invalid --batch-size value");
            }
            "--db" | "-d" => {
                i += 1;
                config.db_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"RowFlow Stress Test

Usage: stress_test [OPTIONS]

Options:
  -t, --transactions <N>  Transactions to submit (default: 10000)
  -c, --threads <N>       Submitting threads (default: 10)
  --cancel-every <N>      Cancel every Nth transaction by name (default: off)
  -b, --batch-size <N>    Rows per transaction (default: 1)
  -d, --db <PATH>         Database path (default: temp file)
  -h, --help              Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

#[derive(Debug, Clone)]
struct Row {
    id: Option<i64>,
    thread: i64,
    seq: i64,
}

struct RowAdapter;

impl EntityAdapter for RowAdapter {
    type Entity = Row;

    fn table(&self) -> TableId {
        TableId::new("stress")
    }

    fn primary_key(&self, entity: &Row) -> Option<PrimaryKey> {
        entity.id.map(PrimaryKey::from_raw)
    }

    fn insert(&self, conn: &DatabaseConnection, entity: &mut Row) -> Result<()> {
        conn.execute(
            "INSERT INTO stress (thread, seq) VALUES (?1, ?2)",
            [entity.thread, entity.seq],
        )?;
        entity.id = Some(conn.last_insert_rowid());
        Ok(())
    }

    fn update(&self, conn: &DatabaseConnection, entity: &Row) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE stress SET thread = ?1, seq = ?2 WHERE id = ?3",
            rusqlite::params![entity.thread, entity.seq, entity.id],
        )?;
        Ok(changed > 0)
    }

    fn delete(&self, conn: &DatabaseConnection, entity: &Row) -> Result<bool> {
        Ok(conn.execute("DELETE FROM stress WHERE id = ?1", [entity.id])? > 0)
    }

    fn exists(&self, conn: &DatabaseConnection, entity: &Row) -> Result<bool> {
        let Some(id) = entity.id else {
            return Ok(false);
        };
        Ok(conn
            .query_row("SELECT 1 FROM stress WHERE id = ?1", [id], |_| Ok(()))?
            .is_some())
    }

    fn load(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
        Ok(Row {
            id: row.get("id")?,
            thread: row.get("thread")?,
            seq: row.get("seq")?,
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let config = parse_args();

    println!("RowFlow Stress Test");
    println!("===================");
    println!("Transactions: {}", config.num_transactions);
    println!("Threads:      {}", config.threads);
    println!("Batch size:   {}", config.batch_size);
    println!(
        "Cancel every: {}",
        if config.cancel_every == 0 {
            "off".to_string()
        } else {
            config.cancel_every.to_string()
        }
    );
    println!();

    // Setup database
    let temp_dir = std::env::temp_dir().join(format!("rowflow-stress-{}", std::process::id()));
    std::fs::create_dir_all(&temp_dir).expect("create temp dir");
    let db_path = config
        .db_path
        .clone()
        .unwrap_or_else(|| temp_dir.join("stress.db").to_string_lossy().to_string());

    println!("Database:     {}", db_path);
    println!();

    let ctx = DatabaseContext::builder(DatabaseConfig::file("stress", &db_path))
        .create_table(
            "CREATE TABLE IF NOT EXISTS stress (id INTEGER PRIMARY KEY, thread INTEGER NOT NULL, seq INTEGER NOT NULL)",
        )
        .open()
        .expect("open database");
    ctx.execute_transaction(|conn: &mut DatabaseConnection| conn.execute("DELETE FROM stress", []))
        .expect("clear table");

    // Metrics
    let completed = Arc::new(AtomicU64::new(0));
    let cancelled = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicU64::new(0));
    let events = Arc::new(AtomicU64::new(0));

    // Order in which the worker ran each thread's transactions
    let run_order: Arc<Mutex<Vec<(i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));

    let mut subscription = ctx.notifier().subscribe_table("stress");
    let event_counter = Arc::clone(&events);
    let event_task = tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            if event.is_ok() {
                event_counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    println!("Starting stress test...");
    let start = Instant::now();

    let per_thread = config.num_transactions / config.threads.max(1);
    let adapter = Arc::new(RowAdapter);
    let mut threads = Vec::new();

    for thread_id in 0..config.threads {
        let ctx = ctx.clone();
        let adapter = Arc::clone(&adapter);
        let completed = Arc::clone(&completed);
        let cancelled = Arc::clone(&cancelled);
        let errors = Arc::clone(&errors);
        let run_order = Arc::clone(&run_order);
        let cancel_every = config.cancel_every;
        let batch_size = config.batch_size.max(1);

        threads.push(std::thread::spawn(move || {
            for seq in 0..per_thread {
                let rows: Vec<Row> = (0..batch_size)
                    .map(|_| Row {
                        id: None,
                        thread: thread_id as i64,
                        seq: seq as i64,
                    })
                    .collect();
                let name = format!("t{thread_id}-{seq}");
                let completed = Arc::clone(&completed);
                let errors = Arc::clone(&errors);
                let run_order = Arc::clone(&run_order);
                let marker = (thread_id as i64, seq as i64);

                ctx.begin_transaction_async(rows.fast_insert(Arc::clone(&adapter)).build())
                    .name(name.clone())
                    .run_callbacks_on_same_thread(true)
                    .success(move |_| {
                        run_order.lock().unwrap().push(marker);
                        completed.fetch_add(1, Ordering::Relaxed);
                    })
                    .error(move |_| {
                        errors.fetch_add(1, Ordering::Relaxed);
                    })
                    .execute()
                    .expect("submit transaction");

                if cancel_every > 0 && seq % cancel_every == 0 {
                    cancelled.fetch_add(ctx.coordinator().cancel(&name), Ordering::Relaxed);
                }
            }
        }));
    }

    for thread in threads {
        thread.join().unwrap();
    }

    let submitted = (per_thread * config.threads) as u64;
    let cancelled_count = cancelled.load(Ordering::Relaxed) as u64;
    while completed.load(Ordering::Relaxed) + errors.load(Ordering::Relaxed) + cancelled_count
        < submitted
    {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let elapsed = start.elapsed();

    // Report metrics
    let completed_count = completed.load(Ordering::Relaxed);
    let error_count = errors.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Completed:       {}", completed_count);
    println!("Cancelled:       {}", cancelled_count);
    println!("Errors:          {}", error_count);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} transactions/sec",
        completed_count as f64 / elapsed.as_secs_f64()
    );
    println!();

    // Verify invariants
    println!("Verifying invariants...");

    let row_count: i64 = ctx
        .execute_transaction(|conn: &mut DatabaseConnection| -> Result<i64> {
            Ok(conn
                .query_row("SELECT COUNT(*) FROM stress", [], |row| row.get(0))?
                .unwrap_or(0))
        })
        .unwrap();
    println!("  Rows in database: {}", row_count);
    assert_eq!(
        row_count as u64,
        completed_count * config.batch_size.max(1) as u64,
        "Row count mismatch: {} in DB, {} completed",
        row_count,
        completed_count
    );
    println!("  Atomicity:         every completed batch fully stored ✓");

    let order = run_order.lock().unwrap().clone();
    for thread_id in 0..config.threads as i64 {
        let seqs: Vec<i64> = order
            .iter()
            .filter(|(t, _)| *t == thread_id)
            .map(|(_, s)| *s)
            .collect();
        assert!(
            seqs.windows(2).all(|w| w[0] < w[1]),
            "Thread {} ran out of submission order",
            thread_id
        );
    }
    println!("  Ordering:          per-thread submission order preserved ✓");

    // The broadcast channel may lag under load; it never over-delivers.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let event_count = events.load(Ordering::Relaxed);
    assert!(
        event_count <= completed_count,
        "More change events ({}) than completed batches ({})",
        event_count,
        completed_count
    );
    println!("  Change events:     {} received ✓", event_count);
    event_task.abort();

    ctx.close();
    println!();
    println!("Stress test PASSED ✓");
}
