use std::sync::LazyLock;

use tokio::sync::{Mutex, MutexGuard};

use db::{DbConfig, DbError};

/// Tables wiped between tests; the connection is process-wide.
const TABLES: [&str; 3] = ["ns_job", "ns_counter", "ns_queue"];

/// One runtime for all tests: the connection's background task lives on the
/// runtime that opened it, so per-test runtimes would close it.
static RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build test runtime")
});

pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    RUNTIME.block_on(future)
}

static DB_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

/// Hold the returned guard for the whole test.
pub async fn setup_db() -> Result<MutexGuard<'static, ()>, DbError> {
    let guard = DB_LOCK.lock().await;
    db::init(DbConfig::memory()).await?;
    let conn = db::get_db()?;
    for table in TABLES {
        conn.query(format!("DELETE {table};")).await?;
    }
    Ok(guard)
}
