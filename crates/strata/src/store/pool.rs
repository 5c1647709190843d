//! Per-thread connection pool for one directory store.
//!
//! Each caller thread gets its own `SQLite` connection. Entries remember a
//! weak handle to a thread-local token; once the owning thread exits the
//! token is dropped and the entry is pruned by the next sweep. All pool
//! mutation (insert, prune, clear) happens under the pool mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::error::{Error, Result};

thread_local! {
    static THREAD_TOKEN: Arc<()> = Arc::new(());
}

/// Minimum time between sweeps triggered from [`ConnectionPool::acquire`].
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

struct PoolEntry {
    conn: Arc<Mutex<Connection>>,
    owner: Weak<()>,
}

struct PoolState {
    entries: HashMap<ThreadId, PoolEntry>,
    last_sweep: Instant,
}

/// Connections to one database file, keyed by caller thread.
pub struct ConnectionPool {
    db_path: PathBuf,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Create an empty pool for `db_path`.
    #[must_use]
    pub fn new(db_path: &Path) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Database file served by this pool.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn state(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|e| {
            Error::Internal(format!(
                "connection pool mutex poisoned (a thread panicked while holding the lock): {e}"
            ))
        })
    }

    /// Connection for the calling thread, opened on first use.
    pub fn acquire(&self) -> Result<Arc<Mutex<Connection>>> {
        let thread_id = thread::current().id();
        let token = THREAD_TOKEN.with(Arc::downgrade);

        let mut state = self.state()?;
        if state.last_sweep.elapsed() >= SWEEP_INTERVAL {
            let pruned = prune(&mut state);
            if pruned > 0 {
                tracing::trace!(pruned, db = %self.db_path.display(), "Pruned dead connections");
            }
        }

        if let Some(entry) = state.entries.get(&thread_id) {
            if entry.owner.strong_count() > 0 {
                return Ok(Arc::clone(&entry.conn));
            }
        }

        let conn = Arc::new(Mutex::new(open_connection(&self.db_path)?));
        state.entries.insert(
            thread_id,
            PoolEntry {
                conn: Arc::clone(&conn),
                owner: token,
            },
        );
        Ok(conn)
    }

    /// Run `f` with the calling thread's connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let conn = self.acquire()?;
        let mut guard = conn.lock().map_err(|e| {
            Error::Internal(format!("connection mutex poisoned: {e}"))
        })?;
        f(&mut *guard)
    }

    /// Drop connections whose threads have exited. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        let mut state = self.state()?;
        Ok(prune(&mut state))
    }

    /// Drop every pooled connection.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state()?;
        state.entries.clear();
        Ok(())
    }

    /// Number of pooled connections.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state()?.entries.len())
    }

    /// Whether the pool holds no connections.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn prune(state: &mut PoolState) -> usize {
    let before = state.entries.len();
    state.entries.retain(|_, entry| entry.owner.strong_count() > 0);
    state.last_sweep = Instant::now();
    before - state.entries.len()
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Background thread sweeping a pool at a fixed interval.
///
/// The thread stops when the handle is dropped or the pool is gone.
pub struct SweeperHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Connection sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start a sweeper for `pool`.
pub fn spawn_sweeper(pool: &Arc<ConnectionPool>, interval: Duration) -> Result<SweeperHandle> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let pool = Arc::downgrade(pool);
    let thread = thread::Builder::new()
        .name("strata-pool-sweeper".to_string())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(pool) = pool.upgrade() else { break };
                    match pool.sweep() {
                        Ok(0) => {}
                        Ok(pruned) => tracing::debug!(pruned, "Swept dead connections"),
                        Err(e) => tracing::warn!(error = %e, "Connection sweep failed"),
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
    Ok(SweeperHandle {
        stop: Some(stop_tx),
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_thread_reuses_connection() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool = ConnectionPool::new(&dir.path().join("t.db"));

        let a = pool.acquire().expect("acquire");
        let b = pool.acquire().expect("acquire again");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len().expect("len"), 1);
    }

    #[test]
    fn exited_threads_are_swept() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool = Arc::new(ConnectionPool::new(&dir.path().join("t.db")));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    pool.acquire().expect("acquire in worker");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }
        pool.acquire().expect("acquire on main");

        assert_eq!(pool.len().expect("len"), 4);
        assert_eq!(pool.sweep().expect("sweep"), 3);
        assert_eq!(pool.len().expect("len"), 1);
    }

    #[test]
    fn background_sweeper_prunes_and_stops() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool = Arc::new(ConnectionPool::new(&dir.path().join("t.db")));
        {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                pool.acquire().expect("acquire in worker");
            })
            .join()
            .expect("worker thread");
        }

        let sweeper = spawn_sweeper(&pool, Duration::from_millis(10)).expect("spawn sweeper");
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.len().expect("len") > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        sweeper.stop();

        assert_eq!(pool.len().expect("len"), 0);
    }

    #[test]
    fn clear_drops_everything() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let pool = ConnectionPool::new(&dir.path().join("t.db"));
        pool.acquire().expect("acquire");

        pool.clear().expect("clear");
        assert!(pool.is_empty().expect("is_empty"));
    }
}
