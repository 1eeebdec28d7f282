//! Write-coalescing persistence pipeline.
//!
//! Each live document owns one flusher task. A change arms a flush window;
//! everything that lands inside the window coalesces into a single durable
//! write of the latest payload, which also refreshes the cache. The buffer
//! is non-durable: a crash loses at most one window of edits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::random_range;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, error, warn};

use crate::Identifier;
use crate::cache::DocumentCache;
use crate::engine::Engine;
use crate::store::Store;

/// Spread between per-document flush timers so many documents do not hit
/// the store in lockstep.
const FLUSH_JITTER: Duration = Duration::from_millis(250);

/// Consecutive failures after which persistence is reported degraded.
const DEGRADED_THRESHOLD: u32 = 3;

/// Everything one document's flusher needs, shared with the leave path so
/// flush-on-leave and the timer serialize on the same lock.
pub struct FlushCtx {
    engine: Arc<Engine>,
    store: Arc<Store>,
    cache: Arc<DocumentCache>,
    interval: Duration,
    admin: Identifier,
    lock: Mutex<()>,
    failures: AtomicU32,
}

impl FlushCtx {
    /// Bundle the flush dependencies for one document.
    pub fn new(
        engine: Arc<Engine>,
        store: Arc<Store>,
        cache: Arc<DocumentCache>,
        interval: Duration,
        admin: Identifier,
    ) -> Self {
        Self {
            engine,
            store,
            cache,
            interval,
            admin,
            lock: Mutex::new(()),
            failures: AtomicU32::new(0),
        }
    }

    /// Flush the coalesced state now, if anything is pending. At most one
    /// write per document is in flight at any instant.
    pub async fn flush(&self) {
        let _guard = self.lock.lock().await;
        let Some((record, writer)) = self.engine.dirty_snapshot().await else {
            return;
        };
        // The update-permission path is enforced at write time: the
        // identity responsible for the pending write must still hold edit
        // rights.
        if let Some(writer) = &writer {
            let check = self.engine.access(writer, &self.admin).await;
            if !check.can_edit {
                // Taking the snapshot cleared the dirty flag; restore it
                // so the payload stays buffered until a later grant or
                // another writer's edit lets a cycle persist it.
                self.engine.redirty().await;
                warn!(
                    document = %self.engine.id(),
                    user = %writer,
                    "refusing flush, writer no longer has edit rights"
                );
                return;
            }
        }
        match self.store.store(&record).await {
            Ok(()) => {
                if !self.cache.update_content(&record.id, &record.data) {
                    self.cache.put(&record);
                }
                self.failures.store(0, Ordering::Relaxed);
                debug!(document = %record.id, "flushed");
            }
            Err(e) => {
                // Keep the payload buffered; the next cycle retries.
                self.engine.redirty().await;
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= DEGRADED_THRESHOLD {
                    error!(
                        document = %record.id,
                        failures,
                        "persistence degraded, continuing with in-memory edits: {e:#}"
                    );
                } else {
                    warn!(document = %record.id, "flush failed, will retry: {e:#}");
                }
            }
        }
    }
}

/// Per-document flusher: waits for the first change, lets the coalescing
/// window elapse, then writes once. Runs until the engine is killed.
pub async fn run(ctx: Arc<FlushCtx>) {
    while !ctx.engine.killed() {
        ctx.engine.changed().await;
        if ctx.engine.killed() {
            break;
        }
        let jitter = random_range(Duration::ZERO..=FLUSH_JITTER);
        time::sleep(ctx.interval + jitter).await;
        ctx.flush().await;
    }
}
