//! Authoritative per-document state machine.
//!
//! Every accepted edit for a document passes through one `Engine`, which
//! serializes transform, apply, version increment, and history append under
//! a single write lock. No I/O happens inside that critical section.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tracing::warn;

use crate::Identifier;
use crate::fabric::Publisher;
use crate::ot::{self, MAX_CONTENT_LEN, OpError, Operation};
use crate::permissions::{self, AccessCheck, GateError, Role};
use crate::store::DocumentRecord;

/// An operation set accepted into the authoritative sequence.
#[derive(Clone, Debug)]
pub struct AcceptedSet {
    /// Version the document advanced to.
    pub version: u64,
    /// The transformed, composed operations.
    pub ops: Vec<Operation>,
    /// Session that produced the set.
    pub origin: u64,
    /// Acceptance instant.
    pub at: SystemTime,
}

/// Result of an accepted submission.
#[derive(Clone, Debug)]
pub struct Submitted {
    /// Operations as actually applied, after transformation.
    pub ops: Vec<Operation>,
    /// The version the document advanced to.
    pub version: u64,
    /// Whether transformation changed the submitted operations.
    pub transformed: bool,
}

/// Rejections from the admission path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// The client claims a version the server has not produced yet.
    #[error("base version {base} is ahead of current version {current}")]
    ClientAhead { base: u64, current: u64 },
    /// The base version predates the retained history window.
    #[error("base version {base} predates the retained history window")]
    ClientTooFarBehind { base: u64 },
    /// Structurally invalid operations.
    #[error("invalid operation set: {0}")]
    InvalidInput(#[from] OpError),
    /// The edit would grow the document past the size cap.
    #[error("edit would grow the document past {MAX_CONTENT_LEN} characters")]
    TooLarge,
    /// The document has been evicted or destroyed.
    #[error("document is no longer resident")]
    Evicted,
}

struct State {
    content: String,
    version: u64,
    history: VecDeque<AcceptedSet>,
    name: String,
    owner: Identifier,
    permissions: HashMap<Identifier, Role>,
    created_at: SystemTime,
    dirty: bool,
    last_writer: Option<Identifier>,
}

/// The live, authoritative form of one document.
pub struct Engine {
    id: Identifier,
    state: RwLock<State>,
    history_max: usize,
    /// Enqueues accepted deltas onto the document's channel. Absent in
    /// unit tests that exercise the state machine alone.
    publisher: Option<Publisher>,
    /// Rung when the document becomes dirty, to arm the flush window.
    dirty_bell: Notify,
    /// Rung once when the engine is killed.
    kill_bell: Notify,
    killed: AtomicBool,
}

impl Engine {
    /// Materialize an engine from a store record. The version counter is
    /// engine-owned and starts at zero for each residency.
    pub fn from_record(
        record: &DocumentRecord,
        history_max: usize,
        publisher: Option<Publisher>,
    ) -> Self {
        Self {
            id: record.id.clone(),
            publisher,
            state: RwLock::new(State {
                content: record.data.clone(),
                version: 0,
                history: VecDeque::new(),
                name: record.name.clone(),
                owner: record.owner.clone(),
                permissions: record.permissions.clone(),
                created_at: record.created_at,
                dirty: false,
                last_writer: None,
            }),
            history_max,
            dirty_bell: Notify::new(),
            kill_bell: Notify::new(),
            killed: AtomicBool::new(false),
        }
    }

    /// The document this engine serializes.
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    /// Admit one operation set produced against `base`.
    ///
    /// The whole admission is a single critical section; the returned set
    /// is what every other participant will receive.
    pub async fn submit(
        &self,
        session: u64,
        user: &Identifier,
        base: u64,
        ops: Vec<Operation>,
    ) -> Result<Submitted, SubmitError> {
        if self.killed() {
            return Err(SubmitError::Evicted);
        }
        ot::validate(&ops)?;

        let mut state = self.state.write().await;
        if base > state.version {
            return Err(SubmitError::ClientAhead {
                base,
                current: state.version,
            });
        }

        let (ops, transformed) = if base < state.version {
            let window_start = state
                .history
                .front()
                .map(|set| set.version)
                .unwrap_or(state.version + 1);
            if base + 1 < window_start {
                return Err(SubmitError::ClientTooFarBehind { base });
            }
            let mut current = ops.clone();
            for set in state.history.iter().filter(|set| set.version > base) {
                current = ot::transform_against(&current, &set.ops);
            }
            let transformed = current != ops;
            (current, transformed)
        } else {
            ot::check_bounds(state.content.chars().count(), &ops)?;
            (ops, false)
        };

        if ot::result_len(state.content.chars().count(), &ops) > MAX_CONTENT_LEN {
            return Err(SubmitError::TooLarge);
        }

        let ops = ot::compose(ops);
        ot::apply(&mut state.content, &ops);
        state.version += 1;
        let version = state.version;
        state.history.push_back(AcceptedSet {
            version,
            ops: ops.clone(),
            origin: session,
            at: SystemTime::now(),
        });
        if state.history.len() > self.history_max {
            state.history.pop_front();
        }
        let was_dirty = state.dirty;
        state.dirty = true;
        state.last_writer = Some(user.clone());
        // Enqueue onto the broadcast channel before releasing the lock so
        // deltas reach the bus in version order.
        if let Some(publisher) = &self.publisher {
            publisher.delta(&self.id, &ops, version, session, user);
        }
        drop(state);

        if !was_dirty {
            self.dirty_bell.notify_waiters();
        }
        Ok(Submitted {
            ops,
            version,
            transformed,
        })
    }

    /// Follow the authoritative sequence produced elsewhere in the cluster.
    ///
    /// A delta at or below the local version is discarded (idempotent
    /// re-delivery); a gap means this replica fell off the channel and
    /// stops following until reloaded.
    pub async fn apply_remote(
        &self,
        ops: &[Operation],
        version: u64,
        origin: u64,
        at: SystemTime,
    ) -> bool {
        let mut state = self.state.write().await;
        if version <= state.version {
            return false;
        }
        if version != state.version + 1 {
            warn!(
                document = %self.id,
                local = state.version,
                remote = version,
                "replica missed deltas, no longer following"
            );
            return false;
        }
        ot::apply(&mut state.content, ops);
        state.version = version;
        state.history.push_back(AcceptedSet {
            version,
            ops: ops.to_vec(),
            origin,
            at,
        });
        if state.history.len() > self.history_max {
            state.history.pop_front();
        }
        let was_dirty = state.dirty;
        state.dirty = true;
        drop(state);

        if !was_dirty {
            self.dirty_bell.notify_waiters();
        }
        true
    }

    /// Content and version in one consistent read, for the load reply.
    pub async fn load_reply(&self) -> (String, u64) {
        let state = self.state.read().await;
        (state.content.clone(), state.version)
    }

    /// Current canonical text.
    pub async fn text(&self) -> String {
        self.state.read().await.content.clone()
    }

    /// Current version.
    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    /// Resolve the effective access of `user` on this document.
    pub async fn access(&self, user: &Identifier, admin: &Identifier) -> AccessCheck {
        let state = self.state.read().await;
        permissions::evaluate(&state.owner, &state.permissions, user, admin)
    }

    /// Mutate the permission table under the sharing rules and schedule a
    /// durable write. The caller is responsible for cache invalidation.
    pub async fn set_role(
        &self,
        actor: &Identifier,
        target: &Identifier,
        role: Role,
        admin: &Identifier,
    ) -> Result<(), GateError> {
        let mut state = self.state.write().await;
        let owner = state.owner.clone();
        permissions::set_role(&owner, &mut state.permissions, actor, target, role, admin)?;
        let was_dirty = state.dirty;
        state.dirty = true;
        state.last_writer = Some(actor.clone());
        drop(state);
        if !was_dirty {
            self.dirty_bell.notify_waiters();
        }
        Ok(())
    }

    /// Record a client-requested save: the authoritative content is marked
    /// for the next coalesced flush.
    pub async fn touch_save(&self, user: &Identifier) {
        let mut state = self.state.write().await;
        let was_dirty = state.dirty;
        state.dirty = true;
        state.last_writer = Some(user.clone());
        drop(state);
        if !was_dirty {
            self.dirty_bell.notify_waiters();
        }
    }

    /// Snapshot of the full record for persistence.
    pub async fn snapshot(&self) -> DocumentRecord {
        let state = self.state.read().await;
        record_of(&self.id, &state)
    }

    /// Take the dirty snapshot, clearing the dirty flag, together with the
    /// identity responsible for the pending write. One operation so a
    /// concurrent edit cannot be lost between check and clear.
    pub async fn dirty_snapshot(&self) -> Option<(DocumentRecord, Option<Identifier>)> {
        let mut state = self.state.write().await;
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        let writer = state.last_writer.clone();
        Some((record_of(&self.id, &state), writer))
    }

    /// Re-mark the document dirty after a failed flush so the next cycle
    /// retries.
    pub async fn redirty(&self) {
        let mut state = self.state.write().await;
        let was_dirty = state.dirty;
        state.dirty = true;
        drop(state);
        if !was_dirty {
            self.dirty_bell.notify_waiters();
        }
    }

    /// Whether any change is waiting for a flush.
    pub async fn is_dirty(&self) -> bool {
        self.state.read().await.dirty
    }

    /// Resolves once the document has pending changes. Returns immediately
    /// when it is already dirty, and on kill so waiters can unwind.
    pub async fn changed(&self) {
        loop {
            let notified = self.dirty_bell.notified();
            if self.killed() || self.state.read().await.dirty {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.kill_bell.notified() => return,
            }
        }
    }

    /// Resolves when the engine is killed.
    pub async fn kill_notified(&self) {
        loop {
            let notified = self.kill_bell.notified();
            if self.killed() {
                return;
            }
            notified.await;
        }
    }

    /// Kill this engine, unwinding its background tasks.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Relaxed);
        self.kill_bell.notify_waiters();
        self.dirty_bell.notify_waiters();
    }

    /// Whether this engine has been killed.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }
}

fn record_of(id: &Identifier, state: &State) -> DocumentRecord {
    DocumentRecord {
        id: id.clone(),
        name: state.name.clone(),
        data: state.content.clone(),
        owner: state.owner.clone(),
        permissions: state.permissions.clone(),
        created_at: state.created_at,
        updated_at: SystemTime::now(),
    }
}
