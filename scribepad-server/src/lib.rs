//! Server backend for the Scribepad collaborative document editor.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use dashmap::DashMap;
use rand::random;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::cache::{CacheStats, DocumentCache};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::fabric::{Bus, MemoryBus, Room};
use crate::permissions::{AccessCheck, GateError, Role};
use crate::persist::FlushCtx;
use crate::ratelimit::ConnectionGate;
use crate::store::{DocumentRecord, Store};

pub mod cache;
pub mod config;
pub mod engine;
pub mod fabric;
pub mod ot;
pub mod permissions;
pub mod persist;
pub mod ratelimit;
pub mod session;
pub mod store;

/// Unique identifier for a document or user.
#[repr(align(64))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier([u8; Self::MAX_LEN]);
impl Identifier {
    /// Maximum length of an identifier, in bytes.
    pub const MAX_LEN: usize = 64;

    fn valid_char(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ')
    }
}
impl FromStr for Identifier {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > Self::MAX_LEN {
            anyhow::bail!("Identifier is too long");
        }
        if !s.chars().all(Self::valid_char) {
            anyhow::bail!("Identifier contains invalid characters");
        }
        let mut bytes = [0u8; Self::MAX_LEN];
        bytes[..s.len()].copy_from_slice(s.as_bytes());
        Ok(Self(bytes))
    }
}
impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(Self::MAX_LEN);
        std::str::from_utf8(&self.0[..len]).expect("Identifier contains invalid UTF-8")
    }
}
impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}
impl serde::Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}
impl<'de> serde::Deserialize<'de> for Identifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// An entry in the process-wide document registry.
///
/// Each slot owns the live engine, the local room, and the flush context
/// of one resident document. Dropping the slot kills the engine, which
/// unwinds the flusher and demultiplexer tasks.
struct DocumentSlot {
    last_accessed: Instant,
    engine: Arc<Engine>,
    room: Arc<Room>,
    flush: Arc<FlushCtx>,
}

impl Drop for DocumentSlot {
    fn drop(&mut self) {
        self.engine.kill();
    }
}

/// A successful document open, ready to hand to the session.
pub struct OpenedDocument {
    /// The live engine for the document.
    pub engine: Arc<Engine>,
    /// The local room the session should join.
    pub room: Arc<Room>,
    /// The requester's resolved access.
    pub check: AccessCheck,
    /// Content for the load reply.
    pub data: String,
    /// Version for the load reply.
    pub version: u64,
}

/// Rejections from the document open path.
pub enum OpenError {
    /// The permission gate denied the requester.
    Denied,
    /// Store trouble; the connection should be closed.
    Internal(anyhow::Error),
}

/// The shared state of one server instance.
pub struct ServerState {
    documents: DashMap<Identifier, DocumentSlot>,
    /// Per-document gates serializing cold loads and creation, so two
    /// first-joiners of a fresh id cannot both write an owner record.
    opening: DashMap<Identifier, Arc<Mutex<()>>>,
    store: Arc<Store>,
    cache: Arc<DocumentCache>,
    bus: Arc<dyn Bus>,
    connections: ConnectionGate,
    config: EngineConfig,
    instance_id: u64,
    sessions: AtomicU64,
    started_at: u64,
}

impl ServerState {
    /// A standalone instance with its own store, cache, and bus.
    pub async fn new(storage: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        let store = Arc::new(Store::new(storage).await?);
        let cache = Arc::new(DocumentCache::new(config.cache_ttl));
        Ok(Self::clustered(config, store, cache, Arc::new(MemoryBus::new())))
    }

    /// An instance wired to shared cluster tiers: the durable store, the
    /// shared cache, and the pub/sub bus.
    pub fn clustered(
        config: EngineConfig,
        store: Arc<Store>,
        cache: Arc<DocumentCache>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self {
            documents: DashMap::new(),
            opening: DashMap::new(),
            store,
            cache,
            bus,
            connections: ConnectionGate::new(config.connections_per_minute),
            instance_id: random(),
            sessions: AtomicU64::new(0),
            started_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .expect("SystemTime returned before UNIX_EPOCH")
                .as_secs(),
            config,
        }
    }

    /// An instance over temporary storage, for testing.
    pub async fn temporary() -> anyhow::Result<Self> {
        Self::temporary_with(EngineConfig::default()).await
    }

    /// A temporary instance with custom configuration, for testing.
    pub async fn temporary_with(config: EngineConfig) -> anyhow::Result<Self> {
        let store = Arc::new(Store::temporary().await?);
        let cache = Arc::new(DocumentCache::new(config.cache_ttl));
        Ok(Self::clustered(config, store, cache, Arc::new(MemoryBus::new())))
    }

    /// The engine configuration of this instance.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The pub/sub bus this instance publishes to.
    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// Random identity of this instance on the bus.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// The shared cache tier of this instance.
    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    /// Allocate the next session id.
    pub fn next_session_id(&self) -> u64 {
        self.sessions.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a document for `user`, loading it read-through or creating it
    /// with `user` as the owner, and materialize its engine if needed.
    pub async fn open_document(
        &self,
        user: &Identifier,
        id: &Identifier,
        name: &str,
    ) -> Result<OpenedDocument, OpenError> {
        // Fast path: the document is already resident.
        if let Some(opened) = self.open_resident(user, id).await {
            return opened;
        }

        // Cold loads and creation are serialized per document: only one
        // task at a time may probe the store, write the fresh record, and
        // materialize the engine for an id.
        let gate = self
            .opening
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let opened = {
            let _guard = gate.lock().await;
            self.open_cold(user, id, name).await
        };
        drop(gate);
        self.opening
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        opened
    }

    /// Serve an open from the live engine, if the document is resident.
    async fn open_resident(
        &self,
        user: &Identifier,
        id: &Identifier,
    ) -> Option<Result<OpenedDocument, OpenError>> {
        let (engine, room) = self.resident(id)?;
        let check = engine.access(user, &self.config.admin_user).await;
        if !check.can_view {
            return Some(Err(OpenError::Denied));
        }
        let (data, version) = engine.load_reply().await;
        self.cache.extend_ttl(id);
        Some(Ok(OpenedDocument {
            engine,
            room,
            check,
            data,
            version,
        }))
    }

    /// Cold path, called with the document's opening gate held.
    async fn open_cold(
        &self,
        user: &Identifier,
        id: &Identifier,
        name: &str,
    ) -> Result<OpenedDocument, OpenError> {
        // Another opener may have materialized the document while this
        // task waited on the gate.
        if let Some(opened) = self.open_resident(user, id).await {
            return opened;
        }

        let record = self.load_or_create(user, id, name).await?;
        let check = permissions::evaluate(
            &record.owner,
            &record.permissions,
            user,
            &self.config.admin_user,
        );
        if !check.can_view {
            return Err(OpenError::Denied);
        }

        use dashmap::mapref::entry::Entry;
        let entry = match self.documents.entry(id.clone()) {
            Entry::Occupied(e) => e.into_ref(),
            Entry::Vacant(e) => {
                info!(document = %id, "materializing engine");
                let publisher = fabric::Publisher::new(self.bus.clone(), self.instance_id);
                let engine = Arc::new(Engine::from_record(
                    &record,
                    self.config.history_max_ops,
                    Some(publisher),
                ));
                let room = Arc::new(Room::default());
                let flush = Arc::new(FlushCtx::new(
                    engine.clone(),
                    self.store.clone(),
                    self.cache.clone(),
                    self.config.flush_interval,
                    self.config.admin_user.clone(),
                ));
                tokio::spawn(persist::run(flush.clone()));
                let updates = self.bus.subscribe(id.as_ref());
                tokio::spawn(fabric::demux(
                    engine.clone(),
                    room.clone(),
                    updates,
                    self.instance_id,
                ));
                e.insert(DocumentSlot {
                    last_accessed: Instant::now(),
                    engine,
                    room,
                    flush,
                })
            }
        };
        let engine = entry.engine.clone();
        let room = entry.room.clone();
        drop(entry);

        let (data, version) = engine.load_reply().await;
        Ok(OpenedDocument {
            engine,
            room,
            check,
            data,
            version,
        })
    }

    fn resident(&self, id: &Identifier) -> Option<(Arc<Engine>, Arc<Room>)> {
        let mut slot = self.documents.get_mut(id)?;
        slot.last_accessed = Instant::now();
        Some((slot.engine.clone(), slot.room.clone()))
    }

    /// Read-through load of the document record, creating a fresh one
    /// owned by `user` when the id is unknown.
    async fn load_or_create(
        &self,
        user: &Identifier,
        id: &Identifier,
        name: &str,
    ) -> Result<DocumentRecord, OpenError> {
        if let Some(cached) = self.cache.get(id) {
            // A hit is only trusted if the document still exists durably.
            if self.store.exists(id).await {
                return Ok(DocumentRecord {
                    id: id.clone(),
                    name: cached.name,
                    data: cached.data,
                    owner: cached.owner,
                    permissions: cached.permissions,
                    created_at: cached.created_at,
                    updated_at: SystemTime::now(),
                });
            }
            self.cache.invalidate(id);
        }
        if self.store.exists(id).await {
            let record = self.store.load(id).await.map_err(OpenError::Internal)?;
            self.cache.put(&record);
            Ok(record)
        } else {
            let record = DocumentRecord::fresh(id.clone(), name, user.clone());
            info!(document = %id, owner = %user, "creating document");
            self.store
                .store(&record)
                .await
                .map_err(OpenError::Internal)?;
            self.cache.put(&record);
            Ok(record)
        }
    }

    /// Flush and evict a document whose room has emptied. A racing join
    /// keeps the document resident.
    pub async fn retire_document(&self, id: &Identifier) {
        let flush = {
            let Some(slot) = self.documents.get(id) else {
                return;
            };
            if !slot.room.is_empty() {
                return;
            }
            slot.flush.clone()
        };
        flush.flush().await;
        self.documents.remove_if(id, |_, slot| slot.room.is_empty());
    }

    /// Flush every resident document, used at shutdown.
    pub async fn flush_all(&self) {
        let ctxs: Vec<_> = self
            .documents
            .iter()
            .map(|entry| entry.flush.clone())
            .collect();
        for ctx in ctxs {
            ctx.flush().await;
        }
    }

    /// Grant or revoke `target`'s role on a document, write through the
    /// store, and invalidate the cache entry.
    pub async fn set_role(
        &self,
        actor: &Identifier,
        id: &Identifier,
        target: &str,
        role: Role,
    ) -> Result<(), GateError> {
        let target: Identifier = target.parse().map_err(|_| GateError::InvalidTarget)?;
        if let Some((engine, _)) = self.resident(id) {
            engine
                .set_role(actor, &target, role, &self.config.admin_user)
                .await?;
        } else if self.store.exists(id).await {
            let mut record = self.store.load(id).await.map_err(|_| GateError::Store)?;
            let owner = record.owner.clone();
            permissions::set_role(
                &owner,
                &mut record.permissions,
                actor,
                &target,
                role,
                &self.config.admin_user,
            )?;
            record.updated_at = SystemTime::now();
            self.store
                .store(&record)
                .await
                .map_err(|_| GateError::Store)?;
        } else {
            return Err(GateError::NotFound);
        }
        self.cache.invalidate(id);
        Ok(())
    }

    /// Destroy a document permanently. Owner or admin only.
    pub async fn delete_document(
        &self,
        actor: &Identifier,
        id: &Identifier,
    ) -> Result<(), GateError> {
        let check = if let Some((engine, _)) = self.resident(id) {
            engine.access(actor, &self.config.admin_user).await
        } else if self.store.exists(id).await {
            let record = self.store.load(id).await.map_err(|_| GateError::Store)?;
            permissions::evaluate(
                &record.owner,
                &record.permissions,
                actor,
                &self.config.admin_user,
            )
        } else {
            return Err(GateError::NotFound);
        };
        if !check.role.can_delete() {
            return Err(GateError::Denied);
        }
        // Dropping the slot kills the engine and its background tasks.
        self.documents.remove(id);
        if let Err(e) = self.store.delete(id).await {
            warn!(document = %id, "deleting stored record: {e:#}");
        }
        self.cache.invalidate(id);
        Ok(())
    }
}

/// Statistics about the server, returned from an API endpoint.
#[derive(Serialize)]
struct Stats {
    /// System time when the server started, in seconds since Unix epoch.
    start_time: u64,
    /// Number of documents currently resident in the engine.
    num_documents: usize,
    /// Number of documents persisted in the store.
    database_size: usize,
    /// Document cache counters.
    cache: CacheStats,
}

/// Build the router handling all server routes.
pub fn server(state: Arc<ServerState>) -> Router {
    tokio::spawn(cleaner(state.clone()));
    Router::new()
        .route("/api/socket", get(socket_handler))
        .route("/api/text/{id}", get(text_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

/// Handler for the `/api/socket` endpoint.
async fn socket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<ServerState>>,
) -> Response {
    if !state.connections.allow(addr.ip()) {
        warn!(%addr, "refusing connection, rate exceeded");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    ws.on_upgrade(move |socket| session::handle_socket(socket, state))
}

/// Handler for the `/api/text/{id}` endpoint.
async fn text_handler(Path(id): Path<Identifier>, State(state): State<Arc<ServerState>>) -> String {
    match state.resident(&id) {
        Some((engine, _)) => engine.text().await,
        None => state
            .store
            .load(&id)
            .await
            .map(|record| record.data)
            .unwrap_or_default(),
    }
}

/// Handler for the `/api/stats` endpoint.
async fn stats_handler(State(state): State<Arc<ServerState>>) -> Result<Json<Stats>, StatusCode> {
    let database_size = state
        .store
        .document_count()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(Stats {
        start_time: state.started_at,
        num_documents: state.documents.len(),
        database_size,
        cache: state.cache.stats(),
    }))
}

const HOUR: Duration = Duration::from_secs(3600);

/// Backstop sweep reclaiming memory for documents whose eager eviction on
/// last leave was missed.
async fn cleaner(state: Arc<ServerState>) {
    loop {
        time::sleep(HOUR).await;
        let candidates: Vec<_> = state
            .documents
            .iter()
            .filter(|entry| entry.room.is_empty() && entry.last_accessed.elapsed() > HOUR)
            .map(|entry| (entry.key().clone(), entry.engine.clone()))
            .collect();
        for (key, engine) in candidates {
            if !engine.is_dirty().await {
                info!(document = %key, "cleaner evicting idle document");
                state
                    .documents
                    .remove_if(&key, |_, slot| slot.room.is_empty());
            }
        }
    }
}
