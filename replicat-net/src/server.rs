//! Inbound HTTP surface of a node.
//!
//! Four endpoints behind shared Basic credentials: `/event/` receives
//! peer events and serves the recent-event ring, `/tree/` exposes and
//! accepts the legacy folder tree, `/config/` receives node map pushes
//! from the manager, and `/upload/` receives file bodies. Peer
//! directives record their paths in the ownership ledger before they
//! touch the backend, so the watcher echo they cause stays local.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{ConnectInfo, Multipart, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::Utc;
use replicat_proto::{
    content_hash, decode_requested_paths, dir_tree_of, upload_digest_bytes, DirTreeMap, Entry,
    Event, EventKind, NodeMap,
};
use replicat_tracker::StorageTracker;
use tracing::{debug, info, warn};

use crate::client::Credentials;
use crate::cluster::ClusterView;
use crate::errors::{NetError, Result};
use crate::ownership::OwnershipLedger;

/// How many recently received events the debug ring retains.
pub const RECENT_EVENTS: usize = 100;

struct ServerInner {
    tracker: Arc<dyn StorageTracker>,
    ledger: Arc<OwnershipLedger>,
    cluster: Arc<ClusterView>,
    credentials: Credentials,
    recent: Mutex<VecDeque<Event>>,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<ServerInner>,
}

impl AppState {
    pub fn new(
        tracker: Arc<dyn StorageTracker>,
        ledger: Arc<OwnershipLedger>,
        cluster: Arc<ClusterView>,
        credentials: Credentials,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                tracker,
                ledger,
                cluster,
                credentials,
                recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS)),
            }),
        }
    }

    fn remember(&self, event: &Event) {
        let mut recent = self.inner.recent.lock().unwrap();
        if recent.len() == RECENT_EVENTS {
            recent.pop_front();
        }
        recent.push_back(event.clone());
    }
}

#[derive(Debug)]
enum ServerError {
    BadRequest(String),
    Internal(NetError),
}

impl From<NetError> for ServerError {
    fn from(e: NetError) -> Self {
        ServerError::Internal(e)
    }
}

impl From<replicat_tracker::TrackerError> for ServerError {
    fn from(e: replicat_tracker::TrackerError) -> Self {
        ServerError::Internal(e.into())
    }
}

impl From<replicat_proto::ProtoError> for ServerError {
    fn from(e: replicat_proto::ProtoError) -> Self {
        ServerError::Internal(e.into())
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            ServerError::BadRequest(msg) => {
                debug!("rejecting request: {}", msg);
                (StatusCode::BAD_REQUEST, msg).into_response()
            }
            ServerError::Internal(e) => {
                warn!("request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/event/", post(post_event).get(get_events))
        .route("/tree/", get(get_tree).post(post_tree))
        .route("/config/", post(post_config))
        .route("/upload/", post(post_upload))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state)
}

/// Bind the router on an already-open listener and run until the
/// connection source closes.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
        .and_then(|pair| pair.parse::<Credentials>().ok());

    if presented.as_ref() == Some(&state.inner.credentials) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"replicat\"")],
        )
            .into_response()
    }
}

async fn post_event(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(mut event): Json<Event>,
) -> std::result::Result<StatusCode, ServerError> {
    event.network_source = remote.to_string();
    state.remember(&event);
    debug!(
        "event {:?} from {} ({})",
        event.kind, event.source, event.network_source
    );

    let tracker = &state.inner.tracker;
    let ledger = &state.inner.ledger;
    match event.kind {
        EventKind::Create => {
            ledger.record_peer(&event.path, &event.source);
            tracker
                .create_path(&event.path, event.is_directory, event.mod_time)
                .await?;
        }
        EventKind::Write => {
            // The body arrives separately through the upload endpoint.
            ledger.record_peer(&event.path, &event.source);
        }
        EventKind::Remove => {
            ledger.record_peer(&event.path, &event.source);
            tracker.delete(&event.path).await?;
        }
        EventKind::Rename => {
            ledger.record_peer(&event.source_path, &event.source);
            ledger.record_peer(&event.path, &event.source);
            if event.source_path.is_empty() {
                // Move-in: nothing local to rename, materialize the
                // destination with the sender's mtime instead.
                tracker
                    .create_path(&event.path, event.is_directory, event.mod_time)
                    .await?;
            } else {
                tracker
                    .rename(&event.source_path, &event.path, event.is_directory)
                    .await?;
            }
        }
        EventKind::Catalog => {
            tracker.process_catalog(&event).await?;
        }
        EventKind::FileRequest => {
            let requests = decode_requested_paths(&event.raw_payload)?;
            tracker.send_requested_paths(requests, &event.source).await?;
        }
        EventKind::StartTest | EventKind::EndTest => {
            info!("test marker {:?} from {}", event.kind, event.source);
        }
        EventKind::RawRename => {
            return Err(ServerError::BadRequest(
                "raw rename halves are node-local".to_string(),
            ));
        }
    }
    Ok(StatusCode::OK)
}

async fn get_events(State(state): State<AppState>) -> Json<Vec<Event>> {
    let recent = state.inner.recent.lock().unwrap();
    Json(recent.iter().cloned().collect())
}

async fn get_tree(State(state): State<AppState>) -> Json<DirTreeMap> {
    let snapshot = state.inner.tracker.snapshot().await;
    Json(dir_tree_of(&snapshot))
}

/// Materialize every folder the pushed tree names that is missing
/// locally. Files in the tree are ignored; bodies travel as uploads.
async fn post_tree(
    State(state): State<AppState>,
    Json(tree): Json<DirTreeMap>,
) -> std::result::Result<StatusCode, ServerError> {
    let tracker = &state.inner.tracker;
    for folder in tree.keys() {
        if folder.is_empty() {
            continue;
        }
        if tracker.get_entry(folder).await.is_ok() {
            continue;
        }
        state.inner.ledger.record_peer(folder, "peer");
        tracker.create_path(folder, true, Utc::now()).await?;
    }
    Ok(StatusCode::OK)
}

async fn post_config(
    State(state): State<AppState>,
    Json(map): Json<NodeMap>,
) -> StatusCode {
    info!("node map push with {} nodes", map.len());
    state.inner.cluster.submit(map);
    StatusCode::OK
}

async fn post_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> std::result::Result<StatusCode, ServerError> {
    let mut body: Option<Vec<u8>> = None;
    let mut digest: Option<String> = None;
    let mut entry: Option<Entry> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(e.to_string()))?
    {
        match field.name() {
            Some("uploadfile") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::BadRequest(e.to_string()))?;
                body = Some(bytes.to_vec());
            }
            Some("HASH") => {
                digest = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ServerError::BadRequest(e.to_string()))?,
                );
            }
            Some("EntryJSON") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::BadRequest(e.to_string()))?;
                entry = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| ServerError::BadRequest(e.to_string()))?,
                );
            }
            other => {
                debug!("ignoring unexpected upload field {:?}", other);
            }
        }
    }

    let (Some(body), Some(digest), Some(entry)) = (body, digest, entry) else {
        return Err(ServerError::BadRequest(
            "upload requires uploadfile, HASH and EntryJSON fields".to_string(),
        ));
    };
    if upload_digest_bytes(&body) != digest {
        return Err(ServerError::BadRequest(format!(
            "digest mismatch for {}",
            entry.relative_path
        )));
    }

    let tracker = &state.inner.tracker;
    if let Ok(local) = tracker.get_entry(&entry.relative_path).await {
        if local.is_hashed() && local.content_hash == content_hash(&body) {
            debug!("already have {} at this content", entry.relative_path);
            return Ok(StatusCode::OK);
        }
        if local.mod_time > entry.mod_time {
            debug!(
                "keeping newer local copy of {} over upload from {}",
                entry.relative_path, entry.origin_server
            );
            return Ok(StatusCode::OK);
        }
    }

    state.inner.ledger.record_peer(&entry.relative_path, &entry.origin_server);
    tracker.store_file(&entry, &body).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use replicat_tracker::InMemoryTracker;

    fn state() -> AppState {
        let tracker = Arc::new(InMemoryTracker::new("node-a"));
        let (cluster, _rx) = ClusterView::new("node-a");
        AppState::new(
            tracker,
            Arc::new(OwnershipLedger::new()),
            cluster,
            "user:pass".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_event_dispatch_creates_and_deletes() {
        let state = state();
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let create = Event::new(EventKind::Create, "node-b", "docs").directory(true);
        post_event(State(state.clone()), ConnectInfo(remote), Json(create))
            .await
            .unwrap();
        assert!(state.inner.tracker.get_entry("docs").await.is_ok());
        // The directive's echo must be suppressed later.
        assert!(!state.inner.ledger.try_claim("docs", "node-a"));

        let remove = Event::new(EventKind::Remove, "node-b", "docs").directory(true);
        post_event(State(state.clone()), ConnectInfo(remote), Json(remove))
            .await
            .unwrap();
        assert!(state.inner.tracker.get_entry("docs").await.is_err());
    }

    #[tokio::test]
    async fn test_create_directive_keeps_sender_mtime() {
        let state = state();
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let sender_time = Utc::now() - chrono::Duration::minutes(10);
        let create =
            Event::new(EventKind::Create, "node-b", "note.txt").mod_time(sender_time);
        post_event(State(state.clone()), ConnectInfo(remote), Json(create))
            .await
            .unwrap();

        // The stub must not look newer than the body upload that
        // follows the directive.
        let stub = state.inner.tracker.get_entry("note.txt").await.unwrap();
        assert_eq!(stub.mod_time, sender_time);
    }

    #[tokio::test]
    async fn test_raw_rename_rejected() {
        let state = state();
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let raw = Event::new(EventKind::RawRename, "node-b", "x");
        assert!(post_event(State(state), ConnectInfo(remote), Json(raw))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_recent_ring_caps_at_limit() {
        let state = state();
        for n in 0..(RECENT_EVENTS + 20) {
            let event = Event::new(EventKind::StartTest, "node-b", format!("{}", n));
            state.remember(&event);
        }
        let recent = state.inner.recent.lock().unwrap();
        assert_eq!(recent.len(), RECENT_EVENTS);
        assert_eq!(recent.front().unwrap().path, "20");
    }

    #[tokio::test]
    async fn test_tree_push_creates_missing_folders() {
        let state = state();
        let mut tree = DirTreeMap::new();
        tree.insert(String::new(), vec!["a".to_string()]);
        tree.insert("a".to_string(), vec!["b".to_string()]);
        tree.insert("a/b".to_string(), Vec::new());

        post_tree(State(state.clone()), Json(tree)).await.unwrap();
        assert!(state.inner.tracker.get_entry("a").await.is_ok());
        assert!(state.inner.tracker.get_entry("a/b").await.is_ok());
    }
}
