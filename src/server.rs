//! HTTP surface
//!
//! `GET /health` never touches a session. `GET /` captures the primary slot
//! and runs the single-capture pipeline; `GET /muni` (only routed when West
//! and East groups exist) captures every directional slot and runs the
//! composite pipeline. Any failure on a request path becomes a plain-text
//! `500` and leaves the sessions exactly as they were.

use crate::manager::{SessionManager, SlotReport};
use crate::pipeline::{Pipeline, PipelineSpec};
use crate::session::SessionLease;
use crate::source::Capture;
use crate::{BoardConfig, Error, GroupKind, RenderSettings, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::future::try_join_all;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared state behind every handler.
pub struct AppState {
    manager: Arc<SessionManager>,
    pipeline: Pipeline,
    render: RenderSettings,
    ready_timeout: Duration,
    single: PipelineSpec,
    primary_slot: String,
    composite: bool,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>, pipeline: Pipeline, config: &BoardConfig) -> Result<Self> {
        let primary_slot = config.primary_slot()?.id.clone();
        Ok(Self {
            manager,
            pipeline,
            single: PipelineSpec::single_capture(&config.render),
            render: config.render.clone(),
            ready_timeout: config.ready_timeout,
            primary_slot,
            composite: config.has_directional_groups(),
        })
    }

    /// Wait for the slot's ready selector on the leased page, then capture it.
    async fn capture(&self, lease: &SessionLease) -> Result<Capture> {
        let selector = &self.manager.slot_config(lease.slot_id())?.selector;
        let page = lease.page();
        page.wait_for_ready(selector, self.ready_timeout).await?;
        let bytes = page.capture_region(selector).await?;
        Ok(Capture::new(lease.slot_id(), bytes))
    }

    /// Captures of every slot of every group of `kind`, in configuration order.
    async fn capture_side(&self, kind: GroupKind) -> Result<Vec<Capture>> {
        let mut captures = Vec::new();
        for group in self.manager.groups_of_kind(kind) {
            let leases = self.manager.current_group(&group)?;
            captures.extend(try_join_all(leases.iter().map(|lease| self.capture(lease))).await?);
        }
        Ok(captures)
    }

    /// Full single-board flow for the primary slot.
    pub async fn render_primary(&self) -> Result<Vec<u8>> {
        let lease = self.manager.current_session(&self.primary_slot)?;
        let capture = self.capture(&lease).await?;
        // Release the page before the transforms run.
        drop(lease);
        self.pipeline.run(&self.single, &[capture]).await
    }

    /// Full composite flow, west strip first.
    pub async fn render_composite(&self) -> Result<Vec<u8>> {
        let west = self.capture_side(GroupKind::West).await?;
        let east = self.capture_side(GroupKind::East).await?;
        let spec = PipelineSpec::composite(west.len(), east.len(), &self.render)?;
        let mut captures = west;
        captures.extend(east);
        self.pipeline.run(&spec, &captures).await
    }
}

/// A request-path failure, served as a plain-text 500.
#[derive(Debug)]
pub struct ServerError(Error);

impl From<Error> for ServerError {
    fn from(err: Error) -> Self {
        ServerError(err)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

/// Build the router; `/muni` is only mounted when the composite board can be served.
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/", get(primary));
    if state.composite {
        router = router.route("/muni", get(composite));
    }
    router.with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Vec<SlotReport>> {
    Json(state.manager.status())
}

async fn primary(State(state): State<Arc<AppState>>) -> std::result::Result<Response, ServerError> {
    let started = Instant::now();
    respond("/", state.render_primary().await, started)
}

async fn composite(State(state): State<Arc<AppState>>) -> std::result::Result<Response, ServerError> {
    let started = Instant::now();
    respond("/muni", state.render_composite().await, started)
}

fn respond(route: &str, result: Result<Vec<u8>>, started: Instant) -> std::result::Result<Response, ServerError> {
    match result {
        Ok(png) => {
            info!(target: "boardshot::server", "GET {} -> 200, {} bytes in {:?}", route, png.len(), started.elapsed());
            Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
        }
        Err(e) => {
            warn!(target: "boardshot::server", "GET {} -> 500: {}", route, e);
            Err(ServerError(e))
        }
    }
}
