//! Container endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use gantry_engine::{
    Action, Capacity, ContainerRecord, DrainController, Executor, InitializeRequest,
    ReserveRequest,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{ApiError, Result};

/// Shared state for every handler
#[derive(Clone)]
pub struct ApiState {
    pub executor: Arc<Executor>,
    pub drain: DrainController,
}

impl ApiState {
    pub fn new(executor: Arc<Executor>, drain: DrainController) -> Self {
        Self { executor, drain }
    }

    /// Mutating requests are refused once draining starts
    fn ensure_accepting(&self) -> Result<()> {
        if self.drain.is_accepting() {
            Ok(())
        } else {
            Err(ApiError::Draining)
        }
    }
}

/// Body of a run submission
#[derive(Debug, Deserialize)]
pub struct RunBody {
    pub actions: Vec<Action>,
    #[serde(default)]
    pub complete_url: Option<String>,
}

/// POST /containers/{guid} - reserve capacity
pub async fn reserve(
    State(state): State<ApiState>,
    Path(guid): Path<String>,
    Json(body): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<ContainerRecord>)> {
    state.ensure_accepting()?;
    let record = state.executor.reserve(&guid, &body)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// POST /containers/{guid}/initialize - create the backend container
pub async fn initialize(
    State(state): State<ApiState>,
    Path(guid): Path<String>,
    Json(body): Json<InitializeRequest>,
) -> Result<Json<ContainerRecord>> {
    state.ensure_accepting()?;
    let record = state.executor.initialize(&guid, &body).await?;
    Ok(Json(record))
}

/// POST /containers/{guid}/run - enqueue an action sequence
pub async fn run(
    State(state): State<ApiState>,
    Path(guid): Path<String>,
    Json(body): Json<RunBody>,
) -> Result<StatusCode> {
    state.ensure_accepting()?;
    state
        .executor
        .run(&guid, &body.actions, body.complete_url)
        .await?;
    Ok(StatusCode::CREATED)
}

/// DELETE /containers/{guid} - destroy and release
pub async fn delete_container(
    State(state): State<ApiState>,
    Path(guid): Path<String>,
) -> Result<Json<ContainerRecord>> {
    state.ensure_accepting()?;
    let record = state.executor.delete(&guid).await?;
    Ok(Json(record))
}

/// GET /containers - list all records
pub async fn list_containers(State(state): State<ApiState>) -> Json<Vec<ContainerRecord>> {
    Json(state.executor.list())
}

/// GET /containers/{guid} - fetch one record
pub async fn get_container(
    State(state): State<ApiState>,
    Path(guid): Path<String>,
) -> Result<Json<ContainerRecord>> {
    Ok(Json(state.executor.find(&guid)?))
}

/// GET /resources/remaining - capacity snapshot
pub async fn remaining_resources(State(state): State<ApiState>) -> Json<Capacity> {
    Json(state.executor.remaining_capacity())
}

/// GET /ping - backend liveness
pub async fn ping(State(state): State<ApiState>) -> Result<StatusCode> {
    state.executor.ping().await?;
    Ok(StatusCode::OK)
}
