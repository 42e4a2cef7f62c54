pub(crate) use std::sync::Arc;

pub(crate) use axum::{extract::State, response::Json};
pub(crate) use serde_json::{Value, json};

pub(crate) use crate::protocol::ApiResponse;
pub(crate) use crate::server::AppState;
pub(crate) use tracing::{debug, error, warn};
