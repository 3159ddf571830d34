//! Label Routes
//!
//! Series discovery backed by the dimension index.
//!
//! - GET /labels - All label names
//! - GET /label-values?label=<name> - All values of one label

use axum::{
    extract::{Query, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::LabelValuesParams;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;

/// GET /labels
pub async fn list_labels(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.storage.labels())
}

/// GET /label-values
pub async fn list_label_values(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LabelValuesParams>,
) -> ApiResult<Json<Vec<String>>> {
    if params.label.is_empty() {
        return Err(ApiError::Validation("Label name cannot be empty".to_string()));
    }

    let mut values = Vec::new();
    state.storage.get_values(&params.label, |value| {
        values.push(value.to_string());
        true
    });
    Ok(Json(values))
}
