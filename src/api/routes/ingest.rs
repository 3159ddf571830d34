//! Ingest Routes
//!
//! - POST /ingest?name=&from=&until=&spyName=&sampleRate=
//!
//! The body is a profile in collapsed text form, one stack per line:
//!
//! ```text
//! main;handle;parse 12
//! main;idle 3
//! ```

use axum::{
    extract::{Query, State},
    http::StatusCode,
};
use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::api::dto::IngestParams;
use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::parse_time;
use crate::api::state::AppState;
use crate::storage::{Key, PutInput, Tree};

/// Interval assumed when the agent sends no `from`
const DEFAULT_INTERVAL_SECS: i64 = 10;

/// POST /ingest
///
/// Store one profile for a series.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IngestParams>,
    body: String,
) -> ApiResult<StatusCode> {
    let key = Key::parse(&params.name)?;

    let now = Utc::now();
    let until = match &params.until {
        Some(s) => parse_time(s, now)?,
        None => now,
    };
    let from = match &params.from {
        Some(s) => parse_time(s, now)?,
        None => until - Duration::seconds(DEFAULT_INTERVAL_SECS),
    };

    let tree = Tree::from_collapsed(&body)
        .map_err(|e| ApiError::Validation(format!("Invalid profile body: {}", e)))?;

    let input = PutInput::new(key, from, until, tree).metadata(
        params.spy_name.unwrap_or_default(),
        params.sample_rate.unwrap_or(0),
    );

    state
        .run_blocking(move |storage, deadline| storage.put(input.deadline(deadline)))
        .await?;

    Ok(StatusCode::OK)
}
