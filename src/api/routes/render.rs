//! Render Routes
//!
//! - GET /render?query=&from=&until=&format=json|collapsed

use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

use crate::api::dto::{FlameNode, RenderParams, RenderResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::routes::parse_time;
use crate::api::state::AppState;
use crate::storage::{GetInput, Key};

/// GET /render
///
/// Merged profile of one series over a window.
pub async fn render(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RenderParams>,
) -> ApiResult<Response> {
    let key = Key::parse(&params.query)?;

    let now = Utc::now();
    let from = parse_time(&params.from, now)?;
    let until = parse_time(&params.until, now)?;

    let format = params.format.to_lowercase();
    if format != "json" && format != "collapsed" {
        return Err(ApiError::Validation(format!(
            "Invalid format: {}. Use json or collapsed",
            params.format
        )));
    }

    let input = GetInput::new(key, from, until);
    let output = state
        .run_blocking(move |storage, deadline| storage.get(input.deadline(deadline)))
        .await?;

    if format == "collapsed" {
        return Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            output.tree.to_string(),
        )
            .into_response());
    }

    Ok(Json(RenderResponse {
        flamegraph: FlameNode::from_tree(&output.tree),
        spy_name: output.spy_name,
        sample_rate: output.sample_rate,
        from: output.covered.map(|(from, _)| from.timestamp()),
        until: output.covered.map(|(_, until)| until.timestamp()),
    })
    .into_response())
}
