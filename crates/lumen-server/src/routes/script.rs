use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Body,
    extract::{FromRequestParts, RawPathParams, Request, rejection::RawPathParamsRejection},
    response::{IntoResponse, Response},
};
use http::request::Parts;
use lumen::HttpRequest;

use super::{AppState, HttpApiError};

/// Largest request body handed to a script.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// `{name}` captures of the matched route; empty for patterns without any.
#[derive(Debug, Default)]
pub struct RouteParams(pub HashMap<String, String>);

impl<S: Send + Sync> FromRequestParts<S> for RouteParams {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match RawPathParams::from_request_parts(parts, state).await {
            Ok(params) => Ok(Self(
                params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )),
            Err(RawPathParamsRejection::MissingPathParams(_)) => Ok(Self::default()),
            Err(err) => Err(err.into_response()),
        }
    }
}

/// Runs the route script on a blocking thread.
pub async fn execute(
    state: AppState,
    script: Arc<str>,
    RouteParams(params): RouteParams,
    request: Request,
) -> Result<Response, HttpApiError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|err| HttpApiError::invalid_request(format!("Failed to read body: {err}")))?;
    let request = HttpRequest {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
        params,
    };

    let handler = state.handler.clone();
    let response = tokio::task::spawn_blocking(move || handler.handle(&script, request))
        .await
        .map_err(|err| HttpApiError::internal(format!("Script task failed: {err}")))??;

    Ok((response.status, response.headers, Body::from(response.body)).into_response())
}
