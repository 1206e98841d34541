mod error;
mod script;
mod state;
mod ws;

use std::{collections::BTreeMap, future::ready, sync::Arc, time::Duration};

use axum::{
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter, get},
};
use http::{HeaderValue, header::CONTENT_TYPE};
use lumen::modules::app::RouteKind;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::trace::TraceLayer;

pub use error::{ErrorCode, HttpApiError};
pub use state::AppState;

use self::script::RouteParams;

pub fn router(state: &AppState) -> anyhow::Result<axum::Router> {
    let prometheus = PrometheusBuilder::new().install_recorder()?;
    let m = prometheus.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            m.run_upkeep();
        }
    });

    let mut by_pattern: BTreeMap<&str, MethodRouter<AppState>> = BTreeMap::new();
    for route in state.routes.iter() {
        let name: Arc<str> = route.script.as_str().into();
        let endpoint = by_pattern
            .remove(route.pattern.as_str())
            .unwrap_or_else(MethodRouter::new);
        let endpoint = match route.kind {
            RouteKind::WebSocket => endpoint.on(MethodFilter::GET, ws::endpoint(name)),
            RouteKind::Http => {
                let handler = move |State(state): State<AppState>,
                                    params: RouteParams,
                                    request: Request| {
                    script::execute(state, name.clone(), params, request)
                };
                match route.method.clone().map(MethodFilter::try_from) {
                    Some(Ok(filter)) => endpoint.on(filter, handler),
                    Some(Err(err)) => anyhow::bail!("route {}: {err}", route.pattern),
                    None => endpoint.fallback(handler),
                }
            }
        };
        by_pattern.insert(route.pattern.as_str(), endpoint);
    }

    let mut app = axum::Router::new()
        .route("/debug/healthz", get(|| ready(StatusCode::NO_CONTENT)))
        .route(
            "/debug/metrics",
            get(move || {
                let mut resp = Response::new(prometheus.render());
                resp.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                ready(resp)
            }),
        );
    for (pattern, endpoint) in by_pattern {
        app = app.route(pattern, endpoint);
    }
    Ok(app
        .fallback(|| ready(HttpApiError::not_found("No route matches").into_response()))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone()))
}
