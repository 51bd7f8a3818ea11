//! The read-only graph query API.
//!
//! Serves the knowledge graph to the portal and external consumers:
//! `/health`, `/graph/pr/{n}`, `/graph/owners`, `/graph/relationships`,
//! plus Prometheus exposition on `/metrics`. When the graph store is
//! unavailable, owners and relationship reads degrade to the last good
//! response with `X-Stale: true`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use gitguard_metrics::GRAPH_API_RESPONSE_SECONDS;
use gitguard_types::NodeType;
use serde_json::{Value, json};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::ServerState;

/// Router for the graph API, CORS included.
pub fn router(state: Arc<ServerState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/graph/pr/:number", get(graph_pr))
        .route("/graph/owners", get(graph_owners))
        .route("/graph/relationships", get(graph_relationships));

    let allowlist = &state.pipeline.config.api.cors_allowlist;
    if !allowlist.is_empty() {
        let origins: Vec<HeaderValue> = allowlist
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        router = router.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([Method::GET, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        );
    }

    router.with_state(state)
}

fn ok_json(body: Value) -> Response {
    (StatusCode::OK, axum::Json(body)).into_response()
}

fn stale_json(body: Value) -> Response {
    let mut response = (StatusCode::OK, axum::Json(body)).into_response();
    response
        .headers_mut()
        .insert("X-Stale", HeaderValue::from_static("true"));
    response
}

fn error_json(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        axum::Json(json!({
            "error": {
                "code": code,
                "message": message,
                "request_id": uuid::Uuid::new_v4().to_string(),
            }
        })),
    )
        .into_response()
}

fn observe(state: &ServerState, endpoint: &str, started: Instant) {
    state.pipeline.metrics.observe(
        GRAPH_API_RESPONSE_SECONDS,
        &[("endpoint", endpoint)],
        started.elapsed().as_secs_f64(),
    );
}

async fn health(State(state): State<Arc<ServerState>>) -> Response {
    let started = Instant::now();
    let mut components = serde_json::Map::new();
    let mut degraded: Vec<&str> = Vec::new();

    match state.pipeline.graph.ping() {
        Ok(()) => {
            components.insert("graph".to_string(), json!("healthy"));
        }
        Err(_) => {
            components.insert("graph".to_string(), json!("unhealthy"));
            degraded.push("graph");
        }
    }
    components.insert(
        "stream".to_string(),
        json!({"last_seq": state.pipeline.stream.last_seq(), "pending": state.consumer.pending()}),
    );
    let dead_letters = state.pipeline.stream.replay(1, Some("gh.dlq.>")).len();
    if dead_letters > 0 {
        degraded.push("dead_letter");
    }
    components.insert("dead_letter".to_string(), json!({"count": dead_letters}));
    components.insert(
        "policy".to_string(),
        json!({"version": state.pipeline.policy.version()}),
    );
    if state.pipeline.config.flags.slo_monitoring_enabled {
        let slo = state.pipeline.slo.evaluate(Utc::now());
        if slo.alert_active {
            degraded.push("freshness");
        }
        components.insert("freshness".to_string(), serde_json::to_value(&slo).unwrap_or(Value::Null));
    }

    let status = if degraded.is_empty() { "healthy" } else { "degraded" };
    let body = json!({
        "status": status,
        "components": components,
        "degraded_components": degraded,
    });
    observe(&state, "health", started);
    ok_json(body)
}

async fn metrics(State(state): State<Arc<ServerState>>) -> Response {
    let text = state.pipeline.metrics.render_prometheus();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response()
}

async fn graph_pr(
    State(state): State<Arc<ServerState>>,
    Path(number): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let started = Instant::now();
    let result = find_pr_graph(&state, number, params.get("repo").map(String::as_str));
    let response = match result {
        Ok(Some(body)) => {
            state.remember(&format!("pr/{}", number), &body);
            ok_json(body)
        }
        Ok(None) => error_json(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("no PR node for #{}", number),
        ),
        Err(e) => match state.recall(&format!("pr/{}", number)) {
            Some(cached) => stale_json(cached),
            None => error_json(StatusCode::SERVICE_UNAVAILABLE, "graph_unavailable", &e.to_string()),
        },
    };
    observe(&state, "graph_pr", started);
    response
}

fn find_pr_graph(
    state: &ServerState,
    number: u64,
    repo: Option<&str>,
) -> anyhow::Result<Option<Value>> {
    let graph = &state.pipeline.graph;
    let node = match repo {
        Some(repo) => graph.get_node(NodeType::Pr, &format!("{}#{}", repo, number))?,
        None => {
            let suffix = format!("#{}", number);
            graph
                .nodes_of_type(NodeType::Pr)?
                .into_iter()
                .find(|n| n.nkey.ends_with(&suffix))
        }
    };
    let Some(node) = node else {
        return Ok(None);
    };
    let (nodes, edges) = graph.neighbors(node.id, None, 1, None)?;
    Ok(Some(json!({
        "nodes": nodes,
        "edges": edges,
    })))
}

async fn graph_owners(State(state): State<Arc<ServerState>>) -> Response {
    let started = Instant::now();
    let response = match build_owners_body(&state) {
        Ok(body) => {
            state.remember("owners", &body);
            ok_json(body)
        }
        Err(e) => match state.recall("owners") {
            Some(cached) => stale_json(cached),
            None => error_json(StatusCode::SERVICE_UNAVAILABLE, "graph_unavailable", &e.to_string()),
        },
    };
    observe(&state, "graph_owners", started);
    response
}

fn build_owners_body(state: &ServerState) -> anyhow::Result<Value> {
    let index = state.pipeline.owners_index()?;
    let total_files = state.pipeline.graph.nodes_of_type(NodeType::File)?.len();

    let mut owners = serde_json::Map::new();
    let mut covered = 0usize;
    for (prefix, entries) in &index.entries {
        let Some(primary) = entries.first() else {
            continue;
        };
        covered += 1;
        let secondary: Vec<&str> = entries.iter().skip(1).map(|o| o.owner.as_str()).collect();
        owners.insert(
            prefix.clone(),
            json!({
                "primary": primary.owner,
                "secondary": secondary,
                "activity_score": primary.activity_score,
                "last_activity": primary.last_activity.to_rfc3339(),
                "expertise_areas": [prefix.trim_end_matches('/')],
            }),
        );
    }

    let coverage = if index.entries.is_empty() {
        0.0
    } else {
        covered as f64 / index.entries.len() as f64 * 100.0
    };

    Ok(json!({
        "owners": owners,
        "metadata": {
            "generated_at": index
                .generated_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            "total_files": total_files,
            "coverage_percentage": coverage,
        }
    }))
}

async fn graph_relationships(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let started = Instant::now();
    let Some(node_id) = params.get("node_id").and_then(|s| s.parse::<i64>().ok()) else {
        observe(&state, "graph_relationships", started);
        return error_json(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "node_id query parameter is required",
        );
    };
    let depth = params
        .get("depth")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2)
        .min(5);

    let cache_key = format!("relationships/{}/{}", node_id, depth);
    let response = match state.pipeline.graph.neighbors(node_id, None, depth, None) {
        Ok((nodes, edges)) => {
            let body = json!({"nodes": nodes, "edges": edges});
            state.remember(&cache_key, &body);
            ok_json(body)
        }
        Err(e) if e.to_string().contains("not found") => {
            error_json(StatusCode::NOT_FOUND, "not_found", &e.to_string())
        }
        Err(e) => match state.recall(&cache_key) {
            Some(cached) => stale_json(cached),
            None => error_json(StatusCode::SERVICE_UNAVAILABLE, "graph_unavailable", &e.to_string()),
        },
    };
    observe(&state, "graph_relationships", started);
    response
}
