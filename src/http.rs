//! Read-only HTTP facade over the result cache
//!
//! Routes:
//!
//! - `GET /health` agent id and host
//! - `GET /paths` sorted canonical paths of every non-expired entry
//! - `GET /r/...`, `/w/...`, `/x/...` cached envelope bytes (empty body when missing)
//! - `GET /check?q=<query>` evaluates a condition query against the cache
//!
//! Every request passes the access gate first: the client address must sit in
//! an allowed network, and the access token (basic-auth username or the
//! `accessToken` query parameter) must be accepted.

use crate::agent::Agent;
use crate::error::Result;
use crate::query;
use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{header, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use base64::prelude::*;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const TOKEN_QUERY_PARAM: &str = "accessToken";

pub fn router(agent: Agent) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/paths", get(paths))
        .route("/check", get(check))
        .route("/r/{*rest}", get(cached_envelope))
        .route("/w/{*rest}", get(cached_envelope))
        .route("/x/{*rest}", get(cached_envelope))
        .layer(middleware::from_fn_with_state(agent.clone(), authorize))
        .with_state(agent)
}

/// Serve the facade on `listener` until `shutdown` is cancelled
pub async fn serve(agent: Agent, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let tls = &agent.configs().general.tls;
    if tls.cert_file.is_some() && tls.key_file.is_some() {
        warn!("TLS cert and key are configured but must be terminated by a fronting proxy, serving plain HTTP");
    }

    info!(addr = %listener.local_addr()?, "Serving HTTP facade");
    let app = router(agent);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

async fn authorize(State(agent): State<Agent>, request: Request, next: Next) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let token = request_token(&request);

    if let Err(e) = agent.access().authorize(client, token.as_deref()) {
        warn!(client = ?client, path = %request.uri().path(), error = %e, "Rejected request");
        return (StatusCode::FORBIDDEN, Json(json!({ "Error": e.to_string() }))).into_response();
    }
    next.run(request).await
}

/// Basic-auth username, else the `accessToken` query parameter
fn request_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| BASE64_STANDARD.decode(encoded.trim()).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .map(|credentials| match credentials.split_once(':') {
            Some((username, _)) => username.to_string(),
            None => credentials,
        });
    if from_header.is_some() {
        return from_header;
    }

    Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(mut params)| params.remove(TOKEN_QUERY_PARAM))
}

async fn health(State(agent): State<Agent>) -> Json<serde_json::Value> {
    Json(json!({
        "Status": "ok",
        "Id": agent.id().to_string(),
        "Host": agent.host(),
    }))
}

async fn paths(State(agent): State<Agent>) -> Json<Vec<String>> {
    let mut paths: Vec<String> = agent.cache().all_non_expired().into_keys().collect();
    paths.sort();
    Json(paths)
}

async fn cached_envelope(State(agent): State<Agent>, uri: Uri) -> Response {
    let body = agent.get_run_by_path(uri.path()).unwrap_or_default();
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

#[derive(Debug, Deserialize)]
struct CheckParams {
    #[serde(default)]
    q: String,
}

async fn check(State(agent): State<Agent>, Query(params): Query<CheckParams>) -> Response {
    let host = agent.host();
    let result = query::evaluate(
        &params.q,
        &**agent.cache(),
        &agent.configs().general.tags,
        &host.name,
    );
    match result {
        Ok(result) => Json(json!({ "Result": result })).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "Error": e.to_string() }))).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configs;
    use crate::host::StaticHost;
    use serde_json::Value;
    use std::sync::Arc;

    async fn start(configs: Configs) -> (Agent, String, CancellationToken) {
        let agent = Agent::new(configs)
            .unwrap()
            .with_host_info(Arc::new(StaticHost::new("h1", Default::default())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let token = CancellationToken::new();
        tokio::spawn(serve(agent.clone(), listener, token.clone()));
        (agent, base, token)
    }

    #[tokio::test]
    async fn test_cached_envelope_and_missing_path() {
        let (agent, base, token) = start(Configs::default()).await;
        agent
            .cache()
            .set("/r/cpu/load", br#"{"Data":{"Load":2.5}}"#.to_vec());

        let response = reqwest::get(format!("{}/r/cpu/load", base)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["content-type"].to_str().unwrap(),
            "application/json"
        );
        assert_eq!(response.text().await.unwrap(), r#"{"Data":{"Load":2.5}}"#);

        let response = reqwest::get(format!("{}/w/nothing", base)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().is_empty());

        let paths: Vec<String> = reqwest::get(format!("{}/paths", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(paths, vec!["/r/cpu/load"]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_health_reports_identity() {
        let (agent, base, token) = start(Configs::default()).await;
        let body: Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["Id"], agent.id().to_string());
        assert_eq!(body["Host"]["Name"], "h1");
        token.cancel();
    }

    #[tokio::test]
    async fn test_token_gate() {
        let mut configs = Configs::default();
        configs.access_tokens = vec!["secret".to_string()];
        let (_agent, base, token) = start(configs).await;
        let client = reqwest::Client::new();

        let denied = client.get(format!("{}/paths", base)).send().await.unwrap();
        assert_eq!(denied.status(), 403);

        let wrong = client
            .get(format!("{}/paths", base))
            .basic_auth("nope", Some(""))
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 403);

        let via_auth = client
            .get(format!("{}/paths", base))
            .basic_auth("secret", Some(""))
            .send()
            .await
            .unwrap();
        assert_eq!(via_auth.status(), 200);

        let via_query = client
            .get(format!("{}/paths?accessToken=secret", base))
            .send()
            .await
            .unwrap();
        assert_eq!(via_query.status(), 200);
        token.cancel();
    }

    #[tokio::test]
    async fn test_network_gate() {
        let mut configs = Configs::default();
        configs.general.allowed_networks = vec!["10.0.0.0/8".to_string()];
        let (_agent, base, token) = start(configs).await;

        let response = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(response.status(), 403);
        token.cancel();
    }

    #[tokio::test]
    async fn test_check_endpoint() {
        let (agent, base, token) = start(Configs::default()).await;
        agent
            .cache()
            .set("/r/cpu/load", br#"{"Data":{"Load":2.5}}"#.to_vec());
        let client = reqwest::Client::new();

        let check = |q: &str| {
            reqwest::Url::parse_with_params(&format!("{}/check", base), &[("q", q)]).unwrap()
        };

        let body: Value = client
            .get(check("/r/cpu/load.Load > 2 && hostname == \"h1\""))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["Result"], true);

        let response = client
            .get(check("/r/missing/path.Load > 0"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert!(body["Error"].as_str().unwrap().contains("/r/missing/path"));
        token.cancel();
    }
}
