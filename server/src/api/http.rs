use axum::{
    extract::{ConnectInfo, Query, State as AxumState},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::metrics::render_prometheus;
use crate::state::{Actor, Backend, OpError, ServerConfig};
use dreamrun_types::{
    api::{
        self, ErrorBody, FinalizeResponse, IssueCodeRequest, IssueCodeResponse,
        LeaderboardResponse, SubmitScoreRequest, SubmitScoreResponse, UseCodeRequest,
        UseCodeResponse, VerifyCodeRequest, VerifyCodeResponse, WinnersResponse,
    },
    time, CodeStatus, IssueError, LeaderboardMode, RedeemError, MAX_LEADERBOARD_LIMIT,
    MAX_PLAYER_ID_LEN,
};

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

#[derive(Deserialize)]
pub(super) struct LeaderboardQuery {
    limit: Option<i64>,
    cutoff: Option<String>,
    mode: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct AdminQuery {
    admin_token: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct FinalizeQuery {
    cutoff: Option<String>,
    top: Option<i64>,
    admin_token: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct WinnersQuery {
    cutoff: Option<String>,
    admin_token: Option<String>,
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn submit_score(
    AxumState(backend): AxumState<Arc<Backend>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<SubmitScoreRequest>,
) -> Response {
    let actor = actor_from(&headers, Some(addr));
    let player_id = api::coerce_player_id(request.player_id.as_ref());
    let score = api::coerce_score(request.score.as_ref());
    // Client timestamps are a convenience default only; anything that is
    // not canonical ISO-8601 is replaced by the server clock downstream.
    let ts = request.ts.as_deref().and_then(time::parse_ts);

    match backend.submit_score(&player_id, score, ts, &actor).await {
        Ok(outcome) => Json(SubmitScoreResponse {
            ok: true,
            best: outcome.best,
            prize_code: outcome.prize_code,
            rank: outcome.rank,
            total_players: outcome.total_players,
            pub_code: outcome.pub_code,
        })
        .into_response(),
        Err(OpError::Invalid(_)) => {
            error_response(StatusCode::BAD_REQUEST, ErrorBody::new("bad_request"))
        }
        Err(_) => internal_error(),
    }
}

pub(super) async fn leaderboard(
    AxumState(backend): AxumState<Arc<Backend>>,
    Query(query): Query<LeaderboardQuery>,
) -> Response {
    let cutoff = match parse_cutoff_param(query.cutoff.as_deref()) {
        Ok(cutoff) => cutoff,
        Err(response) => return response,
    };
    let limit = clamp_limit(query.limit, backend.config.default_leaderboard_limit);
    let mode = LeaderboardMode::parse(query.mode.as_deref().unwrap_or_default());
    let rows = backend.leaderboard(limit, cutoff, mode).await;
    Json(LeaderboardResponse {
        ok: true,
        leaderboard: rows,
    })
    .into_response()
}

pub(super) async fn issue_code(
    AxumState(backend): AxumState<Arc<Backend>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(admin): Query<AdminQuery>,
    Json(request): Json<IssueCodeRequest>,
) -> Response {
    let actor = actor_from(&headers, Some(addr));
    if let Some(status) = admin_auth_error(&backend.config, &headers, admin.admin_token.as_deref())
    {
        backend.record_rejected("issue_reject", "unauthorized", &actor).await;
        return error_response(status, ErrorBody::new("unauthorized"));
    }

    let player_id = request
        .player_id
        .as_deref()
        .map(|p| api::truncate(p, MAX_PLAYER_ID_LEN))
        .unwrap_or_default();
    let Some(rank) = request
        .rank
        .filter(|r| (0..=i64::from(u32::MAX)).contains(r))
    else {
        backend.record_rejected("issue_reject", "bad_request", &actor).await;
        return error_response(StatusCode::BAD_REQUEST, ErrorBody::new("bad_request"));
    };
    if player_id.is_empty() {
        backend.record_rejected("issue_reject", "bad_request", &actor).await;
        return error_response(StatusCode::BAD_REQUEST, ErrorBody::new("bad_request"));
    }

    match backend.issue_code(&player_id, rank as u32, &actor).await {
        Ok((code, expires_at)) => Json(IssueCodeResponse {
            ok: true,
            code,
            expires_at,
        })
        .into_response(),
        Err(OpError::Issue(IssueError::AlreadyIssued { code, .. })) => {
            error_response(StatusCode::CONFLICT, ErrorBody::with_code("already_issued", code))
        }
        Err(OpError::Issue(IssueError::CodeSpaceExhausted(_))) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody::new("code_space_exhausted"),
        ),
        Err(_) => internal_error(),
    }
}

pub(super) async fn verify_code(
    AxumState(backend): AxumState<Arc<Backend>>,
    headers: HeaderMap,
    Query(admin): Query<AdminQuery>,
    Json(request): Json<VerifyCodeRequest>,
) -> Response {
    if let Some(status) = admin_auth_error(&backend.config, &headers, admin.admin_token.as_deref())
    {
        return error_response(status, ErrorBody::new("unauthorized"));
    }
    let Some(code) = request.code.as_deref().filter(|c| !c.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, ErrorBody::new("bad_request"));
    };

    let response = match backend.verify_code(code).await {
        CodeStatus::NotFound => VerifyCodeResponse {
            ok: true,
            status: "not_found",
            ..Default::default()
        },
        CodeStatus::Valid {
            rank,
            player_id,
            expires_at,
        } => VerifyCodeResponse {
            ok: true,
            status: "valid",
            rank: Some(rank),
            player_id: Some(player_id),
            expires_at: Some(expires_at),
            ..Default::default()
        },
        CodeStatus::Used {
            used_at,
            used_by,
            rank,
            player_id,
        } => VerifyCodeResponse {
            ok: true,
            status: "used",
            rank: Some(rank),
            player_id: Some(player_id),
            used_at: Some(used_at),
            used_by,
            ..Default::default()
        },
        CodeStatus::Expired { rank, player_id } => VerifyCodeResponse {
            ok: true,
            status: "expired",
            rank: Some(rank),
            player_id: Some(player_id),
            ..Default::default()
        },
    };
    Json(response).into_response()
}

pub(super) async fn use_code(
    AxumState(backend): AxumState<Arc<Backend>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(admin): Query<AdminQuery>,
    Json(request): Json<UseCodeRequest>,
) -> Response {
    let actor = actor_from(&headers, Some(addr));
    if let Some(status) = admin_auth_error(&backend.config, &headers, admin.admin_token.as_deref())
    {
        backend.record_rejected("use_reject", "unauthorized", &actor).await;
        return error_response(status, ErrorBody::new("unauthorized"));
    }
    let Some(code) = request.code.as_deref().filter(|c| !c.is_empty()) else {
        backend.record_rejected("use_reject", "bad_request", &actor).await;
        return error_response(StatusCode::BAD_REQUEST, ErrorBody::new("bad_request"));
    };

    match backend.use_code(code, request.used_by.as_deref(), &actor).await {
        Ok(used_at) => Json(UseCodeResponse { ok: true, used_at }).into_response(),
        Err(OpError::Redeem(RedeemError::NotFound)) => {
            error_response(StatusCode::NOT_FOUND, ErrorBody::new("not_found"))
        }
        Err(OpError::Redeem(RedeemError::AlreadyUsed(_))) => {
            error_response(StatusCode::CONFLICT, ErrorBody::new("already_used"))
        }
        Err(OpError::Redeem(RedeemError::Expired(_))) => {
            error_response(StatusCode::CONFLICT, ErrorBody::new("expired"))
        }
        Err(_) => internal_error(),
    }
}

pub(super) async fn finalize(
    AxumState(backend): AxumState<Arc<Backend>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<FinalizeQuery>,
) -> Response {
    let actor = actor_from(&headers, Some(addr));
    if let Some(status) = admin_auth_error(&backend.config, &headers, query.admin_token.as_deref())
    {
        backend.record_rejected("finalize_reject", "unauthorized", &actor).await;
        return error_response(status, ErrorBody::new("unauthorized"));
    }
    let Some(cutoff) = query.cutoff.as_deref().and_then(time::parse_ts) else {
        backend.record_rejected("finalize_reject", "bad_cutoff", &actor).await;
        return error_response(StatusCode::BAD_REQUEST, ErrorBody::new("bad_cutoff"));
    };
    let top = clamp_limit(query.top, backend.config.default_leaderboard_limit);

    match backend.finalize(cutoff, top, &actor).await {
        Ok(outcome) => Json(FinalizeResponse {
            ok: true,
            cutoff: time::format_ts(cutoff),
            issued_count: outcome.issued_count(),
            winners: outcome.winners,
        })
        .into_response(),
        Err(OpError::Issue(IssueError::CodeSpaceExhausted(_))) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorBody::new("code_space_exhausted"),
        ),
        Err(_) => internal_error(),
    }
}

pub(super) async fn winners(
    AxumState(backend): AxumState<Arc<Backend>>,
    headers: HeaderMap,
    Query(query): Query<WinnersQuery>,
) -> Response {
    if let Some(status) = admin_auth_error(&backend.config, &headers, query.admin_token.as_deref())
    {
        return error_response(status, ErrorBody::new("unauthorized"));
    }
    let Some(cutoff) = query.cutoff.as_deref().and_then(time::parse_ts) else {
        return error_response(StatusCode::BAD_REQUEST, ErrorBody::new("bad_cutoff"));
    };

    let winners = backend.winners(cutoff).await;
    Json(WinnersResponse {
        ok: true,
        cutoff: time::format_ts(cutoff),
        winners,
    })
    .into_response()
}

pub(super) async fn ops_metrics(
    AxumState(backend): AxumState<Arc<Backend>>,
    headers: HeaderMap,
) -> Response {
    if let Some(status) = metrics_auth_error(&backend.config, &headers) {
        return status.into_response();
    }
    Json(backend.metrics().snapshot()).into_response()
}

pub(super) async fn prometheus_metrics(
    AxumState(backend): AxumState<Arc<Backend>>,
    headers: HeaderMap,
) -> Response {
    if let Some(status) = metrics_auth_error(&backend.config, &headers) {
        return status.into_response();
    }
    let body = render_prometheus(&backend.metrics().snapshot());
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response()
}

/// Validates admin authentication via `X-Admin-Token` header, Bearer token,
/// or `admin_token` query parameter, compared exactly against the
/// configured secret. Returns None if authorized. An unconfigured secret
/// blocks all admin access.
pub(super) fn admin_auth_error(
    config: &ServerConfig,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Option<StatusCode> {
    let Some(expected) = config.admin_token.as_deref().filter(|t| !t.is_empty()) else {
        return Some(StatusCode::UNAUTHORIZED);
    };
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let header_token = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok());
    if bearer == Some(expected) || header_token == Some(expected) || query_token == Some(expected) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

fn metrics_auth_error(config: &ServerConfig, headers: &HeaderMap) -> Option<StatusCode> {
    let Some(expected) = config.metrics_token.as_deref().filter(|t| !t.is_empty()) else {
        return None;
    };
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok());
    if bearer == Some(expected) || header_token == Some(expected) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

fn actor_from(headers: &HeaderMap, addr: Option<SocketAddr>) -> Actor {
    Actor {
        ip: client_ip(headers, addr),
        ua: headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    }
}

/// Proxy headers win over the socket address so audit rows stay useful
/// behind a load balancer.
fn client_ip(headers: &HeaderMap, addr: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| addr.map(|a| a.ip().to_string()))
}

fn parse_cutoff_param(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, Response> {
    match raw {
        None => Ok(None),
        Some(raw) => time::parse_ts(raw).map(Some).ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, ErrorBody::new("bad_cutoff"))
        }),
    }
}

fn clamp_limit(raw: Option<i64>, default: usize) -> usize {
    raw.unwrap_or(default as i64)
        .clamp(1, MAX_LEADERBOARD_LIMIT as i64) as usize
}

fn error_response(status: StatusCode, body: ErrorBody) -> Response {
    (status, Json(body)).into_response()
}

fn internal_error() -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, ErrorBody::new("internal"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_token(token: &str) -> ServerConfig {
        ServerConfig {
            admin_token: Some(token.to_string()),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn admin_auth_accepts_header_bearer_and_query() {
        let config = config_with_token("sekrit");

        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", HeaderValue::from_static("sekrit"));
        assert_eq!(admin_auth_error(&config, &headers, None), None);

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sekrit"),
        );
        assert_eq!(admin_auth_error(&config, &headers, None), None);

        let headers = HeaderMap::new();
        assert_eq!(admin_auth_error(&config, &headers, Some("sekrit")), None);
    }

    #[test]
    fn admin_auth_rejects_mismatch_and_absence() {
        let config = config_with_token("sekrit");
        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", HeaderValue::from_static("wrong"));
        assert_eq!(
            admin_auth_error(&config, &headers, None),
            Some(StatusCode::UNAUTHORIZED)
        );
        assert_eq!(
            admin_auth_error(&config, &HeaderMap::new(), None),
            Some(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn unconfigured_admin_token_blocks_everything() {
        let config = ServerConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", HeaderValue::from_static("anything"));
        assert_eq!(
            admin_auth_error(&config, &headers, Some("anything")),
            Some(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn client_ip_prefers_proxy_headers() {
        let addr: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(
            client_ip(&headers, Some(addr)).as_deref(),
            Some("203.0.113.7")
        );
        assert_eq!(
            client_ip(&HeaderMap::new(), Some(addr)).as_deref(),
            Some("10.0.0.9")
        );
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }

    #[test]
    fn limits_clamp_to_valid_range() {
        assert_eq!(clamp_limit(None, 10), 10);
        assert_eq!(clamp_limit(Some(0), 10), 1);
        assert_eq!(clamp_limit(Some(-3), 10), 1);
        assert_eq!(clamp_limit(Some(500), 10), 100);
        assert_eq!(clamp_limit(Some(25), 10), 25);
    }

    #[test]
    fn cutoff_param_policy_is_uniform() {
        assert!(matches!(parse_cutoff_param(None), Ok(None)));
        assert!(matches!(
            parse_cutoff_param(Some("2024-03-01T12:00:00.000Z")),
            Ok(Some(_))
        ));
        // Malformed cutoffs are a hard error everywhere, leaderboard included.
        assert!(parse_cutoff_param(Some("2024-03-01T12:00:00Z")).is_err());
        assert!(parse_cutoff_param(Some("yesterday")).is_err());
    }
}
