use std::io::Read;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

use crate::alarm::engine::{AlarmEngine, EngineError};
use crate::alarm::model::{Alarm, AlarmId, AlarmStatus, OwnerId};
use crate::session::OwnerSessionTracker;

const OWNER_HEADER: &str = "X-Owner-Id";
const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

/// What request handlers need from the rest of the process.
#[derive(Clone)]
pub struct ApiContext {
    pub engine: AlarmEngine,
    pub sessions: Arc<OwnerSessionTracker>,
}

pub struct ApiServer {
    local_addr: Option<SocketAddr>,
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn start(config: ApiServerConfig, context: ApiContext) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start API server on {bind}: {err}"))?;
        let local_addr = server.server_addr().to_ip();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let http_join = thread::Builder::new()
            .name("api-http".to_string())
            .spawn(move || run_server_loop(server, context, stop_for_thread))
            .context("failed to spawn API server thread")?;

        info!(bind = %bind, local_addr = ?local_addr, "API server listening");
        Ok(Self {
            local_addr,
            stop,
            http_join: Some(http_join),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

fn run_server_loop(server: Server, context: ApiContext, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request, &context),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Json(u16, serde_json::Value),
    Text(u16, &'static str),
}

impl Reply {
    fn status(&self) -> u16 {
        match self {
            Reply::Json(status, _) | Reply::Text(status, _) => *status,
        }
    }
}

#[derive(Debug, Serialize)]
struct AlarmView {
    id: AlarmId,
    time: String,
    status: AlarmStatus,
}

impl From<&Alarm> for AlarmView {
    fn from(alarm: &Alarm) -> Self {
        Self {
            id: alarm.id,
            time: alarm.time_of_day.to_string(),
            status: alarm.status,
        }
    }
}

#[derive(Debug, Serialize)]
struct AlarmListResponse {
    owner_id: OwnerId,
    count: usize,
    alarms: Vec<AlarmView>,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    owner_id: Option<OwnerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_owner_id: Option<OwnerId>,
}

#[derive(Debug, Default, Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    existing_id: Option<AlarmId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<AlarmStatus>,
}

impl ErrorResponse {
    fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateAlarmBody {
    time: String,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    owner_id: String,
}

fn handle_request(mut request: tiny_http::Request, context: &ApiContext) {
    let Some(remote_addr) = request.remote_addr().copied() else {
        let _ = send_text(request, StatusCode(400), "missing remote address");
        return;
    };
    if !is_local_network_ip(remote_addr.ip()) {
        let _ = send_text(request, StatusCode(403), "forbidden: local network only");
        return;
    }

    let mut body = String::new();
    if let Err(err) = request
        .as_reader()
        .take(MAX_BODY_BYTES)
        .read_to_string(&mut body)
    {
        debug!(error = %err, "unreadable request body");
        let _ = send_text(request, StatusCode(400), "request body must be UTF-8");
        return;
    }

    let method = request.method().clone();
    let url = request.url().to_string();
    let (path, query) = split_path_query(&url);
    let owner_header = header_value(&request, OWNER_HEADER);
    let reply = route(context, &method, path, query, owner_header.as_deref(), &body);
    debug!(
        method = ?method,
        path,
        status = reply.status(),
        remote = %remote_addr,
        "api request"
    );

    let sent = match &reply {
        Reply::Json(status, value) => send_json(request, StatusCode(*status), value),
        Reply::Text(status, text) => send_text(request, StatusCode(*status), text),
    };
    if let Err(err) = sent {
        warn!(error = %format!("{err:#}"), "failed to send API response");
    }
}

fn route(
    context: &ApiContext,
    method: &Method,
    path: &str,
    query: &str,
    owner_header: Option<&str>,
    body: &str,
) -> Reply {
    let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();
    match (method, segments.as_slice()) {
        (Method::Get, ["healthz"]) => Reply::Text(200, "ok"),
        (Method::Get, ["v1", "alarms"]) => {
            with_owner(context, owner_header, query, |owner_id| {
                list_alarms(context, owner_id)
            })
        }
        (Method::Post, ["v1", "alarms"]) => {
            with_owner(context, owner_header, query, |owner_id| {
                create_alarm(context, owner_id, body)
            })
        }
        (Method::Post, ["v1", "alarms", raw_id, "cancel"]) => {
            with_owner(context, owner_header, query, |owner_id| {
                cancel_alarm(context, owner_id, raw_id)
            })
        }
        (Method::Get, ["v1", "session"]) => json(
            200,
            &SessionResponse {
                owner_id: context.sessions.current(),
                previous_owner_id: None,
            },
        ),
        (Method::Post, ["v1", "session", "login"]) => login(context, body),
        (Method::Post, ["v1", "session", "logout"]) => match context.sessions.logout() {
            Ok(owner_id) => json(
                200,
                &SessionResponse {
                    owner_id: None,
                    previous_owner_id: Some(owner_id),
                },
            ),
            Err(err) => json(409, &ErrorResponse::new("no_active_owner", err.to_string())),
        },
        (_, ["healthz"] | ["v1", "alarms"] | ["v1", "alarms", _, "cancel"] | ["v1", "session"])
        | (_, ["v1", "session", "login" | "logout"]) => Reply::Text(405, "method not allowed"),
        _ => json(404, &ErrorResponse::new("not_found", format!("no route for {path}"))),
    }
}

/// Header first, then `owner_id` in the query, then the logged-in owner.
fn resolve_owner(context: &ApiContext, owner_header: Option<&str>, query: &str) -> Option<OwnerId> {
    owner_header
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| query_param(query, "owner_id").filter(|value| !value.is_empty()))
        .map(OwnerId::new)
        .or_else(|| context.sessions.current())
}

fn with_owner(
    context: &ApiContext,
    owner_header: Option<&str>,
    query: &str,
    handler: impl FnOnce(&OwnerId) -> Reply,
) -> Reply {
    match resolve_owner(context, owner_header, query) {
        Some(owner_id) => handler(&owner_id),
        None => json(
            401,
            &ErrorResponse::new(
                "no_owner",
                format!("send {OWNER_HEADER}, ?owner_id= or log in first"),
            ),
        ),
    }
}

fn list_alarms(context: &ApiContext, owner_id: &OwnerId) -> Reply {
    match context.engine.list_alarms(owner_id) {
        Ok(alarms) => json(
            200,
            &AlarmListResponse {
                owner_id: owner_id.clone(),
                count: alarms.len(),
                alarms: alarms.iter().map(AlarmView::from).collect(),
            },
        ),
        Err(err) => engine_error_reply(err),
    }
}

fn create_alarm(context: &ApiContext, owner_id: &OwnerId, body: &str) -> Reply {
    let request = match parse_body::<CreateAlarmBody>(body) {
        Ok(request) => request,
        Err(reply) => return reply,
    };
    match context.engine.create_alarm(owner_id, &request.time) {
        Ok(alarm) => json(201, &AlarmView::from(&alarm)),
        Err(err) => engine_error_reply(err),
    }
}

fn cancel_alarm(context: &ApiContext, owner_id: &OwnerId, raw_id: &str) -> Reply {
    let Ok(id) = raw_id.parse::<AlarmId>() else {
        return json(
            404,
            &ErrorResponse::new("not_found", format!("'{raw_id}' is not an alarm id")),
        );
    };
    match context.engine.get_alarm(id) {
        Ok(alarm) if &alarm.owner_id == owner_id => {}
        Ok(_) => return engine_error_reply(EngineError::NotFound(id)),
        Err(err) => return engine_error_reply(err),
    }
    match context.engine.cancel_alarm(id) {
        Ok(alarm) => json(200, &AlarmView::from(&alarm)),
        Err(err) => engine_error_reply(err),
    }
}

fn login(context: &ApiContext, body: &str) -> Reply {
    let request = match parse_body::<LoginBody>(body) {
        Ok(request) => request,
        Err(reply) => return reply,
    };
    let owner_id = request.owner_id.trim();
    if owner_id.is_empty() {
        return json(400, &ErrorResponse::new("invalid_body", "owner_id must not be empty"));
    }
    let owner_id = OwnerId::new(owner_id);
    let previous_owner_id = context.sessions.login(owner_id.clone());
    json(
        200,
        &SessionResponse {
            owner_id: Some(owner_id),
            previous_owner_id,
        },
    )
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, Reply> {
    serde_json::from_str(body).map_err(|err| {
        json(
            400,
            &ErrorResponse::new(
                "invalid_body",
                format!(
                    "invalid JSON at line {}, column {}: {err}",
                    err.line(),
                    err.column()
                ),
            ),
        )
    })
}

fn engine_error_reply(err: EngineError) -> Reply {
    let message = err.to_string();
    match err {
        EngineError::InvalidTime(_) => json(400, &ErrorResponse::new("invalid_time", message)),
        EngineError::DuplicateAlarm { existing, .. } => json(
            409,
            &ErrorResponse {
                existing_id: Some(existing),
                ..ErrorResponse::new("duplicate_alarm", message)
            },
        ),
        EngineError::NotFound(_) => json(404, &ErrorResponse::new("not_found", message)),
        EngineError::Conflict { status, .. } => json(
            409,
            &ErrorResponse {
                status: Some(status),
                ..ErrorResponse::new("conflict", message)
            },
        ),
        err @ (EngineError::Store(_) | EngineError::Scheduling { .. }) => {
            if err.is_retryable() {
                warn!(error = %message, "alarm request failed; retryable");
                json(503, &ErrorResponse::new("unavailable", message))
            } else {
                error!(error = %message, "alarm request failed");
                json(500, &ErrorResponse::new("internal", message))
            }
        }
    }
}

fn json<T: Serialize>(status: u16, body: &T) -> Reply {
    match serde_json::to_value(body) {
        Ok(value) => Reply::Json(status, value),
        Err(err) => {
            error!(error = %err, "failed to serialize API response");
            Reply::Text(500, "internal serialization error")
        }
    }
}

fn send_json<T: Serialize>(
    request: tiny_http::Request,
    status: StatusCode,
    body: &T,
) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn send_text(request: tiny_http::Request, status: StatusCode, body: &str) -> Result<()> {
    let content_type = Header::from_str("Content-Type: text/plain; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(
        Response::from_string(body.to_string())
            .with_status_code(status)
            .with_header(content_type),
    )?;
    Ok(())
}

fn header_value(request: &tiny_http::Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|header| header.field.equiv(name))
        .map(|header| header.value.as_str().to_string())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if k == key {
            return Some(v);
        }
    }
    None
}

fn is_local_network_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || is_ipv4_mapped_local(v6)
        }
    }
}

fn is_ipv4_mapped_local(v6: Ipv6Addr) -> bool {
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        None => false,
    }
}
