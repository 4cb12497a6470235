//! HTTP API surface: routing, envelopes and parameter handling

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use registry_core::{RegistryError, ServiceRegistry, ServiceStatus};
use registry_proxy::{MetricsCollector, ProxyDispatcher};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Shared handles the request handlers work against.
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub dispatcher: Arc<ProxyDispatcher>,
    pub metrics: Arc<MetricsCollector>,
}

/// Registration payload accepted at `POST /api/services`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest {
    service_name: String,
    service_version: String,
    ip: String,
    port: u16,
    #[serde(default)]
    virtual_domain: Option<String>,
}

pub async fn handle_request(
    state: Arc<AppState>,
    client_addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    state
        .metrics
        .observe_request(method.as_str(), route_class(&path));

    Ok(route(state, client_addr, method, &path, req).await)
}

async fn route(
    state: Arc<AppState>,
    client_addr: SocketAddr,
    method: Method,
    path: &str,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let query = parse_query(req.uri().query());

    // Reverse-proxy entry point; method policy is the dispatcher's.
    if let Some(rest) = path.strip_prefix("/proxy/") {
        let target = rest.split('/').next().unwrap_or("").to_string();
        if target.is_empty() {
            return error_envelope(
                StatusCode::NOT_FOUND,
                "No service found for the given virtual domain or service name",
            );
        }
        return state
            .dispatcher
            .dispatch(&target, &client_addr.ip().to_string(), req)
            .await;
    }

    if path == "/healthz" {
        return text_response(StatusCode::OK, "OK\n");
    }

    if path == "/metrics" && method == Method::GET {
        let body = state
            .metrics
            .gather()
            .unwrap_or_else(|_| "Failed to gather metrics\n".to_string());
        return text_response(StatusCode::OK, &body);
    }

    match (method.as_str(), path) {
        ("POST", "/api/services") => register_from_body(&state, req).await,
        ("GET", "/api/services") => list_raw(&state).await,
        ("GET", "/api/services/list") => list_envelope(&state).await,
        ("GET", "/api/services/find") => find_services(&state, &query).await,
        ("POST", "/api/services/register") => register_from_query(&state, &query).await,
        ("DELETE", "/api/services/deregister") => deregister_tuple(&state, &query).await,
        ("PUT", "/api/services/heartbeat") => heartbeat_tuple(&state, &query).await,
        _ => route_dynamic(&state, &method, path, &query).await,
    }
}

async fn route_dynamic(
    state: &AppState,
    method: &Method,
    path: &str,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    if let Some(domain) = path.strip_prefix("/api/services/domain/") {
        if method == &Method::GET {
            return find_by_domain(state, domain).await;
        }
    }

    if let Some(rest) = path.strip_prefix("/api/services/") {
        let mut segments = rest.splitn(2, '/');
        let id = segments.next().unwrap_or("");
        match (method.as_str(), segments.next()) {
            ("DELETE", None) => return deregister_by_id(state, id).await,
            ("PUT", Some("heartbeat")) => return heartbeat_by_id(state, id).await,
            ("PUT", Some("virtual-domain")) => {
                return update_virtual_domain(state, id, query).await
            }
            _ => {}
        }
    }

    if let Some(rest) = path.strip_prefix("/api/rate-limit/") {
        let mut segments = rest.splitn(2, '/');
        let id = segments.next().unwrap_or("");
        match (method.as_str(), segments.next()) {
            ("GET", None) => return get_rate_limit(state, id).await,
            ("PUT", None) => return set_rate_limit(state, id, query).await,
            ("POST", Some("enable")) => return enable_rate_limit(state, id, query).await,
            ("POST", Some("disable")) => return disable_rate_limit(state, id).await,
            _ => {}
        }
    }

    error_envelope(StatusCode::NOT_FOUND, "Not found")
}

async fn register_from_body(state: &AppState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return error_envelope(
                StatusCode::BAD_REQUEST,
                &format!("Failed to read request body: {}", e),
            )
        }
    };

    let payload: RegisterRequest = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(e) => {
            return error_envelope(
                StatusCode::BAD_REQUEST,
                &format!("Invalid registration payload: {}", e),
            )
        }
    };

    match state
        .registry
        .register(
            &payload.service_name,
            &payload.service_version,
            &payload.ip,
            payload.port,
            payload.virtual_domain,
        )
        .await
    {
        // The console consumes the record directly, without an envelope.
        Ok(record) => json_body(StatusCode::OK, &record),
        Err(e) => registry_error_response(e, "Service registration failed"),
    }
}

async fn register_from_query(
    state: &AppState,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let Some((name, version, ip, port)) = tuple_params(query) else {
        return error_envelope(
            StatusCode::BAD_REQUEST,
            "Missing or invalid parameters: serviceName, serviceVersion, ip, port",
        );
    };
    let virtual_domain = query.get("virtualDomain").cloned();

    match state
        .registry
        .register(&name, &version, &ip, port, virtual_domain)
        .await
    {
        Ok(record) => json_response(
            StatusCode::OK,
            json!({ "success": true, "message": "Service registered", "data": record }),
        ),
        Err(e) => registry_error_response(e, "Service registration failed"),
    }
}

async fn list_raw(state: &AppState) -> Response<Full<Bytes>> {
    match state.registry.list_all().await {
        // Raw list for direct console consumption.
        Ok(records) => json_body(StatusCode::OK, &records),
        Err(e) => registry_error_response(e, "Service list query failed"),
    }
}

async fn list_envelope(state: &AppState) -> Response<Full<Bytes>> {
    match state.registry.list_all().await {
        Ok(records) => {
            let total = records.len();
            json_response(
                StatusCode::OK,
                json!({
                    "success": true,
                    "message": "Service list retrieved",
                    "data": records,
                    "total": total,
                }),
            )
        }
        Err(e) => registry_error_response(e, "Service list query failed"),
    }
}

async fn find_services(state: &AppState, query: &HashMap<String, String>) -> Response<Full<Bytes>> {
    let Some(name) = query.get("serviceName").filter(|n| !n.is_empty()) else {
        return error_envelope(
            StatusCode::BAD_REQUEST,
            "Missing required parameter: serviceName",
        );
    };
    let version = query
        .get("serviceVersion")
        .map(|v| v.as_str())
        .filter(|v| !v.is_empty());

    match state.registry.find_by_name_and_version(name, version).await {
        Ok(records) => {
            let total = records.len();
            json_response(
                StatusCode::OK,
                json!({
                    "success": true,
                    "message": "Service lookup succeeded",
                    "data": records,
                    "total": total,
                }),
            )
        }
        Err(e) => registry_error_response(e, "Service lookup failed"),
    }
}

async fn find_by_domain(state: &AppState, domain: &str) -> Response<Full<Bytes>> {
    match state.registry.find_by_virtual_domain(domain).await {
        Ok(Some(record)) if record.status == ServiceStatus::Up => json_response(
            StatusCode::OK,
            json!({ "success": true, "message": "Service lookup succeeded", "data": record }),
        ),
        Ok(_) => error_envelope(StatusCode::NOT_FOUND, "Service not found or offline"),
        Err(e) => registry_error_response(e, "Service lookup failed"),
    }
}

async fn deregister_tuple(
    state: &AppState,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let Some((name, version, ip, port)) = tuple_params(query) else {
        return error_envelope(
            StatusCode::BAD_REQUEST,
            "Missing or invalid parameters: serviceName, serviceVersion, ip, port",
        );
    };

    match state.registry.deregister(&name, &version, &ip, port).await {
        Ok(true) => ok_envelope("Service deregistered"),
        Ok(false) => error_envelope(StatusCode::NOT_FOUND, "Service not found"),
        Err(e) => registry_error_response(e, "Service deregistration failed"),
    }
}

async fn deregister_by_id(state: &AppState, id: &str) -> Response<Full<Bytes>> {
    match state.registry.deregister_by_id(id).await {
        Ok(true) => ok_envelope("Service deregistered"),
        Ok(false) => error_envelope(StatusCode::NOT_FOUND, "Service not found"),
        Err(e) => registry_error_response(e, "Service deregistration failed"),
    }
}

async fn heartbeat_tuple(
    state: &AppState,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let Some((name, version, ip, port)) = tuple_params(query) else {
        return error_envelope(
            StatusCode::BAD_REQUEST,
            "Missing or invalid parameters: serviceName, serviceVersion, ip, port",
        );
    };

    match state.registry.heartbeat(&name, &version, &ip, port).await {
        Ok(true) => ok_envelope("Heartbeat updated"),
        Ok(false) => error_envelope(StatusCode::NOT_FOUND, "Service not found"),
        Err(e) => registry_error_response(e, "Heartbeat update failed"),
    }
}

async fn heartbeat_by_id(state: &AppState, id: &str) -> Response<Full<Bytes>> {
    match state.registry.heartbeat_by_id(id).await {
        Ok(true) => ok_envelope("Heartbeat updated"),
        Ok(false) => error_envelope(StatusCode::NOT_FOUND, "Service not found"),
        Err(e) => registry_error_response(e, "Heartbeat update failed"),
    }
}

async fn update_virtual_domain(
    state: &AppState,
    id: &str,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let domain = query.get("virtualDomain").cloned();

    match state.registry.update_virtual_domain(id, domain).await {
        Ok(true) => ok_envelope("Virtual domain updated"),
        Ok(false) => error_envelope(
            StatusCode::BAD_REQUEST,
            "Service not found or virtual domain already in use",
        ),
        Err(e) => registry_error_response(e, "Virtual domain update failed"),
    }
}

async fn get_rate_limit(state: &AppState, id: &str) -> Response<Full<Bytes>> {
    match state.registry.get_rate_limit(id).await {
        Ok(Some(config)) => {
            json_response(StatusCode::OK, json!({ "success": true, "data": config }))
        }
        Ok(None) => error_envelope(StatusCode::NOT_FOUND, "Service not found"),
        Err(e) => registry_error_response(e, "Rate limit lookup failed"),
    }
}

async fn set_rate_limit(
    state: &AppState,
    id: &str,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let Some(enabled) = query.get("enabled").and_then(|v| v.parse::<bool>().ok()) else {
        return error_envelope(
            StatusCode::BAD_REQUEST,
            "Missing or invalid parameter: enabled",
        );
    };
    let Some(max_rps) = query
        .get("maxRequestsPerSecond")
        .and_then(|v| v.parse::<u32>().ok())
    else {
        return error_envelope(
            StatusCode::BAD_REQUEST,
            "Missing or invalid parameter: maxRequestsPerSecond",
        );
    };
    let error_message = query.get("errorMessage").cloned();

    match state
        .registry
        .set_rate_limit(id, enabled, max_rps, error_message)
        .await
    {
        Ok(true) if enabled => ok_envelope("Rate limit enabled"),
        Ok(true) => ok_envelope("Rate limit configuration updated"),
        Ok(false) => error_envelope(StatusCode::NOT_FOUND, "Service not found"),
        Err(e) => registry_error_response(e, "Rate limit update failed"),
    }
}

async fn enable_rate_limit(
    state: &AppState,
    id: &str,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let Some(max_rps) = query
        .get("maxRequestsPerSecond")
        .and_then(|v| v.parse::<u32>().ok())
    else {
        return error_envelope(
            StatusCode::BAD_REQUEST,
            "Missing or invalid parameter: maxRequestsPerSecond",
        );
    };

    match state.registry.enable_rate_limit(id, max_rps).await {
        Ok(true) => ok_envelope("Rate limit enabled"),
        Ok(false) => error_envelope(StatusCode::NOT_FOUND, "Service not found"),
        Err(e) => registry_error_response(e, "Rate limit update failed"),
    }
}

async fn disable_rate_limit(state: &AppState, id: &str) -> Response<Full<Bytes>> {
    match state.registry.disable_rate_limit(id).await {
        Ok(true) => ok_envelope("Rate limit disabled"),
        Ok(false) => error_envelope(StatusCode::NOT_FOUND, "Service not found"),
        Err(e) => registry_error_response(e, "Rate limit update failed"),
    }
}

/// Bounded-cardinality route label for metrics.
fn route_class(path: &str) -> &'static str {
    if path.starts_with("/proxy/") {
        "/proxy"
    } else if path.starts_with("/api/rate-limit") {
        "/api/rate-limit"
    } else if path.starts_with("/api/services") {
        "/api/services"
    } else if path == "/metrics" {
        "/metrics"
    } else if path == "/healthz" {
        "/healthz"
    } else {
        "other"
    }
}

/// The (serviceName, serviceVersion, ip, port) tuple shared by the legacy
/// query-parameter endpoints.
fn tuple_params(query: &HashMap<String, String>) -> Option<(String, String, String, u16)> {
    let name = query.get("serviceName").filter(|v| !v.is_empty())?;
    let version = query.get("serviceVersion").filter(|v| !v.is_empty())?;
    let ip = query.get("ip").filter(|v| !v.is_empty())?;
    let port = query.get("port")?.parse::<u16>().ok()?;
    Some((name.clone(), version.clone(), ip.clone(), port))
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(percent_decode(key), percent_decode(value));
    }
    params
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn registry_error_response(e: RegistryError, context: &str) -> Response<Full<Bytes>> {
    match e {
        RegistryError::DomainConflict(domain) => error_envelope(
            StatusCode::BAD_REQUEST,
            &format!("Virtual domain already in use: {}", domain),
        ),
        RegistryError::NotFound(what) => error_envelope(
            StatusCode::NOT_FOUND,
            &format!("Service not found: {}", what),
        ),
        e => error_envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("{}: {}", context, e),
        ),
    }
}

fn ok_envelope(message: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        json!({ "success": true, "message": message }),
    )
}

fn error_envelope(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, json!({ "success": false, "message": message }))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap()
}

fn json_body<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_string(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => error_envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Serialization failed: {}", e),
        ),
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}
