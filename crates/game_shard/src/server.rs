use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tungstenite::protocol::Message;

use game_shard_proto::SignedTransaction;

use crate::entity::Tick;
use crate::error::WorldError;
use crate::persona::CREATE_PERSONA_MESSAGE;
use crate::world::{ShardHandle, SubmitError};

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

const GAME_TX_PREFIX: &str = "/tx/game/";
const PERSONA_TX_ROUTE: &str = "/tx/persona/create-persona";
const GAME_QUERY_PREFIX: &str = "/query/game/";
const CQL_QUERY_ROUTE: &str = "/query/game/cql";
const RECEIPTS_ROUTE: &str = "/query/receipts/list";
const PERSONA_SIGNER_ROUTE: &str = "/query/persona/signer";
const ENDPOINTS_ROUTE: &str = "/query/http/endpoints";
const HEALTH_ROUTE: &str = "/health";
const EVENTS_ROUTE: &str = "/events";
const DEBUG_STATE_ROUTE: &str = "/debug/state";

/// The HTTP edge: accepts connections on a listener thread, one worker
/// thread per connection, 5-second read timeout. `/events` upgrades to a
/// WebSocket fed from the event hub.
pub struct ShardServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ShardServer {
    pub fn spawn(handle: ShardHandle) -> Result<Self, WorldError> {
        let listener = TcpListener::bind(("0.0.0.0", handle.config().port))?;
        Self::spawn_on(handle, listener)
    }

    /// Serves on an already-bound listener (tests bind port 0).
    pub fn spawn_on(handle: ShardHandle, listener: TcpListener) -> Result<Self, WorldError> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        handle.set_server_running(true);
        log::info!("serving shard at {addr}");
        let join = thread::spawn(move || {
            loop {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        let connection_handle = handle.clone();
                        thread::spawn(move || {
                            if let Err(err) = serve_connection(stream, connection_handle) {
                                log::debug!("connection error: {err}");
                            }
                        });
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(25));
                    }
                    Err(err) => {
                        log::error!("accept failed: {err}");
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            handle.set_server_running(false);
        });
        Ok(Self {
            addr,
            stop,
            join: Some(join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ShardServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_connection(stream: TcpStream, handle: ShardHandle) -> Result<(), WorldError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    // The websocket handshake must see the unconsumed stream, so sniff the
    // request line before reading anything.
    let mut probe = [0u8; 16];
    let sniffed = stream.peek(&mut probe)?;
    if probe[..sniffed].starts_with(b"GET /events") {
        return serve_events(stream, &handle);
    }

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let mut parts = request_line.trim_end().splitn(3, ' ');
    let method = parts.next().unwrap_or("").to_string();
    let target = parts.next().unwrap_or("").to_string();
    let path = target.split('?').next().unwrap_or("").to_string();

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
        {
            content_length = value.parse().unwrap_or(0);
        }
    }
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader.read_exact(&mut body)?;
    }

    let (status, reply) = route_request(&handle, &method, &path, &body);
    let mut stream = stream;
    write_json_response(&mut stream, status, reply.to_string().as_bytes())?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct CqlRequest {
    #[serde(rename = "CQL")]
    cql: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptsRequest {
    #[serde(default)]
    start_tick: Tick,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonaSignerRequest {
    persona_tag: String,
    #[serde(default)]
    tick: Tick,
}

fn route_request(handle: &ShardHandle, method: &str, path: &str, body: &[u8]) -> (u16, JsonValue) {
    match (method, path) {
        ("GET", HEALTH_ROUTE) => match serde_json::to_value(handle.health()) {
            Ok(reply) => (200, reply),
            Err(err) => internal_error(handle, &err.to_string()),
        },
        ("GET", DEBUG_STATE_ROUTE) => {
            if !handle.config().debug {
                return (404, error_body("unknown route"));
            }
            match serde_json::to_value(handle.debug_state()) {
                Ok(reply) => (200, reply),
                Err(err) => internal_error(handle, &err.to_string()),
            }
        }
        ("POST", _) if handle.is_recovering() => {
            (500, error_body("game world is recovering state"))
        }
        ("POST", PERSONA_TX_ROUTE) => submit_tx(handle, CREATE_PERSONA_MESSAGE, body, true),
        ("POST", CQL_QUERY_ROUTE) => {
            let request: CqlRequest = match serde_json::from_slice(body) {
                Ok(request) => request,
                Err(err) => return (400, error_body(&format!("malformed json: {err}"))),
            };
            let filter = match handle.parse_cql(&request.cql) {
                Ok(filter) => filter,
                Err(err) => return (422, error_body(&err.to_string())),
            };
            match handle
                .evaluate_cql(&filter)
                .and_then(|entities| Ok(serde_json::to_value(entities)?))
            {
                Ok(reply) => (200, reply),
                Err(err) => internal_error(handle, &err.to_string()),
            }
        }
        ("POST", RECEIPTS_ROUTE) => {
            let request: ReceiptsRequest = match serde_json::from_slice(body) {
                Ok(request) => request,
                Err(err) => return (400, error_body(&format!("malformed json: {err}"))),
            };
            match serde_json::to_value(handle.receipts_since(request.start_tick)) {
                Ok(reply) => (200, reply),
                Err(err) => internal_error(handle, &err.to_string()),
            }
        }
        ("POST", PERSONA_SIGNER_ROUTE) => {
            let request: PersonaSignerRequest = match serde_json::from_slice(body) {
                Ok(request) => request,
                Err(err) => return (400, error_body(&format!("malformed json: {err}"))),
            };
            match serde_json::to_value(handle.persona_signer(&request.persona_tag, request.tick)) {
                Ok(reply) => (200, reply),
                Err(err) => internal_error(handle, &err.to_string()),
            }
        }
        ("POST", ENDPOINTS_ROUTE) => match serde_json::to_value(handle.endpoints()) {
            Ok(reply) => (200, reply),
            Err(err) => internal_error(handle, &err.to_string()),
        },
        ("POST", path) if path.starts_with(GAME_TX_PREFIX) => {
            let name = &path[GAME_TX_PREFIX.len()..];
            submit_tx(handle, name, body, false)
        }
        ("POST", path) if path.starts_with(GAME_QUERY_PREFIX) => {
            let name = &path[GAME_QUERY_PREFIX.len()..];
            run_game_query(handle, name, body)
        }
        (method, path) if known_route(path) => {
            (405, error_body(&format!("method {method} not allowed")))
        }
        _ => (404, error_body("unknown route")),
    }
}

fn known_route(path: &str) -> bool {
    path == PERSONA_TX_ROUTE
        || path == RECEIPTS_ROUTE
        || path == PERSONA_SIGNER_ROUTE
        || path == ENDPOINTS_ROUTE
        || path == HEALTH_ROUTE
        || path == EVENTS_ROUTE
        || path.starts_with(GAME_TX_PREFIX)
        || path.starts_with(GAME_QUERY_PREFIX)
}

fn submit_tx(
    handle: &ShardHandle,
    message_name: &str,
    body: &[u8],
    expect_system: bool,
) -> (u16, JsonValue) {
    let tx: SignedTransaction = match serde_json::from_slice(body) {
        Ok(tx) => tx,
        Err(err) => return (400, error_body(&format!("malformed json: {err}"))),
    };
    match handle.submit_transaction(message_name, tx, expect_system) {
        Ok((tx_hash, tick)) => (200, json!({ "txHash": tx_hash, "tick": tick })),
        Err(err) => {
            let status = match &err {
                SubmitError::Recovering => 500,
                SubmitError::UnknownMessage { .. } => 404,
                SubmitError::MalformedBody { .. } => 400,
                SubmitError::Verify(_) => 401,
            };
            log::debug!("transaction for {message_name} rejected: {err}");
            (status, error_body(&err.to_string()))
        }
    }
}

fn run_game_query(handle: &ShardHandle, name: &str, body: &[u8]) -> (u16, JsonValue) {
    let request: JsonValue = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => return (400, error_body(&format!("malformed json: {err}"))),
    };
    match handle.run_query(name, request) {
        Ok(reply) => (200, reply),
        Err(WorldError::QueryNotRegistered { name }) => {
            (404, error_body(&format!("query {name} is not registered")))
        }
        Err(err @ (WorldError::QueryFailed { .. } | WorldError::Serde(_))) => {
            (400, error_body(&err.to_string()))
        }
        Err(err) => internal_error(handle, &err.to_string()),
    }
}

fn internal_error(handle: &ShardHandle, detail: &str) -> (u16, JsonValue) {
    log::error!("internal server error: {detail}");
    if handle.config().debug {
        (500, error_body(detail))
    } else {
        (500, error_body("internal server error"))
    }
}

fn error_body(message: &str) -> JsonValue {
    json!({ "error": message })
}

fn serve_events(stream: TcpStream, handle: &ShardHandle) -> Result<(), WorldError> {
    let receiver = handle.subscribe_events();
    let mut websocket = tungstenite::accept(stream)
        .map_err(|err| WorldError::Io(format!("websocket handshake failed: {err}")))?;
    loop {
        match receiver.recv_timeout(Duration::from_millis(500)) {
            Ok(event) => {
                if websocket.send(Message::Text(event)).is_err() {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if websocket.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    let _ = websocket.close(None);
    Ok(())
}

fn write_json_response(
    stream: &mut TcpStream,
    status_code: u16,
    body: &[u8],
) -> Result<(), WorldError> {
    let status_text = match status_code {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        405 => "Method Not Allowed",
        422 => "Unprocessable Entity",
        _ => "Internal Server Error",
    };
    let headers = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(headers.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldConfig;
    use crate::world::World;

    fn http_request(
        addr: SocketAddr,
        method: &str,
        path: &str,
        body: &str,
    ) -> (u16, JsonValue) {
        let mut stream = TcpStream::connect(addr).expect("connect");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("read");
        let status: u16 = response
            .split(' ')
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status code");
        let payload = response
            .split("\r\n\r\n")
            .nth(1)
            .unwrap_or("")
            .to_string();
        let value = if payload.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_str(&payload).expect("json body")
        };
        (status, value)
    }

    fn spawn_test_server() -> (ShardServer, SocketAddr) {
        let mut world =
            World::new(WorldConfig::default().with_namespace("server-test")).expect("world");
        world.load_game_state().expect("load");
        let handle = world.handle();
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = ShardServer::spawn_on(handle, listener).expect("spawn");
        (server, addr)
    }

    #[test]
    fn health_endpoint_reports_flags() {
        let (_server, addr) = spawn_test_server();
        let (status, body) = http_request(addr, "GET", "/health", "");
        assert_eq!(status, 200);
        assert_eq!(body["isServerRunning"], true);
        assert_eq!(body["isGameLoopRunning"], false);
    }

    #[test]
    fn unknown_route_is_404() {
        let (_server, addr) = spawn_test_server();
        let (status, _) = http_request(addr, "GET", "/nope", "");
        assert_eq!(status, 404);
    }

    #[test]
    fn malformed_json_is_400() {
        let (_server, addr) = spawn_test_server();
        let (status, _) = http_request(addr, "POST", "/query/receipts/list", "{not json");
        assert_eq!(status, 400);
    }

    #[test]
    fn wrong_method_is_405() {
        let (_server, addr) = spawn_test_server();
        let (status, _) = http_request(addr, "GET", "/query/receipts/list", "");
        assert_eq!(status, 405);
    }

    #[test]
    fn debug_state_requires_debug_mode() {
        let (_server, addr) = spawn_test_server();
        let (status, _) = http_request(addr, "GET", "/debug/state", "");
        assert_eq!(status, 404);
    }

    #[test]
    fn cql_parse_failure_is_422() {
        let (_server, addr) = spawn_test_server();
        let (status, _) = http_request(
            addr,
            "POST",
            "/query/game/cql",
            "{\"CQL\": \"CONTAINS(\"}",
        );
        assert_eq!(status, 422);
    }

    #[test]
    fn endpoints_listing_includes_builtins() {
        let (_server, addr) = spawn_test_server();
        let (status, body) = http_request(addr, "POST", "/query/http/endpoints", "{}");
        assert_eq!(status, 200);
        let tx_endpoints: Vec<String> =
            serde_json::from_value(body["txEndpoints"].clone()).expect("txEndpoints");
        assert!(tx_endpoints.contains(&"/tx/persona/create-persona".to_string()));
        assert!(tx_endpoints.contains(&"/tx/game/authorize-persona-address".to_string()));
        let query_endpoints: Vec<String> =
            serde_json::from_value(body["queryEndpoints"].clone()).expect("queryEndpoints");
        assert!(query_endpoints.contains(&"/query/game/cql".to_string()));
    }
}
