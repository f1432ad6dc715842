//! In-process stand-in for Caddy's admin API
//!
//! Keeps a JSON config tree and implements the subset of the admin API the
//! reconciler talks to: path traversal under `/config`, `@id` lookups under
//! `/id/<id>`, PUT (insert, 409 on existing keys), PATCH (replace existing),
//! DELETE and `POST /stop`.

#![allow(dead_code)]

use devcaddy::config::Config;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde_json::{Map, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// One request as seen by the fake server
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
}

#[derive(Debug)]
struct Failure {
    method: String,
    path: String,
    status: u16,
}

#[derive(Debug, Default)]
struct State {
    config: Value,
    requests: Vec<Recorded>,
    failures: Vec<Failure>,
    stopped: bool,
}

pub struct FakeCaddy {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl FakeCaddy {
    pub async fn start() -> Self {
        Self::with_config(Value::Null).await
    }

    pub async fn with_config(config: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State {
            config,
            ..State::default()
        }));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    let _ = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn admin_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Snapshot of the whole config tree
    pub fn config(&self) -> Value {
        self.state.lock().unwrap().config.clone()
    }

    /// Object tagged with `@id`, if any
    pub fn object(&self, id: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        let path = find_id(&state.config, id)?;
        lookup(&state.config, &path).cloned()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Requests other than GET
    pub fn writes(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method != "GET")
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    /// Answer the next `method path` request with `status` instead of handling it
    pub fn fail_next(&self, method: &str, path: &str, status: u16) {
        self.state.lock().unwrap().failures.push(Failure {
            method: method.to_string(),
            path: path.to_string(),
            status,
        });
    }

    /// Global settings pointing at this server
    pub fn settings(&self) -> Config {
        let toml = format!(
            r#"
domain = "dev.example.com"
admin_url = "{}"
request_timeout_secs = 5

[provider]
name = "cloudflare"
api_token = "test-token"
"#,
            self.admin_url()
        );
        let config: Config = toml::from_str(&toml).unwrap();
        config.validate().unwrap();
        config
    }
}

impl Drop for FakeCaddy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(body.into()))
        .unwrap()
}

fn error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    respond(status, serde_json::json!({ "error": message }).to_string())
}

async fn handle(req: Request<Incoming>, state: Arc<Mutex<State>>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return error(StatusCode::BAD_REQUEST, "unreadable body"),
    };
    let body = if bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Some(value),
            Err(e) => return error(StatusCode::BAD_REQUEST, &e.to_string()),
        }
    };

    let mut state = state.lock().unwrap();
    state.requests.push(Recorded {
        method: method.to_string(),
        path: path.clone(),
        body: body.clone(),
    });

    if let Some(index) = state
        .failures
        .iter()
        .position(|f| f.method == method.as_str() && f.path == path)
    {
        let failure = state.failures.remove(index);
        let status = StatusCode::from_u16(failure.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return error(status, "injected failure");
    }

    if method == Method::POST && path == "/stop" {
        state.stopped = true;
        return respond(StatusCode::OK, "");
    }

    let segments = match resolve(&state.config, &path) {
        Ok(segments) => segments,
        Err(response) => return response,
    };

    match method {
        Method::GET => match lookup(&state.config, &segments) {
            Some(value) => respond(StatusCode::OK, value.to_string()),
            None if segments.is_empty() => respond(StatusCode::OK, "null"),
            None => error(StatusCode::NOT_FOUND, "invalid traversal path"),
        },
        Method::PUT => match body {
            Some(value) => put(&mut state.config, &segments, value),
            None => error(StatusCode::BAD_REQUEST, "missing body"),
        },
        Method::PATCH => match (body, lookup_mut(&mut state.config, &segments)) {
            (Some(value), Some(slot)) => {
                *slot = value;
                respond(StatusCode::OK, "")
            }
            (None, _) => error(StatusCode::BAD_REQUEST, "missing body"),
            (_, None) => error(StatusCode::NOT_FOUND, "invalid traversal path"),
        },
        Method::DELETE => delete(&mut state.config, &segments),
        _ => error(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    }
}

/// Translate a request path into segments below the config root
fn resolve(config: &Value, path: &str) -> Result<Vec<String>, Response<Full<Bytes>>> {
    let parts: Vec<String> = path
        .split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect();

    match parts.split_first() {
        Some((head, rest)) if head == "config" => Ok(rest.to_vec()),
        Some((head, rest)) if head == "id" => {
            let Some((id, rest)) = rest.split_first() else {
                return Err(error(StatusCode::BAD_REQUEST, "missing id"));
            };
            let Some(mut segments) = find_id(config, id) else {
                return Err(error(StatusCode::NOT_FOUND, &format!("unknown object ID '{}'", id)));
            };
            segments.extend(rest.iter().cloned());
            Ok(segments)
        }
        _ => Err(error(StatusCode::NOT_FOUND, "not found")),
    }
}

fn find_id(value: &Value, id: &str) -> Option<Vec<String>> {
    match value {
        Value::Object(map) => {
            if map.get("@id").and_then(Value::as_str) == Some(id) {
                return Some(Vec::new());
            }
            map.iter().find_map(|(key, child)| {
                find_id(child, id).map(|mut path| {
                    path.insert(0, key.clone());
                    path
                })
            })
        }
        Value::Array(items) => items.iter().enumerate().find_map(|(index, child)| {
            find_id(child, id).map(|mut path| {
                path.insert(0, index.to_string());
                path
            })
        }),
        _ => None,
    }
}

fn lookup<'a>(value: &'a Value, segments: &[String]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_mut<'a>(value: &'a mut Value, segments: &[String]) -> Option<&'a mut Value> {
    segments.iter().try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}

fn put(config: &mut Value, segments: &[String], value: Value) -> Response<Full<Bytes>> {
    let Some((last, parents)) = segments.split_last() else {
        *config = value;
        return respond(StatusCode::OK, "");
    };

    // Missing intermediate objects are created on the way down
    let mut current = config;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let node = current;
        current = match node {
            Value::Object(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return error(StatusCode::BAD_REQUEST, "invalid traversal path"),
            },
            _ => return error(StatusCode::BAD_REQUEST, "invalid traversal path"),
        };
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    match current {
        Value::Object(map) => {
            if map.contains_key(last) {
                return error(StatusCode::CONFLICT, &format!("key already exists: {}", last));
            }
            map.insert(last.clone(), value);
        }
        Value::Array(items) => match last.parse::<usize>() {
            Ok(index) if index <= items.len() => items.insert(index, value),
            _ => return error(StatusCode::BAD_REQUEST, "array index out of bounds"),
        },
        _ => return error(StatusCode::BAD_REQUEST, "invalid traversal path"),
    }

    respond(StatusCode::OK, "")
}

fn delete(config: &mut Value, segments: &[String]) -> Response<Full<Bytes>> {
    let Some((last, parents)) = segments.split_last() else {
        *config = Value::Null;
        return respond(StatusCode::OK, "");
    };

    let removed = match lookup_mut(config, parents) {
        Some(Value::Object(map)) => map.remove(last).is_some(),
        Some(Value::Array(items)) => match last.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    };

    if removed {
        respond(StatusCode::OK, "")
    } else {
        error(StatusCode::NOT_FOUND, "invalid traversal path")
    }
}
