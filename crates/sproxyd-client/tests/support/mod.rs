//! Test servers: an in-memory ring endpoint that implements the object API,
//! and a set of deliberately misbehaving listeners for failover tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

/// One stored object: payload plus optional user metadata.
pub struct StoredObject {
    pub data: Vec<u8>,
    pub usermd: Option<String>,
}

/// A request as the endpoint saw it.
#[derive(Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }
}

/// Shared state of the in-memory ring endpoint.
#[derive(Clone, Default)]
pub struct RingState {
    pub objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    pub requests: Arc<Mutex<Vec<RecordedRequest>>>,
    pub accepted: Arc<AtomicUsize>,
    /// Keys answered with 423 on DELETE.
    pub locked_keys: Arc<Mutex<HashSet<String>>>,
    /// When set, every object request is answered with this status.
    pub force_status: Arc<Mutex<Option<u16>>>,
    /// When set, every batch delete request is answered with this status.
    pub batch_status: Arc<Mutex<Option<u16>>>,
    pub batch_current: Arc<AtomicUsize>,
    pub batch_max: Arc<AtomicUsize>,
    pub batch_sizes: Arc<Mutex<Vec<usize>>>,
}

impl RingState {
    pub fn insert(&self, key: &str, data: Vec<u8>, usermd: Option<String>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), StoredObject { data, usermd });
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// In-memory ring endpoint speaking the object API over HTTP/1.1.
pub struct RingServer {
    pub addr: String,
    pub state: RingState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl RingServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = RingState::default();
        let server_state = state.clone();

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                server_state.accepted.fetch_add(1, Ordering::SeqCst);
                                let io = TokioIo::new(stream);
                                let state = server_state.clone();

                                tokio::spawn(async move {
                                    let service = service_fn(move |req| {
                                        let state = state.clone();
                                        async move { handle(state, req).await }
                                    });

                                    if let Err(err) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        eprintln!("Ring server error: {}", err);
                                    }
                                });
                            }
                            Err(err) => {
                                eprintln!("Accept error: {}", err);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

impl Drop for RingServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle(
    state: RingState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
        }
    }
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        headers: headers.clone(),
    });

    let key = path.rsplit('/').next().unwrap_or("").to_string();

    if method == Method::POST && key == ".batch_delete" {
        let current = state.batch_current.fetch_add(1, Ordering::SeqCst) + 1;
        state.batch_max.fetch_max(current, Ordering::SeqCst);
        // keep the request in flight long enough for overlap to be visible
        tokio::time::sleep(Duration::from_millis(30)).await;
        let body = req.into_body().collect().await?.to_bytes();
        state.batch_current.fetch_sub(1, Ordering::SeqCst);

        if let Some(status) = *state.batch_status.lock().unwrap() {
            return Ok(status_response(StatusCode::from_u16(status).unwrap()));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let keys = parsed["keys"].as_array().unwrap();
        state.batch_sizes.lock().unwrap().push(keys.len());
        let mut objects = state.objects.lock().unwrap();
        for key in keys {
            objects.remove(key.as_str().unwrap());
        }
        return Ok(status_response(StatusCode::OK));
    }

    if method == Method::GET && key == ".conf" {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from_static(b"{\"ring\":\"OK\"}")))
            .unwrap());
    }

    if let Some(status) = *state.force_status.lock().unwrap() {
        return Ok(status_response(StatusCode::from_u16(status).unwrap()));
    }

    match method {
        Method::PUT => {
            let usermd = headers.get("x-scal-usermd").cloned();
            let body = req.into_body().collect().await?.to_bytes();
            state.objects.lock().unwrap().insert(
                key,
                StoredObject {
                    data: body.to_vec(),
                    usermd,
                },
            );
            Ok(status_response(StatusCode::OK))
        }
        Method::GET => {
            let range = headers.get("range").and_then(|value| parse_range(value));
            let objects = state.objects.lock().unwrap();
            match objects.get(&key) {
                Some(object) => match range {
                    Some((start, end)) => {
                        let end = end.min(object.data.len().saturating_sub(1));
                        let slice = object.data[start..=end].to_vec();
                        Ok(Response::builder()
                            .status(StatusCode::PARTIAL_CONTENT)
                            .body(Full::new(Bytes::from(slice)))
                            .unwrap())
                    }
                    None => Ok(Response::builder()
                        .status(StatusCode::OK)
                        .body(Full::new(Bytes::from(object.data.clone())))
                        .unwrap()),
                },
                None => Ok(status_response(StatusCode::NOT_FOUND)),
            }
        }
        Method::HEAD => {
            let objects = state.objects.lock().unwrap();
            match objects.get(&key) {
                Some(object) => {
                    let mut builder = Response::builder().status(StatusCode::OK);
                    if let Some(usermd) = &object.usermd {
                        builder = builder.header("x-scal-usermd", usermd);
                    }
                    Ok(builder.body(Full::new(Bytes::new())).unwrap())
                }
                None => Ok(status_response(StatusCode::NOT_FOUND)),
            }
        }
        Method::DELETE => {
            if state.locked_keys.lock().unwrap().contains(&key) {
                return Ok(status_response(StatusCode::LOCKED));
            }
            match state.objects.lock().unwrap().remove(&key) {
                Some(_) => Ok(status_response(StatusCode::OK)),
                None => Ok(status_response(StatusCode::NOT_FOUND)),
            }
        }
        _ => Ok(status_response(StatusCode::BAD_REQUEST)),
    }
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// A listener that never produces a usable response; `behavior` decides how
/// it mistreats each accepted connection.
pub struct MisbehavingServer {
    pub addr: String,
    pub accepted: Arc<AtomicUsize>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

enum Misbehavior {
    /// Reset the connection immediately after accepting it.
    ResetOnAccept,
    /// Read roughly this many bytes, then reset.
    ResetAfterReading(usize),
    /// Read forever and never answer.
    Stall,
}

impl MisbehavingServer {
    pub async fn reset_on_accept() -> Self {
        Self::start(Misbehavior::ResetOnAccept).await
    }

    pub async fn reset_after_reading(bytes: usize) -> Self {
        Self::start(Misbehavior::ResetAfterReading(bytes)).await
    }

    pub async fn stall() -> Self {
        Self::start(Misbehavior::Stall).await
    }

    async fn start(behavior: Misbehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_counter = Arc::clone(&accepted);
        let behavior = Arc::new(behavior);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((mut stream, _)) = result else { continue };
                        accepted_counter.fetch_add(1, Ordering::SeqCst);
                        let behavior = Arc::clone(&behavior);

                        tokio::spawn(async move {
                            // linger zero turns the close into a reset
                            let _ = stream.set_linger(Some(Duration::from_secs(0)));
                            match *behavior {
                                Misbehavior::ResetOnAccept => drop(stream),
                                Misbehavior::ResetAfterReading(limit) => {
                                    let mut total = 0;
                                    let mut buf = vec![0u8; 16 * 1024];
                                    while total < limit {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => total += n,
                                        }
                                    }
                                    drop(stream);
                                }
                                Misbehavior::Stall => {
                                    let mut buf = vec![0u8; 16 * 1024];
                                    while let Ok(n) = stream.read(&mut buf).await {
                                        if n == 0 {
                                            break;
                                        }
                                    }
                                }
                            }
                        });
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            accepted,
            shutdown_tx: Some(shutdown_tx),
        }
    }
}

impl Drop for MisbehavingServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// An address nothing listens on: connections to it are refused.
pub async fn refused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}
