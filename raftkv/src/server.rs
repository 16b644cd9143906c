//! HTTP listeners: the client API, the raft peer endpoint and the metrics endpoint.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};
use protobuf::Message as PbMessage;
use raft::prelude::Message;
use serde::de::{self, Deserializer};
use serde_derive::{Deserialize, Serialize};

use crate::command::{Operation, Value};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::fsm::ApplyResult;
use crate::gatekeeper::Gatekeeper;
use crate::metrics;
use crate::raft::transport::MESSAGE_PATH;
use crate::raft::RaftHandle;
use crate::reader::Reader;

#[derive(Deserialize)]
struct StoreRequest {
    key: String,
    #[serde(default)]
    value: Value,
}

#[derive(Deserialize)]
struct JoinRequest {
    #[serde(deserialize_with = "node_id")]
    node_id: u64,
    raft_address: String,
}

#[derive(Deserialize)]
struct RemoveRequest {
    #[serde(deserialize_with = "node_id")]
    node_id: u64,
}

#[derive(Serialize)]
struct KeyValue<'a> {
    key: &'a str,
    value: Value,
}

#[derive(Serialize)]
struct Success<'a, T> {
    message: &'a str,
    data: T,
}

#[derive(Serialize)]
struct Failure {
    error: String,
}

/// Node ids are accepted as numbers or as numeric strings.
fn node_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NodeId {
        Number(u64),
        Text(String),
    }
    match <NodeId as serde::Deserialize>::deserialize(deserializer)? {
        NodeId::Number(id) => Ok(id),
        NodeId::Text(text) => text.trim().parse().map_err(de::Error::custom),
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let (status, body) = match serde_json::to_vec(body) {
        Ok(body) => (status, body),
        Err(e) => {
            log::error!("Failed to encode response body: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    };
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn success<T: serde::Serialize>(message: &str, data: T) -> Response<Body> {
    json_response(StatusCode::OK, &Success { message, data })
}

fn failure(err: &Error) -> Response<Body> {
    json_response(
        err.status_code(),
        &Failure {
            error: err.to_string(),
        },
    )
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Body>) -> Result<T> {
    let body = hyper::body::to_bytes(req.into_body()).await?;
    Ok(serde_json::from_slice(&body)?)
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse().map_err(|e: std::net::AddrParseError| Error::ListenAddr {
        addr: addr.to_string(),
        reason: e.to_string(),
    })
}

/// Percent-decodes a key taken from the request path.
fn path_key(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|key| key.into_owned())
        .map_err(|e| Error::Validation(format!("key is not valid UTF-8: {}", e)))
}

/// Shared state of the client API.
struct Api {
    gatekeeper: Gatekeeper,
    reader: Reader,
}

impl Api {
    async fn route(self: Arc<Self>, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path().trim_end_matches('/').to_string();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let consistent = req
            .uri()
            .query()
            .map_or(false, |query| query.split('&').any(|pair| pair == "consistent=true"));

        let result = match (req.method().clone(), segments.as_slice()) {
            (Method::POST, ["store"]) => {
                metrics::record_metrics("store_set", || self.store(req)).await
            }
            (Method::GET, ["store", key]) => {
                let key = key.to_string();
                metrics::record_metrics("store_get", || self.get(key, consistent)).await
            }
            (Method::DELETE, ["store", key]) => {
                let key = key.to_string();
                metrics::record_metrics("store_delete", || self.delete(key)).await
            }
            (Method::POST, ["raft", "join"]) => {
                metrics::record_metrics("raft_join", || self.join(req)).await
            }
            (Method::POST, ["raft", "remove"]) => {
                metrics::record_metrics("raft_remove", || self.remove(req)).await
            }
            (Method::GET, ["raft", "stats"]) => {
                metrics::record_metrics("raft_stats", || self.stats()).await
            }
            _ => {
                return json_response(
                    StatusCode::NOT_FOUND,
                    &Failure {
                        error: "not found".to_string(),
                    },
                )
            }
        };

        result.unwrap_or_else(|e| {
            log::debug!("Request {} failed: {}", path, e);
            failure(&e)
        })
    }

    async fn store(&self, req: Request<Body>) -> Result<Response<Body>> {
        let form: StoreRequest = read_json(req).await?;
        let key = form.key.trim().to_string();
        let result = self
            .gatekeeper
            .submit(Operation::Set, &key, form.value)
            .await?;
        let value = result.into_result()?;
        Ok(success(
            "success persisting data",
            KeyValue { key: &key, value },
        ))
    }

    async fn get(&self, key: String, consistent: bool) -> Result<Response<Body>> {
        let key = path_key(&key)?;
        let key = key.trim();
        let value = if consistent {
            self.gatekeeper
                .submit(Operation::Get, key, Value::null())
                .await?
                .into_result()?
        } else {
            self.reader.read(key)?
        };
        Ok(success("success fetching data", KeyValue { key, value }))
    }

    async fn delete(&self, key: String) -> Result<Response<Body>> {
        let key = path_key(&key)?;
        let key = key.trim();
        let result: ApplyResult = self
            .gatekeeper
            .submit(Operation::Delete, key, Value::null())
            .await?;
        let value = result.into_result()?;
        Ok(success("success removing data", KeyValue { key, value }))
    }

    async fn join(&self, req: Request<Body>) -> Result<Response<Body>> {
        let form: JoinRequest = read_json(req).await?;
        self.gatekeeper
            .add_voter(form.node_id, form.raft_address.clone())
            .await?;
        let message = format!(
            "node {} at {} joined successfully",
            form.node_id, form.raft_address
        );
        Ok(success(&message, self.gatekeeper.stats()))
    }

    async fn remove(&self, req: Request<Body>) -> Result<Response<Body>> {
        let form: RemoveRequest = read_json(req).await?;
        self.gatekeeper.remove_server(form.node_id).await?;
        let message = format!("node {} removed successfully", form.node_id);
        Ok(success(&message, self.gatekeeper.stats()))
    }

    async fn stats(&self) -> Result<Response<Body>> {
        let stats: BTreeMap<String, String> = self.gatekeeper.stats();
        Ok(success("Here is the raft status", stats))
    }
}

/// Accepts raft messages posted by the peers' transports.
async fn receive_raft_message(
    raft: RaftHandle<ApplyResult>,
    req: Request<Body>,
) -> Response<Body> {
    if req.method() != Method::POST || req.uri().path() != MESSAGE_PATH {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NOT_FOUND;
        return response;
    }
    let outcome = async {
        let body = hyper::body::to_bytes(req.into_body()).await?;
        let message = Message::parse_from_bytes(&body)?;
        raft.step(message).await
    };
    let mut response = Response::new(Body::empty());
    match outcome.await {
        Ok(()) => *response.status_mut() = StatusCode::NO_CONTENT,
        Err(e) => {
            log::warn!("raft message rejected: {}", e);
            *response.status_mut() = match e {
                Error::Protobuf(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
        }
    }
    response
}

pub struct Server {
    config: ServerConfig,
    raft_addr: String,
    raft: RaftHandle<ApplyResult>,
    api: Arc<Api>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        raft_addr: String,
        raft: RaftHandle<ApplyResult>,
        gatekeeper: Gatekeeper,
        reader: Reader,
    ) -> Self {
        Server {
            config,
            raft_addr,
            raft,
            api: Arc::new(Api { gatekeeper, reader }),
        }
    }

    /// Binds every listener and serves them in the background.
    pub fn start(&self) -> Result<()> {
        self.start_peer_server()?;
        self.start_api_server()?;
        self.start_metrics_server()?;
        Ok(())
    }

    fn start_api_server(&self) -> Result<()> {
        let addr = parse_addr(&self.config.addr)?;
        let api = self.api.clone();
        let make_svc = make_service_fn(move |_| {
            let api = api.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let api = api.clone();
                    async move { Ok::<_, Infallible>(api.route(req).await) }
                }))
            }
        });
        let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("api server stopped: {}", e);
            }
        });
        log::info!("api server started on {}", addr);
        Ok(())
    }

    fn start_peer_server(&self) -> Result<()> {
        let addr = parse_addr(&self.raft_addr)?;
        let raft = self.raft.clone();
        let make_svc = make_service_fn(move |_| {
            let raft = raft.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let raft = raft.clone();
                    async move { Ok::<_, Infallible>(receive_raft_message(raft, req).await) }
                }))
            }
        });
        let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("raft peer server stopped: {}", e);
            }
        });
        log::info!("raft peer server started on {}", addr);
        Ok(())
    }

    fn start_metrics_server(&self) -> Result<()> {
        let addr = parse_addr(&self.config.metrics_addr)?;
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        let mut response = match encoder.encode(&metric_families, &mut buffer) {
                            Ok(()) => Response::new(Body::from(buffer)),
                            Err(e) => {
                                let mut response = Response::new(Body::from(e.to_string()));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        };
                        if let Ok(content_type) = HeaderValue::from_str(encoder.format_type()) {
                            response.headers_mut().insert(CONTENT_TYPE, content_type);
                        }
                        Ok::<_, hyper::Error>(response)
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::try_bind(&addr)?.serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server stopped: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
        Ok(())
    }
}
