//! The runtime's remote driver protocol over a unix socket.
//!
//! Every call is an HTTP `POST /<Method>` carrying a JSON body; replies are
//! JSON with the plugin content type, errors as `{"Err": "<message>"}`.

use std::{path::Path, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use log::{debug, error, info};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::{
    net::UnixListener,
    signal::unix::{signal, SignalKind},
    task,
};

use crate::{
    api::*,
    driver::Driver,
    error::{DriverError, DriverResult, ErrorKind},
};

pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Activate,
    GetCapabilities,
    CreateNetwork(CreateNetworkRequest),
    DeleteNetwork(DeleteNetworkRequest),
    AllocateNetwork(AllocateNetworkRequest),
    FreeNetwork(FreeNetworkRequest),
    CreateEndpoint(CreateEndpointRequest),
    DeleteEndpoint(DeleteEndpointRequest),
    EndpointInfo(InfoRequest),
    Join(JoinRequest),
    Leave(LeaveRequest),
    DiscoverNew(DiscoveryNotification),
    DiscoverDelete(DiscoveryNotification),
    ProgramExternalConnectivity(ProgramExternalConnectivityRequest),
    RevokeExternalConnectivity(RevokeExternalConnectivityRequest),
}

impl Request {
    /// Builds a request from the called method and its raw JSON body.
    pub fn decode(method: &str, body: &[u8]) -> DriverResult<Self> {
        let params = params(body)?;

        let request = match method {
            "Plugin.Activate" => Request::Activate,
            "NetworkDriver.GetCapabilities" => Request::GetCapabilities,
            "NetworkDriver.CreateNetwork" => Request::CreateNetwork(from_params(params)?),
            "NetworkDriver.DeleteNetwork" => Request::DeleteNetwork(from_params(params)?),
            "NetworkDriver.AllocateNetwork" => Request::AllocateNetwork(from_params(params)?),
            "NetworkDriver.FreeNetwork" => Request::FreeNetwork(from_params(params)?),
            "NetworkDriver.CreateEndpoint" => Request::CreateEndpoint(from_params(params)?),
            "NetworkDriver.DeleteEndpoint" => Request::DeleteEndpoint(from_params(params)?),
            "NetworkDriver.EndpointOperInfo" => Request::EndpointInfo(from_params(params)?),
            "NetworkDriver.Join" => Request::Join(from_params(params)?),
            "NetworkDriver.Leave" => Request::Leave(from_params(params)?),
            "NetworkDriver.DiscoverNew" => Request::DiscoverNew(from_params(params)?),
            "NetworkDriver.DiscoverDelete" => Request::DiscoverDelete(from_params(params)?),
            "NetworkDriver.ProgramExternalConnectivity" => {
                Request::ProgramExternalConnectivity(from_params(params)?)
            }
            "NetworkDriver.RevokeExternalConnectivity" => {
                Request::RevokeExternalConnectivity(from_params(params)?)
            }
            _ => {
                return Err(DriverError::not_found(&format!(
                    "Unknown method {method}."
                )))
            }
        };

        Ok(request)
    }
}

/// An empty or `null` body stands for "no parameters".
fn params(body: &[u8]) -> DriverResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }

    match serde_json::from_slice(body) {
        Ok(Value::Null) => Ok(json!({})),
        Ok(value) => Ok(value),
        Err(e) => Err(DriverError::invalid_argument(&format!(
            "Malformed request: {e}"
        ))),
    }
}

fn from_params<T: DeserializeOwned>(params: Value) -> DriverResult<T> {
    serde_json::from_value(params)
        .map_err(|e| DriverError::invalid_argument(&format!("Malformed request: {e}")))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok(Value),
    Err { kind: ErrorKind, message: String },
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ActivateResponse {
    implements: Vec<&'static str>,
}

impl From<DriverError> for Reply {
    fn from(e: DriverError) -> Self {
        Reply::Err {
            kind: e.kind(),
            message: e.report(),
        }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Reply::Ok(value) => (StatusCode::OK, value),
            Reply::Err { kind, message } => (
                StatusCode::from_u16(kind.status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                json!({ "Err": message }),
            ),
        };

        (
            status,
            [(header::CONTENT_TYPE, PLUGIN_CONTENT_TYPE)],
            body.to_string(),
        )
            .into_response()
    }
}

fn reply<T: Serialize>(result: DriverResult<T>) -> Reply {
    let value = match result {
        Ok(value) => value,
        Err(e) => {
            error!("Request failed: {}", e.report());
            return e.into();
        }
    };

    match serde_json::to_value(&value) {
        // The runtime expects an empty object for "no payload".
        Ok(Value::Null) => Reply::Ok(json!({})),
        Ok(value) => Reply::Ok(value),
        Err(e) => Reply::Err {
            kind: ErrorKind::Retryable,
            message: format!("Failed to encode reply: {e}"),
        },
    }
}

/// Runs one request against the driver. Blocks for as long as the driver does.
pub fn dispatch(driver: &Driver, request: Request) -> Reply {
    match request {
        Request::Activate => reply(Ok(ActivateResponse {
            implements: vec!["NetworkDriver"],
        })),
        Request::GetCapabilities => reply(Ok(driver.capabilities())),
        Request::CreateNetwork(req) => reply(driver.create_network(&req)),
        Request::DeleteNetwork(req) => reply(driver.delete_network(&req)),
        Request::AllocateNetwork(req) => reply(driver.allocate_network(&req)),
        Request::FreeNetwork(req) => reply(driver.free_network(&req)),
        Request::CreateEndpoint(req) => reply(driver.create_endpoint(&req)),
        Request::DeleteEndpoint(req) => reply(driver.delete_endpoint(&req)),
        Request::EndpointInfo(req) => reply(driver.endpoint_info(&req)),
        Request::Join(req) => reply(driver.join(&req)),
        Request::Leave(req) => reply(driver.leave(&req)),
        Request::DiscoverNew(req) => reply(driver.discover_new(&req)),
        Request::DiscoverDelete(req) => reply(driver.discover_delete(&req)),
        Request::ProgramExternalConnectivity(req) => {
            reply(driver.program_external_connectivity(&req))
        }
        Request::RevokeExternalConnectivity(req) => {
            reply(driver.revoke_external_connectivity(&req))
        }
    }
}

async fn handler(
    State(driver): State<Arc<Driver>>,
    UrlPath(method): UrlPath<String>,
    body: Bytes,
) -> Reply {
    debug!("Plugin call {method}");

    let request = match Request::decode(&method, &body) {
        Ok(request) => request,
        Err(e) => {
            error!("Rejected {method}: {}", e.report());
            return e.into();
        }
    };

    match task::spawn_blocking(move || dispatch(&driver, request)).await {
        Ok(reply) => reply,
        Err(e) => Reply::Err {
            kind: ErrorKind::Retryable,
            message: format!("Request handler failed: {e}"),
        },
    }
}

pub fn router(driver: Arc<Driver>) -> Router {
    Router::new()
        .route("/{method}", post(handler))
        .with_state(driver)
}

/// Binds `path`, replacing a socket file left behind by an earlier run.
pub fn bind(path: &Path) -> tokio::io::Result<UnixListener> {
    if let Some(parent_dir) = path.parent() {
        std::fs::create_dir_all(parent_dir)?;
    }

    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }

    UnixListener::bind(path)
}

/// Serves the plugin API until the listener fails.
pub async fn serve(listener: UnixListener, driver: Arc<Driver>) -> tokio::io::Result<()> {
    axum::serve(listener, router(driver)).await
}

async fn shutdown_signal() {
    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {e}");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
}

/// Serves on `socket` until SIGINT or SIGTERM, then removes the socket file.
pub async fn run_daemon(socket: &Path, driver: Arc<Driver>) -> tokio::io::Result<()> {
    let listener = bind(socket)?;
    info!("Listening on {}", socket.display());

    let result = axum::serve(listener, router(driver))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = std::fs::remove_file(socket);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::{MockLinkManager, MockSwitchClient},
        store::MockStore,
    };
    use axum::body::Body;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tower::ServiceExt;

    fn driver() -> Arc<Driver> {
        let mut store = MockStore::new();
        store.expect_load().returning(|| Ok(None));
        store.expect_save().returning(|_| Ok(()));

        Arc::new(Driver::new(
            Arc::new(store),
            Arc::new(MockLinkManager::new()),
            Arc::new(MockSwitchClient::new()),
            false,
        ))
    }

    async fn call(router: Router, method: &str, body: &str) -> (StatusCode, Value) {
        let request = axum::http::Request::post(format!("/{method}"))
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PLUGIN_CONTENT_TYPE
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[rstest]
    #[case("")]
    #[case("null")]
    #[case("{}")]
    fn test_decode_parameterless(#[case] body: &str) {
        assert_eq!(
            Request::decode("Plugin.Activate", body.as_bytes()).unwrap(),
            Request::Activate
        );
        assert_eq!(
            Request::decode("NetworkDriver.GetCapabilities", body.as_bytes()).unwrap(),
            Request::GetCapabilities
        );
    }

    #[test]
    fn test_decode_params() {
        let req = Request::decode(
            "NetworkDriver.Leave",
            br#"{"NetworkID":"n1","EndpointID":"e1"}"#,
        )
        .unwrap();

        assert_eq!(
            req,
            Request::Leave(LeaveRequest {
                network_id: "n1".to_string(),
                endpoint_id: "e1".to_string(),
            })
        );
    }

    #[rstest]
    #[case("NetworkDriver.Nope", "{}", ErrorKind::NotFound)]
    #[case("NetworkDriver.Leave", "not json", ErrorKind::InvalidArgument)]
    #[case("NetworkDriver.Leave", r#"{"NetworkID": 7}"#, ErrorKind::InvalidArgument)]
    fn test_decode_rejects(#[case] method: &str, #[case] body: &str, #[case] kind: ErrorKind) {
        let err = Request::decode(method, body.as_bytes()).unwrap_err();

        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn test_unit_result_is_empty_object() {
        assert_eq!(reply(Ok(())), Reply::Ok(json!({})));
    }

    #[tokio::test]
    async fn test_activate_route() {
        let (status, body) = call(router(driver()), "Plugin.Activate", "").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "Implements": ["NetworkDriver"] }));
    }

    #[tokio::test]
    async fn test_error_body() {
        let router = router(driver());

        let (status, body) = call(
            router.clone(),
            "NetworkDriver.DeleteNetwork",
            r#"{"NetworkID":"missing"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "Err": "Not found: Network not found." }));

        let (status, body) = call(router, "NetworkDriver.FreeNetwork", "{}").await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert!(body["Err"].as_str().unwrap().contains("FreeNetwork"));
    }

    #[tokio::test]
    async fn test_get_is_not_routed() {
        let request = axum::http::Request::get("/Plugin.Activate")
            .body(Body::empty())
            .unwrap();

        let response = router(driver()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
