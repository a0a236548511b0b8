//! gRPC ingress. Services are not generated from protos: the config
//! names them (`grpc:<service>` entries) and every method is a unary
//! byte-in/byte-out call, so the surface is a single dynamic service
//! that resolves `/{service}/{method}` against the function config and
//! passes request messages through untouched.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use futures::future::BoxFuture;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::server::{Grpc, UnaryService};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::gateway::Gateway;

/// Pass-through codec: request and response messages are opaque bytes.
#[derive(Default)]
struct RawCodec;

struct RawEncoder;

struct RawDecoder;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawEncoder;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        RawEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

impl Encoder for RawEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

struct InvokeUnary {
    gateway: Arc<Gateway>,
    func_id: u16,
    method_id: u16,
}

impl UnaryService<Bytes> for InvokeUnary {
    type Response = Bytes;
    type Future = BoxFuture<'static, Result<Response<Bytes>, Status>>;

    fn call(&mut self, request: Request<Bytes>) -> Self::Future {
        let gateway = self.gateway.clone();
        let func_id = self.func_id;
        let method_id = self.method_id;
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            gateway.on_external_grpc(func_id, method_id, request.into_inner(), tx);
            match rx.await {
                Ok(Ok(output)) => Ok(Response::new(output)),
                Ok(Err(status)) => Err(status),
                Err(_) => Err(Status::internal("call context dropped")),
            }
        })
    }
}

/// Answers with a fixed status; used for calls that never enter the
/// admission core.
struct Reject(Status);

impl UnaryService<Bytes> for Reject {
    type Response = Bytes;
    type Future = std::future::Ready<Result<Response<Bytes>, Status>>;

    fn call(&mut self, _request: Request<Bytes>) -> Self::Future {
        std::future::ready(Err(self.0.clone()))
    }
}

fn resolve(gateway: &Gateway, path: &str) -> Result<(u16, u16), Status> {
    let mut parts = path.trim_start_matches('/').splitn(2, '/');
    let (Some(service), Some(method)) = (parts.next(), parts.next()) else {
        return Err(Status::not_found(format!("malformed method path {path}")));
    };
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return Err(Status::not_found(format!("malformed method path {path}")));
    }
    gateway
        .func_config()
        .find_grpc(service, method)
        .ok_or_else(|| Status::not_found(format!("unknown grpc method /{service}/{method}")))
}

pub(crate) async fn handle_request<B>(
    gateway: Arc<Gateway>,
    request: http::Request<B>,
) -> http::Response<tonic::body::Body>
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    let mut grpc = Grpc::new(RawCodec);
    match resolve(&gateway, request.uri().path()) {
        Ok((func_id, method_id)) => {
            grpc.unary(
                InvokeUnary {
                    gateway,
                    func_id,
                    method_id,
                },
                request,
            )
            .await
        }
        Err(status) => grpc.unary(Reject(status), request).await,
    }
}

/// Accept loop for the optional gRPC port. Each connection is served
/// over HTTP/2 by its own task; shutdown stops accepting, existing
/// connections drain on their own.
pub async fn run_grpc_listener(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    mut shutdown: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("grpc listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "new grpc connection");
                    let gateway = gateway.clone();
                    tokio::spawn(async move {
                        let service = hyper::service::service_fn(move |request| {
                            let gateway = gateway.clone();
                            async move {
                                Ok::<_, Infallible>(handle_request(gateway, request).await)
                            }
                        });
                        let result = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                        if let Err(err) = result {
                            debug!(error = %err, "grpc connection ended with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to accept grpc connection"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::Full;

    use super::*;
    use crate::config::ServerConfig;
    use crate::func_config::FuncConfig;
    use crate::metrics::GatewayMetrics;
    use crate::worker_manager::WorkerManager;

    const CONFIG: &str = r#"[{"funcName": "grpc:svc", "funcId": 5, "grpcMethods": ["Foo"]}]"#;

    fn gateway() -> Arc<Gateway> {
        let server_config = ServerConfig {
            func_config_file: "funcs.json".to_string(),
            ..Default::default()
        };
        Arc::new(Gateway::new(
            FuncConfig::load(CONFIG).unwrap(),
            CONFIG.to_string(),
            &server_config,
            Arc::new(WorkerManager::new()),
            GatewayMetrics::new(),
        ))
    }

    fn grpc_request(path: &str) -> http::Request<Full<Bytes>> {
        // One unary message: compression flag + length prefix + payload.
        let payload = b"x";
        let mut framed = Vec::with_capacity(5 + payload.len());
        framed.push(0);
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        http::Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/grpc")
            .header("te", "trailers")
            .body(Full::new(Bytes::from(framed)))
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_method_never_enters_the_core() {
        let gateway = gateway();
        let response = handle_request(gateway.clone(), grpc_request("/svc/DoesNotExist")).await;
        // NOT_FOUND = 5, delivered as a trailers-only response.
        assert_eq!(
            response.headers().get("grpc-status").unwrap(),
            &http::HeaderValue::from_static("5")
        );
        assert_eq!(gateway.counters().snapshot().incoming, 0);
        assert_eq!(gateway.running_external_count(), 0);
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let gateway = gateway();
        let response = handle_request(gateway.clone(), grpc_request("/other/Foo")).await;
        assert_eq!(
            response.headers().get("grpc-status").unwrap(),
            &http::HeaderValue::from_static("5")
        );
        assert_eq!(gateway.counters().snapshot().incoming, 0);
    }

    #[tokio::test]
    async fn known_method_without_workers_is_unimplemented() {
        let gateway = gateway();
        let response = handle_request(gateway.clone(), grpc_request("/svc/Foo")).await;
        // UNIMPLEMENTED = 12: the call entered the core and failed
        // dispatch because no worker is connected.
        assert_eq!(
            response.headers().get("grpc-status").unwrap(),
            &http::HeaderValue::from_static("12")
        );
        assert_eq!(gateway.counters().snapshot().incoming, 1);
        assert_eq!(gateway.counters().snapshot().dispatch_failed, 1);
        assert_eq!(gateway.running_external_count(), 0);
    }
}
