use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn, Instrument};

use crate::rpc::rpc_value::{RpcRequest, RpcResponse};
use crate::util::cancellation::{await_termination, CancellationSource, CancellationToken, Cancelled};

/// Dispatches incoming calls. Implementations never fail: every problem is reported as a
///  response with a non-success status code.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle_call(&self, request: RpcRequest) -> RpcResponse;
}

/// A listening XML-RPC server. Each accepted HTTP connection gets its own task, serving any
///  number of sequential calls until the peer closes it or the server is stopped.
///
/// Stopping the server cancels calls that are still being handled, and waits for their
///  connections to wind down.
pub struct RpcServer {
    local_addr: SocketAddr,
    cancel: CancellationSource,
    task: Mutex<Option<JoinHandle<()>>>,
    dispose_timeout: Duration,
}

impl RpcServer {
    pub async fn start(bind_addr: &str, handler: Arc<dyn RpcHandler>, max_body_len: usize, dispose_timeout: Duration) -> anyhow::Result<RpcServer> {
        let listener = TcpListener::bind(bind_addr).await?;
        Self::start_with_listener(listener, handler, max_body_len, dispose_timeout)
    }

    /// For callers that need to know the server's port before they can create the handler
    pub fn start_with_listener(listener: TcpListener, handler: Arc<dyn RpcHandler>, max_body_len: usize, dispose_timeout: Duration) -> anyhow::Result<RpcServer> {
        let local_addr = listener.local_addr()?;
        info!("RPC server listening on {:?}", local_addr);

        let cancel = CancellationSource::new();
        let token = cancel.token();
        let task = tokio::spawn(
            accept_loop(listener, handler, token, max_body_len)
                .instrument(tracing::info_span!("rpc_server", addr = %local_addr))
        );

        Ok(RpcServer {
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
            dispose_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock()
            .expect("lock poisoned")
            .take();
        if let Some(task) = task {
            await_termination(task, self.dispose_timeout, "RPC server").await;
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn RpcHandler>, token: CancellationToken, max_body_len: usize) {
    let mut connections = JoinSet::new();
    loop {
        select! {
            biased;
            _ = token.cancelled() => {
                debug!("accept loop cancelled");
                break;
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    trace!("accepted RPC connection from {:?}", addr);
                    connections.spawn(
                        serve_connection(stream, handler.clone(), token.clone(), max_body_len)
                            .instrument(tracing::debug_span!("rpc_connection", peer = %addr))
                    );
                }
                Err(e) => {
                    warn!("error accepting RPC connection: {}", e);
                }
            }
        }
    }

    // the connections observe the same token
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(stream: TcpStream, handler: Arc<dyn RpcHandler>, token: CancellationToken, max_body_len: usize) {
    let call_token = token.clone();
    let service = service_fn(move |request| {
        let handler = handler.clone();
        let token = call_token.clone();
        async move {
            Ok::<_, Infallible>(handle_request(request, handler, token, max_body_len).await)
        }
    });

    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service);
    match token.guard(connection).await {
        Ok(Ok(())) => trace!("RPC connection closed"),
        Ok(Err(e)) => debug!("RPC connection broke with an error: {}", e),
        Err(Cancelled) => trace!("RPC connection cancelled"),
    }
}

async fn handle_request(request: Request<Incoming>, handler: Arc<dyn RpcHandler>, token: CancellationToken, max_body_len: usize) -> Response<Full<Bytes>> {
    if request.method() != Method::POST {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        return response;
    }

    let rpc_response = match read_call(request, max_body_len).await {
        Ok(call) => {
            trace!("handling call '{}'", call.method);
            match token.guard(handler.handle_call(call)).await {
                Ok(rpc_response) => rpc_response,
                Err(Cancelled) => RpcResponse::error("server is shutting down"),
            }
        }
        Err(e) => {
            debug!("malformed RPC request: {}", e);
            RpcResponse::error(format!("malformed request: {}", e))
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(rpc_response.to_xml())));
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/xml"));
    response
}

async fn read_call(request: Request<Incoming>, max_body_len: usize) -> anyhow::Result<RpcRequest> {
    let body = Limited::new(request.into_body(), max_body_len)
        .collect()
        .await
        .map_err(|e| anyhow!("reading the request body failed: {}", e))?
        .to_bytes();
    RpcRequest::from_xml(std::str::from_utf8(&body)?)
}
