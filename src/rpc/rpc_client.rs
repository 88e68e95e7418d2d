use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::trace;

use crate::rpc::rpc_value::{RpcRequest, RpcResponse, RpcValue};
use crate::topic::endpoint::Endpoint;

/// An XML-RPC client for a single remote server. Connections are not pooled, so every call
///  uses its own short-lived connection and concurrent calls are independent of each other.
#[derive(Clone)]
pub struct RpcClient {
    endpoint: Endpoint,
    uri: String,
    timeout: Duration,
    max_body_len: usize,
    http: Client<HttpConnector, Full<Bytes>>,
}

impl RpcClient {
    pub fn new(endpoint: Endpoint, timeout: Duration, max_body_len: usize) -> RpcClient {
        let uri = format!("http://{}/", endpoint.socket_addr_string());
        let http = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build_http();

        RpcClient {
            endpoint,
            uri,
            timeout,
            max_body_len,
            http,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Performs a call, bounded by the configured timeout as a whole (connect, send, receive).
    ///  A non-success status code is *not* an error at this level.
    pub async fn call(&self, method: &str, args: Vec<RpcValue>) -> anyhow::Result<RpcResponse> {
        let request = RpcRequest::new(method, args);
        match tokio::time::timeout(self.timeout, self.do_call(&request)).await {
            Ok(result) => result,
            Err(_) => bail!("RPC call '{}' to {} timed out after {:?}", method, self.endpoint, self.timeout),
        }
    }

    async fn do_call(&self, request: &RpcRequest) -> anyhow::Result<RpcResponse> {
        trace!("calling '{}' on {}", request.method, self.endpoint);

        let http_request = Request::builder()
            .method(Method::POST)
            .uri(&self.uri)
            .header(CONTENT_TYPE, "text/xml")
            .body(Full::new(Bytes::from(request.to_xml())))?;

        let response = self.http.request(http_request).await?;
        if response.status() != StatusCode::OK {
            bail!("RPC call '{}' to {} returned HTTP status {}", request.method, self.endpoint, response.status());
        }

        let body = Limited::new(response.into_body(), self.max_body_len)
            .collect()
            .await
            .map_err(|e| anyhow!("reading the response from {} failed: {}", self.endpoint, e))?
            .to_bytes();
        RpcResponse::from_xml(std::str::from_utf8(&body)?)
    }
}
