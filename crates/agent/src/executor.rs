//! Outbound HTTP execution.
//!
//! One executor per tunnelled request: build a client from the current
//! credential snapshot, perform the call, and stream the response back as
//! exactly one header frame, zero or more non-empty chunk frames, and one
//! terminating empty chunk. Build and upstream failures surface as a
//! synthetic 502; read errors after the header are logged but still end
//! in a clean termination, since the status has already been conveyed.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use burrow_tunnel_protocol::defaults::RESPONSE_CHUNK_SIZE;
use burrow_tunnel_protocol::{
    AgentToController, HttpChunkedResponse, HttpRequest, HttpResponse,
};

use crate::cancel::CancelRegistry;
use crate::credentials::BackendCredentials;

/// Synthetic 502 header frame for a failed request.
pub(crate) fn bad_gateway_header(id: &str, target: &str) -> AgentToController {
    AgentToController::HttpResponse(HttpResponse {
        id: id.to_string(),
        target: target.to_string(),
        status: 502,
        content_length: 0,
        headers: Default::default(),
    })
}

/// Emit a 502 header and the terminating empty chunk.
pub(crate) async fn send_bad_gateway(
    dataflow: &mpsc::Sender<AgentToController>,
    id: &str,
    target: &str,
) {
    let _ = dataflow.send(bad_gateway_header(id, target)).await;
    let _ = dataflow
        .send(AgentToController::HttpChunk(HttpChunkedResponse::terminator(
            id, target,
        )))
        .await;
}

/// Execute one tunnelled request against the backend.
pub async fn execute_request(
    dataflow: mpsc::Sender<AgentToController>,
    credentials: Arc<BackendCredentials>,
    cancels: Arc<CancelRegistry>,
    request: HttpRequest,
) {
    let id = request.id.clone();
    let cancel = cancels.register(&id);
    run(&dataflow, credentials, request, cancel).await;
    cancels.unregister(&id);
}

async fn run(
    dataflow: &mpsc::Sender<AgentToController>,
    credentials: Arc<BackendCredentials>,
    request: HttpRequest,
    cancel: CancellationToken,
) {
    let id = request.id.clone();
    let target = request.target.clone();
    let url = format!("{}{}", credentials.server_url, request.uri);
    debug!(request_id = %id, method = %request.method, url = %url, "Executing request");

    let client = match build_client(&credentials) {
        Ok(client) => client,
        Err(e) => {
            warn!(request_id = %id, error = %e, "Failed to build backend client");
            send_bad_gateway(dataflow, &id, &target).await;
            return;
        }
    };

    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => method,
        Err(e) => {
            warn!(request_id = %id, method = %request.method, error = %e, "Invalid request method");
            send_bad_gateway(dataflow, &id, &target).await;
            return;
        }
    };

    let mut builder = client.request(method, &url).body(request.body);
    for (name, values) in &request.headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if let Some(token) = credentials.token.as_deref() {
        if !token.is_empty() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(request_id = %id, "Request cancelled before upstream replied");
            send_bad_gateway(dataflow, &id, &target).await;
            return;
        }
        response = builder.send() => match response {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %id, url = %url, error = %e, "Failed to execute request");
                send_bad_gateway(dataflow, &id, &target).await;
                return;
            }
        }
    };

    // Headers first.
    let header = HttpResponse {
        id: id.clone(),
        target: target.clone(),
        status: response.status().as_u16(),
        content_length: response
            .content_length()
            .map(|len| len as i64)
            .unwrap_or(-1),
        headers: response_headers(&response),
    };
    if dataflow
        .send(AgentToController::HttpResponse(header))
        .await
        .is_err()
    {
        return;
    }

    // Then the body, re-sliced into bounded chunks.
    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(request_id = %id, "Context cancelled mid-body");
                break;
            }
            next = stream.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                for part in bytes.chunks(RESPONSE_CHUNK_SIZE) {
                    if part.is_empty() {
                        continue;
                    }
                    let chunk = AgentToController::HttpChunk(HttpChunkedResponse {
                        id: id.clone(),
                        target: target.clone(),
                        body: part.to_vec(),
                    });
                    if dataflow.send(chunk).await.is_err() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                // The status already went out; terminate cleanly.
                warn!(request_id = %id, error = %e, "Got error on HTTP read");
                break;
            }
            None => break,
        }
    }

    let _ = dataflow
        .send(AgentToController::HttpChunk(HttpChunkedResponse::terminator(
            &id, &target,
        )))
        .await;
}

/// Client for one request, built from the credential snapshot.
fn build_client(credentials: &BackendCredentials) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(30))
        .danger_accept_invalid_certs(credentials.insecure);

    if let Some(ca_pem) = credentials.server_ca_pem.as_deref() {
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(ca_pem)?);
    }

    if let (Some(cert), Some(key)) = (
        credentials.client_cert_pem.as_deref(),
        credentials.client_key_pem.as_deref(),
    ) {
        let mut identity_pem = cert.to_vec();
        identity_pem.extend_from_slice(key);
        builder = builder.identity(reqwest::Identity::from_pem(&identity_pem)?);
    }

    builder.build()
}

fn response_headers(
    response: &reqwest::Response,
) -> std::collections::HashMap<String, Vec<String>> {
    let mut headers: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    for (name, value) in response.headers() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).to_string());
    }
    headers
}
