//! End-to-end tunnel tests.
//!
//! These start a real controller (tunnel listener plus client-facing
//! HTTPS listener) with rcgen-generated certificates, connect scripted
//! agents over mTLS, and drive requests through with an HTTPS client
//! presenting its own client certificate.

use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;

use rcgen::{CertificateParams, CertifiedIssuer, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

use burrow_common::{core_metrics, AgentIdentity, RequestIdMinter};
use burrow_controller::http::{run_api_server, ApiContext};
use burrow_controller::registry::AgentRegistry;
use burrow_controller::server::run_tunnel_server;
use burrow_controller::tls::build_server_config;
use burrow_tunnel_protocol::defaults::PROTOCOL_VERSION;
use burrow_tunnel_protocol::{
    read_frame, write_frame, AgentHello, AgentToController, CancelRequest, ControllerToAgent,
    HttpChunkedResponse, HttpRequest, HttpResponse, StatisticsRequest,
};

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

// ============================================================================
// Certificate Generation Utilities
// ============================================================================

fn generate_ca() -> CertifiedIssuer<'static, KeyPair> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Tunnel Test CA");
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate().unwrap();
    CertifiedIssuer::self_signed(params, key_pair).unwrap()
}

fn generate_server_cert(ca: &CertifiedIssuer<'static, KeyPair>) -> (rcgen::Certificate, KeyPair) {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "localhost");
    params.distinguished_name = dn;

    params.subject_alt_names = vec![
        rcgen::SanType::DnsName("localhost".try_into().unwrap()),
        rcgen::SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1))),
    ];

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key_pair, ca).unwrap();
    (cert, key_pair)
}

fn generate_client_cert(
    ca: &CertifiedIssuer<'static, KeyPair>,
    common_name: &str,
) -> (rcgen::Certificate, KeyPair) {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key_pair, ca).unwrap();
    (cert, key_pair)
}

// ============================================================================
// Test Harness
// ============================================================================

struct TestController {
    tunnel_addr: std::net::SocketAddr,
    api_addr: std::net::SocketAddr,
    registry: Arc<AgentRegistry>,
    ca: CertifiedIssuer<'static, KeyPair>,
    ca_pem: String,
    _material_dir: tempfile::TempDir,
}

impl TestController {
    /// Certificate and key PEM for a client/agent with the given CN,
    /// signed by this controller's CA.
    fn client_material(&self, common_name: &str) -> (String, String) {
        let (cert, key) = generate_client_cert(&self.ca, common_name);
        (cert.pem(), key.serialize_pem())
    }
}

async fn start_controller() -> TestController {
    ensure_crypto_provider();

    let ca = generate_ca();
    let (server_cert, server_key) = generate_server_cert(&ca);
    let ca_pem = ca.as_ref().pem();

    let dir = tempfile::tempdir().unwrap();
    let cert_path: PathBuf = dir.path().join("tls.crt");
    let key_path: PathBuf = dir.path().join("tls.key");
    let ca_path: PathBuf = dir.path().join("ca.pem");
    std::fs::write(&cert_path, server_cert.pem()).unwrap();
    std::fs::write(&key_path, server_key.serialize_pem()).unwrap();
    std::fs::write(&ca_path, &ca_pem).unwrap();

    let tls_config = build_server_config(&cert_path, &key_path, &ca_path).unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let registry = Arc::new(AgentRegistry::new());
    let api_ctx = Arc::new(ApiContext {
        registry: Arc::clone(&registry),
        minter: RequestIdMinter::new(),
    });

    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel_listener.local_addr().unwrap();
    let api_addr = api_listener.local_addr().unwrap();

    tokio::spawn(run_tunnel_server(
        tunnel_listener,
        acceptor.clone(),
        Arc::clone(&registry),
    ));
    tokio::spawn(run_api_server(api_listener, acceptor, api_ctx));

    TestController {
        tunnel_addr,
        api_addr,
        registry,
        ca,
        ca_pem,
        _material_dir: dir,
    }
}

fn agent_tls_config(ca_pem: &str, cert_pem: &str, key_pem: &str) -> ClientConfig {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }

    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .unwrap()
        .unwrap();

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .unwrap()
}

async fn connect_tunnel(
    controller: &TestController,
    cert_pem: &str,
    key_pem: &str,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let tls = agent_tls_config(&controller.ca_pem, cert_pem, key_pem);
    let tcp = TcpStream::connect(controller.tunnel_addr).await.unwrap();
    let server_name = ServerName::try_from("localhost").unwrap();
    tokio_rustls::TlsConnector::from(Arc::new(tls))
        .connect(server_name, tcp)
        .await
        .unwrap()
}

/// A scripted agent: sends its hello, answers each request with the
/// frames the responder produces, acknowledges cancels by terminating
/// the cancelled request, and records everything it saw.
struct ScriptedAgent {
    requests: mpsc::UnboundedReceiver<HttpRequest>,
    cancels: mpsc::UnboundedReceiver<CancelRequest>,
}

async fn spawn_scripted_agent<F>(
    controller: &TestController,
    cert_pem: &str,
    key_pem: &str,
    protocol_version: u32,
    responder: F,
) -> ScriptedAgent
where
    F: Fn(&HttpRequest) -> Vec<AgentToController> + Send + 'static,
{
    let stream = connect_tunnel(controller, cert_pem, key_pem).await;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let hello = AgentToController::Hello(AgentHello {
        protocols: vec!["kubernetes".to_string()],
        kubernetes_namespaces: vec![],
        protocol_version,
    });
    write_frame(&mut writer, &hello).await.unwrap();

    let (request_tx, requests) = mpsc::unbounded_channel();
    let (cancel_tx, cancels) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            match read_frame::<_, ControllerToAgent>(&mut reader).await {
                Ok(Some(ControllerToAgent::HttpRequest(request))) => {
                    let frames = responder(&request);
                    let _ = request_tx.send(request);
                    for frame in frames {
                        if write_frame(&mut writer, &frame).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(Some(ControllerToAgent::Cancel(cancel))) => {
                    let terminator = AgentToController::HttpChunk(
                        HttpChunkedResponse::terminator(&cancel.id, "test"),
                    );
                    let _ = cancel_tx.send(cancel);
                    if write_frame(&mut writer, &terminator).await.is_err() {
                        return;
                    }
                }
                Ok(Some(ControllerToAgent::Pong(_))) => continue,
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return,
            }
        }
    });

    ScriptedAgent { requests, cancels }
}

fn https_client(controller: &TestController, cert_pem: &str, key_pem: &str) -> reqwest::Client {
    let identity_pem = format!("{}{}", cert_pem, key_pem);
    reqwest::Client::builder()
        .use_rustls_tls()
        .add_root_certificate(reqwest::Certificate::from_pem(controller.ca_pem.as_bytes()).unwrap())
        .identity(reqwest::Identity::from_pem(identity_pem.as_bytes()).unwrap())
        .resolve("localhost", controller.api_addr)
        .build()
        .unwrap()
}

fn api_url(controller: &TestController, path: &str) -> String {
    format!("https://localhost:{}{}", controller.api_addr.port(), path)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within deadline");
}

fn ok_response(request: &HttpRequest, body: &[u8]) -> Vec<AgentToController> {
    let mut headers = std::collections::HashMap::new();
    headers.insert("x-served-by".to_string(), vec!["scripted".to_string()]);
    vec![
        AgentToController::HttpResponse(HttpResponse {
            id: request.id.clone(),
            target: request.target.clone(),
            status: 200,
            content_length: -1,
            headers,
        }),
        AgentToController::HttpChunk(HttpChunkedResponse {
            id: request.id.clone(),
            target: request.target.clone(),
            body: body.to_vec(),
        }),
        AgentToController::HttpChunk(HttpChunkedResponse::terminator(
            &request.id,
            &request.target,
        )),
    ]
}

// ============================================================================
// Integration Tests
// ============================================================================

#[tokio::test]
async fn test_happy_path_roundtrip() {
    let controller = start_controller().await;
    let (cert, key) = controller.client_material("a1.agents.example");

    let mut agent = spawn_scripted_agent(&controller, &cert, &key, PROTOCOL_VERSION, |req| {
        ok_response(req, b"ok\n")
    })
    .await;

    let registry = Arc::clone(&controller.registry);
    wait_for(move || registry.session_count(&AgentIdentity::new("a1")) == 1).await;

    let client = https_client(&controller, &cert, &key);
    let response = client
        .get(api_url(&controller, "/healthz"))
        .header("accept-encoding", "gzip")
        .header("x-probe", "1")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-served-by").unwrap(),
        "scripted"
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"ok\n");

    // The agent saw the request routed to its identity, with the
    // Accept-Encoding header stripped and the probe header intact.
    let seen = timeout(Duration::from_secs(5), agent.requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.target, "a1");
    assert_eq!(seen.method, "GET");
    assert_eq!(seen.uri, "/healthz");
    assert_eq!(seen.protocol, "kubernetes");
    assert!(seen.headers.contains_key("x-probe"));
    assert!(!seen.headers.keys().any(|k| k.eq_ignore_ascii_case("accept-encoding")));
}

#[tokio::test]
async fn test_no_agent_yields_502_and_counts_request() {
    let controller = start_controller().await;
    let (cert, key) = controller.client_material("a2.agents.example");

    let counter = core_metrics().api_requests.with_label_values(&["a2"]);
    let before = counter.get();

    let client = https_client(&controller, &cert, &key);
    let response = client
        .get(api_url(&controller, "/anything"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    assert_eq!(counter.get(), before + 1);
}

#[tokio::test]
async fn test_version_mismatch_closes_stream_before_admission() {
    let controller = start_controller().await;
    let (cert, key) = controller.client_material("a3.agents.example");

    let stream = connect_tunnel(&controller, &cert, &key).await;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let hello = AgentToController::Hello(AgentHello {
        protocols: vec!["kubernetes".to_string()],
        kubernetes_namespaces: vec![],
        protocol_version: PROTOCOL_VERSION - 1,
    });
    write_frame(&mut writer, &hello).await.unwrap();

    // The controller closes the stream without admitting the session.
    let eof = timeout(
        Duration::from_secs(5),
        read_frame::<_, ControllerToAgent>(&mut reader),
    )
    .await
    .unwrap();
    assert!(matches!(eof, Ok(None) | Err(_)));

    assert_eq!(
        controller
            .registry
            .session_count(&AgentIdentity::new("a3")),
        0
    );
    assert_eq!(
        core_metrics()
            .agents_connected
            .with_label_values(&["a3"])
            .get(),
        0
    );
}

#[tokio::test]
async fn test_zero_length_response_finalises_on_header() {
    let controller = start_controller().await;
    let (cert, key) = controller.client_material("a4.agents.example");

    let _agent = spawn_scripted_agent(&controller, &cert, &key, PROTOCOL_VERSION, |req| {
        vec![
            AgentToController::HttpResponse(HttpResponse {
                id: req.id.clone(),
                target: req.target.clone(),
                status: 204,
                content_length: 0,
                headers: Default::default(),
            }),
            // The executor contract still terminates; the controller has
            // already finalised and drops this frame as unknown.
            AgentToController::HttpChunk(HttpChunkedResponse::terminator(&req.id, &req.target)),
        ]
    })
    .await;

    let registry = Arc::clone(&controller.registry);
    wait_for(move || registry.session_count(&AgentIdentity::new("a4")) == 1).await;

    let client = https_client(&controller, &cert, &key);
    let response = client
        .delete(api_url(&controller, "/resource/1"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 204);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_client_disconnect_sends_cancel() {
    let controller = start_controller().await;
    let (cert, key) = controller.client_material("a5.agents.example");

    // Header and one chunk, but no terminator: the response stays open.
    let mut agent = spawn_scripted_agent(&controller, &cert, &key, PROTOCOL_VERSION, |req| {
        vec![
            AgentToController::HttpResponse(HttpResponse {
                id: req.id.clone(),
                target: req.target.clone(),
                status: 200,
                content_length: -1,
                headers: Default::default(),
            }),
            AgentToController::HttpChunk(HttpChunkedResponse {
                id: req.id.clone(),
                target: req.target.clone(),
                body: b"partial".to_vec(),
            }),
        ]
    })
    .await;

    let registry = Arc::clone(&controller.registry);
    wait_for(move || registry.session_count(&AgentIdentity::new("a5")) == 1).await;

    let client = https_client(&controller, &cert, &key);
    let mut response = client
        .get(api_url(&controller, "/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let first = response.chunk().await.unwrap().unwrap();
    assert_eq!(first.as_ref(), b"partial");

    // Hang up mid-response.
    drop(response);

    let cancel = timeout(Duration::from_secs(5), agent.cancels.recv())
        .await
        .expect("no cancel frame within deadline")
        .unwrap();
    assert!(!cancel.id.is_empty());

    // The terminator the agent sent back cleared the request table.
    let session = controller
        .registry
        .pick(&AgentIdentity::new("a5"))
        .unwrap();
    wait_for(move || session.outstanding_requests() == 0).await;
}

#[tokio::test]
async fn test_agent_disconnect_before_header_yields_502() {
    let controller = start_controller().await;
    let (cert, key) = controller.client_material("a7.agents.example");

    // Hand-rolled agent so the stream can be dropped mid-request.
    let stream = connect_tunnel(&controller, &cert, &key).await;
    let (mut reader, mut writer) = tokio::io::split(stream);
    let hello = AgentToController::Hello(AgentHello {
        protocols: vec!["kubernetes".to_string()],
        kubernetes_namespaces: vec![],
        protocol_version: PROTOCOL_VERSION,
    });
    write_frame(&mut writer, &hello).await.unwrap();

    let registry = Arc::clone(&controller.registry);
    wait_for(move || registry.session_count(&AgentIdentity::new("a7")) == 1).await;

    let client = https_client(&controller, &cert, &key);
    let request = tokio::spawn(
        client
            .get(api_url(&controller, "/never-answered"))
            .send(),
    );

    // Swallow frames until the request arrives, then die without a
    // header frame.
    loop {
        match read_frame::<_, ControllerToAgent>(&mut reader).await {
            Ok(Some(ControllerToAgent::HttpRequest(_))) => break,
            Ok(Some(_)) => continue,
            other => panic!("expected request frame, got {:?}", other),
        }
    }
    drop(reader);
    drop(writer);

    let response = timeout(Duration::from_secs(5), request)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn test_statistics_exchange() {
    let controller = start_controller().await;
    let (cert, key) = controller.client_material("a6.agents.example");

    let _agent = spawn_scripted_agent(&controller, &cert, &key, PROTOCOL_VERSION, |req| {
        ok_response(req, b"x")
    })
    .await;

    let registry = Arc::clone(&controller.registry);
    wait_for(move || registry.session_count(&AgentIdentity::new("a6")) == 1).await;

    let stream = connect_tunnel(&controller, &cert, &key).await;
    let (mut reader, mut writer) = tokio::io::split(stream);
    write_frame(
        &mut writer,
        &AgentToController::Statistics(StatisticsRequest::default()),
    )
    .await
    .unwrap();

    let response = timeout(
        Duration::from_secs(5),
        read_frame::<_, ControllerToAgent>(&mut reader),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();

    match response {
        ControllerToAgent::Statistics(stats) => {
            assert!(stats.agents.iter().any(|a| a.identity == "a6"));
        }
        other => panic!("expected statistics response, got {:?}", other),
    }
}

