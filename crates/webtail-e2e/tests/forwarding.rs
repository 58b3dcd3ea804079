//! Full-path forwarding tests: TLS in through the loopback backend,
//! rewritten request out to a recording upstream.

use std::sync::Arc;

use hyper::StatusCode;
use webtail::{ProxyInstance, ServiceSpec, TailnetSettings};
use webtail_e2e::MockHttpService;
use webtail_tailnet::LoopbackTailnet;

fn init_test() {
    // Install rustls crypto provider (ignore if already installed)
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = tracing_subscriber::fmt()
        .with_env_filter("webtail=debug,webtail_tailnet=debug")
        .with_test_writer()
        .try_init();
}

fn settings() -> Arc<TailnetSettings> {
    Arc::new(TailnetSettings {
        auth_key: "tskey-test".to_string(),
        ephemeral: true,
        tailnet_domain: Some("test.ts.net".to_string()),
    })
}

async fn start_proxy(spec: ServiceSpec) -> Arc<ProxyInstance> {
    let backend = LoopbackTailnet::new(Some("test.ts.net".to_string()));
    let proxy = ProxyInstance::new(spec, settings(), backend);
    proxy.start().await.expect("proxy start failed");
    proxy
}

fn spec(node: &str, target: String) -> ServiceSpec {
    ServiceSpec {
        node_name: node.to_string(),
        target: Some(target),
        local_port: None,
        pass_host_header: false,
        trust_forward_header: false,
    }
}

/// Client that tolerates the loopback backend's self-signed certificate.
fn https_client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .expect("client build failed")
}

#[tokio::test]
async fn test_round_trip_replaces_target_path_and_query() {
    init_test();

    let mock = MockHttpService::start().await;
    mock.set_response_body(b"hello from upstream".to_vec());

    // The target's own path and query must be discarded.
    let proxy = start_proxy(spec(
        "web",
        format!("http://{}/stale/path?y=2", mock.addr()),
    ))
    .await;
    let listen = proxy.listen_addr().expect("no listen addr");

    let resp = https_client()
        .get(format!("https://{}/foo?x=1", listen))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "hello from upstream");

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].uri, "/foo?x=1");
    assert_eq!(requests[0].method, "GET");

    proxy.stop().await.expect("stop failed");
}

#[tokio::test]
async fn test_upstream_status_and_body_copied_back() {
    init_test();

    let mock = MockHttpService::start().await;
    mock.set_response_status(StatusCode::NOT_FOUND);
    mock.set_response_body(b"nothing here".to_vec());

    let proxy = start_proxy(spec("web-status", format!("http://{}", mock.addr()))).await;
    let listen = proxy.listen_addr().unwrap();

    let resp = https_client()
        .get(format!("https://{}/missing", listen))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "nothing here");

    proxy.stop().await.expect("stop failed");
}

#[tokio::test]
async fn test_unrewritable_target_returns_500_and_keeps_serving() {
    init_test();

    // A port outside the u16 range cannot produce an outbound URL, so
    // every request must fail with 500 while the instance stays up.
    let proxy = start_proxy(spec("web-badtarget", "localhost:99999".to_string())).await;
    let listen = proxy.listen_addr().unwrap();

    let client = https_client();
    for _ in 0..2 {
        let resp = client
            .get(format!("https://{}/", listen))
            .send()
            .await
            .expect("request failed");
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.text().await.unwrap(), "Invalid target URL");
    }

    proxy.stop().await.expect("stop failed");
}

#[tokio::test]
async fn test_forward_headers_overwritten_by_default() {
    init_test();

    let mock = MockHttpService::start().await;
    let proxy = start_proxy(spec("web-strict", format!("http://{}", mock.addr()))).await;
    let listen = proxy.listen_addr().unwrap();

    https_client()
        .get(format!("https://{}/", listen))
        .header("x-forwarded-for", "203.0.113.7")
        .header("x-forwarded-host", "spoofed.example.com")
        .send()
        .await
        .expect("request failed");

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    let recorded = &requests[0];

    assert_eq!(recorded.header("x-forwarded-proto"), Some("https"));
    assert_eq!(
        recorded.header("x-forwarded-host"),
        Some("web-strict.test.ts.net"),
        "spoofed forwarding host must be overwritten with the certified one"
    );
    assert_ne!(recorded.header("x-forwarded-for"), Some("203.0.113.7"));

    proxy.stop().await.expect("stop failed");
}

#[tokio::test]
async fn test_forward_headers_kept_when_trusted() {
    init_test();

    let mock = MockHttpService::start().await;
    let mut s = spec("web-trusting", format!("http://{}", mock.addr()));
    s.trust_forward_header = true;
    let proxy = start_proxy(s).await;
    let listen = proxy.listen_addr().unwrap();

    https_client()
        .get(format!("https://{}/", listen))
        .header("x-forwarded-for", "203.0.113.7")
        .send()
        .await
        .expect("request failed");

    let requests = mock.requests();
    let recorded = &requests[0];

    assert_eq!(recorded.header("x-forwarded-for"), Some("203.0.113.7"));
    // The caller left no forwarding host, so the certified one is advertised.
    assert_eq!(
        recorded.header("x-forwarded-host"),
        Some("web-trusting.test.ts.net")
    );

    proxy.stop().await.expect("stop failed");
}

#[tokio::test]
async fn test_host_header_policy() {
    init_test();

    // Default: the backend sees its own authority.
    let mock = MockHttpService::start().await;
    let proxy = start_proxy(spec("web-host", format!("http://{}", mock.addr()))).await;
    let listen = proxy.listen_addr().unwrap();

    https_client()
        .get(format!("https://{}/", listen))
        .send()
        .await
        .expect("request failed");

    assert_eq!(
        mock.requests()[0].header("host"),
        Some(mock.addr().to_string().as_str())
    );
    proxy.stop().await.expect("stop failed");

    // pass_host_header: the backend sees the host the caller used.
    let mock = MockHttpService::start().await;
    let mut s = spec("web-passhost", format!("http://{}", mock.addr()));
    s.pass_host_header = true;
    let proxy = start_proxy(s).await;
    let listen = proxy.listen_addr().unwrap();

    https_client()
        .get(format!("https://{}/", listen))
        .send()
        .await
        .expect("request failed");

    assert_eq!(
        mock.requests()[0].header("host"),
        Some(listen.to_string().as_str())
    );
    proxy.stop().await.expect("stop failed");
}
