use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use http::Method;
use portcullis::error::ProcessError;
use portcullis::http::{
    CacheRule, CookieProcessor, CsrfProcessor, OutputProcessor, PathRouter, RequestContext,
    RequestProcessor, ResponseContext, RouteProcessor,
};
use portcullis::pipeline::Pipeline;
use portcullis::server::{Server, ServerEngine};

fn build_router() -> PathRouter {
    let mut router = PathRouter::new();
    router
        .register(
            Method::GET,
            "/hello/{name}",
            Arc::new(
                |req: &mut RequestContext,
                 res: &mut ResponseContext|
                 -> Result<(), ProcessError> {
                    let name = req.path_params.get("name").cloned().unwrap_or_default();
                    res.json(200, &serde_json::json!({ "hello": name }));
                    Ok(())
                },
            ),
        )
        .unwrap();
    router
        .register(
            Method::GET,
            "/foo.png",
            Arc::new(
                |_req: &mut RequestContext,
                 res: &mut ResponseContext|
                 -> Result<(), ProcessError> {
                    res.set_status(200, None);
                    res.set_header("Content-Type", "image/png");
                    res.set_body(vec![0x89, 0x50, 0x4e, 0x47]);
                    Ok(())
                },
            ),
        )
        .unwrap();
    router
}

fn build_engine() -> ServerEngine {
    let pipeline = Pipeline::builder()
        .stage(Arc::new(RequestProcessor::builder().build().unwrap()))
        .stage(Arc::new(CookieProcessor::builder().build().unwrap()))
        .stage(Arc::new(CsrfProcessor::builder().build().unwrap()))
        .stage(Arc::new(
            RouteProcessor::builder()
                .resolver(Arc::new(build_router()))
                .build()
                .unwrap(),
        ))
        .stage(Arc::new(
            OutputProcessor::builder()
                .extension_rule("png", CacheRule::public(3600))
                .build()
                .unwrap(),
        ))
        .build();
    ServerEngine::builder().pipeline(pipeline).build().unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn http_get(addr: SocketAddr, path: &str, extra_headers: &[&str]) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for header in extra_headers {
        request.push_str(header);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[test]
fn test_route_dispatch_end_to_end() {
    init_tracing();
    let handle = Server::new(build_engine()).start("127.0.0.1:0").unwrap();
    handle.wait_ready().unwrap();

    let response = http_get(handle.addr(), "/hello/world", &[]);
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Content-Type: application/json"));
    assert!(response.contains(r#""hello":"world""#));
    // The CSRF stage issues a token cookie on safe requests.
    assert!(response.contains("Set-Cookie: csrf-id="));

    handle.stop();
}

#[test]
fn test_extension_cache_rule_on_the_wire() {
    init_tracing();
    let handle = Server::new(build_engine()).start("127.0.0.1:0").unwrap();
    handle.wait_ready().unwrap();

    let response = http_get(handle.addr(), "/foo.png", &[]);
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("Cache-Control: public, max-age=3600"));

    // A client refusing caches gets the uncacheable pairing instead.
    let response = http_get(handle.addr(), "/foo.png", &["Cache-Control: no-cache"]);
    assert!(response.contains("Cache-Control: no-store, no-cache, must-revalidate, max-age=0"));
    assert!(response.contains("Pragma: no-cache"));

    handle.stop();
}

#[test]
fn test_unknown_route_is_404() {
    init_tracing();
    let handle = Server::new(build_engine()).start("127.0.0.1:0").unwrap();
    handle.wait_ready().unwrap();

    let response = http_get(handle.addr(), "/nope", &[]);
    assert!(response.starts_with("HTTP/1.1 404 Not Found"));

    handle.stop();
}

#[test]
fn test_redirect_mode_points_at_https() {
    let engine = ServerEngine::builder()
        .pipeline(Pipeline::builder().build())
        .redirect_to_https(8443)
        .build()
        .unwrap();
    let handle = Server::new(engine).start("127.0.0.1:0").unwrap();
    handle.wait_ready().unwrap();

    let response = http_get(handle.addr(), "/secure?x=1", &[]);
    assert!(response.starts_with("HTTP/1.1 301 Moved Permanently"));
    assert!(response.contains("Location: https://localhost:8443/secure?x=1"));

    handle.stop();
}
