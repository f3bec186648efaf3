use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http::Method;
use portcullis::error::ProcessError;
use portcullis::http::context::{RequestContext, ResponseContext};
use portcullis::http::route::MemoryRouteCache;
use portcullis::http::{PathRouter, Resolution, RouteProcessor, RouteResolver};
use portcullis::pipeline::{Pipeline, Processor};

struct CountingResolver {
    inner: PathRouter,
    calls: Arc<AtomicUsize>,
}

impl RouteResolver for CountingResolver {
    fn resolve(&self, method: &Method, path: &str, language: Option<&str>) -> Resolution {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(method, path, language)
    }
}

fn ok_handler() -> Arc<dyn portcullis::http::route::RouteHandler> {
    Arc::new(
        |_req: &mut RequestContext, res: &mut ResponseContext| -> Result<(), ProcessError> {
            res.json(200, &serde_json::json!({ "ok": true }));
            Ok(())
        },
    )
}

fn request(path: &str) -> RequestContext {
    RequestContext::new(Method::GET, path, 1, HashMap::new(), None, None)
}

#[test]
fn test_resolvers_queried_in_configured_order() {
    let mut first = PathRouter::new();
    first
        .register(
            Method::GET,
            "/shared",
            Arc::new(
                |_req: &mut RequestContext,
                 res: &mut ResponseContext|
                 -> Result<(), ProcessError> {
                    res.json(200, &serde_json::json!({ "from": "first" }));
                    Ok(())
                },
            ),
        )
        .unwrap();
    let mut second = PathRouter::new();
    second
        .register(
            Method::GET,
            "/shared",
            Arc::new(
                |_req: &mut RequestContext,
                 res: &mut ResponseContext|
                 -> Result<(), ProcessError> {
                    res.json(200, &serde_json::json!({ "from": "second" }));
                    Ok(())
                },
            ),
        )
        .unwrap();
    second
        .register(Method::GET, "/only-second", ok_handler())
        .unwrap();

    let processor = RouteProcessor::builder()
        .resolver(Arc::new(first))
        .resolver(Arc::new(second))
        .build()
        .unwrap();

    // First match wins across the configured sequence.
    let mut req = request("/shared");
    let mut res = ResponseContext::new();
    processor.process(&mut req, &mut res).unwrap();
    assert!(String::from_utf8_lossy(res.body()).contains("first"));

    // Later resolvers still serve what earlier ones miss.
    let mut req = request("/only-second");
    let mut res = ResponseContext::new();
    processor.process(&mut req, &mut res).unwrap();
    assert_eq!(res.status(), 200);
}

#[test]
fn test_cache_short_circuits_resolution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut router = PathRouter::new();
    router.register(Method::GET, "/cached", ok_handler()).unwrap();
    let resolver = CountingResolver {
        inner: router,
        calls: calls.clone(),
    };
    let processor = RouteProcessor::builder()
        .resolver(Arc::new(resolver))
        .cache(Arc::new(MemoryRouteCache::new()))
        .build()
        .unwrap();

    for _ in 0..3 {
        let mut req = request("/cached");
        let mut res = ResponseContext::new();
        processor.process(&mut req, &mut res).unwrap();
        assert_eq!(res.status(), 200);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Misses are cached too.
    for _ in 0..2 {
        let mut req = request("/absent");
        let mut res = ResponseContext::new();
        assert!(processor.process(&mut req, &mut res).is_err());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_not_found_maps_to_404_through_pipeline() {
    let router = PathRouter::new();
    let pipeline = Pipeline::builder()
        .stage(Arc::new(
            RouteProcessor::builder()
                .resolver(Arc::new(router))
                .build()
                .unwrap(),
        ))
        .build();
    let mut req = request("/nowhere");
    let mut res = ResponseContext::new();
    pipeline.run(&mut req, &mut res);
    assert_eq!(res.status(), 404);
}

#[test]
fn test_resolved_route_attached_to_context() {
    let mut router = PathRouter::new();
    router
        .register(Method::GET, "/pets/{id}", ok_handler())
        .unwrap();
    let processor = RouteProcessor::builder()
        .resolver(Arc::new(router))
        .build()
        .unwrap();
    let mut req = request("/pets/42");
    let mut res = ResponseContext::new();
    processor.process(&mut req, &mut res).unwrap();
    assert_eq!(req.path_params.get("id").map(String::as_str), Some("42"));
    let route = req.route.as_ref().expect("route attached");
    assert_eq!(route.path, "/pets/{id}");
    assert_eq!(route.params, vec!["id".to_string()]);
}
