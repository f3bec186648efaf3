use std::collections::HashMap;
use std::time::Duration;

use http::Method;
use portcullis::http::context::{RequestContext, ResponseContext};
use portcullis::http::{CsrfProcessor, TokenStore};
use portcullis::pipeline::Processor;

#[test]
fn test_create_verify_round_trip() {
    let store = TokenStore::new();
    let token = store.create(32, None);
    assert!(store.verify(&token.id, &token.secret));
    assert!(!store.verify(&token.id, &format!("{}x", token.secret)));
    assert!(!store.verify(&uuid::Uuid::new_v4(), &token.secret));
}

#[test]
fn test_token_expires_after_ttl() {
    let store = TokenStore::new();
    let token = store.create(16, Some(Duration::from_millis(60)));
    assert!(store.get(&token.id).is_some());
    std::thread::sleep(Duration::from_millis(200));
    assert!(store.get(&token.id).is_none());
}

#[test]
fn test_ttl_change_reschedules_instead_of_stacking() {
    let store = TokenStore::new();
    let token = store.create(16, Some(Duration::from_millis(60)));
    // Extending the TTL cancels the original timer; the token must survive
    // past the original deadline...
    store.set_ttl(&token.id, Some(Duration::from_millis(400)));
    std::thread::sleep(Duration::from_millis(150));
    assert!(store.get(&token.id).is_some());
    // ...and still expire at the new one.
    std::thread::sleep(Duration::from_millis(400));
    assert!(store.get(&token.id).is_none());
}

#[test]
fn test_remove_cancels_timer() {
    let store = TokenStore::new();
    let token = store.create(16, Some(Duration::from_millis(60)));
    store.remove(&token.id);
    assert!(store.get(&token.id).is_none());
    std::thread::sleep(Duration::from_millis(120));
    assert!(store.is_empty());
}

fn get_request(cookie: Option<&str>) -> RequestContext {
    let mut headers = HashMap::new();
    if let Some(cookie) = cookie {
        headers.insert("cookie".to_string(), cookie.to_string());
    }
    let mut req = RequestContext::new(Method::GET, "/", 1, headers, None, None);
    if let Some(cookie) = cookie {
        req.cookies = portcullis::http::cookies::parse_cookie_header(cookie);
    }
    req
}

#[test]
fn test_safe_request_issues_token_cookie() {
    let processor = CsrfProcessor::builder().build().unwrap();
    let mut req = get_request(None);
    let mut res = ResponseContext::new();
    processor.process(&mut req, &mut res).unwrap();

    let token = req.csrf_token.as_ref().expect("token issued");
    let staged = &res.staged_cookies()[0];
    assert_eq!(staged.name, "csrf-id");
    // The cookie carries the id, never the secret.
    assert_eq!(staged.value, token.id.to_string());
    assert!(!staged.value.contains(&token.secret));
}

#[test]
fn test_mutating_request_verified_via_header() {
    let processor = CsrfProcessor::builder().build().unwrap();

    // First request obtains a token.
    let mut req = get_request(None);
    let mut res = ResponseContext::new();
    processor.process(&mut req, &mut res).unwrap();
    let token = req.csrf_token.clone().expect("token issued");

    // Mutating request presents id via cookie and secret via header.
    let cookie = format!("csrf-id={}", token.id);
    let mut headers = HashMap::new();
    headers.insert("cookie".to_string(), cookie.clone());
    headers.insert("x-csrf-token".to_string(), token.secret.clone());
    let mut req = RequestContext::new(Method::POST, "/submit", 1, headers, None, None);
    req.cookies = portcullis::http::cookies::parse_cookie_header(&cookie);
    let mut res = ResponseContext::new();
    assert!(processor.process(&mut req, &mut res).is_ok());

    // A tampered secret is rejected.
    let mut headers = HashMap::new();
    headers.insert("cookie".to_string(), cookie.clone());
    headers.insert("x-csrf-token".to_string(), format!("{}x", token.secret));
    let mut req = RequestContext::new(Method::POST, "/submit", 1, headers, None, None);
    req.cookies = portcullis::http::cookies::parse_cookie_header(&cookie);
    let mut res = ResponseContext::new();
    let err = processor.process(&mut req, &mut res).unwrap_err();
    assert_eq!(err.kind(), "csrf_mismatch");
}

#[test]
fn test_mutating_request_without_token_rejected() {
    let processor = CsrfProcessor::builder().build().unwrap();
    let mut req = RequestContext::new(Method::POST, "/submit", 1, HashMap::new(), None, None);
    let mut res = ResponseContext::new();
    assert!(processor.process(&mut req, &mut res).is_err());
}
