use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use portcullis::http::context::{RequestContext, ResponseContext};
use portcullis::http::cookies::parse_cookie_header;
use portcullis::http::{CookieOptions, CookieProcessor, DecryptFailure};
use portcullis::pipeline::Processor;
use portcullis::services::CookieCipher;

/// Reversible toy cipher: XOR with the IV, repeated. Enough to exercise the
/// IV layout and failure paths without a real crypto dependency.
struct XorCipher;

impl CookieCipher for XorCipher {
    fn encrypt(&self, plaintext: &[u8], iv: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(plaintext
            .iter()
            .zip(iv.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect())
    }

    fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.encrypt(ciphertext, iv)
    }
}

/// Cipher that refuses everything, to exercise the failure policies.
struct BrokenCipher;

impl CookieCipher for BrokenCipher {
    fn encrypt(&self, plaintext: &[u8], _iv: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, _ciphertext: &[u8], _iv: &[u8]) -> anyhow::Result<Vec<u8>> {
        anyhow::bail!("bad ciphertext")
    }
}

fn request_with_cookie(header: &str) -> RequestContext {
    let mut headers = HashMap::new();
    headers.insert("cookie".to_string(), header.to_string());
    RequestContext::new(Method::GET, "/", 1, headers, None, None)
}

#[test]
fn test_set_cookie_header_round_trip() {
    let processor = CookieProcessor::builder().build().unwrap();
    let mut res = ResponseContext::new();
    processor.set_cookie(
        &mut res,
        "a",
        "b",
        CookieOptions {
            max_age: Some(0),
            ..CookieOptions::default()
        },
    );

    let staged = &res.staged_cookies()[0];
    let header = staged.to_header_value();
    assert!(header.contains("a=b"));
    assert!(header.contains("Max-Age=0"));

    // Parsing the emitted pair back yields the original cookie.
    let parsed = parse_cookie_header(header.split("; ").next().unwrap());
    assert_eq!(parsed.get("a").map(String::as_str), Some("b"));
}

#[test]
fn test_processor_parses_inbound_cookies() {
    let processor = CookieProcessor::builder().build().unwrap();
    let mut req = request_with_cookie("sid=abc; token=x=y");
    let mut res = ResponseContext::new();
    processor.process(&mut req, &mut res).unwrap();
    assert_eq!(req.cookie("sid"), Some("abc"));
    assert_eq!(req.cookie("token"), Some("x=y"));
}

#[test]
fn test_encrypted_value_round_trip() {
    let cipher: Arc<dyn CookieCipher> = Arc::new(XorCipher);
    let processor = CookieProcessor::builder()
        .cipher(cipher)
        .build()
        .unwrap();

    let mut res = ResponseContext::new();
    processor.set_cookie(&mut res, "sid", "hello world", CookieOptions::default());
    let wire_value = res.staged_cookies()[0].value.clone();
    // hex IV, dot, payload
    let (iv_hex, payload) = wire_value.split_once('.').unwrap();
    assert!(iv_hex.len() == 32 && !payload.is_empty());
    assert_ne!(wire_value, "hello world");

    let mut req = request_with_cookie(&format!("sid={wire_value}"));
    let mut res = ResponseContext::new();
    processor.process(&mut req, &mut res).unwrap();
    assert_eq!(req.cookie("sid"), Some("hello world"));
}

#[test]
fn test_decrypt_failure_keeps_raw_by_default() {
    let processor = CookieProcessor::builder()
        .cipher(Arc::new(BrokenCipher))
        .build()
        .unwrap();
    let mut req = request_with_cookie("sid=deadbeefdeadbeefdeadbeefdeadbeef.QUJD");
    let mut res = ResponseContext::new();
    processor.process(&mut req, &mut res).unwrap();
    assert_eq!(
        req.cookie("sid"),
        Some("deadbeefdeadbeefdeadbeefdeadbeef.QUJD")
    );
}

#[test]
fn test_decrypt_failure_drop_policy() {
    let processor = CookieProcessor::builder()
        .cipher(Arc::new(BrokenCipher))
        .on_decrypt_failure(DecryptFailure::Drop)
        .build()
        .unwrap();
    let mut req = request_with_cookie("sid=deadbeefdeadbeefdeadbeefdeadbeef.QUJD");
    let mut res = ResponseContext::new();
    processor.process(&mut req, &mut res).unwrap();
    assert_eq!(req.cookie("sid"), None);
}

#[test]
fn test_iv_length_validation() {
    let err = CookieProcessor::builder().iv_length(2).build().unwrap_err();
    assert!(matches!(
        err,
        portcullis::ConfigError::InvalidValue {
            field: "iv_length",
            ..
        }
    ));
}
