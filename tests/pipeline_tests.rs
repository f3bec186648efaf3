use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use http::Method;
use portcullis::error::ProcessError;
use portcullis::http::context::{RequestContext, ResponseContext};
use portcullis::http::ExceptionProcessor;
use portcullis::pipeline::{Flow, Pipeline, Processor};

#[derive(Clone, Copy)]
enum Mode {
    Continue,
    Halt,
    Fail,
}

struct Recorder {
    name: &'static str,
    mode: Mode,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl Processor for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn process(
        &self,
        _req: &mut RequestContext,
        res: &mut ResponseContext,
    ) -> Result<Flow, ProcessError> {
        self.log.lock().unwrap().push(self.name);
        match self.mode {
            Mode::Continue => Ok(Flow::Continue),
            Mode::Halt => {
                res.set_status(204, None);
                Ok(Flow::Halt)
            }
            Mode::Fail => Err(ProcessError::http(418, "stage failure")),
        }
    }
}

fn recorder(
    name: &'static str,
    mode: Mode,
    log: &Arc<Mutex<Vec<&'static str>>>,
) -> Arc<dyn Processor> {
    Arc::new(Recorder {
        name,
        mode,
        log: log.clone(),
    })
}

fn request() -> RequestContext {
    RequestContext::new(Method::GET, "/", 1, HashMap::new(), None, None)
}

#[test]
fn test_stages_run_in_configured_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::builder()
        .stage(recorder("first", Mode::Continue, &log))
        .stage(recorder("second", Mode::Continue, &log))
        .stage(recorder("third", Mode::Continue, &log))
        .build();
    let mut req = request();
    let mut res = ResponseContext::new();
    pipeline.run(&mut req, &mut res);
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn test_halt_skips_remaining_stages() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::builder()
        .stage(recorder("first", Mode::Continue, &log))
        .stage(recorder("second", Mode::Halt, &log))
        .stage(recorder("third", Mode::Continue, &log))
        .build();
    let mut req = request();
    let mut res = ResponseContext::new();
    pipeline.run(&mut req, &mut res);
    assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(res.status(), 204);
}

#[test]
fn test_stage_error_routes_to_exception_stage() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pipeline = Pipeline::builder()
        .stage(recorder("first", Mode::Fail, &log))
        .stage(recorder("second", Mode::Continue, &log))
        .build();
    let mut req = request();
    let mut res = ResponseContext::new();
    pipeline.run(&mut req, &mut res);
    assert_eq!(*log.lock().unwrap(), vec!["first"]);
    // HTTP-category errors keep their authoritative status.
    assert_eq!(res.status(), 418);
}

#[test]
fn test_external_failure_uses_exception_stage() {
    let pipeline = Pipeline::builder()
        .exception(Arc::new(ExceptionProcessor::builder().build()))
        .build();
    let mut req = request();
    let mut res = ResponseContext::new();
    pipeline.fail(
        &ProcessError::Rejected {
            reason: "Forbidden".to_string(),
        },
        &mut req,
        &mut res,
    );
    assert_eq!(res.status(), 403);
}

#[test]
fn test_rebuilding_with_same_record_is_idempotent() {
    use portcullis::http::RequestProcessor;

    // Two processors crafted from the same configuration record must behave
    // identically.
    let build = || {
        RequestProcessor::builder()
            .method_override(true)
            .method_override_param("_method")
            .build()
            .unwrap()
    };
    let a = build();
    let b = build();

    let make_request = || {
        let mut headers = HashMap::new();
        headers.insert("accept-language".to_string(), "en;q=0.5, fr".to_string());
        RequestContext::new(Method::POST, "/x?_method=DELETE", 1, headers, None, None)
    };

    let mut req_a = make_request();
    let mut req_b = make_request();
    let mut res = ResponseContext::new();
    a.process(&mut req_a, &mut res).unwrap();
    b.process(&mut req_b, &mut res).unwrap();

    assert_eq!(req_a.method, req_b.method);
    assert_eq!(req_a.original_method, req_b.original_method);
    assert_eq!(req_a.preferred_language, req_b.preferred_language);
    assert_eq!(req_a.query_params, req_b.query_params);
}
