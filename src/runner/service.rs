//! Function invocation
//!
//! Each call forks the language entrypoint with a fresh FIFO, reads the
//! HTTP response the child writes to it and streams that back, followed by
//! trailers describing the child's resource usage.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures::future::{BoxFuture, FutureExt, Shared};
use gram_functions_core::{
    CPU_HEADER, CallToolPayload, EXECUTION_TIME_HEADER, FUNCTIONS_ERROR_HEADER, MEMORY_HEADER,
    MethodError, ReadResourcePayload, RequestType, is_allowed_response_header, is_fly_replay,
    parse_functions_error, trailer_announcement,
};
use http_body::Frame;
use http_body_util::StreamBody;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use super::bootstrap::Program;
use super::ipc::{Fifo, ResponseHead, read_response_head};
use super::sys::{self, ChildExit};

/// Hard ceiling on one invocation, from spawn to child exit.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long to wait for a terminated child before giving up on trailers.
const REAP_GRACE: Duration = Duration::from_secs(5);

const CHUNK_SIZE: usize = 16 * 1024;

type ExitFuture = Shared<BoxFuture<'static, Result<ChildExit, String>>>;
type FrameResult = Result<Frame<Bytes>, io::Error>;

/// A validated call, ready to hand to the child.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// JSON passed as the second entrypoint argument
    pub request_arg: String,
    /// The child's entire environment
    pub environment: BTreeMap<String, String>,
    /// Tool or resource
    pub request_type: RequestType,
}

impl CallRequest {
    /// Validate a tool call. The environment is split off the child-visible payload.
    ///
    /// # Errors
    ///
    /// 400 when the name or input is missing.
    pub fn tool(mut payload: CallToolPayload) -> Result<Self, MethodError> {
        if payload.name.is_empty() {
            return Err(MethodError::permanent("invalid request: missing name", 400));
        }
        if payload.input.is_none() {
            return Err(MethodError::permanent("invalid request: missing input", 400));
        }
        let environment = std::mem::take(&mut payload.environment);
        Ok(Self {
            request_arg: encode_arg(&payload)?,
            environment,
            request_type: RequestType::Tool,
        })
    }

    /// Validate a resource read.
    ///
    /// # Errors
    ///
    /// 400 when the uri is missing.
    pub fn resource(mut payload: ReadResourcePayload) -> Result<Self, MethodError> {
        if payload.uri.is_empty() {
            return Err(MethodError::permanent("invalid request: missing uri", 400));
        }
        let environment = std::mem::take(&mut payload.environment);
        Ok(Self {
            request_arg: encode_arg(&payload)?,
            environment,
            request_type: RequestType::Resource,
        })
    }
}

fn encode_arg<T: serde::Serialize>(payload: &T) -> Result<String, MethodError> {
    serde_json::to_string(payload)
        .map_err(|e| MethodError::fault(format!("encode request: {e}"), 500))
}

/// Build the child command line.
///
/// The child sees `environment` and nothing else from this process.
#[must_use]
pub fn child_command(
    program: &Program,
    work_dir: &Path,
    extra_args: &[OsString],
    environment: &BTreeMap<String, String>,
) -> Command {
    let mut cmd = Command::new(&program.command);
    cmd.args(&program.args)
        .args(extra_args)
        .current_dir(work_dir)
        .env_clear()
        .envs(environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Runs user code for authenticated calls.
#[derive(Debug, Clone)]
pub struct FunctionService {
    program: Program,
    work_dir: PathBuf,
    fifo_dir: PathBuf,
    call_timeout: Duration,
}

impl FunctionService {
    /// Create a service running `program` inside `work_dir`.
    pub fn new(program: Program, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program,
            work_dir: work_dir.into(),
            fifo_dir: std::env::temp_dir(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the per-call ceiling.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Create pipes somewhere other than the system temp dir.
    #[must_use]
    pub fn with_fifo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fifo_dir = dir.into();
        self
    }

    /// Handle `POST /tool-call`.
    ///
    /// # Errors
    ///
    /// See [`FunctionService::execute`].
    pub async fn call_tool(&self, payload: CallToolPayload) -> Result<Response, MethodError> {
        let call = CallRequest::tool(payload)?;
        self.execute(call).await
    }

    /// Handle `POST /resource-request`.
    ///
    /// # Errors
    ///
    /// See [`FunctionService::execute`].
    pub async fn read_resource(&self, payload: ReadResourcePayload) -> Result<Response, MethodError> {
        let call = CallRequest::resource(payload)?;
        self.execute(call).await
    }

    /// Run one call to completion of the response head.
    ///
    /// The body and trailers are streamed by a background task that owns
    /// the child; dropping the response terminates the child.
    ///
    /// # Errors
    ///
    /// - 408 (temporary) when the child does not answer in time
    /// - 502 when the child asks for an edge replay or writes an invalid status
    /// - 500 (fault) when the child cannot start or exits without answering
    pub async fn execute(&self, call: CallRequest) -> Result<Response, MethodError> {
        let start = Instant::now();
        let deadline = start + self.call_timeout;

        let fifo = Arc::new(
            Fifo::create_in(&self.fifo_dir)
                .map_err(|e| MethodError::fault(format!("create pipe: {e}"), 500))?,
        );
        let args = [
            fifo.path().as_os_str().to_owned(),
            OsString::from(&call.request_arg),
            OsString::from(call.request_type.as_str()),
        ];
        let mut child = child_command(&self.program, &self.work_dir, &args, &call.environment)
            .spawn()
            .map_err(|e| MethodError::fault(format!("start function: {e}"), 500))?;
        let pid = child.id();
        debug!(pid, request_type = %call.request_type, "started function");

        if let Some(out) = child.stdout.take() {
            capture_lines(out, "stdout");
        }
        if let Some(err) = child.stderr.take() {
            capture_lines(err, "stderr");
        }
        drop(child);

        let supervisor = Supervisor::new(pid);
        let exit = supervisor.wait();

        let mut open = fifo.open_reader();
        let opened = tokio::select! {
            biased;
            res = &mut open => res,
            _ = exit.clone() => {
                // The child may have written and exited before the blocked
                // open returned; releasing the reader keeps that data readable.
                match open.release(deadline).await {
                    Some(res) => res,
                    None => return Err(call_timed_out()),
                }
            }
            () = tokio::time::sleep_until(deadline) => return Err(call_timed_out()),
        };
        let mut pipe = opened.map_err(|e| MethodError::fault(format!("open pipe: {e}"), 500))?;

        let head = match tokio::time::timeout_at(deadline, read_response_head(&mut pipe)).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log_early_exit(&exit).await;
                return Err(MethodError::fault("function exited without writing a response", 500));
            }
            Ok(Err(e)) => {
                return Err(MethodError::fault(format!("read function response: {e}"), 500));
            }
            Err(_) => return Err(call_timed_out()),
        };

        if head.header("content-type").is_some_and(is_fly_replay) {
            warn!(pid, "function attempted fly replay");
            return Err(MethodError::permanent("function attempted fly replay", 502));
        }
        if let Some(value) = head.header(FUNCTIONS_ERROR_HEADER) {
            match parse_functions_error(value) {
                Some(code) => warn!(pid, %code, status = head.status, "function reported an error"),
                None => debug!(pid, value, "ignoring unknown function error code"),
            }
        }

        let status = StatusCode::from_u16(head.status)
            .map_err(|_| MethodError::fault(format!("invalid status from function: {}", head.status), 502))?;
        let headers = forward_headers(&head);

        let (tx, rx) = mpsc::channel::<FrameResult>(8);
        tokio::spawn(stream_body(StreamTask {
            pipe,
            head,
            supervisor,
            exit,
            start,
            deadline,
            tx,
            _fifo: fifo,
        }));

        let mut response = Response::new(Body::new(StreamBody::new(ReceiverStream::new(rx))));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn call_timed_out() -> MethodError {
    MethodError::temporary("timed out waiting for sub-process", 408)
}

fn forward_headers(head: &ResponseHead) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &head.headers {
        let error_code = name.eq_ignore_ascii_case(FUNCTIONS_ERROR_HEADER)
            && parse_functions_error(value).is_some();
        if !is_allowed_response_header(name) && !error_code {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(header = %name, "dropping malformed function header");
            continue;
        };
        headers.append(name, value);
    }
    if let Ok(announce) = HeaderValue::from_str(&trailer_announcement()) {
        headers.insert(header::TRAILER, announce);
    }
    headers
}

/// Log each line the child writes, tagged with the stream it came from.
fn capture_lines<R: Read + Send + 'static>(stream: R, device: &'static str) {
    tokio::task::spawn_blocking(move || {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    info!(device, event_origin = "user", "{}", text.trim_end_matches(['\r', '\n']));
                }
                Err(e) => {
                    debug!(device, error = %e, "stopped reading function output");
                    break;
                }
            }
        }
    });
}

async fn log_early_exit(exit: &ExitFuture) {
    match tokio::time::timeout(REAP_GRACE, exit.clone()).await {
        Ok(Ok(exit)) => warn!(status = %exit.status, "function exited before responding"),
        Ok(Err(e)) => warn!(error = %e, "function exited before responding"),
        Err(_) => warn!("function closed its pipe without responding"),
    }
}

/// Owns the child pid until it has been reaped.
///
/// Dropping the supervisor of a live child sends it SIGTERM. The reaped
/// flag is only set while holding the lock, so a signal can never reach a
/// recycled pid.
struct Supervisor {
    pid: u32,
    reaped: Arc<Mutex<bool>>,
}

impl Supervisor {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            reaped: Arc::new(Mutex::new(false)),
        }
    }

    fn wait(&self) -> ExitFuture {
        let pid = self.pid;
        let reaped = Arc::clone(&self.reaped);
        tokio::task::spawn_blocking(move || {
            sys::wait_exited(pid)?;
            let mut done = reaped.lock();
            let exit = sys::reap(pid)?;
            *done = true;
            Ok::<_, io::Error>(exit)
        })
        .map(|joined| match joined {
            Ok(Ok(exit)) => Ok(exit),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        })
        .boxed()
        .shared()
    }

    fn terminate(&self) {
        let reaped = self.reaped.lock();
        if *reaped {
            return;
        }
        if let Err(e) = sys::terminate(self.pid) {
            debug!(pid = self.pid, error = %e, "failed to signal function");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct StreamTask {
    pipe: File,
    head: ResponseHead,
    supervisor: Supervisor,
    exit: ExitFuture,
    start: Instant,
    deadline: Instant,
    tx: mpsc::Sender<FrameResult>,
    _fifo: Arc<Fifo>,
}

enum Flow {
    Finished,
    Disconnected,
}

async fn stream_body(task: StreamTask) {
    let StreamTask {
        mut pipe,
        head,
        supervisor,
        exit,
        start,
        deadline,
        tx,
        _fifo,
    } = task;

    let content_length = head.content_length();
    let pumped = tokio::time::timeout_at(
        deadline,
        pump(&mut pipe, head.body_prefix, content_length, &tx),
    )
    .await;
    match pumped {
        Ok(Ok(Flow::Finished)) => {}
        Ok(Ok(Flow::Disconnected)) => {
            debug!(pid = supervisor.pid, "caller went away, stopping function");
            return;
        }
        Ok(Err(e)) => {
            warn!(pid = supervisor.pid, error = %e, "failed reading function body");
            let _ = tx.send(Err(e)).await;
            return;
        }
        Err(_) => {
            warn!(pid = supervisor.pid, "function exceeded its time limit");
            supervisor.terminate();
        }
    }
    drop(pipe);

    let remaining = deadline.saturating_duration_since(Instant::now()).max(REAP_GRACE);
    let exit = match tokio::time::timeout(remaining, exit).await {
        Ok(Ok(exit)) => exit,
        Ok(Err(e)) => {
            error!(pid = supervisor.pid, error = %e, "failed waiting for function");
            return;
        }
        Err(_) => {
            warn!(pid = supervisor.pid, "function did not exit in time");
            return;
        }
    };
    let elapsed = start.elapsed();

    if exit.status.success() {
        debug!(pid = supervisor.pid, elapsed = ?elapsed, "function exited");
    } else {
        warn!(pid = supervisor.pid, status = %exit.status, "function exited with failure");
    }

    let _ = tx.send(Ok(Frame::trailers(usage_trailers(&exit, elapsed)))).await;
}

/// Copy the body, honouring a declared `Content-Length`.
async fn pump(
    pipe: &mut File,
    prefix: Bytes,
    limit: Option<u64>,
    tx: &mpsc::Sender<FrameResult>,
) -> io::Result<Flow> {
    let mut remaining = limit;
    let mut chunk = prefix;
    loop {
        if let Some(left) = remaining {
            let len = chunk.len() as u64;
            if len > left {
                chunk.truncate(usize::try_from(left).unwrap_or(usize::MAX));
            }
            remaining = Some(left.saturating_sub(chunk.len() as u64));
        }
        if !chunk.is_empty() && tx.send(Ok(Frame::data(chunk))).await.is_err() {
            return Ok(Flow::Disconnected);
        }
        if remaining == Some(0) {
            return Ok(Flow::Finished);
        }

        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        if pipe.read_buf(&mut buf).await? == 0 {
            return Ok(Flow::Finished);
        }
        chunk = buf.freeze();
    }
}

fn usage_trailers(exit: &ChildExit, elapsed: Duration) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    let values = [
        (CPU_HEADER, exit.cpu.as_secs_f64()),
        (MEMORY_HEADER, sys::total_memory_gb()),
        (EXECUTION_TIME_HEADER, elapsed.as_secs_f64()),
    ];
    for (name, value) in values {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value.to_string()),
        ) {
            trailers.insert(name, value);
        }
    }
    trailers
}

// ============================================================================
// HTTP handlers
// ============================================================================

/// Serialise a [`MethodError`] as the response body.
#[must_use]
pub fn error_response(err: &MethodError) -> Response {
    if err.fault {
        error!(error_id = %err.id, message = %err.message, "function call failed");
    } else {
        warn!(error_id = %err.id, message = %err.message, "function call rejected");
    }
    let status = StatusCode::from_u16(err.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(err)).into_response();
    if let Some(code) = err.functions_code() {
        response
            .headers_mut()
            .insert(FUNCTIONS_ERROR_HEADER, HeaderValue::from_static(code.code()));
    }
    response
}

/// `POST /tool-call`
pub async fn tool_call(State(service): State<Arc<FunctionService>>, body: Bytes) -> Response {
    let payload = match serde_json::from_slice::<CallToolPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return error_response(&MethodError::permanent(
                format!("decode tool call request: {e}"),
                400,
            ));
        }
    };
    service
        .call_tool(payload)
        .await
        .unwrap_or_else(|e| error_response(&e))
}

/// `POST /resource-request`
pub async fn resource_request(State(service): State<Arc<FunctionService>>, body: Bytes) -> Response {
    let payload = match serde_json::from_slice::<ReadResourcePayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return error_response(&MethodError::permanent(
                format!("decode resource request: {e}"),
                400,
            ));
        }
    };
    service
        .read_resource(payload)
        .await
        .unwrap_or_else(|e| error_response(&e))
}
