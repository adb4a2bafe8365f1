//! Per-task request state and the parse → resolve → dispatch pipeline.
//!
//! ```text
//! Created → Parsed → Resolved → (Interrupted | Dispatched) → Completed
//!        ↘ Rejected (decode error, unknown command)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;

use crate::app::Application;
use crate::bridge::protocol::{ClientInfo, TaskId, WorkerMessage};
use crate::envelope::{self, Cmd, DecodeError, Envelope, ErrorCode};
use crate::route::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Parsed,
    Resolved,
    Interrupted,
    Dispatched,
    Completed,
    Rejected,
}

/// Failure raised while running hooks or the handler. The worker turns it
/// into an error reply and keeps serving.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("before_request hook failed: {0:#}")]
    Hook(anyhow::Error),
    #[error("handler failed: {0:#}")]
    Failed(anyhow::Error),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TimedOut(_) => ErrorCode::Timeout,
            _ => ErrorCode::HandlerError,
        }
    }
}

/// Upstream half of the IPC connection was closed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("reply channel closed")]
pub struct ReplyChannelClosed;

/// Mapping form of a reply: set fields override a copy of the request
/// envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyPatch {
    pub cmd: Option<Cmd>,
    pub ret: Option<i32>,
    pub body: Option<Bytes>,
}

impl ReplyPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cmd(mut self, cmd: Cmd) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn ret(mut self, ret: i32) -> Self {
        self.ret = Some(ret);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// What a handler, hook or interrupt sends back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Reply {
    /// Nothing is written.
    #[default]
    Empty,
    /// Default form: the request envelope with this body.
    Body(Bytes),
    /// Already encoded envelope bytes, sent verbatim.
    Packed(Bytes),
    /// Mapping form.
    Patch(ReplyPatch),
    /// A complete envelope.
    Envelope(Envelope),
}

impl Reply {
    pub fn body(body: impl Into<Bytes>) -> Self {
        Self::Body(body.into())
    }

    pub fn packed(bytes: impl Into<Bytes>) -> Self {
        Self::Packed(bytes.into())
    }

    pub fn json<T: Serialize>(value: &T) -> anyhow::Result<Self> {
        Ok(Self::Body(Bytes::from(serde_json::to_vec(value)?)))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Encode against the request envelope (`None` if the request never parsed).
    pub fn encode(self, request: Option<&Envelope>) -> Option<Bytes> {
        let base = || {
            request
                .map(|env| env.reply(Bytes::new()))
                .unwrap_or_default()
        };
        match self {
            Self::Empty => None,
            Self::Packed(bytes) => Some(bytes),
            Self::Envelope(env) => Some(envelope::pack(&env)),
            Self::Body(body) => {
                let mut env = base();
                env.body = body;
                Some(envelope::pack(&env))
            }
            Self::Patch(patch) => {
                let mut env = base();
                if let Some(cmd) = patch.cmd {
                    env.cmd = cmd;
                }
                if let Some(ret) = patch.ret {
                    env.ret = ret;
                }
                if let Some(body) = patch.body {
                    env.body = body;
                }
                Some(envelope::pack(&env))
            }
        }
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Self::Empty
    }
}

impl From<Bytes> for Reply {
    fn from(body: Bytes) -> Self {
        Self::Body(body)
    }
}

impl From<Vec<u8>> for Reply {
    fn from(body: Vec<u8>) -> Self {
        Self::Body(Bytes::from(body))
    }
}

impl From<&'static str> for Reply {
    fn from(body: &'static str) -> Self {
        Self::Body(Bytes::from_static(body.as_bytes()))
    }
}

impl From<String> for Reply {
    fn from(body: String) -> Self {
        Self::Body(Bytes::from(body))
    }
}

impl From<serde_json::Value> for Reply {
    fn from(value: serde_json::Value) -> Self {
        Self::Body(Bytes::from(value.to_string()))
    }
}

impl From<Envelope> for Reply {
    fn from(env: Envelope) -> Self {
        Self::Envelope(env)
    }
}

impl From<ReplyPatch> for Reply {
    fn from(patch: ReplyPatch) -> Self {
        Self::Patch(patch)
    }
}

impl<T: Into<Reply>> From<Option<T>> for Reply {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}

/// Handle for sending replies upstream on the worker's IPC connection.
///
/// Writes are queued on an unbounded channel and flushed by the worker's
/// writer task, so hooks and synchronous handlers can reply without
/// awaiting.
#[derive(Clone)]
pub struct ReplySender {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl ReplySender {
    pub fn new(tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { tx }
    }

    pub fn send_reply(&self, task_id: TaskId, payload: Bytes) -> Result<(), ReplyChannelClosed> {
        self.tx
            .send(WorkerMessage::Reply { task_id, payload })
            .map_err(|_| ReplyChannelClosed)
    }

    pub fn send_idle(&self, task_id: TaskId) -> Result<(), ReplyChannelClosed> {
        self.tx
            .send(WorkerMessage::Idle { task_id })
            .map_err(|_| ReplyChannelClosed)
    }
}

pub struct Request {
    task_id: TaskId,
    client: ClientInfo,
    raw: Bytes,
    envelope: Option<Envelope>,
    route: Option<Route>,
    state: RequestState,
    interrupted: bool,
    interrupt_reply: Reply,
    responded: bool,
    sender: ReplySender,
}

impl Request {
    pub fn new(task_id: TaskId, client: ClientInfo, raw: Bytes, sender: ReplySender) -> Self {
        Self {
            task_id,
            client,
            raw,
            envelope: None,
            route: None,
            state: RequestState::Created,
            interrupted: false,
            interrupt_reply: Reply::Empty,
            responded: false,
            sender,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        self.envelope.as_ref()
    }

    pub fn cmd(&self) -> Option<Cmd> {
        self.envelope.as_ref().map(|env| env.cmd)
    }

    /// Request body; empty until parsed.
    pub fn body(&self) -> &[u8] {
        self.envelope
            .as_ref()
            .map(|env| &env.body[..])
            .unwrap_or_default()
    }

    pub fn json<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(self.body())?)
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn blueprint(&self) -> Option<&str> {
        self.route.as_ref().and_then(Route::blueprint)
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn has_responded(&self) -> bool {
        self.responded
    }

    /// Skip the handler. The response becomes `data`, or nothing when
    /// `None` is given. Meant for before-request hooks.
    pub fn interrupt(&mut self, data: impl Into<Reply>) {
        self.interrupted = true;
        self.interrupt_reply = data.into();
        self.state = RequestState::Interrupted;
    }

    /// Encode `reply` against this request and send it upstream.
    pub fn write(&mut self, reply: impl Into<Reply>) -> Result<(), ReplyChannelClosed> {
        let Some(payload) = reply.into().encode(self.envelope.as_ref()) else {
            return Ok(());
        };
        self.sender.send_reply(self.task_id, payload)?;
        self.responded = true;
        Ok(())
    }

    pub fn parse(&mut self) -> Result<&Envelope, DecodeError> {
        match envelope::unpack(&self.raw) {
            Ok(env) => {
                self.state = RequestState::Parsed;
                Ok(&*self.envelope.insert(env))
            }
            Err(e) => {
                self.state = RequestState::Rejected;
                Err(e)
            }
        }
    }

    /// Match the parsed cmd against the application's route table.
    pub fn resolve(&mut self, app: &Application) -> Option<&Route> {
        let route = self.cmd().and_then(|cmd| app.resolve(cmd)).cloned();
        match route {
            Some(route) => {
                self.state = RequestState::Resolved;
                Some(&*self.route.insert(route))
            }
            None => {
                self.state = RequestState::Rejected;
                None
            }
        }
    }

    fn write_error(&mut self, code: ErrorCode, message: String) -> Result<(), ReplyChannelClosed> {
        let base = self.envelope.clone().unwrap_or_default();
        self.write(base.error_reply(code, message))
    }

    /// Run the whole pipeline for this request and signal completion.
    ///
    /// Only a closed reply channel is returned as an error: everything
    /// else ends in a reply on the same channel.
    pub async fn process(
        &mut self,
        app: &Application,
        task_timeout: Option<Duration>,
    ) -> Result<(), ReplyChannelClosed> {
        if let Err(e) = self.parse() {
            tracing::warn!(task_id = self.task_id, error = %e, "Dropping undecodable task");
            self.write_error(ErrorCode::DecodeError, e.to_string())?;
            return self.complete();
        }

        let Some(route) = self.resolve(app) else {
            let cmd = self.cmd().unwrap_or_default();
            tracing::debug!(task_id = self.task_id, cmd, "Unknown command");
            self.write_error(ErrorCode::UnknownCommand, format!("no route for cmd {}", cmd))?;
            return self.complete();
        };
        let handler = Arc::clone(route.handler());
        let blueprint = route.blueprint().map(str::to_owned);

        let mut error = None;
        for hook in app.before_request_hooks(blueprint.as_deref()) {
            match std::panic::catch_unwind(AssertUnwindSafe(|| hook(self))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error = Some(HandlerError::Hook(e));
                    break;
                }
                Err(panic) => {
                    error = Some(HandlerError::Panicked(panic_message(panic.as_ref())));
                    break;
                }
            }
            if self.interrupted {
                break;
            }
        }

        if error.is_none() && self.interrupted {
            let reply = std::mem::take(&mut self.interrupt_reply);
            self.write(reply)?;
        } else if error.is_none() {
            self.state = RequestState::Dispatched;
            let call = AssertUnwindSafe(handler.handle(self)).catch_unwind();
            let result = match task_timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Ok(Err(HandlerError::TimedOut(limit).into())),
                },
                None => call.await,
            };
            match result {
                Ok(Ok(reply)) if !self.responded => self.write(reply)?,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error = Some(match e.downcast::<HandlerError>() {
                        Ok(handler_error) => handler_error,
                        Err(e) => HandlerError::Failed(e),
                    })
                }
                Err(panic) => error = Some(HandlerError::Panicked(panic_message(panic.as_ref()))),
            }
        }

        if let Some(e) = &error {
            tracing::error!(
                task_id = self.task_id,
                cmd = self.cmd().unwrap_or_default(),
                error = %e,
                "Request failed"
            );
            self.write_error(e.code(), e.to_string())?;
        }

        for hook in app.after_request_hooks(blueprint.as_deref()) {
            let request = &*self;
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(request, error.as_ref()))) {
                tracing::error!(
                    task_id = self.task_id,
                    panic = %panic_message(panic.as_ref()),
                    "after_request hook panicked"
                );
            }
        }

        self.complete()
    }

    fn complete(&mut self) -> Result<(), ReplyChannelClosed> {
        if self.state != RequestState::Rejected {
            self.state = RequestState::Completed;
        }
        self.sender.send_idle(self.task_id)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{Blueprint, handler_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request_for(env: &Envelope) -> (Request, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let req = Request::new(
            1,
            ClientInfo::new(7, None),
            envelope::pack(env),
            ReplySender::new(tx),
        );
        (req, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Vec<WorkerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn reply_envelopes(msgs: &[WorkerMessage]) -> Vec<Envelope> {
        msgs.iter()
            .filter_map(|m| match m {
                WorkerMessage::Reply { payload, .. } => Some(envelope::unpack(payload).unwrap()),
                _ => None,
            })
            .collect()
    }

    fn echo_app() -> Application {
        Application::builder()
            .register(
                1,
                handler_fn(|req: &mut Request| Ok(Bytes::copy_from_slice(req.body()))),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn state_advances_through_parse_and_resolve() {
        let app = echo_app();
        let (mut req, _rx) = request_for(&Envelope::new(1, Bytes::new()));
        assert_eq!(req.state(), RequestState::Created);

        req.parse().unwrap();
        assert_eq!(req.state(), RequestState::Parsed);
        assert!(req.body().is_empty());

        assert!(req.resolve(&app).is_some());
        assert_eq!(req.state(), RequestState::Resolved);
    }

    #[test]
    fn unknown_cmd_is_rejected_not_panicking() {
        let app = echo_app();
        let (mut req, _rx) = request_for(&Envelope::new(99, Bytes::new()));
        req.parse().unwrap();
        assert!(req.resolve(&app).is_none());
        assert_eq!(req.state(), RequestState::Rejected);
    }

    #[test]
    fn reply_forms_encode_against_request() {
        let req = Envelope::new(4, &b"in"[..]).with_sn(9);

        let body = envelope::unpack(&Reply::body("out").encode(Some(&req)).unwrap()).unwrap();
        assert_eq!((body.cmd, body.sn, &body.body[..]), (4, 9, &b"out"[..]));

        let patch = Reply::from(ReplyPatch::new().cmd(5).ret(2))
            .encode(Some(&req))
            .unwrap();
        let patched = envelope::unpack(&patch).unwrap();
        assert_eq!((patched.cmd, patched.ret, patched.sn), (5, 2, 9));
        assert!(patched.body.is_empty());

        let raw = envelope::pack(&Envelope::new(77, &b"pre"[..]));
        assert_eq!(Reply::packed(raw.clone()).encode(Some(&req)), Some(raw));

        assert_eq!(Reply::Empty.encode(Some(&req)), None);
    }

    #[tokio::test]
    async fn process_writes_handler_return_then_idle() {
        let app = echo_app();
        let (mut req, mut rx) = request_for(&Envelope::new(1, &b"ping"[..]).with_sn(3));

        req.process(&app, None).await.unwrap();

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 2);
        let replies = reply_envelopes(&msgs);
        assert_eq!(&replies[0].body[..], b"ping");
        assert_eq!(replies[0].sn, 3);
        assert!(matches!(msgs[1], WorkerMessage::Idle { task_id: 1 }));
        assert_eq!(req.state(), RequestState::Completed);
    }

    #[tokio::test]
    async fn explicit_write_suppresses_return_value() {
        let app = Application::builder()
            .register(
                1,
                handler_fn(|req: &mut Request| {
                    req.write("first")?;
                    req.write("second")?;
                    Ok("ignored")
                }),
            )
            .build()
            .unwrap();
        let (mut req, mut rx) = request_for(&Envelope::new(1, Bytes::new()));

        req.process(&app, None).await.unwrap();

        let bodies: Vec<_> = reply_envelopes(&drain(&mut rx))
            .into_iter()
            .map(|e| e.body)
            .collect();
        assert_eq!(bodies, vec![Bytes::from("first"), Bytes::from("second")]);
    }

    #[tokio::test]
    async fn interrupt_skips_handler_and_replies_with_data() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let app = Application::builder()
            .before_request(|req: &mut Request| {
                req.interrupt("blocked");
                Ok(())
            })
            .register(
                1,
                handler_fn(move |_req: &mut Request| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("handled")
                }),
            )
            .build()
            .unwrap();
        let (mut req, mut rx) = request_for(&Envelope::new(1, Bytes::new()));

        req.process(&app, None).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(req.is_interrupted());
        let replies = reply_envelopes(&drain(&mut rx));
        assert_eq!(replies.len(), 1);
        assert_eq!(&replies[0].body[..], b"blocked");
    }

    #[tokio::test]
    async fn interrupt_without_payload_sends_only_idle() {
        let app = Application::builder()
            .before_request(|req: &mut Request| {
                req.interrupt(());
                Ok(())
            })
            .register(1, handler_fn(|_req: &mut Request| Ok("handled")))
            .build()
            .unwrap();
        let (mut req, mut rx) = request_for(&Envelope::new(1, Bytes::new()));

        req.process(&app, None).await.unwrap();

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], WorkerMessage::Idle { .. }));
    }

    #[tokio::test]
    async fn handler_error_becomes_error_reply() {
        let app = Application::builder()
            .register(
                1,
                handler_fn(|_req: &mut Request| -> anyhow::Result<()> {
                    anyhow::bail!("boom")
                }),
            )
            .build()
            .unwrap();
        let (mut req, mut rx) = request_for(&Envelope::new(1, &b"x"[..]));

        req.process(&app, None).await.unwrap();

        let replies = reply_envelopes(&drain(&mut rx));
        assert_eq!(replies[0].error_code(), Some(ErrorCode::HandlerError));
        assert!(replies[0].error_body().unwrap().message.contains("boom"));
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let app = Application::builder()
            .register(
                1,
                handler_fn(|_req: &mut Request| -> anyhow::Result<()> { panic!("kaput") }),
            )
            .build()
            .unwrap();
        let (mut req, mut rx) = request_for(&Envelope::new(1, Bytes::new()));

        req.process(&app, None).await.unwrap();

        let msgs = drain(&mut rx);
        let replies = reply_envelopes(&msgs);
        let body = replies[0].error_body().unwrap();
        assert_eq!(body.error, ErrorCode::HandlerError);
        assert!(body.message.contains("kaput"));
        assert!(matches!(msgs.last(), Some(WorkerMessage::Idle { .. })));
    }

    #[tokio::test]
    async fn hook_panics_are_contained() {
        let handled = Arc::new(AtomicUsize::new(0));
        let handler_seen = Arc::clone(&handled);
        let app = Application::builder()
            .before_request(|_req: &mut Request| -> anyhow::Result<()> { panic!("hook kaput") })
            .register(
                1,
                handler_fn(move |_req: &mut Request| {
                    handler_seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .build()
            .unwrap();
        let (mut req, mut rx) = request_for(&Envelope::new(1, Bytes::new()));

        req.process(&app, None).await.unwrap();

        let msgs = drain(&mut rx);
        let replies = reply_envelopes(&msgs);
        let body = replies[0].error_body().unwrap();
        assert_eq!(body.error, ErrorCode::HandlerError);
        assert!(body.message.contains("hook kaput"));
        assert!(matches!(msgs.last(), Some(WorkerMessage::Idle { .. })));
        assert_eq!(handled.load(Ordering::SeqCst), 0);

        let app = Application::builder()
            .after_request(|_req: &Request, _err: Option<&HandlerError>| panic!("after kaput"))
            .register(1, handler_fn(|_req: &mut Request| Ok("fine")))
            .build()
            .unwrap();
        let (mut req, mut rx) = request_for(&Envelope::new(1, Bytes::new()));

        req.process(&app, None).await.unwrap();

        let msgs = drain(&mut rx);
        assert_eq!(&reply_envelopes(&msgs)[0].body[..], b"fine");
        assert!(matches!(msgs.last(), Some(WorkerMessage::Idle { .. })));
    }

    #[tokio::test]
    async fn blueprint_hooks_only_run_for_their_routes() {
        let seen = Arc::new(AtomicUsize::new(0));
        let hook_seen = Arc::clone(&seen);
        let bp = Blueprint::new("admin")
            .before_request(move |_req: &mut Request| {
                hook_seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .register(20, handler_fn(|_req: &mut Request| Ok(())));
        let app = Application::builder()
            .register(1, handler_fn(|_req: &mut Request| Ok(())))
            .register_blueprint(bp)
            .build()
            .unwrap();

        let (mut plain, _rx1) = request_for(&Envelope::new(1, Bytes::new()));
        plain.process(&app, None).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let (mut scoped, _rx2) = request_for(&Envelope::new(20, Bytes::new()));
        scoped.process(&app, None).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(scoped.blueprint(), Some("admin"));
    }

    #[tokio::test]
    async fn garbage_payload_gets_decode_error_reply() {
        let app = echo_app();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut req = Request::new(
            2,
            ClientInfo::new(1, None),
            Bytes::from_static(b"not an envelope"),
            ReplySender::new(tx),
        );

        req.process(&app, None).await.unwrap();

        assert_eq!(req.state(), RequestState::Rejected);
        let replies = reply_envelopes(&drain(&mut rx));
        assert_eq!(replies[0].error_code(), Some(ErrorCode::DecodeError));
    }

    #[tokio::test]
    async fn closed_channel_surfaces_as_error() {
        let app = echo_app();
        let (mut req, rx) = request_for(&Envelope::new(1, Bytes::new()));
        drop(rx);
        assert!(req.process(&app, None).await.is_err());
    }
}
