//! Client side of the connection to the stylelint worker.
//!
//! One thread reads frames off the worker's stdout, another owns the write
//! half and the table of pending requests. Everything else talks to that
//! thread through cheap [`Client`] handles.

mod transport;
mod types;

pub use types::{ErrorCode, Message, Notification, Request, RequestId, Response, ResponseError};

use crate::dispatch::{Pending, WorkerChannel};
use crate::document::Document;
use crate::settings::ServerSettings;
use anyhow::Context as _;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    borrow::Cow,
    io::{BufRead, BufReader, Read, Write},
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};
use transport::Transport;

type ResponseCallback = Box<dyn FnOnce(&Client, anyhow::Result<serde_json::Value>) + Send>;

pub struct Lsp {
    thread: Option<std::thread::JoinHandle<()>>,
    process: Option<Child>,
    pub client: Client,
}

impl Lsp {
    /// Stops the dispatch thread and reaps the worker process.
    ///
    /// Send `shutdown`/`exit` through [`Client::shutdown`] first, or the
    /// worker gets killed once [`EXIT_GRACE`] runs out.
    pub fn stop(mut self) {
        let _ = self.client.sender.send(ClientMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("worker dispatch thread panicked");
            }
        }

        if let Some(mut process) = self.process.take() {
            if let Err(e) = reap(&mut process, EXIT_GRACE) {
                log::warn!("failed to reap worker: {}", e);
            }
        }
    }
}

/// How long a worker gets to exit after `exit` before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

fn reap(process: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = process.try_wait()? {
            log::debug!("worker exited with {}", status);
            return Ok(status);
        }
        if Instant::now() >= deadline {
            log::warn!("worker still running after {:?}, killing it", grace);
            process.kill()?;
            return process.wait();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Spawns the worker and connects to it over its stdio.
pub fn start(
    server: &ServerSettings,
    timeout: Duration,
) -> anyhow::Result<(Lsp, crossbeam_channel::Receiver<Message>)> {
    let mut process = Command::new(&server.command)
        .args(&server.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to start worker `{}`", server.command))?;

    let stdin = process.stdin.take().context("worker stdin not captured")?;
    let stdout = process.stdout.take().context("worker stdout not captured")?;
    let stderr = process.stderr.take().context("worker stderr not captured")?;

    std::thread::Builder::new()
        .name("worker stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => log::debug!("worker stderr: {}", line),
                    Err(_) => break,
                }
            }
        })
        .context("failed to spawn worker stderr thread")?;

    let (mut lsp, rx) = connect(stdout, stdin, timeout)?;
    lsp.process = Some(process);
    Ok((lsp, rx))
}

/// Runs the client over an already established stream.
///
/// Requests and notifications from the worker arrive on the returned
/// receiver.
pub fn connect<R, W>(
    reader: R,
    writer: W,
    timeout: Duration,
) -> anyhow::Result<(Lsp, crossbeam_channel::Receiver<Message>)>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (transport, server_rx) = Transport::start(reader, writer)?;
    let (tx, client_rx) = crossbeam_channel::unbounded::<ClientMessage>();
    let (client_tx, rx) = crossbeam_channel::unbounded::<Message>();

    let client = Client { sender: tx };

    let mut ctx = Context {
        transport,
        handle: client.clone(),
        request_counter: 0,
        timeout,
        pending_requests: Vec::new(),
    };

    let thread = std::thread::Builder::new()
        .name("worker dispatch".to_string())
        .spawn(move || {
            loop {
                let timer = match ctx.next_deadline() {
                    Some(deadline) => crossbeam_channel::at(deadline),
                    None => crossbeam_channel::never(),
                };

                crossbeam_channel::select! {
                    recv(client_rx) -> msg => match msg {
                        Ok(msg) => match ctx.process_client_message(msg) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => log::error!("worker: failed to send: {:#}", e),
                        },
                        Err(_) => break,
                    },
                    recv(server_rx) -> msg => match msg {
                        Ok(msg) => {
                            if let Err(e) = ctx.process_server_message(&client_tx, msg) {
                                log::warn!("worker: {:#}", e);
                            }
                        }
                        Err(_) => break,
                    },
                    recv(timer) -> _ => ctx.expire_requests(Instant::now()),
                }
            }
            ctx.fail_pending("worker connection closed");
        })
        .context("failed to spawn worker dispatch thread")?;

    let lsp = Lsp {
        thread: Some(thread),
        process: None,
        client,
    };

    Ok((lsp, rx))
}

#[derive(Clone)]
pub struct Client {
    sender: crossbeam_channel::Sender<ClientMessage>,
}

impl Client {
    pub fn request<R, F>(&self, params: R::Params, callback: F) -> anyhow::Result<()>
    where
        R: lsp_types::request::Request + 'static,
        R::Params: Serialize,
        R::Result: DeserializeOwned,
        F: Send + FnOnce(&Self, anyhow::Result<R::Result>) + 'static,
    {
        let method = R::METHOD.into();
        let params = serde_json::to_value(params)?;

        let callback = Box::new(
            move |ctx: &Client, response: anyhow::Result<serde_json::Value>| {
                let response = response.and_then(|res| {
                    serde_json::from_value(res)
                        .with_context(|| format!("unexpected result for {}", R::METHOD))
                });
                callback(ctx, response);
            },
        );

        let msg = ClientMessage::Request {
            method,
            params,
            callback,
        };

        self.sender
            .send(msg)
            .map_err(|_| anyhow::anyhow!("worker connection closed"))?;
        Ok(())
    }

    pub fn notify<N: lsp_types::notification::Notification>(
        &self,
        params: N::Params,
    ) -> anyhow::Result<()>
    where
        N::Params: Serialize,
    {
        let method = N::METHOD.into();
        let params = serde_json::to_value(params)?;
        let notification = Notification { method, params };
        self.send(ClientMessage::Notification(notification))
    }

    pub fn respond<R: lsp_types::request::Request>(
        &self,
        id: RequestId,
        result: R::Result,
    ) -> anyhow::Result<()>
    where
        R::Result: Serialize,
    {
        let result = serde_json::to_value(result)?;
        let response = Response {
            id,
            result: Some(result),
            error: None,
        };
        self.send(ClientMessage::Response(response))
    }

    pub fn respond_error(
        &self,
        id: RequestId,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> anyhow::Result<()> {
        let response = Response {
            id,
            result: None,
            error: Some(ResponseError::new(code, message)),
        };
        self.send(ClientMessage::Response(response))
    }

    /// Sends `initialize`, then `initialized` once the worker answers.
    pub fn initialize(
        &self,
        root_uri: Option<lsp_types::Url>,
    ) -> anyhow::Result<oneshot::Receiver<anyhow::Result<lsp_types::InitializeResult>>> {
        #[allow(deprecated)]
        let initialize = lsp_types::InitializeParams {
            process_id: Some(std::process::id()),
            root_path: None,
            root_uri,
            initialization_options: None,
            capabilities: lsp_types::ClientCapabilities {
                workspace: Some(lsp_types::WorkspaceClientCapabilities {
                    apply_edit: Some(true),
                    ..Default::default()
                }),
                text_document: None,
                window: None,
                general: None,
                experimental: None,
            },
            trace: None,
            workspace_folders: None,
            client_info: Some(lsp_types::ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            locale: None,
        };

        let (tx, rx) = oneshot::channel();
        self.request::<lsp_types::request::Initialize, _>(initialize, move |ctx, resp| {
            if resp.is_ok() {
                if let Err(e) = ctx
                    .notify::<lsp_types::notification::Initialized>(lsp_types::InitializedParams {})
                {
                    log::error!("failed to send initialized: {:#}", e);
                }
            }
            let _ = tx.send(resp);
        })?;

        Ok(rx)
    }

    /// Sends `shutdown`, then `exit` once the worker acknowledges it.
    pub fn shutdown(&self) -> anyhow::Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.request::<lsp_types::request::Shutdown, _>((), move |ctx, resp| {
            if let Err(e) = resp {
                log::warn!("worker refused shutdown: {:#}", e);
            }
            if let Err(e) = ctx.notify::<lsp_types::notification::Exit>(()) {
                log::warn!("failed to send exit: {:#}", e);
            }
            let _ = tx.send(());
        })?;
        Ok(rx)
    }

    pub fn did_open(&self, document: &Document) -> anyhow::Result<()> {
        self.notify::<lsp_types::notification::DidOpenTextDocument>(
            lsp_types::DidOpenTextDocumentParams {
                text_document: lsp_types::TextDocumentItem {
                    uri: document.uri.clone(),
                    language_id: document.language_id.clone(),
                    version: document.version,
                    text: document.text(),
                },
            },
        )
    }

    /// Full-text sync of the document's current state.
    pub fn did_change(&self, document: &Document) -> anyhow::Result<()> {
        self.notify::<lsp_types::notification::DidChangeTextDocument>(
            lsp_types::DidChangeTextDocumentParams {
                text_document: lsp_types::VersionedTextDocumentIdentifier::new(
                    document.uri.clone(),
                    document.version,
                ),
                content_changes: vec![lsp_types::TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text: document.text(),
                }],
            },
        )
    }

    pub fn did_change_configuration(&self, settings: serde_json::Value) -> anyhow::Result<()> {
        self.notify::<lsp_types::notification::DidChangeConfiguration>(
            lsp_types::DidChangeConfigurationParams { settings },
        )
    }

    fn send(&self, msg: ClientMessage) -> anyhow::Result<()> {
        self.sender
            .send(msg)
            .map_err(|_| anyhow::anyhow!("worker connection closed"))
    }
}

impl WorkerChannel for Client {
    fn execute(&self, params: lsp_types::ExecuteCommandParams) -> anyhow::Result<Pending> {
        let (tx, rx) = oneshot::channel();
        self.request::<lsp_types::request::ExecuteCommand, _>(params, move |_, resp| {
            let _ = tx.send(resp);
        })?;
        Ok(rx)
    }
}

struct PendingRequest {
    id: u64,
    method: Cow<'static, str>,
    deadline: Instant,
    callback: ResponseCallback,
}

struct Context {
    transport: Transport,
    handle: Client,
    request_counter: u64,
    timeout: Duration,
    pending_requests: Vec<PendingRequest>,
}

impl Context {
    fn next_request_id(&mut self) -> u64 {
        let id = self.request_counter;
        self.request_counter += 1;
        id
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending_requests.iter().map(|req| req.deadline).min()
    }

    fn process_client_message(&mut self, msg: ClientMessage) -> anyhow::Result<bool> {
        match msg {
            ClientMessage::Request {
                method,
                params,
                callback,
            } => {
                let id = self.next_request_id();
                log::debug!("worker <- request {} {}", id, method);
                let request = Request {
                    id: id.into(),
                    method: method.clone(),
                    params,
                };
                if let Err(e) = self.transport.send(Message::Request(request)) {
                    callback(&self.handle, Err(e.context(format!("failed to send {}", method))));
                    return Ok(true);
                }
                self.pending_requests.push(PendingRequest {
                    id,
                    method,
                    deadline: Instant::now() + self.timeout,
                    callback,
                });
            }
            ClientMessage::Response(resp) => self.transport.send(Message::Response(resp))?,
            ClientMessage::Notification(notif) => {
                self.transport.send(Message::Notification(notif))?
            }
            ClientMessage::Shutdown => return Ok(false),
        }

        Ok(true)
    }

    fn process_server_message(
        &mut self,
        client_tx: &crossbeam_channel::Sender<Message>,
        msg: Message,
    ) -> anyhow::Result<()> {
        match msg {
            Message::Request(_) | Message::Notification(_) => {
                client_tx.send(msg)?;
            }
            Message::Response(resp) => {
                let index = match resp.id {
                    RequestId::Number(id) => self
                        .pending_requests
                        .binary_search_by_key(&id, |req| req.id)
                        .ok(),
                    RequestId::String(_) => None,
                };
                let index = match index {
                    Some(index) => index,
                    None => anyhow::bail!("no pending request for response {}", resp.id),
                };
                let req = self.pending_requests.remove(index);

                let result = match resp.error {
                    Some(err) => Err(anyhow::anyhow!("{} failed: {}", req.method, err)),
                    None => Ok(resp.result.unwrap_or(serde_json::Value::Null)),
                };
                log::debug!("worker -> response {} ({})", req.id, req.method);

                (req.callback)(&self.handle, result);
            }
        }

        Ok(())
    }

    fn expire_requests(&mut self, now: Instant) {
        let (expired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_requests)
            .into_iter()
            .partition(|req| req.deadline <= now);
        self.pending_requests = pending;

        for req in expired {
            log::warn!("worker: request {} ({}) timed out", req.id, req.method);
            (req.callback)(
                &self.handle,
                Err(anyhow::anyhow!("{} timed out after {:?}", req.method, self.timeout)),
            );
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for req in std::mem::take(&mut self.pending_requests) {
            (req.callback)(&self.handle, Err(anyhow::anyhow!("{}: {}", req.method, reason)));
        }
    }
}

enum ClientMessage {
    Shutdown,
    Request {
        method: Cow<'static, str>,
        params: serde_json::Value,
        callback: ResponseCallback,
    },
    Notification(Notification),
    Response(Response),
}
