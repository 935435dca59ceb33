//! The `stylelint.executeAutofix` command.
//!
//! Invoking the command asks the worker to fix the focused document. The
//! worker edits the buffer itself (through `workspace/applyEdit`), so all that
//! happens here is building the request, waiting for the answer and telling the
//! user when it did not work out.

use crate::CommandRequest;
use lsp_types::{ExecuteCommandParams, VersionedTextDocumentIdentifier};
use std::sync::Arc;

/// Shown for every failed autofix, whatever went wrong.
pub const AUTOFIX_FAILED: &str = "Failed to apply stylelint fixes to the document. \
    Please consider opening an issue with steps to reproduce.";

/// Resolves once the worker answers, times out or goes away.
pub type Pending = oneshot::Receiver<anyhow::Result<Option<serde_json::Value>>>;

/// Request/response transport to the worker.
pub trait WorkerChannel: Send + Sync {
    fn execute(&self, params: ExecuteCommandParams) -> anyhow::Result<Pending>;
}

/// What the dispatcher needs from the editor.
pub trait Host: Send + Sync {
    /// The focused document with its current version.
    fn active_document(&self) -> Option<VersionedTextDocumentIdentifier>;
    fn show_error_message(&self, message: &str);
}

/// Per editor session; outlives every request made through it.
#[derive(Clone)]
pub struct Session {
    pub host: Arc<dyn Host>,
    pub worker: Arc<dyn WorkerChannel>,
}

impl Session {
    pub fn new(host: Arc<dyn Host>, worker: Arc<dyn WorkerChannel>) -> Self {
        Self { host, worker }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was focused, nothing was sent.
    NoDocument,
    Applied,
    /// The user has been notified.
    Failed,
}

pub struct AutofixDispatcher {
    session: Session,
    command: String,
}

impl AutofixDispatcher {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            command: crate::APPLY_AUTOFIX.to_string(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// Never fails: errors end up in front of the user, not the caller.
    ///
    /// Concurrent invocations are not serialized. Each request carries the
    /// version it was built from, so the worker's edits for an outdated
    /// version are refused where they are applied.
    pub async fn invoke(&self) -> Outcome {
        let document = match self.session.host.active_document() {
            Some(document) => document,
            None => {
                log::debug!("autofix: no active document");
                return Outcome::NoDocument;
            }
        };

        let uri = document.uri.clone();
        let version = document.version;
        log::debug!("autofix: {} at version {}", uri, version);

        match self.send(CommandRequest::new(&self.command, document)).await {
            Ok(_) => Outcome::Applied,
            Err(err) => {
                log::error!("autofix of {} (version {}) failed: {:#}", uri, version, err);
                self.session.host.show_error_message(AUTOFIX_FAILED);
                Outcome::Failed
            }
        }
    }

    async fn send(&self, request: CommandRequest) -> anyhow::Result<Option<serde_json::Value>> {
        let pending = self.session.worker.execute(request.into())?;
        pending
            .await
            .map_err(|_| anyhow::anyhow!("worker dropped the request"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::Url;
    use serde_json::json;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeHost {
        document: Option<Url>,
        version: AtomicI32,
        messages: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn with_document(uri: &str, version: i32) -> Self {
            Self {
                document: Some(Url::parse(uri).unwrap()),
                version: AtomicI32::new(version),
                messages: Mutex::default(),
            }
        }

        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl Host for FakeHost {
        fn active_document(&self) -> Option<VersionedTextDocumentIdentifier> {
            let uri = self.document.clone()?;
            Some(VersionedTextDocumentIdentifier::new(
                uri,
                self.version.load(Ordering::SeqCst),
            ))
        }

        fn show_error_message(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    enum Reply {
        Succeed,
        Reject,
        Hang,
        Unreachable,
        Hold,
    }

    type Responder = oneshot::Sender<anyhow::Result<Option<serde_json::Value>>>;

    struct FakeWorker {
        reply: Reply,
        requests: Mutex<Vec<ExecuteCommandParams>>,
        held: Mutex<Vec<Responder>>,
    }

    impl FakeWorker {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                requests: Mutex::default(),
                held: Mutex::default(),
            }
        }

        fn requests(&self) -> Vec<ExecuteCommandParams> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl WorkerChannel for FakeWorker {
        fn execute(&self, params: ExecuteCommandParams) -> anyhow::Result<Pending> {
            if let Reply::Unreachable = self.reply {
                anyhow::bail!("worker is not running");
            }
            self.requests.lock().unwrap().push(params);

            let (tx, rx) = oneshot::channel();
            match self.reply {
                Reply::Succeed => drop(tx.send(Ok(None))),
                Reply::Reject => drop(tx.send(Err(anyhow::anyhow!("-32603 InternalError")))),
                Reply::Hang => drop(tx),
                Reply::Hold => self.held.lock().unwrap().push(tx),
                Reply::Unreachable => unreachable!(),
            }
            Ok(rx)
        }
    }

    fn dispatcher(host: &Arc<FakeHost>, worker: &Arc<FakeWorker>) -> AutofixDispatcher {
        AutofixDispatcher::new(Session::new(host.clone(), worker.clone()))
    }

    #[tokio::test]
    async fn no_active_document_sends_nothing() {
        let host = Arc::new(FakeHost::default());
        let worker = Arc::new(FakeWorker::new(Reply::Succeed));

        assert_eq!(dispatcher(&host, &worker).invoke().await, Outcome::NoDocument);
        assert!(worker.requests().is_empty());
        assert!(host.messages().is_empty());
    }

    #[tokio::test]
    async fn success_is_silent() {
        let host = Arc::new(FakeHost::with_document("file:///a.css", 3));
        let worker = Arc::new(FakeWorker::new(Reply::Succeed));

        let outcome = dispatcher(&host, &worker).with_command("autofix").invoke().await;

        assert_eq!(outcome, Outcome::Applied);
        assert!(host.messages().is_empty());
        let requests = worker.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].command, "autofix");
        assert_eq!(
            requests[0].arguments,
            vec![json!({ "uri": "file:///a.css", "version": 3 })]
        );
    }

    #[tokio::test]
    async fn every_kind_of_failure_notifies_once() {
        for reply in [Reply::Reject, Reply::Hang, Reply::Unreachable] {
            let host = Arc::new(FakeHost::with_document("file:///a.css", 3));
            let worker = Arc::new(FakeWorker::new(reply));

            assert_eq!(dispatcher(&host, &worker).invoke().await, Outcome::Failed);
            assert_eq!(host.messages(), vec![AUTOFIX_FAILED.to_string()]);
        }
    }

    #[tokio::test]
    async fn default_command_is_apply_autofix() {
        let host = Arc::new(FakeHost::with_document("file:///a.css", 1));
        let worker = Arc::new(FakeWorker::new(Reply::Succeed));

        dispatcher(&host, &worker).invoke().await;
        assert_eq!(worker.requests()[0].command, "stylelint.applyAutoFix");
    }

    #[tokio::test]
    async fn overlapping_invocations_each_pin_their_version() {
        let host = Arc::new(FakeHost::with_document("file:///a.css", 1));
        let worker = Arc::new(FakeWorker::new(Reply::Hold));
        let dispatcher = dispatcher(&host, &worker);

        let release = async {
            while worker.held.lock().unwrap().len() < 2 {
                tokio::task::yield_now().await;
            }
            let held: Vec<_> = worker.held.lock().unwrap().drain(..).collect();
            for tx in held.into_iter().rev() {
                let _ = tx.send(Ok(None));
            }
        };
        let second = async {
            host.version.store(2, Ordering::SeqCst);
            dispatcher.invoke().await
        };

        let (first, second, ()) = tokio::join!(dispatcher.invoke(), second, release);

        assert_eq!((first, second), (Outcome::Applied, Outcome::Applied));
        let versions: Vec<_> = worker
            .requests()
            .iter()
            .map(|r| r.arguments[0]["version"].clone())
            .collect();
        assert_eq!(versions, vec![json!(1), json!(2)]);
        assert!(host.messages().is_empty());
    }
}
