use anyhow::Context as _;
use clap::Parser;
use lsp_types::request::Request as _;
use lsp_types::{
    ApplyWorkspaceEditParams, ApplyWorkspaceEditResponse, Position, Range, Url,
    VersionedTextDocumentIdentifier,
};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use stylelint_bridge::{
    dispatch::{AutofixDispatcher, Host, Session},
    document::Document,
    fixer::Fixer,
    lsp::{self, Client, ErrorCode, Message},
    settings::Settings,
};

mod logging {
    use log::{Level, Metadata, Record};

    pub static LOGGER: Logger = Logger;
    pub struct Logger;

    pub fn init(filter: log::LevelFilter) {
        log::set_logger(&LOGGER)
            .map(|_| log::set_max_level(filter))
            .expect("failed to set logger");
    }

    /// `STYLELINT_BRIDGE_LOG=debug` and friends; `info` otherwise.
    pub fn filter_from_env() -> log::LevelFilter {
        std::env::var("STYLELINT_BRIDGE_LOG")
            .ok()
            .and_then(|level| level.parse().ok())
            .unwrap_or(log::LevelFilter::Info)
    }

    // stdout is program output, so everything goes to stderr
    impl log::Log for Logger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                let color = match record.level() {
                    Level::Error => "\x1b[31m",
                    Level::Warn => "\x1b[33m",
                    Level::Info => "\x1b[34m",
                    Level::Debug => "\x1b[32m",
                    Level::Trace => "\x1b[90m",
                };
                eprintln!("{}{:5}\x1b[0m {}", color, record.level(), record.args());
            }
        }

        fn flush(&self) {}
    }
}

/// Quick fixes and worker-driven autofix for a single stylesheet.
#[derive(Parser, Debug)]
#[command(name = "stylelint-bridge", version)]
struct Args {
    /// JSON file holding the `stylelint` settings section
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Language id of the file; guessed from the extension by default
    #[arg(long)]
    language: Option<String>,

    /// Have the worker fix the whole file
    #[arg(long)]
    fix: bool,

    /// Write the fixed text back to the file instead of printing it
    #[arg(long, requires = "fix")]
    write: bool,

    file: PathBuf,

    /// Zero-based cursor line
    line: u32,

    /// Zero-based cursor column, in UTF-16 units
    character: u32,
}

/// The one open buffer, seen from the worker's side.
struct Editor {
    document: Mutex<Document>,
}

impl Editor {
    fn apply_edit(&self, client: &Client, params: serde_json::Value) -> ApplyWorkspaceEditResponse {
        let rejected = |reason: String| ApplyWorkspaceEditResponse {
            applied: false,
            failure_reason: Some(reason),
            failed_change: None,
        };

        let params: ApplyWorkspaceEditParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => return rejected(format!("invalid applyEdit params: {}", e)),
        };
        let mut document = match self.document.lock() {
            Ok(document) => document,
            Err(_) => return rejected("document lock poisoned".to_string()),
        };

        match document.apply_workspace_edit(&params.edit) {
            Ok(true) => {
                log::info!("applied worker edit, now at version {}", document.version);
                if let Err(e) = client.did_change(&document) {
                    log::warn!("failed to sync document: {:#}", e);
                }
                ApplyWorkspaceEditResponse {
                    applied: true,
                    failure_reason: None,
                    failed_change: None,
                }
            }
            Ok(false) => rejected("edit does not touch the open document".to_string()),
            Err(e) => {
                log::warn!("rejected worker edit: {}", e);
                rejected(e.to_string())
            }
        }
    }

    fn text(&self) -> anyhow::Result<String> {
        self.document
            .lock()
            .map(|document| document.text())
            .map_err(|_| anyhow::anyhow!("document lock poisoned"))
    }
}

impl Host for Editor {
    fn active_document(&self) -> Option<VersionedTextDocumentIdentifier> {
        let document = self.document.lock().ok()?;
        Some(VersionedTextDocumentIdentifier::new(
            document.uri.clone(),
            document.version,
        ))
    }

    fn show_error_message(&self, message: &str) {
        eprintln!("{}", message);
    }
}

fn serve_worker(rx: crossbeam_channel::Receiver<Message>, client: Client, editor: Arc<Editor>) {
    for msg in rx {
        let result = match msg {
            Message::Request(req) if req.method == lsp_types::request::ApplyWorkspaceEdit::METHOD => {
                let response = editor.apply_edit(&client, req.params);
                client.respond::<lsp_types::request::ApplyWorkspaceEdit>(req.id, response)
            }
            Message::Request(req) => {
                log::debug!("worker asked for unsupported {}", req.method);
                client.respond_error(
                    req.id,
                    ErrorCode::MethodNotFound,
                    format!("{} is not supported", req.method),
                )
            }
            Message::Notification(notif) => {
                match notif.method.as_ref() {
                    "window/showMessage" | "window/logMessage" => {
                        log::info!("worker: {}", notif.params["message"].as_str().unwrap_or(""))
                    }
                    "textDocument/publishDiagnostics" => log::info!(
                        "worker reported {} problem(s)",
                        notif.params["diagnostics"].as_array().map_or(0, Vec::len)
                    ),
                    method => log::trace!("ignoring {}", method),
                }
                Ok(())
            }
            Message::Response(resp) => {
                log::warn!("unexpected response {}", resp.id);
                Ok(())
            }
        };

        if let Err(e) = result {
            log::warn!("failed to answer worker: {:#}", e);
        }
    }
}

fn language_for(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or("plaintext", |ext| match ext {
            "css" | "pcss" | "postcss" => "css",
            "scss" => "scss",
            "sass" => "sass",
            "less" => "less",
            "sss" => "sugarss",
            "html" | "htm" => "html",
            other => other,
        })
        .to_string()
}

fn autofix(settings: &Settings, document: Document) -> anyhow::Result<String> {
    let (lsp, worker_rx) = lsp::start(&settings.server, settings.request_timeout())?;
    let client = lsp.client.clone();

    let root = document.uri.join(".").ok();
    client
        .initialize(root)?
        .recv()
        .context("worker went away during initialize")??;
    client.did_change_configuration(serde_json::json!({ "stylelint": settings }))?;
    client.did_open(&document)?;

    let editor = Arc::new(Editor {
        document: Mutex::new(document),
    });
    let server = {
        let client = client.clone();
        let editor = editor.clone();
        std::thread::Builder::new()
            .name("worker requests".to_string())
            .spawn(move || serve_worker(worker_rx, client, editor))?
    };

    let session = Session::new(editor.clone(), Arc::new(client.clone()));
    let dispatcher = AutofixDispatcher::new(session).with_command(&settings.autofix_command);
    let runtime = tokio::runtime::Builder::new_current_thread().build()?;
    let outcome = runtime.block_on(dispatcher.invoke());
    log::info!("{} finished: {:?}", stylelint_bridge::EXECUTE_AUTOFIX, outcome);

    match client.shutdown() {
        Ok(done) => {
            if done.recv_timeout(settings.request_timeout()).is_err() {
                log::warn!("worker did not acknowledge shutdown");
            }
        }
        Err(e) => log::warn!("failed to shut worker down: {:#}", e),
    }
    lsp.stop();
    if server.join().is_err() {
        log::error!("worker request thread panicked");
    }

    editor.text()
}

fn main() -> anyhow::Result<()> {
    logging::init(logging::filter_from_env());
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let path = args
        .file
        .canonicalize()
        .with_context(|| format!("cannot open {}", args.file.display()))?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let uri = Url::from_file_path(&path)
        .map_err(|_| anyhow::anyhow!("{} has no file uri", path.display()))?;
    let language = args.language.clone().unwrap_or_else(|| language_for(&path));
    let document = Document::new(uri, language, 1, &text);

    if !settings.selects(&document.uri, &document.language_id) {
        log::info!(
            "{} documents are not handled (languages: {:?})",
            document.language_id,
            settings.languages
        );
        return Ok(());
    }

    let cursor = Position::new(args.line, args.character);
    let actions = Fixer.code_actions(&document, Range::new(cursor, cursor));
    println!("{}", serde_json::to_string_pretty(&actions)?);

    if !args.fix {
        return Ok(());
    }
    if !settings.enable {
        log::info!("stylelint is disabled in settings, not starting the worker");
        return Ok(());
    }

    let fixed = autofix(&settings, document)?;
    if args.write {
        std::fs::write(&path, fixed).with_context(|| format!("failed to write {}", path.display()))?;
    } else {
        print!("{}", fixed);
    }

    Ok(())
}
