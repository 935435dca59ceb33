pub mod dispatch;
pub mod document;
pub mod fixer;
pub mod lsp;
pub mod settings;

use lsp_types::{ExecuteCommandParams, Range, Url, VersionedTextDocumentIdentifier};

/// Command the worker registers for fixing a whole document.
pub const APPLY_AUTOFIX: &str = "stylelint.applyAutoFix";

/// Command exposed to the editor's command palette.
pub const EXECUTE_AUTOFIX: &str = "stylelint.executeAutofix";

/// Replace the text spanning `range` in `uri` with `new_text`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edit {
    pub uri: Url,
    pub range: Range,
    pub new_text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommandRef {
    pub name: String,
    pub title: String,
    pub args: Vec<serde_json::Value>,
}

/// A command addressed to the worker, pinned to the document versions it was
/// built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub arguments: Vec<VersionedTextDocumentIdentifier>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, document: VersionedTextDocumentIdentifier) -> Self {
        Self {
            command: command.into(),
            arguments: vec![document],
        }
    }
}

impl From<CommandRequest> for ExecuteCommandParams {
    fn from(request: CommandRequest) -> Self {
        let arguments = request
            .arguments
            .into_iter()
            .map(|doc| serde_json::json!({ "uri": doc.uri, "version": doc.version }))
            .collect();

        ExecuteCommandParams {
            command: request.command,
            arguments,
            work_done_progress_params: Default::default(),
        }
    }
}
