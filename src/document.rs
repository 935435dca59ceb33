use crate::Edit;
use lsp_types::{
    DocumentChangeOperation, DocumentChanges, OneOf, Position, Range, TextDocumentEdit, TextEdit,
    Url, WorkspaceEdit,
};
use ropey::Rope;
use std::borrow::Cow;

/// The slice of the editor's document model the fixer needs.
pub trait TextSource {
    fn uri(&self) -> &Url;
    fn version(&self) -> i32;
    /// Text of `line` without its terminator, or `None` past the last line.
    fn line_at(&self, line: u32) -> Option<Cow<'_, str>>;
    fn range_text(&self, range: Range) -> Option<String>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("position {line}:{character} is outside the document")]
    OutOfRange { line: u32, character: u32 },
    #[error("edit range ends before it starts")]
    Inverted,
    #[error("edit targets {0}, not this document")]
    WrongDocument(Url),
    #[error("edit expects version {expected}, document is at {actual}")]
    VersionMismatch { expected: i32, actual: i32 },
    #[error("edits overlap")]
    Overlapping,
}

/// An open buffer.
#[derive(Debug, Clone)]
pub struct Document {
    pub uri: Url,
    pub language_id: String,
    /// Bumped once per applied edit batch.
    pub version: i32,
    pub content: Rope,
}

impl Document {
    pub fn new(uri: Url, language_id: impl Into<String>, version: i32, text: &str) -> Self {
        Self {
            uri,
            language_id: language_id.into(),
            version,
            content: Rope::from_str(text),
        }
    }

    pub fn text(&self) -> String {
        self.content.to_string()
    }

    pub fn apply(&mut self, edit: &Edit) -> Result<(), EditError> {
        if edit.uri != self.uri {
            return Err(EditError::WrongDocument(edit.uri.clone()));
        }

        self.apply_text_edits(&[TextEdit::new(edit.range, edit.new_text.clone())])
    }

    /// Applies a batch of non-overlapping edits, all or nothing.
    pub fn apply_text_edits(&mut self, edits: &[TextEdit]) -> Result<(), EditError> {
        let mut resolved = edits
            .iter()
            .map(|edit| Ok((self.char_range(edit.range)?, edit.new_text.as_str())))
            .collect::<Result<Vec<_>, EditError>>()?;

        resolved.sort_by_key(|((start, end), _)| (*start, *end));
        if resolved.windows(2).any(|pair| pair[0].0 .1 > pair[1].0 .0) {
            return Err(EditError::Overlapping);
        }

        for ((start, end), text) in resolved.into_iter().rev() {
            self.content.remove(start..end);
            self.content.insert(start, text);
        }
        self.version += 1;

        Ok(())
    }

    /// Applies the parts of `edit` that target this document.
    ///
    /// Versioned edits built against another version of the document are
    /// rejected as a whole. Returns `false` if nothing addressed this document.
    pub fn apply_workspace_edit(&mut self, edit: &WorkspaceEdit) -> Result<bool, EditError> {
        let mut edits: Vec<TextEdit> = Vec::new();

        if let Some(changes) = &edit.changes {
            if let Some(text_edits) = changes.get(&self.uri) {
                edits.extend(text_edits.iter().cloned());
            }
        }

        let document_edits: Vec<&TextDocumentEdit> = match &edit.document_changes {
            Some(DocumentChanges::Edits(doc_edits)) => doc_edits.iter().collect(),
            Some(DocumentChanges::Operations(ops)) => ops
                .iter()
                .filter_map(|op| match op {
                    DocumentChangeOperation::Edit(edit) => Some(edit),
                    DocumentChangeOperation::Op(_) => None,
                })
                .collect(),
            None => Vec::new(),
        };

        for doc_edit in document_edits {
            if doc_edit.text_document.uri != self.uri {
                continue;
            }
            if let Some(expected) = doc_edit.text_document.version {
                if expected != self.version {
                    return Err(EditError::VersionMismatch {
                        expected,
                        actual: self.version,
                    });
                }
            }
            edits.extend(doc_edit.edits.iter().map(|edit| match edit {
                OneOf::Left(edit) => edit.clone(),
                OneOf::Right(annotated) => annotated.text_edit.clone(),
            }));
        }

        if edits.is_empty() {
            return Ok(false);
        }

        self.apply_text_edits(&edits)?;
        Ok(true)
    }

    fn char_range(&self, range: Range) -> Result<(usize, usize), EditError> {
        let start = self.char_index(range.start)?;
        let end = self.char_index(range.end)?;
        if end < start {
            return Err(EditError::Inverted);
        }
        Ok((start, end))
    }

    fn char_index(&self, position: Position) -> Result<usize, EditError> {
        let out_of_range = EditError::OutOfRange {
            line: position.line,
            character: position.character,
        };
        let line = self.line_at(position.line).ok_or(out_of_range.clone())?;
        let offset = char_offset(&line, position.character).ok_or(out_of_range)?;
        Ok(self.content.line_to_char(position.line as usize) + offset)
    }
}

impl TextSource for Document {
    fn uri(&self) -> &Url {
        &self.uri
    }

    fn version(&self) -> i32 {
        self.version
    }

    // ropey is built with `cr_lines` only, so lines split exactly where LSP
    // splits them
    fn line_at(&self, line: u32) -> Option<Cow<'_, str>> {
        let line = line as usize;
        if line >= self.content.len_lines() {
            return None;
        }

        let text = Cow::from(self.content.line(line));
        let trimmed = text.trim_end_matches(&['\n', '\r'][..]).len();
        Some(match text {
            Cow::Borrowed(s) => Cow::Borrowed(&s[..trimmed]),
            Cow::Owned(mut s) => {
                s.truncate(trimmed);
                Cow::Owned(s)
            }
        })
    }

    fn range_text(&self, range: Range) -> Option<String> {
        let (start, end) = self.char_range(range).ok()?;
        Some(self.content.slice(start..end).to_string())
    }
}

/// Converts a UTF-16 column into a char offset within `line`.
///
/// `None` if the column is past the end of the line or lands inside a
/// surrogate pair.
pub fn char_offset(line: &str, character: u32) -> Option<usize> {
    let target = character as usize;
    let mut units = 0;
    for (index, ch) in line.chars().enumerate() {
        if units == target {
            return Some(index);
        }
        units += ch.len_utf16();
        if units > target {
            return None;
        }
    }
    (units == target).then(|| line.chars().count())
}

/// Length of `line` in UTF-16 code units.
pub fn utf16_len(line: &str) -> u32 {
    line.chars().map(|ch| ch.len_utf16() as u32).sum()
}
