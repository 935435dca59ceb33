//! Quick fixes offered at the cursor.
//!
//! Every eligible position gets the same static list: one edit per catalog
//! entry, in catalog order, followed by a "learn more" command. Nothing is
//! ranked at runtime and the document is only read.

use crate::document::{char_offset, TextSource};
use crate::{CommandRef, Edit};
use lsp_types::{CodeAction, CodeActionKind, Command, Position, Range, TextEdit, WorkspaceEdit};
use std::collections::HashMap;

/// Opens the emoji reference in the editor's browser.
pub const LEARN_MORE: &str = "learn-more";

const EMOJI_CHARTS: &str = "https://unicode.org/emoji/charts/full-emoji-list.html";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Emoji {
    SmileyCat,
    Smiley,
    PileOfPoo,
}

/// Replacement values in the order they are offered.
pub const CATALOG: [Emoji; 3] = [Emoji::SmileyCat, Emoji::Smiley, Emoji::PileOfPoo];

impl Emoji {
    pub fn value(self) -> &'static str {
        match self {
            Emoji::SmileyCat => "😺",
            Emoji::Smiley => "😀",
            Emoji::PileOfPoo => "💩",
        }
    }

    pub fn is_preferred(self) -> bool {
        matches!(self, Emoji::Smiley)
    }

    /// Width, in UTF-16 units, of the token this entry replaces.
    pub fn token_width(self) -> u32 {
        match self {
            Emoji::SmileyCat | Emoji::Smiley | Emoji::PileOfPoo => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateKind {
    QuickFix,
    Empty,
}

impl From<CandidateKind> for CodeActionKind {
    fn from(kind: CandidateKind) -> Self {
        match kind {
            CandidateKind::QuickFix => CodeActionKind::QUICKFIX,
            CandidateKind::Empty => CodeActionKind::EMPTY,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Edit(Edit),
    Command(CommandRef),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub label: String,
    pub kind: CandidateKind,
    pub action: Action,
    pub preferred: bool,
}

impl Candidate {
    pub fn edit(&self) -> Option<&Edit> {
        match &self.action {
            Action::Edit(edit) => Some(edit),
            Action::Command(_) => None,
        }
    }

    pub fn command(&self) -> Option<&CommandRef> {
        match &self.action {
            Action::Command(command) => Some(command),
            Action::Edit(_) => None,
        }
    }
}

impl From<Candidate> for CodeAction {
    fn from(candidate: Candidate) -> Self {
        let (edit, command) = match candidate.action {
            Action::Edit(edit) => {
                let changes = HashMap::from([(
                    edit.uri,
                    vec![TextEdit::new(edit.range, edit.new_text)],
                )]);
                (Some(WorkspaceEdit::new(changes)), None)
            }
            Action::Command(command) => (
                None,
                Some(Command::new(command.title, command.name, Some(command.args))),
            ),
        };

        CodeAction {
            title: candidate.label,
            kind: Some(candidate.kind.into()),
            diagnostics: None,
            edit,
            command,
            is_preferred: candidate.preferred.then(|| true),
            disabled: None,
            data: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Fixer;

impl Fixer {
    pub fn provided_kinds() -> Vec<CodeActionKind> {
        vec![CodeActionKind::QUICKFIX]
    }

    pub fn provide_actions(&self, document: &impl TextSource, range: Range) -> Vec<Candidate> {
        if !self.is_eligible(document, range) {
            return Vec::new();
        }

        let mut actions: Vec<Candidate> = CATALOG
            .iter()
            .map(|emoji| self.create_fix(document, range, *emoji))
            .collect();
        actions.push(self.create_command());
        actions
    }

    /// [`Fixer::provide_actions`] in wire form.
    pub fn code_actions(&self, document: &impl TextSource, range: Range) -> Vec<CodeAction> {
        self.provide_actions(document, range)
            .into_iter()
            .map(CodeAction::from)
            .collect()
    }

    /// The range must sit inside the document and the widest catalog token
    /// must fit on the start line.
    fn is_eligible(&self, document: &impl TextSource, range: Range) -> bool {
        let (start, end) = (range.start, range.end);
        if (end.line, end.character) < (start.line, start.character) {
            return false;
        }

        let in_bounds = |pos: Position| {
            document
                .line_at(pos.line)
                .map_or(false, |line| char_offset(&line, pos.character).is_some())
        };
        if !in_bounds(start) || !in_bounds(end) {
            return false;
        }

        let width = CATALOG.iter().map(|emoji| emoji.token_width()).max().unwrap_or(0);
        in_bounds(Position::new(start.line, start.character + width))
    }

    fn create_fix(&self, document: &impl TextSource, range: Range, emoji: Emoji) -> Candidate {
        let start = range.start;
        let end = Position::new(start.line, start.character + emoji.token_width());

        Candidate {
            label: format!("Convert to {}", emoji.value()),
            kind: CandidateKind::QuickFix,
            action: Action::Edit(Edit {
                uri: document.uri().clone(),
                range: Range::new(start, end),
                new_text: emoji.value().to_string(),
            }),
            preferred: emoji.is_preferred(),
        }
    }

    fn create_command(&self) -> Candidate {
        Candidate {
            label: "Learn more...".to_string(),
            kind: CandidateKind::Empty,
            action: Action::Command(CommandRef {
                name: LEARN_MORE.to_string(),
                title: "Learn more about emojis".to_string(),
                args: vec![serde_json::Value::from(EMOJI_CHARTS)],
            }),
            preferred: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use lsp_types::Url;
    use proptest::prelude::*;

    fn doc(text: &str) -> Document {
        Document::new(Url::parse("file:///a.css").unwrap(), "css", 3, text)
    }

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> Range {
        Range::new(Position::new(sl, sc), Position::new(el, ec))
    }

    #[test]
    fn token_at_offset_five_gets_catalog_then_command() {
        let doc = doc("html :) { }");
        let actions = Fixer.provide_actions(&doc, range(0, 5, 0, 7));

        assert_eq!(actions.len(), 4);
        let edits: Vec<_> = actions.iter().filter_map(Candidate::edit).collect();
        assert_eq!(
            edits.iter().map(|e| e.new_text.as_str()).collect::<Vec<_>>(),
            ["😺", "😀", "💩"]
        );
        for edit in &edits {
            assert_eq!(edit.range, range(0, 5, 0, 7));
            assert_eq!(edit.uri.as_str(), "file:///a.css");
        }
        assert_eq!(
            actions.iter().map(|a| a.preferred).collect::<Vec<_>>(),
            [false, true, false, false]
        );

        let last = &actions[3];
        assert_eq!(last.kind, CandidateKind::Empty);
        assert_eq!(last.command().map(|c| c.name.as_str()), Some("learn-more"));
    }

    #[test]
    fn edit_width_comes_from_the_catalog_not_the_range() {
        let doc = doc("html :)) { }");
        let actions = Fixer.provide_actions(&doc, range(0, 5, 0, 5));
        let edit = actions[0].edit().unwrap();
        assert_eq!(edit.range, range(0, 5, 0, 7));

        let actions = Fixer.provide_actions(&doc, range(0, 5, 1, 0));
        assert!(actions.is_empty());
    }

    #[test]
    fn ineligible_ranges_yield_nothing() {
        let doc = doc("a :)\nb");
        assert!(Fixer.provide_actions(&doc, range(4, 0, 4, 2)).is_empty());
        assert!(Fixer.provide_actions(&doc, range(0, 9, 0, 9)).is_empty());
        assert!(Fixer.provide_actions(&doc, range(0, 3, 0, 2)).is_empty());
        // token would run past the end of the line
        assert!(Fixer.provide_actions(&doc, range(0, 3, 0, 4)).is_empty());
        assert!(Fixer.provide_actions(&doc, range(1, 0, 1, 1)).is_empty());
    }

    #[test]
    fn surrogate_pairs_are_not_split() {
        let doc = doc("a 😺 b");
        assert!(Fixer.provide_actions(&doc, range(0, 3, 0, 3)).is_empty());
        assert_eq!(Fixer.provide_actions(&doc, range(0, 2, 0, 4)).len(), 4);
    }

    #[test]
    fn applying_a_fix_replaces_the_whole_token() {
        let mut doc = doc("html :) { }");
        let target = range(0, 5, 0, 7);
        let original = doc.range_text(target).unwrap();

        for candidate in Fixer.provide_actions(&doc.clone(), target) {
            let Some(edit) = candidate.edit() else { continue };
            let mut fixed = doc.clone();
            fixed.apply(edit).unwrap();
            assert_eq!(fixed.text(), format!("html {} {{ }}", edit.new_text));

            for again in Fixer.provide_actions(&fixed, target) {
                if let Some(edit) = again.edit() {
                    assert_ne!(fixed.range_text(edit.range).unwrap(), original);
                }
            }
        }

        let preferred = Fixer
            .provide_actions(&doc.clone(), target)
            .into_iter()
            .find(|c| c.preferred)
            .unwrap();
        doc.apply(preferred.edit().unwrap()).unwrap();
        assert_eq!(doc.text(), "html 😀 { }");
        assert_eq!(doc.version, 4);
    }

    #[test]
    fn code_actions_carry_edit_or_command() {
        let doc = doc("html :) { }");
        let actions = Fixer.code_actions(&doc, range(0, 5, 0, 7));

        assert_eq!(actions[1].title, "Convert to 😀");
        assert_eq!(actions[1].kind, Some(CodeActionKind::QUICKFIX));
        assert_eq!(actions[1].is_preferred, Some(true));
        assert_eq!(actions[0].is_preferred, None);
        let changes = actions[1].edit.as_ref().unwrap().changes.as_ref().unwrap();
        assert_eq!(changes[&doc.uri][0].new_text, "😀");
        assert!(actions[1].command.is_none());

        let learn = &actions[3];
        assert_eq!(learn.kind, Some(CodeActionKind::EMPTY));
        assert!(learn.edit.is_none());
        assert_eq!(learn.command.as_ref().unwrap().command, "learn-more");
    }

    #[test]
    fn exactly_one_catalog_entry_is_preferred() {
        assert_eq!(CATALOG.iter().filter(|e| e.is_preferred()).count(), 1);
        assert_eq!(Fixer::provided_kinds(), vec![CodeActionKind::QUICKFIX]);
    }

    proptest! {
        #[test]
        fn ranges_past_the_last_line_yield_nothing(
            text in "[a-z :;{}\n]{0,40}",
            line_past in 0u32..5,
            sc in 0u32..20,
            ec in 0u32..20,
        ) {
            let doc = doc(&text);
            let first_missing = doc.content.len_lines() as u32;
            let line = first_missing + line_past;
            let actions = Fixer.provide_actions(&doc, range(line, sc, line + 1, ec));
            prop_assert!(actions.is_empty());
        }

        #[test]
        fn results_have_one_preferred_edit_and_a_trailing_command(
            text in "[a-z :;{}\n]{0,40}",
            sl in 0u32..6,
            sc in 0u32..12,
            el in 0u32..6,
            ec in 0u32..12,
        ) {
            let doc = doc(&text);
            let actions = Fixer.provide_actions(&doc, range(sl, sc, el, ec));
            if !actions.is_empty() {
                let preferred: Vec<_> = actions.iter().filter(|a| a.preferred).collect();
                prop_assert_eq!(preferred.len(), 1);
                prop_assert!(preferred[0].edit().is_some());

                let last = actions.last().unwrap();
                prop_assert!(last.command().is_some());
                prop_assert!(!last.preferred);
                prop_assert_eq!(last.kind, CandidateKind::Empty);
            }
        }

        #[test]
        fn in_bounds_ranges_with_room_for_a_token_are_eligible(
            line in "[a-z :;{}]{2,20}",
            sc in 0u32..20,
        ) {
            let len = line.len() as u32;
            prop_assume!(sc + 2 <= len);
            let doc = doc(&line);
            prop_assert_eq!(Fixer.provide_actions(&doc, range(0, sc, 0, sc)).len(), 4);
        }
    }
}
