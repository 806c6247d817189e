//! Markdown section parsing and rendering.
//!
//! Documents are modeled as a tree of headed sections (levels `#` through
//! `###`); deeper headings and everything else stay as body text. The parsed
//! form serializes to JSON, so pipeline steps can carry a `StructuredDoc`
//! inside workflow state and re-render it at the end.

use capstan_types::{Result, WorkflowError};
use serde::{Deserialize, Serialize};

const MAX_HEADING_LEVEL: usize = 3;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub title: String,
    /// Heading depth, 1 to 3.
    pub level: u8,
    /// Non-empty body lines, in order.
    pub body: Vec<String>,
    pub children: Vec<Section>,
}

impl Section {
    pub fn new(title: impl Into<String>, level: u8) -> Self {
        Self {
            title: title.into(),
            level,
            body: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Flattened body text of this section only, newline-joined.
    pub fn text(&self) -> String {
        self.body.join("\n")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredDoc {
    /// Body lines appearing before the first heading.
    pub preamble: Vec<String>,
    pub sections: Vec<Section>,
}

impl StructuredDoc {
    /// Title of the document: the first top-level heading, if any.
    pub fn title(&self) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.level == 1)
            .map(|s| s.title.as_str())
    }

    /// Depth-first lookup of a section by exact title.
    pub fn section(&self, title: &str) -> Option<&Section> {
        fn walk<'a>(sections: &'a [Section], title: &str) -> Option<&'a Section> {
            for section in sections {
                if section.title == title {
                    return Some(section);
                }
                if let Some(found) = walk(&section.children, title) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.sections, title)
    }

    /// Total number of sections at any depth.
    pub fn section_count(&self) -> usize {
        fn count(sections: &[Section]) -> usize {
            sections.len() + sections.iter().map(|s| count(&s.children)).sum::<usize>()
        }
        count(&self.sections)
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn heading_level(line: &str) -> Option<usize> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > MAX_HEADING_LEVEL {
        return None;
    }
    // Require the space so "#hashtag" stays body text.
    (line.as_bytes().get(hashes) == Some(&b' ')).then_some(hashes)
}

/// Parse raw markdown into a section tree.
///
/// Blank lines are dropped; a heading with no title text is a `ParseError`
/// carrying its 1-based line number.
pub fn parse(raw: &str) -> Result<StructuredDoc> {
    let mut doc = StructuredDoc::default();
    // Path of open sections, one per level currently in scope.
    let mut open: Vec<Section> = Vec::new();

    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim_end();
        match heading_level(line) {
            Some(level) => {
                let title = line[level..].trim();
                if title.is_empty() {
                    return Err(WorkflowError::ParseError {
                        line: idx + 1,
                        message: "heading has no title".into(),
                    });
                }
                // Close sections at this level or deeper.
                while open.last().is_some_and(|s| usize::from(s.level) >= level) {
                    if let Some(closed) = open.pop() {
                        attach(&mut doc, &mut open, closed);
                    }
                }
                open.push(Section::new(title, level as u8));
            }
            None => {
                if line.is_empty() {
                    continue;
                }
                match open.last_mut() {
                    Some(section) => section.body.push(line.to_string()),
                    None => doc.preamble.push(line.to_string()),
                }
            }
        }
    }

    while let Some(closed) = open.pop() {
        attach(&mut doc, &mut open, closed);
    }
    Ok(doc)
}

fn attach(doc: &mut StructuredDoc, open: &mut [Section], closed: Section) {
    match open.last_mut() {
        Some(parent) => parent.children.push(closed),
        None => doc.sections.push(closed),
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render a section tree back to markdown. `parse(render(doc))` reproduces
/// the tree for any doc this module produced.
pub fn render(doc: &StructuredDoc) -> String {
    let mut out = String::new();
    for line in &doc.preamble {
        out.push_str(line);
        out.push('\n');
    }
    if !doc.preamble.is_empty() && !doc.sections.is_empty() {
        out.push('\n');
    }
    for section in &doc.sections {
        render_section(&mut out, section);
    }
    out
}

fn render_section(out: &mut String, section: &Section) {
    for _ in 0..section.level {
        out.push('#');
    }
    out.push(' ');
    out.push_str(&section.title);
    out.push('\n');
    if !section.body.is_empty() {
        out.push('\n');
        for line in &section.body {
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push('\n');
    for child in &section.children {
        render_section(out, child);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Intro paragraph before any heading.

# Release Plan

Overall goal for the quarter.

## Milestones

First cut in March.

### Risks

Supply chain is tight.

## Staffing

Two engineers assigned.

# Appendix

Raw numbers.
";

    #[test]
    fn parses_nested_sections() {
        let doc = parse(SAMPLE).unwrap();
        assert_eq!(doc.preamble, vec!["Intro paragraph before any heading."]);
        assert_eq!(doc.title(), Some("Release Plan"));
        assert_eq!(doc.sections.len(), 2);
        assert_eq!(doc.section_count(), 5);

        let plan = &doc.sections[0];
        assert_eq!(plan.children.len(), 2);
        assert_eq!(plan.children[0].title, "Milestones");
        assert_eq!(plan.children[0].children[0].title, "Risks");
        assert_eq!(plan.children[0].children[0].text(), "Supply chain is tight.");
        assert_eq!(plan.children[1].title, "Staffing");
    }

    #[test]
    fn section_lookup_is_depth_first() {
        let doc = parse(SAMPLE).unwrap();
        assert_eq!(doc.section("Risks").map(|s| s.level), Some(3));
        assert!(doc.section("Nonexistent").is_none());
    }

    #[test]
    fn render_then_parse_reproduces_tree() {
        let doc = parse(SAMPLE).unwrap();
        let reparsed = parse(&render(&doc)).unwrap();
        assert_eq!(doc, reparsed);
    }

    #[test]
    fn empty_heading_is_a_parse_error_with_line_number() {
        let err = parse("# Title\n\n## \n").unwrap_err();
        match err {
            WorkflowError::ParseError { line, message } => {
                assert_eq!(line, 3);
                assert!(message.contains("no title"));
            }
            other => panic!("expected ParseError, got: {other:?}"),
        }
    }

    #[test]
    fn deep_headings_and_hashtags_stay_body_text() {
        let doc = parse("# Top\n\n#### too deep\n#hashtag\n").unwrap();
        assert_eq!(doc.sections[0].body, vec!["#### too deep", "#hashtag"]);
    }

    #[test]
    fn doc_round_trips_through_json() {
        let doc = parse(SAMPLE).unwrap();
        let json = serde_json::to_value(&doc).unwrap();
        let back: StructuredDoc = serde_json::from_value(json).unwrap();
        assert_eq!(doc, back);
    }
}
