//! Compiler diagnostics log.
//!
//! ```xml
//! <Diagnostics>
//!   <Diagnostic i:type="CompilerDiagnostic">
//!     <Severity>Error</Severity>
//!     <Path>dynamics://Class/Foo/Method/bar</Path>
//!     <ElementType>Class</ElementType>
//!     <Moniker>BPErrorUnknownLabel</Moniker>
//!     <Line>10</Line><Column>5</Column>
//!     <EndLine>10</EndLine><EndColumn>12</EndColumn>
//!     <Message>Label @SYS0 not found</Message>
//!   </Diagnostic>
//! </Diagnostics>
//! ```
//!
//! Every `Diagnostic` element is collected regardless of nesting. The
//! severity match is case-sensitive: only `Error` and `Warning` count as
//! such, anything else is informational.

use std::fmt;
use std::path::Path;

use serde::Serialize;

use super::{ResultsError, child_text, parse_int, parse_xml, read_document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Informational,
}

impl Severity {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "Error" => Severity::Error,
            "Warning" => Severity::Warning,
            _ => Severity::Informational,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Informational => "info",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Type tag of the entry (e.g. `CompilerDiagnostic`), if any.
    pub kind: Option<String>,
    /// Dotted or URI-style identifier of the offending element.
    pub path: String,
    pub element_type: Option<String>,
    /// Best-practice rule name, for rule diagnostics.
    pub rule: Option<String>,
    pub message: String,
    pub line: i64,
    pub column: i64,
    pub end_line: i64,
    pub end_column: i64,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({},{}): {}: {}",
            self.path, self.line, self.column, self.severity, self.message
        )
    }
}

/// Parsed compiler log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompilerLog {
    pub diagnostics: Vec<Diagnostic>,
}

impl CompilerLog {
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }
}

fn type_tag(node: roxmltree::Node<'_, '_>) -> Option<String> {
    node.attributes()
        .find(|a| a.name() == "type")
        .map(|a| a.value().to_string())
        .or_else(|| child_text(node, "DiagnosticType").map(str::to_string))
        .filter(|t| !t.is_empty())
}

fn optional(node: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    child_text(node, name)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Parse a compiler XML log. `Ok(None)` when the file does not exist.
pub fn parse_compiler_log(path: &Path) -> Result<Option<CompilerLog>, ResultsError> {
    let Some(text) = read_document(path)? else {
        return Ok(None);
    };
    parse_compiler_xml(path, &text).map(Some)
}

pub(crate) fn parse_compiler_xml(path: &Path, text: &str) -> Result<CompilerLog, ResultsError> {
    let doc = parse_xml(path, text)?;

    let diagnostics = doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "Diagnostic")
        .map(|node| Diagnostic {
            severity: Severity::from_tag(child_text(node, "Severity").unwrap_or_default()),
            kind: type_tag(node),
            path: child_text(node, "Path").unwrap_or_default().to_string(),
            element_type: optional(node, "ElementType"),
            rule: optional(node, "Moniker"),
            message: child_text(node, "Message").unwrap_or_default().to_string(),
            line: parse_int(child_text(node, "Line")),
            column: parse_int(child_text(node, "Column")),
            end_line: parse_int(child_text(node, "EndLine")),
            end_column: parse_int(child_text(node, "EndColumn")),
        })
        .collect();

    Ok(CompilerLog { diagnostics })
}
