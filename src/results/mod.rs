//! Structured result documents written by the vendor tools.
//!
//! Both parsers share one contract: a missing file is `Ok(None)` ("the tool
//! never wrote results"), which callers must keep distinct from a document
//! with zero entries. Unreadable or malformed files are errors.

pub mod compiler;
pub mod test_log;

use std::path::{Path, PathBuf};

use roxmltree::Node;
use thiserror::Error;

pub use compiler::{CompilerLog, Diagnostic, Severity, parse_compiler_log};
pub use test_log::{TestCaseResult, TestLog, TestMessage, TestOutcome, parse_test_log};

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed XML in {path}: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: roxmltree::Error,
    },
}

/// Read `path`, or `None` when it does not exist.
fn read_document(path: &Path) -> Result<Option<String>, ResultsError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(decode(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ResultsError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Decode UTF-8 (with or without BOM) or UTF-16LE with BOM, which is what
/// the Windows tools emit.
fn decode(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8_lossy(rest).into_owned();
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16_lossy(&units);
        // The prolog still says utf-16; roxmltree only takes &str so drop it.
        return match text.find("?>") {
            Some(end) if text.starts_with("<?xml") => text[end + 2..].to_string(),
            _ => text,
        };
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_xml<'a>(path: &Path, text: &'a str) -> Result<roxmltree::Document<'a>, ResultsError> {
    roxmltree::Document::parse(text).map_err(|source| ResultsError::Xml {
        path: path.to_path_buf(),
        source,
    })
}

/// Text of the first element child named `name`, trimmed.
fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
        .and_then(|c| c.text())
        .map(str::trim)
}

/// Integer field; absent or unparseable values are zero.
fn parse_int(value: Option<&str>) -> i64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Boolean field; `true`/`1` in any case, everything else false.
fn parse_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        let v = v.trim();
        v.eq_ignore_ascii_case("true") || v == "1"
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_document(&tmp.path().join("nope.xml")).unwrap().is_none());
    }

    #[test]
    fn directory_is_an_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = read_document(tmp.path()).unwrap_err();
        assert!(matches!(err, ResultsError::Io { .. }));
    }

    #[test]
    fn decodes_utf8_bom() {
        let bytes = [&[0xEF, 0xBB, 0xBF][..], b"<a/>"].concat();
        assert_eq!(decode(&bytes), "<a/>");
    }

    #[test]
    fn decodes_utf16le_and_drops_prolog() {
        let text = "<?xml version=\"1.0\" encoding=\"utf-16\"?><a>x</a>";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let decoded = decode(&bytes);
        assert_eq!(decoded, "<a>x</a>");
        assert!(roxmltree::Document::parse(&decoded).is_ok());
    }

    #[test]
    fn int_defaults_to_zero() {
        assert_eq!(parse_int(Some(" 42 ")), 42);
        assert_eq!(parse_int(Some("n/a")), 0);
        assert_eq!(parse_int(None), 0);
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert!(parse_flag(Some("True")));
        assert!(parse_flag(Some("true")));
        assert!(parse_flag(Some("1")));
        assert!(!parse_flag(Some("False")));
        assert!(!parse_flag(Some("yes please")));
        assert!(!parse_flag(None));
    }
}
