//! Blocking-prompt detection for captured tool output.
//!
//! The vendor tools occasionally stop and wait for a key press so a
//! debugger can attach. When stdout is captured, the relay scans each line
//! (and the trailing partial line, since such prompts usually end without a
//! newline) for a configured marker.
//!
//! Markers are literal substrings; they are escaped before compilation so
//! punctuation like `...` matches verbatim. Extra regex patterns can be
//! supplied for tools whose prompt text varies.

use regex::Regex;

/// Default marker for the debug-attach prompt.
pub const DEFAULT_PROMPT_MARKER: &str = "Press any key to continue";

/// A detected prompt with the text that matched.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPrompt {
    pub matched_text: String,
}

/// Compiled prompt detection patterns.
#[derive(Debug, Clone)]
pub struct PromptPatterns {
    patterns: Vec<Regex>,
}

impl PromptPatterns {
    /// Scan a line of (ANSI-stripped) output for a known prompt.
    /// Returns the first match found.
    pub fn detect(&self, line: &str) -> Option<DetectedPrompt> {
        for regex in &self.patterns {
            if let Some(m) = regex.find(line) {
                return Some(DetectedPrompt {
                    matched_text: m.as_str().to_string(),
                });
            }
        }
        None
    }

    /// Patterns for the vendor tools' debug-attach prompt.
    pub fn debug_attach() -> Self {
        Self::from_markers(&[DEFAULT_PROMPT_MARKER.to_string()], &[])
            .unwrap_or_else(|_| Self { patterns: vec![] })
    }

    /// Build patterns from literal `markers` plus raw regex `patterns`.
    pub fn from_markers(markers: &[String], patterns: &[String]) -> Result<Self, regex::Error> {
        let mut compiled = Vec::with_capacity(markers.len() + patterns.len());
        for marker in markers.iter().filter(|m| !m.is_empty()) {
            compiled.push(Regex::new(&regex::escape(marker))?);
        }
        for pattern in patterns {
            compiled.push(Regex::new(pattern)?);
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Strip ANSI escape sequences from console output.
pub fn strip_ansi(input: &str) -> String {
    // Matches CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}
