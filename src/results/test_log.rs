//! Test runner XML log.
//!
//! Suites may nest arbitrarily; only `testcase` elements whose direct
//! parent is a `testsuite` are read, and each is qualified with that
//! parent's name. A case is therefore reported once no matter how many
//! enclosing suites there are.

use std::fmt;
use std::path::Path;

use roxmltree::Node;
use serde::Serialize;

use super::{ResultsError, parse_flag, parse_int, parse_xml, read_document};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TestOutcome::Passed => "passed",
            TestOutcome::Failed => "failed",
            TestOutcome::Skipped => "skipped",
        })
    }
}

/// One child element of a testcase, e.g. `<Error>assert failed</Error>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestMessage {
    pub tag: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCaseResult {
    /// `<suite>.<case>`
    pub name: String,
    pub outcome: TestOutcome,
    pub elapsed_ms: i64,
    pub started: Option<String>,
    pub finished: Option<String>,
    pub messages: Vec<TestMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestLog {
    pub cases: Vec<TestCaseResult>,
}

impl TestLog {
    pub fn count(&self, outcome: TestOutcome) -> usize {
        self.cases.iter().filter(|c| c.outcome == outcome).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestCaseResult> {
        self.cases
            .iter()
            .filter(|c| c.outcome == TestOutcome::Failed)
    }
}

fn is_element(node: &Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

fn attribute(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.attribute(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn read_case(suite: &str, node: Node<'_, '_>) -> TestCaseResult {
    let outcome = if parse_flag(node.attribute("skipped")) {
        TestOutcome::Skipped
    } else if parse_flag(node.attribute("success")) {
        TestOutcome::Passed
    } else {
        TestOutcome::Failed
    };

    let messages = if outcome == TestOutcome::Failed {
        node.children()
            .filter(Node::is_element)
            .map(|m| TestMessage {
                tag: m.tag_name().name().to_string(),
                text: m.text().map(str::trim).unwrap_or_default().to_string(),
            })
            .collect()
    } else {
        Vec::new()
    };

    TestCaseResult {
        name: format!("{suite}.{}", node.attribute("name").unwrap_or_default()),
        outcome,
        elapsed_ms: parse_int(node.attribute("time")),
        started: attribute(node, "start"),
        finished: attribute(node, "end"),
        messages,
    }
}

/// Parse a test runner XML log. `Ok(None)` when the file does not exist.
pub fn parse_test_log(path: &Path) -> Result<Option<TestLog>, ResultsError> {
    let Some(text) = read_document(path)? else {
        return Ok(None);
    };
    parse_test_xml(path, &text).map(Some)
}

pub(crate) fn parse_test_xml(path: &Path, text: &str) -> Result<TestLog, ResultsError> {
    let doc = parse_xml(path, text)?;

    let cases = doc
        .descendants()
        .filter(|n| is_element(n, "testcase"))
        .filter_map(|case| {
            let suite = case.parent_element().filter(|p| is_element(p, "testsuite"))?;
            Some(read_case(suite.attribute("name").unwrap_or_default(), case))
        })
        .collect();

    Ok(TestLog { cases })
}
