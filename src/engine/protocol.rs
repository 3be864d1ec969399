//! Newline-delimited JSON protocol spoken by [`ProcessEngine`](super::ProcessEngine) children.
//!
//! One request per line on the child's stdin, one response per line on its
//! stdout. Responses carry the request id; stdout lines that are not a
//! response are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Feval,
    Eval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nlhs: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Request {
    pub fn feval(id: u64, function: impl Into<String>, nlhs: usize, args: Vec<Value>) -> Self {
        Self {
            id,
            op: Op::Feval,
            function: Some(function.into()),
            nlhs: Some(nlhs),
            args,
            command: None,
        }
    }

    pub fn eval(id: u64, command: impl Into<String>) -> Self {
        Self {
            id,
            op: Op::Eval,
            function: None,
            nlhs: None,
            args: Vec::new(),
            command: Some(command.into()),
        }
    }

    /// Encode as a single line, terminator included.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub failed: bool,
}

impl Response {
    /// Parse a stdout line. `None` for anything that is not a response object.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    /// Message to report when the response is a failure.
    pub fn failure_message(&self) -> String {
        let text = self.error.trim_end();
        if text.is_empty() {
            "engine reported a failure".to_string()
        } else {
            text.to_string()
        }
    }
}
