//! # Process Result
//!
//! [`ProcessOutput`] is the immutable snapshot a job hands back once its process has
//! finished: the exit code plus the captured stdout, stderr and combined bytes. Text
//! accessors decode the whole buffer at once with the job's encoding, so a multi-byte
//! character split across two reads is never mangled.

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use serde::de::DeserializeOwned;
use std::fmt;

/// Captured result of a finished process.
#[derive(Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    exit_code: i32,
    stdout: Bytes,
    stderr: Bytes,
    combined: Bytes,
    encoding: &'static Encoding,
}

impl ProcessOutput {
    pub fn new(
        exit_code: i32,
        stdout: impl Into<Bytes>,
        stderr: impl Into<Bytes>,
        combined: impl Into<Bytes>,
        encoding: &'static Encoding,
    ) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            combined: combined.into(),
            encoding,
        }
    }

    /// An output with nothing captured, used for processes that never started.
    pub fn empty(exit_code: i32) -> Self {
        Self::new(exit_code, Bytes::new(), Bytes::new(), Bytes::new(), UTF_8)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn stdout_bytes(&self) -> &Bytes {
        &self.stdout
    }

    pub fn stderr_bytes(&self) -> &Bytes {
        &self.stderr
    }

    pub fn combined_bytes(&self) -> &Bytes {
        &self.combined
    }

    pub fn stdout(&self) -> String {
        self.decode(&self.stdout)
    }

    pub fn stderr(&self) -> String {
        self.decode(&self.stderr)
    }

    /// Stdout and stderr in the order the bytes arrived.
    pub fn combined(&self) -> String {
        self.decode(&self.combined)
    }

    /// Combined text without trailing line breaks. This is what gets substituted when an
    /// output is embedded in another command line.
    pub fn trimmed(&self) -> String {
        self.combined().trim_end_matches(['\r', '\n']).to_string()
    }

    /// Combined text split on `\n` and `\r\n`. A trailing newline yields a final empty line.
    pub fn lines(&self) -> Vec<String> {
        split_lines(&self.combined())
    }

    /// Like [`lines`](Self::lines) but trailing line breaks are removed first.
    pub fn lines_trimmed(&self) -> Vec<String> {
        split_lines(&self.trimmed())
    }

    /// Deserializes the combined text as one JSON document.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.combined())
    }

    /// Deserializes each line of the combined text as a JSON document.
    pub fn json_lines<T: DeserializeOwned>(&self, skip_empty: bool) -> serde_json::Result<Vec<T>> {
        self.lines()
            .iter()
            .filter(|line| !(skip_empty && line.trim().is_empty()))
            .map(|line| serde_json::from_str(line))
            .collect()
    }

    fn decode(&self, bytes: &[u8]) -> String {
        let (text, _, _) = self.encoding.decode(bytes);
        text.into_owned()
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect()
}

impl fmt::Display for ProcessOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.combined())
    }
}

impl fmt::Debug for ProcessOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOutput")
            .field("exit_code", &self.exit_code)
            .field("stdout", &self.stdout())
            .field("stderr", &self.stderr())
            .field("encoding", &self.encoding.name())
            .finish()
    }
}

impl IntoIterator for &ProcessOutput {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines().into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn output(text: &str) -> ProcessOutput {
        ProcessOutput::new(0, text.as_bytes().to_vec(), Bytes::new(), text.as_bytes().to_vec(), UTF_8)
    }

    #[test]
    fn lines_keep_trailing_empty_line() {
        let out = output("one\r\ntwo\nthree\n");
        assert_eq!(out.lines(), ["one", "two", "three", ""]);
        assert_eq!(out.lines_trimmed(), ["one", "two", "three"]);
    }

    #[test]
    fn trimmed_strips_only_trailing_line_breaks() {
        assert_eq!(output("  value \n\n").trimmed(), "  value ");
        assert_eq!(output("").trimmed(), "");
    }

    #[test]
    fn iterates_over_lines() {
        let out = output("a\nb");
        let collected: Vec<String> = (&out).into_iter().collect();
        assert_eq!(collected, ["a", "b"]);
        assert_eq!(out.to_string(), "a\nb");
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        name: String,
    }

    #[test]
    fn json_and_json_lines() {
        let single = output("{\"name\":\"x\"}\n");
        assert_eq!(single.json::<Item>().unwrap(), Item { name: "x".into() });

        let many = output("{\"name\":\"a\"}\n\n{\"name\":\"b\"}\n");
        let items: Vec<Item> = many.json_lines(true).unwrap();
        assert_eq!(items.len(), 2);
        assert!(many.json_lines::<Item>(false).is_err());
    }

    #[test]
    fn decodes_with_configured_encoding() {
        let bytes = vec![0x63, 0x61, 0x66, 0xE9];
        let out = ProcessOutput::new(0, bytes.clone(), Bytes::new(), bytes, encoding_rs::WINDOWS_1252);
        assert_eq!(out.stdout(), "café");
    }

    #[test]
    fn empty_output_reports_exit_code() {
        let out = ProcessOutput::empty(127);
        assert_eq!(out.exit_code(), 127);
        assert!(!out.is_success());
        assert!(out.combined_bytes().is_empty());
        assert!(ProcessOutput::empty(0).is_success());
    }
}
