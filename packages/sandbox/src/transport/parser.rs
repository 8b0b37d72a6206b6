// ABOUTME: Incremental parser for concatenated JSON values in agent CLI stdout
// ABOUTME: Strips terminal escapes, skips leading noise, enforces a buffer cap, and stops at the result message

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};

lazy_static! {
    static ref ANSI_ESCAPE: Regex =
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ANSI escape pattern is valid");
}

/// Remove terminal escape sequences and carriage returns
pub fn clean_output(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").replace('\r', "")
}

fn is_result_message(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("result")
}

#[derive(Debug)]
pub struct JsonStreamParser {
    buffer: String,
    max_buffer_size: usize,
    saw_result: bool,
}

impl JsonStreamParser {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            buffer: String::new(),
            max_buffer_size,
            saw_result: false,
        }
    }

    /// True once a `result` message has been yielded; further input is ignored
    pub fn is_done(&self) -> bool {
        self.saw_result
    }

    /// Feed decoded stdout text and return every value completed by it.
    ///
    /// An incomplete trailing value stays buffered. Malformed JSON, or a
    /// buffer that outgrows the cap, is a fatal decode error.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<Value>> {
        if self.saw_result {
            self.buffer.push_str(&clean_output(chunk));
            self.check_capacity()?;
            return Ok(Vec::new());
        }

        self.buffer.push_str(&clean_output(chunk));
        self.skip_preamble();
        self.check_capacity()?;

        let mut values = Vec::new();
        let mut consumed = 0;
        {
            let mut stream = serde_json::Deserializer::from_str(&self.buffer).into_iter::<Value>();
            loop {
                match stream.next() {
                    Some(Ok(value)) => {
                        consumed = stream.byte_offset();
                        let terminal = is_result_message(&value);
                        values.push(value);
                        if terminal {
                            self.saw_result = true;
                            break;
                        }
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        let snippet = &self.buffer[consumed..];
                        return Err(SandboxError::decode(e.to_string(), snippet));
                    }
                    None => {
                        consumed = stream.byte_offset();
                        break;
                    }
                }
            }
        }
        self.buffer.drain(..consumed);

        if self.saw_result {
            debug!("Result message received; ignoring further CLI output");
        }
        Ok(values)
    }

    /// Drain whatever is left once the output channel closes.
    ///
    /// A complete trailing value is returned. A partial value is a decode error
    /// unless the result message was already seen, in which case it is logged.
    pub fn finish(&mut self) -> Result<Option<Value>> {
        let leftover = std::mem::take(&mut self.buffer);
        let trimmed = leftover.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if !self.saw_result => Ok(Some(value)),
            Ok(_) => {
                debug!("Discarding {} bytes of CLI output after result", trimmed.len());
                Ok(None)
            }
            Err(e) if self.saw_result => {
                warn!("Ignoring undecodable CLI output after result: {}", e);
                Ok(None)
            }
            Err(e) => Err(SandboxError::decode(
                format!("incomplete JSON at end of stream: {}", e),
                trimmed,
            )),
        }
    }

    fn skip_preamble(&mut self) {
        match self.buffer.find(['{', '[']) {
            Some(0) => {}
            Some(start) => {
                if !self.buffer[..start].trim().is_empty() {
                    debug!("Skipping {} bytes of non-JSON CLI output", start);
                }
                self.buffer.drain(..start);
            }
            None => {
                if !self.buffer.trim().is_empty() {
                    debug!("Skipping non-JSON CLI output line");
                }
                self.buffer.clear();
            }
        }
    }

    fn check_capacity(&mut self) -> Result<()> {
        if self.buffer.len() > self.max_buffer_size {
            let err = SandboxError::decode(
                format!(
                    "JSON message exceeded maximum buffer size of {} bytes",
                    self.max_buffer_size
                ),
                &self.buffer,
            );
            self.buffer.clear();
            return Err(err);
        }
        Ok(())
    }
}
