use anyhow::{anyhow, Result};
use serde::Serialize;

/// Incremental decoder for the wire format: a TCP stream carrying
/// back-to-back JSON objects with no delimiter between them. A single
/// read may hold a partial object, one object, or several, so the
/// decoder accumulates bytes and emits only completed objects.
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Failure noticed after this call already decoded frames; surfaced
    /// on the next call so those frames are not lost.
    failed: Option<String>,
}

enum Scan {
    /// A balanced `{...}` span ends at this byte offset (exclusive).
    Complete(usize),
    /// The buffer holds a prefix of an object; keep accumulating.
    Incomplete,
    /// The buffer cannot begin a JSON object.
    Garbage,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            buf: Vec::new(),
            failed: None,
        }
    }

    /// Number of bytes currently held back as an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Absorb a chunk of bytes and return every complete object it
    /// finishes, in order. A chunk completing zero objects is not an
    /// error. A malformed span is dropped by itself; frames decoded
    /// before it in the same chunk are still emitted, with the error
    /// deferred to the next call, and bytes after it stay buffered.
    /// A prefix that cannot start an object clears the buffer so the
    /// stream does not spin on it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<serde_json::Value>> {
        self.buf.extend_from_slice(chunk);
        if let Some(deferred) = self.failed.take() {
            return Err(anyhow!(deferred));
        }
        let mut out = Vec::new();

        loop {
            // Whitespace between objects carries no information.
            let skip = self
                .buf
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if skip > 0 {
                self.buf.drain(..skip);
            }
            if self.buf.is_empty() {
                break;
            }

            match scan_object(&self.buf) {
                Scan::Complete(end) => {
                    match serde_json::from_slice::<serde_json::Value>(&self.buf[..end]) {
                        Ok(value) => {
                            out.push(value);
                            // Consumed prefix is measured in bytes, which keeps
                            // the drain correct for multi-byte UTF-8 content.
                            self.buf.drain(..end);
                        }
                        Err(e) => {
                            self.buf.drain(..end);
                            return self.fail(out, format!("malformed frame: {}", e));
                        }
                    }
                }
                Scan::Incomplete => break,
                Scan::Garbage => {
                    self.buf.clear();
                    return self.fail(out, "stream does not frame a JSON object".to_string());
                }
            }
        }

        Ok(out)
    }

    /// Report a framing failure without losing frames decoded earlier
    /// in the same call: with none, error now; otherwise emit them and
    /// raise the error on the next `feed`.
    fn fail(
        &mut self,
        out: Vec<serde_json::Value>,
        message: String,
    ) -> Result<Vec<serde_json::Value>> {
        if out.is_empty() {
            Err(anyhow!(message))
        } else {
            self.failed = Some(message);
            Ok(out)
        }
    }
}

/// Find the end of the first balanced `{...}` span. Brace depth is
/// tracked outside string literals only; a quote toggles string state
/// unless preceded by an unconsumed backslash. Multi-byte UTF-8
/// continuation bytes never collide with the ASCII bytes inspected
/// here, so byte-wise scanning is safe.
fn scan_object(buf: &[u8]) -> Scan {
    if buf[0] != b'{' {
        return Scan::Garbage;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in buf.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Scan::Complete(i + 1);
                }
            }
            _ => {}
        }
    }

    Scan::Incomplete
}

/// Serialize one outbound envelope to its wire bytes. The caller is
/// expected to hand the whole buffer to a single `write_all` so frames
/// from concurrent senders never interleave.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}
