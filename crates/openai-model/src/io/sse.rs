use super::{Chunks, ChunksError};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    ChunksError(ChunksError),
    InvalidPayload,
}

/// A type for reading the `data` of server-sent events from a chunk stream.
pub struct Sse {
    buf: Vec<u8>,
    chunks: Chunks,
    exhausted: bool,
}

impl Sse {
    #[inline]
    pub fn new(chunks: Chunks) -> Self {
        Self {
            buf: Vec::new(),
            chunks,
            exhausted: false,
        }
    }

    /// Returns the data of the next event, or `None` once the stream has
    /// ended. A trailing event without the terminating blank line is
    /// dropped.
    pub async fn next_event(&mut self) -> Result<Option<String>, Error> {
        loop {
            while let Some(block) = self.take_block() {
                if let Some(data) = parse_block(&block)? {
                    return Ok(Some(data));
                }
            }
            if self.exhausted {
                return Ok(None);
            }
            match self.chunks.next_chunk().await.map_err(Error::ChunksError)? {
                // Chunks may split multi-byte characters, so the buffer
                // stays raw bytes until a whole block is available.
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => self.exhausted = true,
            }
        }
    }

    /// Removes one event block, terminated by an empty line, from the
    /// buffer.
    fn take_block(&mut self) -> Option<Vec<u8>> {
        let mut line_start = 0;
        let mut idx = 0;
        while idx < self.buf.len() {
            let eol_len = match self.buf[idx] {
                b'\n' => 1,
                b'\r' if self.buf.get(idx + 1) == Some(&b'\n') => 2,
                // A lone `\r` at the end may be followed by `\n` later.
                b'\r' if idx + 1 == self.buf.len() => return None,
                b'\r' => 1,
                _ => {
                    idx += 1;
                    continue;
                }
            };
            if idx == line_start {
                let block = self.buf[..line_start].to_vec();
                self.buf.drain(..idx + eol_len);
                return Some(block);
            }
            idx += eol_len;
            line_start = idx;
        }
        None
    }
}

/// Parses the fields of an event block.
///
/// ```text
/// event         = *( comment / field ) end-of-line
/// comment       = colon *any-char end-of-line
/// field         = 1*name-char [ colon [ space ] *any-char ] end-of-line
/// ```
///
/// Only `data` fields are kept; multiple data lines are joined by `\n`.
/// Other fields are ignored. Blocks without data (comments, keep-alives)
/// yield `None`.
fn parse_block(block: &[u8]) -> Result<Option<String>, Error> {
    let Ok(block) = std::str::from_utf8(block) else {
        return Err(Error::InvalidPayload);
    };

    let mut data: Option<String> = None;
    for line in block.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => {
                (name, value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };
        match name {
            "data" => {
                let data = data.get_or_insert_with(String::new);
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(value);
            }
            // `event`, `id`, `retry` and unknown fields.
            _ => {}
        }
    }
    Ok(data)
}
