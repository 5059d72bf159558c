//! Shared I/O utilities: a byte-level line reader that tracks stream
//! offsets and supports one-line pushback, plus the C-style path
//! quoting used by fileop and stream handling.

use std::io::{self, BufRead};

use memchr::memchr;

/// A line reader over a buffered source that counts consumed bytes and
/// supports pushing back exactly one line.
///
/// The offset is the position of the *next* byte to be read from the
/// underlying source, which is what blob stream-views need: a `data N`
/// payload starts at `offset()` right after its header line.
pub struct LineReader<R> {
    inner: R,
    offset: u64,
    lineno: u64,
    pushback: Option<Vec<u8>>,
}

impl<R: BufRead> LineReader<R> {
    /// Creates a new `LineReader` wrapping the given reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            lineno: 0,
            pushback: None,
        }
    }

    /// Byte offset of the next read in the underlying source. A pushed
    /// back line is accounted as unread.
    pub fn offset(&self) -> u64 {
        match &self.pushback {
            Some(line) => self.offset - line.len() as u64,
            None => self.offset,
        }
    }

    /// One-based number of the line most recently returned.
    pub fn lineno(&self) -> u64 {
        self.lineno
    }

    /// Read one line including its terminating LF if present. Returns
    /// `None` at end of input. A pushed-back line is returned first.
    pub fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        if let Some(line) = self.pushback.take() {
            self.lineno += 1;
            return Ok(Some(line));
        }
        let mut line = Vec::new();
        let n = read_until_lf(&mut self.inner, &mut line)?;
        if n == 0 {
            return Ok(None);
        }
        self.offset += n as u64;
        self.lineno += 1;
        Ok(Some(line))
    }

    /// Push one line back; it will be the next `read_line` result.
    /// Only a single level of pushback is supported.
    pub fn push_back(&mut self, line: Vec<u8>) {
        debug_assert!(self.pushback.is_none(), "double pushback");
        self.lineno -= 1;
        self.pushback = Some(line);
    }

    /// Read exactly `len` raw bytes, e.g. a counted `data` payload.
    pub fn read_exact(&mut self, len: usize) -> io::Result<Vec<u8>> {
        debug_assert!(self.pushback.is_none(), "raw read across pushback");
        let mut buf = vec![0; len];
        io::Read::read_exact(&mut self.inner, &mut buf)?;
        self.offset += len as u64;
        Ok(buf)
    }
}

fn read_until_lf<R: BufRead>(r: &mut R, out: &mut Vec<u8>) -> io::Result<usize> {
    let mut total = 0;
    loop {
        let available = r.fill_buf()?;
        if available.is_empty() {
            return Ok(total);
        }
        match memchr(b'\n', available) {
            Some(i) => {
                out.extend_from_slice(&available[..=i]);
                r.consume(i + 1);
                return Ok(total + i + 1);
            }
            None => {
                let n = available.len();
                out.extend_from_slice(available);
                r.consume(n);
                total += n;
            }
        }
    }
}

/// True if a path needs quoting when emitted on a fileop line.
pub fn path_needs_quoting(path: &[u8]) -> bool {
    path.iter()
        .any(|&b| b == b'"' || b == b'\\' || b == b'\n' || b == b'\t' || b == b' ')
        || path.starts_with(b"\"")
}

/// Render a path with double quotes and C-style escapes. Paths without
/// special bytes are returned unquoted.
pub fn quote_path(path: &[u8]) -> Vec<u8> {
    if !path_needs_quoting(path) {
        return path.to_vec();
    }
    let mut out = Vec::with_capacity(path.len() + 2);
    out.push(b'"');
    for &b in path {
        match b {
            b'"' => out.extend(b"\\\""),
            b'\\' => out.extend(b"\\\\"),
            b'\n' => out.extend(b"\\n"),
            b'\t' => out.extend(b"\\t"),
            _ => out.push(b),
        }
    }
    out.push(b'"');
    out
}

/// Parse a possibly-quoted path token. Returns the decoded path and the
/// number of input bytes consumed (including the closing quote).
/// Unquoted tokens run to the first whitespace or end of input.
pub fn unquote_path(token: &[u8]) -> Option<(Vec<u8>, usize)> {
    if !token.starts_with(b"\"") {
        let end = token
            .iter()
            .position(|&b| b == b' ' || b == b'\n')
            .unwrap_or(token.len());
        return Some((token[..end].to_vec(), end));
    }
    let mut out = Vec::with_capacity(token.len());
    let mut i = 1;
    while i < token.len() {
        match token[i] {
            b'"' => return Some((out, i + 1)),
            b'\\' => {
                i += 1;
                let esc = *token.get(i)?;
                match esc {
                    b'"' => out.push(b'"'),
                    b'\\' => out.push(b'\\'),
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'0'..=b'7' => {
                        // up to three octal digits
                        let mut val = (esc - b'0') as u32;
                        let mut digits = 1;
                        while digits < 3 {
                            match token.get(i + 1) {
                                Some(&d @ b'0'..=b'7') => {
                                    val = val * 8 + (d - b'0') as u32;
                                    i += 1;
                                    digits += 1;
                                }
                                _ => break,
                            }
                        }
                        out.push(val as u8);
                    }
                    _ => return None,
                }
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    // unterminated quote
    None
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;

    use super::*;

    #[test]
    fn test_line_reader_offsets() {
        let data = b"blob\nmark :1\ndata 3\nabc\n";
        let mut r = LineReader::new(BufReader::new(&data[..]));
        assert_eq!(r.read_line().unwrap().unwrap(), b"blob\n");
        assert_eq!(r.offset(), 5);
        assert_eq!(r.lineno(), 1);
        assert_eq!(r.read_line().unwrap().unwrap(), b"mark :1\n");
        assert_eq!(r.read_line().unwrap().unwrap(), b"data 3\n");
        // payload begins exactly at the tracked offset
        assert_eq!(r.offset(), 20);
        assert_eq!(r.read_exact(3).unwrap(), b"abc");
        assert_eq!(r.read_line().unwrap().unwrap(), b"\n");
        assert!(r.read_line().unwrap().is_none());
    }

    #[test]
    fn test_line_reader_pushback() {
        let data = b"one\ntwo\n";
        let mut r = LineReader::new(BufReader::new(&data[..]));
        let line = r.read_line().unwrap().unwrap();
        assert_eq!(line, b"one\n");
        r.push_back(line);
        assert_eq!(r.offset(), 0);
        assert_eq!(r.read_line().unwrap().unwrap(), b"one\n");
        assert_eq!(r.read_line().unwrap().unwrap(), b"two\n");
    }

    #[test]
    fn test_final_line_without_lf() {
        let data = b"done";
        let mut r = LineReader::new(BufReader::new(&data[..]));
        assert_eq!(r.read_line().unwrap().unwrap(), b"done");
        assert!(r.read_line().unwrap().is_none());
    }

    #[test]
    fn test_quote_plain_path() {
        assert_eq!(quote_path(b"src/main.rs"), b"src/main.rs".to_vec());
    }

    #[test]
    fn test_quote_path_with_space() {
        assert_eq!(quote_path(b"a b"), b"\"a b\"".to_vec());
        assert_eq!(quote_path(b"x\"y"), b"\"x\\\"y\"".to_vec());
        assert_eq!(quote_path(b"nl\nend"), b"\"nl\\nend\"".to_vec());
    }

    #[test]
    fn test_unquote_roundtrip() {
        for path in [
            b"plain".to_vec(),
            b"has space".to_vec(),
            b"quote\"inside".to_vec(),
            b"tab\there".to_vec(),
            b"back\\slash".to_vec(),
        ] {
            let quoted = quote_path(&path);
            let (decoded, used) = unquote_path(&quoted).unwrap();
            assert_eq!(decoded, path);
            assert_eq!(used, quoted.len());
        }
    }

    #[test]
    fn test_unquote_octal() {
        let (decoded, _) = unquote_path(b"\"\\101\\040b\"").unwrap();
        assert_eq!(decoded, b"A b".to_vec());
    }

    #[test]
    fn test_unquote_unterminated() {
        assert!(unquote_path(b"\"oops").is_none());
    }
}
