use std::{
    io::{self, Read},
    mem, str,
};

#[derive(thiserror::Error, Debug)]
pub enum CharReaderError {
    #[error("{0}")]
    IoError(#[from] io::Error),

    #[error("{0}")]
    Utf8Error(#[from] str::Utf8Error),
}

/// Char iterator over a reader that also captures each completed source
/// line so the driver can hand it to the listing.
pub struct LineReader<R> {
    inner: R,
    buf: [u8; 4],
    buf_len: usize,
    line: String,
    completed: Option<String>,
}

impl<R> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: [0; 4],
            buf_len: 0,
            line: String::new(),
            completed: None,
        }
    }

    #[inline]
    pub fn line_is_empty(&self) -> bool {
        self.line.is_empty()
    }

    /// The most recently completed line, if any. Taking it clears it.
    #[inline]
    pub fn take_line(&mut self) -> String {
        self.completed.take().unwrap_or_default()
    }

    /// Finish the in-progress line without a newline (end of file).
    pub fn flush_line(&mut self) {
        self.completed = Some(mem::take(&mut self.line));
    }
}

impl<R: Read> Iterator for LineReader<R> {
    type Item = Result<char, CharReaderError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf_len == 0 {
            self.buf_len = match self.inner.read(&mut self.buf) {
                Ok(len) => len,
                Err(e) => return Some(Err(e.into())),
            }
        }

        if self.buf_len == 0 {
            return None;
        }

        let s = match str::from_utf8(&self.buf[0..self.buf_len]) {
            Ok(s) => s,
            Err(e) => {
                let valid_len = e.valid_up_to();
                if valid_len == 0 {
                    return Some(Err(e.into()));
                }
                // Safety: We already checked up to `valid_len`
                unsafe { str::from_utf8_unchecked(&self.buf[0..valid_len]) }
            }
        };

        let c = s.chars().next().unwrap();
        let char_len = c.len_utf8();
        self.buf.rotate_left(char_len);
        self.buf_len -= char_len;

        if c == '\n' {
            self.completed = Some(mem::take(&mut self.line));
        } else if c != '\r' {
            self.line.push(c);
        }
        Some(Ok(c))
    }
}
