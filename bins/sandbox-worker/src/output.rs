/// Bounded output capture
///
/// Submitted code can print without limit; anything past the cap is dropped
/// and flagged instead of failing the attempt.

#[derive(Debug)]
pub struct CappedBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Lossy UTF-8; a cut in the middle of a code point becomes U+FFFD
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// stdout and stderr of one container, each capped separately
#[derive(Debug)]
pub struct OutputCapture {
    pub stdout: CappedBuffer,
    pub stderr: CappedBuffer,
}

impl OutputCapture {
    pub fn new(limit_per_stream: usize) -> Self {
        Self {
            stdout: CappedBuffer::new(limit_per_stream),
            stderr: CappedBuffer::new(limit_per_stream),
        }
    }

    pub fn truncated(&self) -> bool {
        self.stdout.is_truncated() || self.stderr.is_truncated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_limit_is_kept_verbatim() {
        let mut buf = CappedBuffer::new(16);
        buf.push(b"hello ");
        buf.push(b"world");

        assert!(!buf.is_truncated());
        assert_eq!(buf.into_string(), "hello world");
    }

    #[test]
    fn test_excess_is_truncated_not_fatal() {
        let mut buf = CappedBuffer::new(8);
        buf.push(b"0123456789");
        buf.push(b"more");

        assert!(buf.is_truncated());
        assert_eq!(buf.into_string(), "01234567");
    }

    #[test]
    fn test_streams_are_capped_independently() {
        let mut capture = OutputCapture::new(4);
        capture.stdout.push(b"ok");
        capture.stderr.push(b"overflowing");

        assert!(capture.truncated());
        assert!(!capture.stdout.is_truncated());
        assert_eq!(capture.stdout.into_string(), "ok");
    }
}
