//! A byte source with capture/rollback, used to classify incoming traffic.
//!
//! RTSP connections carry two kinds of data on the same socket: textual
//! requests and `$`-framed binary media (RFC 2326 §10.12). The connection
//! reads a single byte to tell them apart, and the bytes it consumed while
//! deciding must be replayable to whichever parser wins:
//!
//! ```text
//! start_capture();
//! read(1)            -> b'$'?  drop_capture(); hand off to the frame reader
//!                    -> else   roll_back(); parse a textual request
//! ```

use std::io::Read;

/// Wraps a byte source, buffering reads after [`start_capture`] so they can
/// be replayed verbatim via [`roll_back`].
///
/// [`start_capture`]: Self::start_capture
/// [`roll_back`]: Self::roll_back
pub struct RollbackReader<R> {
    inner: R,
    /// Bytes queued for replay; served before `inner`.
    front: Vec<u8>,
    cursor: usize,
    /// Side buffer recording every byte read since `start_capture`.
    capture: Option<Vec<u8>>,
}

impl<R: Read> RollbackReader<R> {
    pub fn new(inner: R) -> Self {
        RollbackReader {
            inner,
            front: Vec::new(),
            cursor: 0,
            capture: None,
        }
    }

    /// Begin recording every byte subsequently read.
    pub fn start_capture(&mut self) {
        self.capture = Some(Vec::new());
    }

    /// Discard the recording; the captured bytes are consumed for good.
    pub fn drop_capture(&mut self) {
        self.capture = None;
    }

    /// Make the recording the new front of the read queue, so the captured
    /// bytes are returned again by subsequent reads.
    pub fn roll_back(&mut self) {
        if let Some(buffer) = self.capture.take() {
            self.front = buffer;
            self.cursor = 0;
        }
    }

    /// Whether replay bytes are queued ahead of the underlying source.
    pub fn has_buffered(&self) -> bool {
        self.cursor < self.front.len()
    }

    /// Access the wrapped source (for buffer inspection on `BufReader`s).
    pub fn get_ref(&self) -> &R {
        &self.inner
    }
}

impl<R: Read> Read for RollbackReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = if self.cursor < self.front.len() {
            let pending = &self.front[self.cursor..];
            let n = pending.len().min(buf.len());
            buf[..n].copy_from_slice(&pending[..n]);
            self.cursor += n;
            if self.cursor == self.front.len() {
                self.front.clear();
                self.cursor = 0;
            }
            n
        } else {
            self.inner.read(buf)?
        };

        if let Some(capture) = &mut self.capture {
            capture.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_n<R: Read>(reader: &mut R, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        reader.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn roll_back_replays_same_bytes() {
        let mut reader = RollbackReader::new(Cursor::new(b"OPTIONS * RTSP/1.0\r\n".to_vec()));
        reader.start_capture();
        let first = read_n(&mut reader, 8);
        reader.roll_back();
        let second = read_n(&mut reader, 8);
        assert_eq!(first, second);
        assert_eq!(read_n(&mut reader, 4), b"* RT");
    }

    #[test]
    fn drop_capture_never_replays() {
        let mut reader = RollbackReader::new(Cursor::new(b"$abcdef".to_vec()));
        reader.start_capture();
        assert_eq!(read_n(&mut reader, 1), b"$");
        reader.drop_capture();
        assert_eq!(read_n(&mut reader, 6), b"abcdef");
    }

    #[test]
    fn capture_spans_rolled_back_bytes() {
        // A capture started after a rollback records the replayed bytes too.
        let mut reader = RollbackReader::new(Cursor::new(b"abcdef".to_vec()));
        reader.start_capture();
        read_n(&mut reader, 3);
        reader.roll_back();

        reader.start_capture();
        assert_eq!(read_n(&mut reader, 4), b"abcd");
        reader.roll_back();
        assert_eq!(read_n(&mut reader, 6), b"abcdef");
    }

    #[test]
    fn has_buffered_tracks_replay_queue() {
        let mut reader = RollbackReader::new(Cursor::new(b"xy".to_vec()));
        assert!(!reader.has_buffered());
        reader.start_capture();
        read_n(&mut reader, 1);
        reader.roll_back();
        assert!(reader.has_buffered());
        read_n(&mut reader, 1);
        assert!(!reader.has_buffered());
    }
}
