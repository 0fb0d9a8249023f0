/// Extracts length-prefixed messages from an ordered byte stream.
///
/// Framing is the one DNS uses over TCP: a 2-byte big-endian length followed
/// by that many bytes, repeated. A frame is complete only once the full
/// payload is buffered; whatever remains when the stream ends is discarded
/// silently (normal end-of-stream, not an error).
#[derive(Default)]
pub struct MessageFramer {
    buf: Vec<u8>,
}

impl MessageFramer {
    pub fn new() -> Self {
        MessageFramer::default()
    }

    /// Append a chunk of the reassembled stream.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([self.buf[0], self.buf[1]]));
        if self.buf.len() < 2 + len {
            return None;
        }
        let message = self.buf[2..2 + len].to_vec();
        self.buf.drain(..2 + len);
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::MessageFramer;

    fn frame(messages: &[&[u8]]) -> Vec<u8> {
        let mut stream = Vec::new();
        for m in messages {
            stream.extend_from_slice(&(m.len() as u16).to_be_bytes());
            stream.extend_from_slice(m);
        }
        stream
    }

    fn drain(framer: &mut MessageFramer) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| framer.next_message()).collect()
    }

    #[test]
    fn frames_round_trip() {
        let messages: &[&[u8]] = &[b"first", b"second message", b""];
        let mut framer = MessageFramer::new();
        framer.feed(&frame(messages));
        assert_eq!(drain(&mut framer), messages);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let stream = frame(&[b"complete", b"truncated"]);
        let mut framer = MessageFramer::new();
        framer.feed(&stream[..stream.len() - 1]);
        assert_eq!(drain(&mut framer), vec![b"complete".to_vec()]);
        // the partial remainder never surfaces
        assert!(framer.next_message().is_none());
    }

    #[test]
    fn prefix_split_across_chunks() {
        let stream = frame(&[b"split"]);
        let mut framer = MessageFramer::new();
        for b in &stream {
            framer.feed(&[*b]);
        }
        assert_eq!(drain(&mut framer), vec![b"split".to_vec()]);
    }

    #[test]
    fn short_prefix_yields_nothing() {
        let mut framer = MessageFramer::new();
        framer.feed(&[0x00]);
        assert!(framer.next_message().is_none());
    }
}
