use bytes::{BufMut, Bytes, BytesMut};

use crate::Error;

/// Records larger than this are rejected before any allocation happens,
/// this is to prevent a malformed or hostile peer from pinning down an
/// arbitrary amount of memory with a single length header.
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Prefix a payload with its 4-byte big-endian length.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(payload.len() + 4);
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    dst.freeze()
}

enum State {
    /// Waiting for the 4-byte big-endian length header.
    Header,
    /// Waiting for a payload of the given size.
    Body(usize),
}

/// Incremental record parser for the peer-to-peer stream.
///
/// Bytes are pushed in whatever chunks the socket produces; whole payloads
/// come out. Partial reads are buffered internally, and payloads are
/// emitted as single contiguous buffers.
///
/// # Example
///
/// ```
/// use bus_server_codec::framing::{Framer, frame};
///
/// let record = frame(b"hello");
///
/// let mut framer = Framer::default();
/// framer.extend(&record[..3]);
/// assert!(framer.next_record().unwrap().is_none());
///
/// framer.extend(&record[3..]);
/// assert_eq!(framer.next_record().unwrap().unwrap().as_ref(), b"hello");
/// ```
pub struct Framer {
    state: State,
    buffer: BytesMut,
}

impl Default for Framer {
    fn default() -> Self {
        Self {
            state: State::Header,
            buffer: BytesMut::with_capacity(4096),
        }
    }
}

impl Framer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Take the next complete payload out of the internal buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A length header
    /// beyond [`MAX_RECORD_SIZE`] is a protocol error and poisons the
    /// stream, the caller is expected to drop the connection.
    pub fn next_record(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            match self.state {
                State::Header => {
                    if self.buffer.len() < 4 {
                        return Ok(None);
                    }

                    let size = u32::from_be_bytes(self.buffer[..4].try_into()?) as usize;
                    if size > MAX_RECORD_SIZE {
                        return Err(Error::RecordTooLarge(size));
                    }

                    let _ = self.buffer.split_to(4);
                    self.state = State::Body(size);
                }
                State::Body(size) => {
                    if self.buffer.len() < size {
                        return Ok(None);
                    }

                    self.state = State::Header;
                    return Ok(Some(self.buffer.split_to(size).freeze()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_across_arbitrary_chunks() {
        let first = frame(b"first");
        let second = frame(b"second");

        let mut stream = Vec::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);

        for chunk_size in 1..stream.len() {
            let mut framer = Framer::default();
            let mut records = Vec::new();

            for chunk in stream.chunks(chunk_size) {
                framer.extend(chunk);
                while let Some(record) = framer.next_record().unwrap() {
                    records.push(record);
                }
            }

            assert_eq!(records.len(), 2);
            assert_eq!(records[0].as_ref(), b"first");
            assert_eq!(records[1].as_ref(), b"second");
        }
    }

    #[test]
    fn empty_payload_is_a_valid_record() {
        let mut framer = Framer::default();
        framer.extend(&frame(b""));

        assert_eq!(framer.next_record().unwrap().unwrap().len(), 0);
        assert!(framer.next_record().unwrap().is_none());
    }

    #[test]
    fn oversized_length_header_is_rejected() {
        let mut framer = Framer::default();
        framer.extend(&u32::MAX.to_be_bytes());

        assert!(matches!(
            framer.next_record(),
            Err(Error::RecordTooLarge(_))
        ));
    }
}
