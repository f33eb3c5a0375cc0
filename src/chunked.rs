use crate::error::{Error, Result};
use std::mem;
use tracing::{debug, trace};

/// Default segment size of a chunked transfer
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Framing appended to every chunked payload
pub const TERMINATOR: &[u8] = b"END\r\n";

/// Length of a payload once framed
#[inline]
#[must_use]
pub const fn framed_len(payload_len: usize) -> usize {
    payload_len.saturating_add(TERMINATOR.len())
}

/// Number of `chunk_size` segments needed for `total` bytes
#[inline]
#[must_use]
pub const fn chunk_count(total: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return 0;
    }
    total.saturating_add(chunk_size.saturating_sub(1)) / chunk_size
}

/// Frame `payload` and split it into segments of at most `chunk_size` bytes
pub fn split_framed(payload: &[u8], chunk_size: usize) -> Result<Vec<Vec<u8>>> {
    if chunk_size == 0 {
        return Err(Error::invalid_state("chunk size must not be zero"));
    }
    let mut framed = Vec::with_capacity(framed_len(payload.len()));
    framed.extend_from_slice(payload);
    framed.extend_from_slice(TERMINATOR);
    let segments: Vec<Vec<u8>> = framed.chunks(chunk_size).map(<[u8]>::to_vec).collect();
    trace!(
        "{} payload bytes framed into {} segments of at most {}",
        payload.len(),
        segments.len(),
        chunk_size
    );
    Ok(segments)
}

/// The payload of a framed message, `None` if the framing is missing
#[inline]
#[must_use]
pub fn strip_terminator(framed: &[u8]) -> Option<&[u8]> {
    framed.strip_suffix(TERMINATOR)
}

/// Progress of a reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More segments are expected
    Incomplete,
    /// The framed message, terminator included
    Complete(Vec<u8>),
}

/// Receiver side of a chunked transfer.
///
/// Sized up front for the announced total. A terminator at the tail completes the
/// message when it arrives with a short segment or with the last budgeted segment; a
/// full-size middle segment that happens to end with it is data.
#[derive(Debug)]
pub struct Reassembler {
    /// Bytes received so far
    assembled: Vec<u8>,
    /// Segment size of the sender
    chunk_size: usize,
    /// Segments the announced total takes
    budget: usize,
    /// Segments received so far
    received: usize,
    /// Whether the message was handed out
    done: bool,
}

impl Reassembler {
    /// Prepare for a framed message of `expected_total` bytes sent in `chunk_size` segments
    pub fn new(expected_total: usize, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::invalid_state("chunk size must not be zero"));
        }
        let budget = chunk_count(expected_total, chunk_size).max(1);
        let capacity = budget.checked_mul(chunk_size).ok_or_else(|| {
            Error::Resource(format!("no room for {budget} segments of {chunk_size} bytes"))
        })?;
        Ok(Self {
            assembled: Vec::with_capacity(capacity),
            chunk_size,
            budget,
            received: 0,
            done: false,
        })
    }

    /// Append one received segment
    pub fn push(&mut self, segment: &[u8]) -> Result<Reassembly> {
        if self.done {
            return Err(Error::invalid_state("segment after the message completed"));
        }
        if segment.len() > self.chunk_size {
            return Err(Error::protocol(format!(
                "segment of {} bytes exceeds the chunk size {}",
                segment.len(),
                self.chunk_size
            )));
        }
        if self.received >= self.budget {
            return Err(Error::protocol(format!(
                "more than {} segments received",
                self.budget
            )));
        }
        self.assembled.extend_from_slice(segment);
        self.received = self.received.saturating_add(1);

        let short = segment.len() < self.chunk_size;
        let last = self.received == self.budget;
        if self.assembled.ends_with(TERMINATOR) && (short || last) {
            self.done = true;
            debug!(
                "reassembled {} bytes from {} segments",
                self.assembled.len(),
                self.received
            );
            return Ok(Reassembly::Complete(mem::take(&mut self.assembled)));
        }
        if short {
            return Err(Error::protocol(format!(
                "short segment of {} bytes without terminator",
                segment.len()
            )));
        }
        if last {
            return Err(Error::protocol(format!(
                "no terminator after {} segments",
                self.budget
            )));
        }
        Ok(Reassembly::Incomplete)
    }

    /// Segments received so far
    #[inline]
    #[must_use]
    pub const fn received(&self) -> usize {
        self.received
    }

    /// Segments the announced total takes
    #[inline]
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn reassemble(segments: &[Vec<u8>], expected: usize, chunk: usize) -> Result<Vec<u8>> {
        let mut reassembler = Reassembler::new(expected, chunk)?;
        for segment in segments {
            if let Reassembly::Complete(message) = reassembler.push(segment)? {
                return Ok(message);
            }
        }
        Err(Error::protocol("ran out of segments"))
    }

    #[test]
    fn payload_survives_chunking_for_every_size_class() {
        let chunk = 16;
        for size in (0..=4 * chunk).chain([5 * chunk - 5, 5 * chunk - 3]) {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let segments = split_framed(&payload, chunk).unwrap();
            assert_eq!(segments.len(), chunk_count(framed_len(size), chunk));
            let message = reassemble(&segments, framed_len(size), chunk).unwrap();
            assert_eq!(strip_terminator(&message).unwrap(), payload.as_slice(), "size {}", size);
        }
    }

    #[test]
    fn terminator_in_a_full_middle_segment_is_data() {
        let chunk = 8;
        // the first segment happens to end with the terminator
        let payload = b"abcEND\r\nxyz".to_vec();
        let segments = split_framed(&payload, chunk).unwrap();
        assert!(segments[0].ends_with(TERMINATOR));
        let message = reassemble(&segments, framed_len(payload.len()), chunk).unwrap();
        assert_eq!(strip_terminator(&message).unwrap(), payload.as_slice());
    }

    #[test]
    fn two_full_chunks_complete_with_the_terminator() {
        let chunk = DEFAULT_CHUNK_SIZE;
        let mut framed = vec![b'v'; 2 * chunk - TERMINATOR.len()];
        framed.extend_from_slice(TERMINATOR);
        let mut reassembler = Reassembler::new(framed.len(), chunk).unwrap();
        assert_eq!(reassembler.budget(), 2);
        assert_eq!(reassembler.push(&framed[..chunk]).unwrap(), Reassembly::Incomplete);
        match reassembler.push(&framed[chunk..]).unwrap() {
            Reassembly::Complete(message) => assert_eq!(message.len(), 2 * chunk),
            Reassembly::Incomplete => panic!("message not completed after two chunks"),
        }
        let err = reassembler.push(b"x").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn two_full_chunks_without_terminator_fail() {
        let chunk = DEFAULT_CHUNK_SIZE;
        let data = vec![b'v'; 2 * chunk];
        let mut reassembler = Reassembler::new(data.len(), chunk).unwrap();
        assert_eq!(reassembler.push(&data[..chunk]).unwrap(), Reassembly::Incomplete);
        let err = reassembler.push(&data[chunk..]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn short_segment_without_terminator_fails() {
        let mut reassembler = Reassembler::new(100, 16).unwrap();
        let err = reassembler.push(b"only data").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn oversized_segment_fails() {
        let mut reassembler = Reassembler::new(100, 16).unwrap();
        let err = reassembler.push(&[0_u8; 17]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert_eq!(split_framed(b"x", 0).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(Reassembler::new(10, 0).unwrap_err().kind(), ErrorKind::InvalidState);
        assert_eq!(chunk_count(10, 0), 0);
    }
}
