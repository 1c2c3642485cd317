//! Record reassembly across arbitrary chunk boundaries.
//!
//! Incoming chunks are appended to a single buffer and split on the record
//! terminator. Everything up to the last terminator is handed out as complete
//! records; the bytes after it stay behind as the fragment for the next chunk.
//! Because splitting always happens on the accumulated buffer, a chunk that
//! ends mid-field, mid-terminator or exactly on a record boundary all look the
//! same.

/// Default record terminator.
pub const RECORD_TERMINATOR: u8 = b'\n';

/// Accumulates byte chunks and yields complete records.
#[derive(Debug)]
pub struct Reassembler {
    buf: Vec<u8>,
    /// Start of the bytes not yet handed out.
    start: usize,
    /// `buf[start..searched]` is known to contain no terminator.
    searched: usize,
    terminator: u8,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(RECORD_TERMINATOR)
    }
}

impl Reassembler {
    /// Create a reassembler splitting on `terminator`.
    pub fn new(terminator: u8) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            searched: 0,
            terminator,
        }
    }

    /// Append a chunk and iterate over the records it completes.
    ///
    /// Records are yielded without their terminator. Records that the caller
    /// does not consume are not lost: they are yielded again by the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Records<'_> {
        self.compact();
        self.buf.extend_from_slice(chunk);
        self.records(false)
    }

    /// Iterate over the remaining records at end-of-input.
    ///
    /// The trailing fragment is yielded as a final record even without a
    /// terminator. An empty fragment yields nothing.
    pub fn finish(&mut self) -> Records<'_> {
        self.compact();
        self.records(true)
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.searched -= self.start;
            self.start = 0;
        }
    }

    fn records(&mut self, at_end: bool) -> Records<'_> {
        let Reassembler {
            buf,
            start,
            searched,
            terminator,
        } = self;
        Records {
            buf: buf.as_slice(),
            start,
            searched,
            terminator: *terminator,
            at_end,
        }
    }
}

/// Lazy iterator over complete records held by a [`Reassembler`].
pub struct Records<'a> {
    buf: &'a [u8],
    start: &'a mut usize,
    searched: &'a mut usize,
    terminator: u8,
    at_end: bool,
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let begin = *self.start;
        let scan_from = (*self.searched).max(begin);

        match self.buf[scan_from..].iter().position(|&b| b == self.terminator) {
            Some(offset) => {
                let end = scan_from + offset;
                *self.start = end + 1;
                *self.searched = end + 1;
                Some(&self.buf[begin..end])
            }
            None if self.at_end && begin < self.buf.len() => {
                *self.start = self.buf.len();
                *self.searched = self.buf.len();
                Some(&self.buf[begin..])
            }
            None => {
                *self.searched = self.buf.len();
                None
            }
        }
    }
}
