//! Reassembles console output into lines across arbitrarily split reads

/// Maximum pending characters before a partial line is emitted as-is
pub const MAX_LINE: usize = 256;

/// Accumulates received bytes until a CR or LF terminates a line
#[derive(Clone, Debug, Default)]
pub struct LineAssembler {
    pending: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a received chunk, yielding each completed line (terminator stripped).
    ///
    /// Lines are produced lazily; trailing unterminated text remains buffered
    /// for the next call. Dropping the iterator early discards the unread
    /// portion of `bytes`.
    pub fn feed<'a>(&'a mut self, bytes: &'a [u8]) -> Lines<'a> {
        Lines {
            pending: &mut self.pending,
            bytes,
        }
    }

    /// Take any buffered unterminated text
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    /// Number of characters waiting for a terminator
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Iterator over the lines completed by a single [`LineAssembler::feed`] call
pub struct Lines<'a> {
    pending: &'a mut String,
    bytes: &'a [u8],
}

impl<'a> Iterator for Lines<'a> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while let Some((&b, rest)) = self.bytes.split_first() {
            self.bytes = rest;

            match b {
                b'\r' | b'\n' => return Some(std::mem::take(self.pending)),
                _ => {
                    // Console output is ASCII, map bytes 1:1 so noise cannot fail decoding
                    self.pending.push(char::from(b));

                    if self.pending.len() >= MAX_LINE {
                        return Some(std::mem::take(self.pending));
                    }
                }
            }
        }

        None
    }
}
