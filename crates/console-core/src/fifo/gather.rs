//! CPU-side write-combining buffer feeding the command pipeline.

/// Size of one forwarded burst in bytes.
pub const GATHER_BURST_BYTES: usize = 32;

/// Accumulates guest stores and forwards them in fixed-size bursts.
#[derive(Debug, Clone, Default)]
pub struct GatherPipe {
    buffer: [u8; GATHER_BURST_BYTES],
    len: usize,
    bursts: u64,
}

impl GatherPipe {
    /// Creates an empty pipe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data`, handing every completed burst to `forward`.
    ///
    /// # Errors
    ///
    /// Propagates the first error returned by `forward`. Bytes of the failed
    /// burst are discarded.
    pub fn write<E>(
        &mut self,
        data: &[u8],
        mut forward: impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut rest = data;
        while !rest.is_empty() {
            let room = GATHER_BURST_BYTES - self.len;
            let (now, later) = rest.split_at(room.min(rest.len()));
            self.buffer[self.len..self.len + now.len()].copy_from_slice(now);
            self.len += now.len();
            rest = later;
            if self.len == GATHER_BURST_BYTES {
                self.len = 0;
                self.bursts += 1;
                forward(&self.buffer)?;
            }
        }
        Ok(())
    }

    /// Forwards any partial burst.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `forward`.
    pub fn flush<E>(&mut self, mut forward: impl FnMut(&[u8]) -> Result<(), E>) -> Result<(), E> {
        if self.len == 0 {
            return Ok(());
        }
        let len = std::mem::take(&mut self.len);
        forward(&self.buffer[..len])
    }

    /// Bytes waiting for a burst to complete.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when no partial burst is buffered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Full bursts forwarded so far.
    #[must_use]
    pub const fn bursts(&self) -> u64 {
        self.bursts
    }
}
