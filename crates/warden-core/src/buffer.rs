/// Byte capture bounded by a fixed ceiling.
///
/// Bytes past the ceiling are dropped and the truncated flag is set for good.
/// A ceiling of zero is truncated from the start.
#[derive(Debug, Clone)]
pub struct TruncatingBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl TruncatingBuffer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: limit == 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let room = self.limit.saturating_sub(self.data.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        let take = chunk.len().min(room);
        self.data.extend_from_slice(&chunk[..take]);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Captured bytes as text; a multi-byte sequence cut at the ceiling is replaced.
    #[must_use]
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
