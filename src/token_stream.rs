/// Ordered output of one request. Fragments are owned, append-only and read
/// through a cursor that only moves forward.
#[derive(Debug, Default, Clone)]
pub struct TokenStreamBuffer {
    fragments: Vec<String>,
    cursor: usize,
    finished: bool,
    failure: Option<String>,
}

impl TokenStreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the stream is already finished; late fragments are
    /// dropped.
    pub fn append(&mut self, fragment: impl Into<String>) -> bool {
        if self.finished {
            return false;
        }
        self.fragments.push(fragment.into());
        true
    }

    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// Finishes the stream with an error. Unread fragments are discarded so the
    /// reader sees the failure next.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.failure.is_none() {
            self.failure = Some(message.into());
        }
        self.cursor = self.fragments.len();
        self.finished = true;
    }

    pub fn next_unread(&mut self) -> Option<&str> {
        let fragment = self.fragments.get(self.cursor)?;
        self.cursor += 1;
        Some(fragment.as_str())
    }

    #[cfg(test)]
    pub fn has_unread(&self) -> bool {
        self.cursor < self.fragments.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_completely_finished(&self) -> bool {
        self.finished && self.cursor == self.fragments.len()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    /// Rewinds to the first fragment. Only for re-draining a reused buffer.
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }
}
