use dashmap::DashMap;

/// Named sequences of log lines waiting to be shipped
#[derive(Debug, Default)]
pub struct LogBuffers {
    buffers: DashMap<String, Vec<String>>,
}

impl LogBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, name: &str, line: impl Into<String>) {
        self.buffers
            .entry(name.to_string())
            .or_default()
            .push(line.into());
    }

    pub fn extend<I>(&self, name: &str, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.buffers
            .entry(name.to_string())
            .or_default()
            .extend(lines);
    }

    /// Copy of the lines currently buffered under `name`
    pub fn lines(&self, name: &str) -> Vec<String> {
        self.buffers
            .get(name)
            .map(|b| b.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self, name: &str) -> usize {
        self.buffers.get(name).map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }

    /// Atomically copy and clear the buffer
    pub fn take(&self, name: &str) -> Vec<String> {
        self.buffers
            .get_mut(name)
            .map(|mut b| std::mem::take(b.value_mut()))
            .unwrap_or_default()
    }

    /// Remove the first `count` lines, keeping anything appended after they were read
    pub fn drain_front(&self, name: &str, count: usize) {
        if let Some(mut buffer) = self.buffers.get_mut(name) {
            let count = count.min(buffer.len());
            buffer.drain(..count);
        }
    }

    pub fn clear(&self, name: &str) {
        if let Some(mut buffer) = self.buffers.get_mut(name) {
            buffer.clear();
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.buffers.iter().map(|b| b.key().clone()).collect()
    }
}
