/// Runtime configuration for an opened database.
#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    /// Number of buffered items that triggers an asynchronous segment
    /// flush inside a write transaction.
    pub max_buffered_items: usize,
    /// Run the tiered merge policy in the background after each committed
    /// write transaction.
    pub enable_auto_compact: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_buffered_items: 10 * 1024 * 1024,
            enable_auto_compact: true,
        }
    }
}

impl DatabaseConfig {
    /// Set the buffered-item flush threshold.
    pub fn with_max_buffered_items(mut self, n: usize) -> Self {
        self.max_buffered_items = n;
        self
    }

    /// Enable or disable background merging.
    pub fn with_auto_compact(mut self, enabled: bool) -> Self {
        self.enable_auto_compact = enabled;
        self
    }
}
