//! Per-command options

/// Options for storage commands.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Item lifetime in seconds. Defaults to the client's lifetime.
    pub lifetime: Option<u32>,
    /// Compress the value if it is large enough
    pub compress: bool,
    /// Do not wait for, or expect, a reply
    pub noreply: bool,
    /// Treat `NOT_STORED` as success. `set` falls back to the client default.
    pub ignore_not_stored: Option<bool>,
    /// Required by `cas`
    pub cas_unique: Option<u64>,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifetime(mut self, seconds: u32) -> Self {
        self.lifetime = Some(seconds);
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn noreply(mut self) -> Self {
        self.noreply = true;
        self
    }

    pub fn ignore_not_stored(mut self, ignore: bool) -> Self {
        self.ignore_not_stored = Some(ignore);
        self
    }

    pub fn cas_unique(mut self, cas: u64) -> Self {
        self.cas_unique = Some(cas);
        self
    }
}

/// Options for other commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandOptions {
    pub noreply: bool,
}

impl CommandOptions {
    pub fn noreply() -> Self {
        Self { noreply: true }
    }
}
