use std::path::PathBuf;
use std::sync::Arc;

use crate::codec::{Codec, Handlers, JsonCodec};
use crate::errors::Result;
use crate::store::Larder;

/// Configuration for a [`Larder`] store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Force data and directory metadata to stable storage after each
    /// mutating operation (default: `true`).
    ///
    /// Disabling trades crash durability for throughput; atomicity of
    /// individual records is preserved either way.
    pub fsync: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { fsync: true }
    }
}

/// Builder for configuring and opening a [`Larder`] store.
pub struct Builder {
    path: PathBuf,
    config: Config,
    codec: Arc<dyn Codec>,
    read_handlers: Handlers,
    write_handlers: Handlers,
}

impl Builder {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            config: Config::default(),
            codec: Arc::new(JsonCodec),
            read_handlers: Handlers::new(),
            write_handlers: Handlers::new(),
        }
    }

    /// Whether mutating operations fsync file data and the directory.
    ///
    /// Default: `true`.
    #[must_use]
    pub fn fsync(mut self, fsync: bool) -> Self {
        self.config.fsync = fsync;
        self
    }

    /// Replace the serializer (default: [`JsonCodec`]).
    #[must_use]
    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Handler registry consulted when decoding records (default: empty).
    #[must_use]
    pub fn read_handlers(mut self, handlers: Handlers) -> Self {
        self.read_handlers = handlers;
        self
    }

    /// Handler registry consulted when encoding records (default: empty).
    #[must_use]
    pub fn write_handlers(mut self, handlers: Handlers) -> Self {
        self.write_handlers = handlers;
        self
    }

    /// Open the store with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns [`LarderError::NotWritable`](crate::LarderError::NotWritable)
    /// if the folder cannot be created or fails the writability probe.
    pub async fn open(self) -> Result<Larder> {
        Larder::with_options(
            self.path,
            self.codec,
            self.read_handlers,
            self.write_handlers,
            self.config,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.fsync);
    }

    #[test]
    fn test_builder_overrides_fsync() {
        let builder = Builder::new("./scratch".into()).fsync(false);
        assert!(!builder.config.fsync);
    }

    #[tokio::test]
    async fn test_builder_opens_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Builder::new(dir.path().to_path_buf()).fsync(false).open().await.unwrap();
        store.assoc(&serde_json::json!("k"), serde_json::json!(1)).await.unwrap();
    }
}
