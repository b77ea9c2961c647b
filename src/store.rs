use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::atomic;
use crate::codec::{Codec, Handlers};
use crate::config::{Builder, Config};
use crate::errors::{Cause, LarderError, Result};
use crate::fingerprint::Fingerprint;
use crate::locks::LockTable;
use crate::paths::{self, PathStep};

/// Durable, crash-consistent, file-backed key-value store.
///
/// Keys are arbitrary structured values; each key owns either a structured
/// record (a serialized value graph) or a binary blob, named on disk by the
/// key's fingerprint. Operations on the same key serialize through a per-key
/// lock; operations on different keys proceed in parallel. Every mutation
/// goes through a side-file-and-rename protocol, so readers observe either
/// the pre-write or the post-write contents, never a torn file.
pub struct Larder {
    dir: PathBuf,
    codec: Arc<dyn Codec>,
    read_handlers: ArcSwap<Handlers>,
    write_handlers: ArcSwap<Handlers>,
    locks: LockTable,
    config: Config,
}

impl std::fmt::Debug for Larder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Larder")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Contents of a binary record, handed to the `bget` callback while the
/// per-key lock is held.
pub struct Blob<'a> {
    bytes: &'a [u8],
    path: &'a Path,
}

impl<'a> Blob<'a> {
    /// The full record contents.
    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Record length in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// A readable stream over the record contents.
    #[must_use]
    pub fn reader(&self) -> Cursor<&'a [u8]> {
        Cursor::new(self.bytes)
    }

    /// Path of the underlying file; stable for the duration of the callback.
    #[must_use]
    pub fn path(&self) -> &'a Path {
        self.path
    }
}

impl Larder {
    /// Open a store at `path` with default configuration.
    ///
    /// Creates the folder if missing, then verifies writability by writing
    /// and deleting a probe file under a random name.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use larder::Larder;
    /// use serde_json::json;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let store = Larder::open("./data").await?;
    ///     store.assoc(&json!("answer"), json!(42)).await?;
    ///     assert_eq!(store.get(&json!("answer")).await?, Some(json!(42)));
    ///     Ok(())
    /// }
    /// ```
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Builder::new(path.into()).open().await
    }

    /// Builder for custom configuration.
    pub fn builder(path: impl Into<PathBuf>) -> Builder {
        Builder::new(path.into())
    }

    pub(crate) async fn with_options(
        dir: PathBuf,
        codec: Arc<dyn Codec>,
        read_handlers: Handlers,
        write_handlers: Handlers,
        config: Config,
    ) -> Result<Self> {
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| LarderError::NotWritable { path: dir.clone(), source })?;

        let probe = dir.join(format!("probe-{}", Uuid::new_v4()));
        if let Err(source) = probe_writable(&probe).await {
            return Err(LarderError::NotWritable { path: dir, source });
        }

        Ok(Self {
            dir,
            codec,
            read_handlers: ArcSwap::from_pointee(read_handlers),
            write_handlers: ArcSwap::from_pointee(write_handlers),
            locks: LockTable::default(),
            config,
        })
    }

    /// Delete the store at `path`: unlink every regular file, remove the
    /// folder, then best-effort fsync the parent directory.
    pub async fn destroy(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                fs::remove_file(entry.path()).await?;
            }
        }
        fs::remove_dir(path).await?;
        if let Some(parent) = path.parent() {
            let _ = atomic::sync_dir(parent).await;
        }
        Ok(())
    }

    /// Whether any record (structured or binary) exists for `key`.
    ///
    /// Does not take the per-key lock; racy with concurrent writers and
    /// meant as a hint.
    pub async fn exists(&self, key: &Value) -> Result<bool> {
        let fp = Fingerprint::of(key);
        if fs::try_exists(self.dir.join(fp.record_name()))
            .await
            .map_err(|cause| LarderError::read(key, cause))?
        {
            return Ok(true);
        }
        fs::try_exists(self.dir.join(fp.blob_name()))
            .await
            .map_err(|cause| LarderError::read(key, cause))
    }

    /// The structured value stored under `key`, or `None`.
    pub async fn get(&self, key: &Value) -> Result<Option<Value>> {
        self.get_in(key, &[]).await
    }

    /// The sub-value at `path` inside the value stored under `key`.
    ///
    /// Yields `None` when the record does not exist or any path component is
    /// absent.
    pub async fn get_in(&self, key: &Value, path: &[PathStep]) -> Result<Option<Value>> {
        let fp = Fingerprint::of(key);
        let _guard = self.locks.acquire(fp).await;

        let Some(bytes) = atomic::read_file(&self.dir.join(fp.record_name()))
            .await
            .map_err(|cause| LarderError::read(key, cause))?
        else {
            return Ok(None);
        };
        let value = self.decode_record(key, &bytes)?;
        Ok(paths::get_path(&value, path).cloned())
    }

    /// Replace the whole value under `key`.
    pub async fn assoc(&self, key: &Value, value: Value) -> Result<()> {
        self.assoc_in(key, &[], value).await
    }

    /// Replace the sub-value at `path` under `key`, creating missing
    /// intermediate mappings.
    pub async fn assoc_in(&self, key: &Value, path: &[PathStep], value: Value) -> Result<()> {
        self.update_in(key, path, move |_| value).await?;
        Ok(())
    }

    /// Transform the whole value under `key` with `f`.
    ///
    /// Returns the old and new values. `f` receives `None` when no record
    /// exists yet; a `Null` result is stored like any other value — deletion
    /// is reserved to [`dissoc`](Self::dissoc).
    pub async fn update<F>(&self, key: &Value, f: F) -> Result<(Option<Value>, Option<Value>)>
    where
        F: FnOnce(Option<Value>) -> Value + Send,
    {
        self.update_in(key, &[], f).await
    }

    /// Transform the sub-value at `path` under `key` with `f`, creating
    /// missing intermediate mappings on the way down.
    ///
    /// Runs under the per-key lock: read the old record, compute the new
    /// value, write it through the atomic protocol. Returns the sub-values
    /// at `path` before and after the update. An `Index` step may rewrite an
    /// existing sequence slot or append at the sequence end; an index past
    /// the end is a write error and leaves the record untouched.
    pub async fn update_in<F>(
        &self,
        key: &Value,
        path: &[PathStep],
        f: F,
    ) -> Result<(Option<Value>, Option<Value>)>
    where
        F: FnOnce(Option<Value>) -> Value + Send,
    {
        let fp = Fingerprint::of(key);
        let _guard = self.locks.acquire(fp).await;

        let old_value = match atomic::read_file(&self.dir.join(fp.record_name()))
            .await
            .map_err(|cause| LarderError::read(key, cause))?
        {
            Some(bytes) => Some(self.decode_record(key, &bytes)?),
            None => None,
        };

        let new_value = paths::update_path(old_value.clone(), path, f)
            .map_err(|cause| LarderError::write(key, cause))?;
        self.write_record(fp, key, &new_value).await?;

        Ok((
            paths::get_path_owned(old_value.as_ref(), path),
            paths::get_path_owned(Some(&new_value), path),
        ))
    }

    /// Delete the structured record for `key`.
    ///
    /// Succeeds whether or not the record exists.
    pub async fn dissoc(&self, key: &Value) -> Result<()> {
        let fp = Fingerprint::of(key);
        let _guard = self.locks.acquire(fp).await;

        match fs::remove_file(self.dir.join(fp.record_name())).await {
            Ok(()) => {
                if self.config.fsync {
                    atomic::sync_dir(&self.dir)
                        .await
                        .map_err(|cause| LarderError::write(key, cause))?;
                }
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LarderError::write(key, err)),
        }
    }

    /// Stream opaque bytes into the binary record for `key`.
    pub async fn bassoc<R>(&self, key: &Value, mut source: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let fp = Fingerprint::of(key);
        let _guard = self.locks.acquire(fp).await;

        atomic::write_atomic(&self.dir, &fp.blob_name(), &mut source, self.config.fsync)
            .await
            .map(|_| ())
            .map_err(|cause| LarderError::write(key, cause))
    }

    /// Read the binary record for `key` and hand it to `f` while the
    /// per-key lock is held, so the blob cannot be rewritten underneath the
    /// callback.
    ///
    /// Returns `Ok(false)` when no binary record exists. The callback's
    /// return value is discarded beyond error propagation; callback errors
    /// surface as read errors.
    pub async fn bget<F>(&self, key: &Value, f: F) -> Result<bool>
    where
        F: FnOnce(Blob<'_>) -> io::Result<()> + Send,
    {
        let fp = Fingerprint::of(key);
        let _guard = self.locks.acquire(fp).await;

        let path = self.dir.join(fp.blob_name());
        let Some(bytes) =
            atomic::map_file(&path).await.map_err(|cause| LarderError::read(key, cause))?
        else {
            return Ok(false);
        };

        f(Blob { bytes: bytes.as_slice(), path: &path })
            .map_err(|cause| LarderError::read(key, cause))?;
        Ok(true)
    }

    /// All keys with a structured record, in no particular order.
    ///
    /// Eventually consistent: the directory listing is snapshotted once,
    /// then each record is decoded under its per-key lock. Records deleted
    /// after the snapshot are skipped; records created after it are not
    /// reported. Binary records are not tracked.
    pub async fn keys(&self) -> Result<Vec<Value>> {
        let mut fingerprints = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let fp = entry.file_name().to_str().and_then(Fingerprint::from_record_name);
            if let Some(fp) = fp {
                fingerprints.push(fp);
            }
        }

        let mut keys = Vec::with_capacity(fingerprints.len());
        for fp in fingerprints {
            let _guard = self.locks.acquire(fp).await;
            let path = self.dir.join(fp.record_name());
            // Vanished between listing and open.
            let Some(bytes) = atomic::read_file(&path).await? else { continue };
            match self.decode_pair(&bytes) {
                Ok((stored_key, _)) => keys.push(stored_key),
                Err(cause) => {
                    tracing::warn!(
                        file = %path.display(),
                        error = %cause,
                        "skipping undecodable record during enumeration"
                    );
                }
            }
        }
        Ok(keys)
    }

    /// Install a new read-handler registry; observed by operations that
    /// start after the call.
    pub fn set_read_handlers(&self, handlers: Handlers) {
        self.read_handlers.store(Arc::new(handlers));
    }

    /// Install a new write-handler registry; observed by operations that
    /// start after the call.
    pub fn set_write_handlers(&self, handlers: Handlers) {
        self.write_handlers.store(Arc::new(handlers));
    }

    /// Decode a record payload into its `(stored-key, value)` pair.
    fn decode_pair(&self, bytes: &[u8]) -> std::result::Result<(Value, Value), Cause> {
        let handlers = self.read_handlers.load();
        let record = self.codec.decode(bytes, &handlers)?;
        let Value::Array(mut pair) = record else {
            return Err("record is not a key-value pair".into());
        };
        if pair.len() != 2 {
            return Err("record is not a key-value pair".into());
        }
        let value = pair.pop().unwrap_or(Value::Null);
        let stored_key = pair.pop().unwrap_or(Value::Null);
        Ok((stored_key, value))
    }

    /// Decode a record for `key`, verifying the stored key matches.
    fn decode_record(&self, key: &Value, bytes: &[u8]) -> Result<Value> {
        let (stored_key, value) =
            self.decode_pair(bytes).map_err(|cause| LarderError::Read { key: key.clone(), cause })?;
        if stored_key != *key {
            return Err(LarderError::read(
                key,
                format!("fingerprint collision: record belongs to key {stored_key}"),
            ));
        }
        Ok(value)
    }

    async fn write_record(&self, fp: Fingerprint, key: &Value, value: &Value) -> Result<()> {
        let record = Value::Array(vec![key.clone(), value.clone()]);
        let handlers = self.write_handlers.load();
        let bytes = self
            .codec
            .encode(&record, &handlers)
            .map_err(|cause| LarderError::write(key, cause))?;

        let mut source = bytes.as_slice();
        atomic::write_atomic(&self.dir, &fp.record_name(), &mut source, self.config.fsync)
            .await
            .map(|_| ())
            .map_err(|cause| LarderError::write(key, cause))
    }
}

async fn probe_writable(path: &Path) -> io::Result<()> {
    fs::write(path, b"").await?;
    fs::remove_file(path).await
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::codec::{CodecError, JsonCodec};

    /// Codec that decodes normally but refuses to encode, for modeling a
    /// failure before the side-file write.
    struct EncodeBomb;

    impl Codec for EncodeBomb {
        fn encode(
            &self,
            _value: &Value,
            _handlers: &Handlers,
        ) -> std::result::Result<Vec<u8>, CodecError> {
            Err("encoder refused".into())
        }

        fn decode(
            &self,
            bytes: &[u8],
            handlers: &Handlers,
        ) -> std::result::Result<Value, CodecError> {
            JsonCodec.decode(bytes, handlers)
        }
    }

    #[tokio::test]
    async fn test_assoc_update_get() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();
        let key = json!("bar");

        store.assoc(&key, json!(42)).await.unwrap();
        store
            .update(&key, |old| json!(old.and_then(|v| v.as_i64()).unwrap_or_default() + 1))
            .await
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(json!(43)));
    }

    #[tokio::test]
    async fn test_nested_update_in() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();
        let key = json!("foo");
        let path: Vec<PathStep> = vec!["bar".into(), "foo".into()];

        store.assoc(&key, json!({"bar": {"foo": "baz"}})).await.unwrap();
        store
            .update_in(&key, &path, |old| {
                json!(format!(
                    "{}foo",
                    old.and_then(|v| v.as_str().map(String::from)).unwrap_or_default()
                ))
            })
            .await
            .unwrap();

        assert_eq!(store.get_in(&key, &path).await.unwrap(), Some(json!("bazfoo")));
    }

    #[tokio::test]
    async fn test_update_in_returns_old_and_new_sub_values() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();
        let key = json!(["counters", 7]);
        let path: Vec<PathStep> = vec!["hits".into()];

        let (old, new) = store.update_in(&key, &path, |_| json!(1)).await.unwrap();
        assert_eq!(old, None);
        assert_eq!(new, Some(json!(1)));

        let (old, new) = store.update_in(&key, &path, |_| json!(2)).await.unwrap();
        assert_eq!(old, Some(json!(1)));
        assert_eq!(new, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_update_in_out_of_range_index_preserves_sequence() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();
        let key = json!("seq");

        store.assoc(&key, json!([10, 20, 30])).await.unwrap();
        let err = store
            .update_in(&key, &[PathStep::Index(5)], |_| json!("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LarderError::Write { .. }));

        assert_eq!(store.get(&key).await.unwrap(), Some(json!([10, 20, 30])));
    }

    #[tokio::test]
    async fn test_null_is_a_value_not_a_deletion() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();
        let key = json!("nullable");

        store.assoc(&key, Value::Null).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(Value::Null));
    }

    #[tokio::test]
    async fn test_dissoc_removes_record() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();
        let key = json!("doomed");

        store.assoc(&key, json!("value")).await.unwrap();
        store.dissoc(&key).await.unwrap();

        assert!(!store.exists(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dissoc_unset_key_is_not_an_error() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();

        store.dissoc(&json!("never set")).await.unwrap();
    }

    #[tokio::test]
    async fn test_exists_sees_binary_records() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();
        let key = json!("blobby");

        assert!(!store.exists(&key).await.unwrap());
        store.bassoc(&key, &b"raw"[..]).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_bget_missing_yields_false() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();

        let found = store.bget(&json!("absent"), |_| panic!("must not run")).await.unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn test_bget_callback_error_is_read_error_and_store_survives() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();
        let key = json!("blob");

        store.bassoc(&key, &b"bytes"[..]).await.unwrap();
        let err = store
            .bget(&key, |_| Err(io::Error::other("consumer exploded")))
            .await
            .unwrap_err();
        assert!(matches!(err, LarderError::Read { .. }));

        // The store stays usable and the blob is untouched.
        let found = store
            .bget(&key, |blob| {
                assert_eq!(blob.bytes(), b"bytes");
                assert_eq!(blob.size(), 5);
                Ok(())
            })
            .await
            .unwrap();
        assert!(found);
    }

    #[tokio::test]
    async fn test_keys_lists_structured_records_only() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();

        store.assoc(&json!("a"), json!(1)).await.unwrap();
        store.assoc(&json!({"composite": true}), json!(2)).await.unwrap();
        store.bassoc(&json!("binary"), &b"opaque"[..]).await.unwrap();

        let mut keys = store.keys().await.unwrap();
        keys.sort_by_key(ToString::to_string);
        assert_eq!(keys, vec![json!("a"), json!({"composite": true})]);
    }

    #[tokio::test]
    async fn test_failed_encode_preserves_record_and_leaves_no_side_file() {
        let dir = tempdir().unwrap();
        {
            let store = Larder::open(dir.path()).await.unwrap();
            store.assoc(&json!("stable"), json!("before")).await.unwrap();
        }

        let store = Larder::builder(dir.path()).codec(EncodeBomb).open().await.unwrap();
        let err = store.assoc(&json!("stable"), json!("after")).await.unwrap_err();
        assert!(matches!(err, LarderError::Write { .. }));

        let store = Larder::open(dir.path()).await.unwrap();
        assert_eq!(store.get(&json!("stable")).await.unwrap(), Some(json!("before")));

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(
            !entries.any(|e| e.unwrap().file_name().to_string_lossy().ends_with(".new")),
            "no side file may survive a failed operation"
        );
    }

    #[tokio::test]
    async fn test_read_handlers_swap_applies_to_later_reads() {
        let dir = tempdir().unwrap();
        let store = Larder::open(dir.path()).await.unwrap();
        let key = json!("tagged");

        store.assoc(&key, json!({"@tag": "flag", "@value": 1})).await.unwrap();
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(json!({"@tag": "flag", "@value": 1}))
        );

        store.set_read_handlers(Handlers::new().with("flag", |_| json!(true)));
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(json!({"@tag": "flag", "@value": true}))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_only_folder_is_not_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let folder = dir.path().join("frozen");
        std::fs::create_dir(&folder).unwrap();
        std::fs::set_permissions(&folder, std::fs::Permissions::from_mode(0o555)).unwrap();

        let err = Larder::open(&folder).await.unwrap_err();
        assert!(matches!(err, LarderError::NotWritable { .. }));

        std::fs::set_permissions(&folder, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn test_destroy_removes_folder() {
        let dir = tempdir().unwrap();
        let folder = dir.path().join("store");
        {
            let store = Larder::open(&folder).await.unwrap();
            store.assoc(&json!("k"), json!("v")).await.unwrap();
            store.bassoc(&json!("b"), &b"raw"[..]).await.unwrap();
        }

        Larder::destroy(&folder).await.unwrap();
        assert!(!folder.exists());
    }
}
