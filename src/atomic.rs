use std::io;
use std::path::Path;

use memmap2::Mmap;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

/// Suffix of the transient side file used by every mutation.
pub(crate) const SIDE_SUFFIX: &str = ".new";

/// Atomically replace `dir/name` with the bytes produced by `source`.
///
/// Protocol: stage into `dir/name.new` (truncating any leftover from a
/// crashed prior attempt), flush, `sync_all` when `fsync`, close the handle,
/// rename over the target, then fsync the directory on the success path.
/// On any failure the side file is deleted best-effort and the error
/// surfaces to the caller; the pre-existing record is untouched.
///
/// Returns the number of bytes written.
pub(crate) async fn write_atomic<R>(
    dir: &Path,
    name: &str,
    source: &mut R,
    fsync: bool,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let side = dir.join(format!("{name}{SIDE_SUFFIX}"));
    match stage_and_swap(dir, &side, name, source, fsync).await {
        Ok(written) => Ok(written),
        Err(err) => {
            let _ = fs::remove_file(&side).await;
            Err(err)
        }
    }
}

async fn stage_and_swap<R>(
    dir: &Path,
    side: &Path,
    name: &str,
    source: &mut R,
    fsync: bool,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(side).await?;
    let written = tokio::io::copy(source, &mut file).await?;
    file.flush().await?;
    if fsync {
        file.sync_all().await?;
    }
    // The descriptor must be closed before the rename on some operating systems.
    drop(file);

    fs::rename(side, dir.join(name)).await?;
    if fsync {
        sync_dir(dir).await?;
    }
    Ok(written)
}

/// Force a directory's entries to stable storage.
///
/// Windows neither permits nor needs this for rename atomicity, so the call
/// is a no-op there.
pub(crate) async fn sync_dir(path: &Path) -> io::Result<()> {
    if cfg!(windows) {
        return Ok(());
    }
    File::open(path).await?.sync_all().await
}

/// Read a whole file, mapping a missing file to `None`.
pub(crate) async fn read_file(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Full contents of a binary record.
pub(crate) enum BlobBytes {
    Mapped(Mmap),
    Empty,
}

impl BlobBytes {
    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            BlobBytes::Mapped(mmap) => mmap,
            BlobBytes::Empty => &[],
        }
    }
}

/// Map a whole file into memory, or `None` if it does not exist.
///
/// mmap calls are blocking, so they run on the blocking thread pool. A
/// zero-length file yields [`BlobBytes::Empty`] since empty mappings are not
/// portable.
pub(crate) async fn map_file(path: &Path) -> io::Result<Option<BlobBytes>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || map_file_sync(&path))
        .await
        .map_err(|err| io::Error::other(format!("blob read task failed: {err}")))?
}

fn map_file_sync(path: &Path) -> io::Result<Option<BlobBytes>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    if file.metadata()?.len() == 0 {
        return Ok(Some(BlobBytes::Empty));
    }
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Some(BlobBytes::Mapped(mmap)))
}
