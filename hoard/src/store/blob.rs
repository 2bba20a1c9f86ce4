//! Content-addressed blob storage with reference-counted garbage collection.
//!
//! A blob is an opaque byte sequence stored under the lowercase hex SHA-256 of
//! its contents, split as `<root>/<hash[..4]>/<hash[4..]>`. Next to the
//! content sits a `.meta.json` sidecar with the digest set and the *pointer*
//! map: named references with their insertion time. A blob with at least one
//! pointer must not be deleted; a blob without pointers is fair game for
//! [BlobStore::gc].
//!
//! Writes are staged under `<root>/cache/<uuid>` and renamed into place, so a
//! reader only ever observes complete blobs. Writers, readers and the sweep
//! coordinate through one RW lock per hash.

use crate::util::lock_group::{BlockingOwned, LockGroup};
use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OwnedRwLockReadGuard;
use tracing::{debug, warn};
use uuid::Uuid;

const SIDECAR_SUFFIX: &str = ".meta.json";
const STAGING_DIR: &str = "cache";

/// Sidecar record stored next to each blob.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Sidecar {
    /// Pointer name to insertion time. Empty means deletable.
    points: BTreeMap<String, DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    md5: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    sha1: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    sha256: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    sha512: String,
}

/// Content-addressed blob store rooted at a directory.
///
/// Multiple threads may use the store in parallel; per-hash RW locks serialize
/// writers and the GC sweep against open readers.
pub struct BlobStore {
    root: PathBuf,
    staging: PathBuf,
    locks: LockGroup,
}

impl BlobStore {
    /// Opens (and creates, if necessary) a blob store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&staging)?;
        Ok(BlobStore {
            root,
            staging,
            locks: LockGroup::new(),
        })
    }

    /// Removes staging files left behind by a previous hard kill.
    ///
    /// Must only be called before the store starts accepting writes.
    pub fn clean_leftover_staging(&self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in self.staging.read_dir()? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn content_path(&self, hash: &str) -> io::Result<PathBuf> {
        if hash.len() < 5 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("invalid blob hash: {hash:?}"),
            ));
        }
        Ok(self.root.join(&hash[..4]).join(&hash[4..]))
    }

    fn sidecar_path(content_path: &Path) -> PathBuf {
        let mut path = content_path.to_path_buf().into_os_string();
        path.push(SIDECAR_SUFFIX);
        PathBuf::from(path)
    }

    /// Returns a writer staging a new blob into the store.
    ///
    /// The staged bytes only become visible once [BlobWriter::commit] runs;
    /// dropping the writer discards them. Staging names are fresh UUIDs, so
    /// any number of writers may run in parallel.
    pub fn writer(self: &Arc<Self>) -> io::Result<BlobWriter> {
        let staging_path = self.staging.join(Uuid::new_v4().to_string());
        let file = File::create(&staging_path)?;
        Ok(BlobWriter {
            store: self.clone(),
            file: Some(file),
            staging_path,
            md5: Md5::new(),
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            sha512: Sha512::new(),
            committed: false,
        })
    }

    /// Streams `reader` into the store and returns the SHA-256 of its
    /// contents. If `pointer` is non-empty it is added to the blob's pointer
    /// set.
    pub fn update<R: Read>(self: &Arc<Self>, pointer: &str, reader: &mut R) -> io::Result<String> {
        let mut writer = self.writer()?;
        io::copy(reader, &mut writer)?;
        writer.commit(pointer)
    }

    /// Adds `pointer` to the pointer set of the blob `hash`.
    ///
    /// Fails with [ErrorKind::NotFound] if the blob content is absent.
    pub fn add_pointer(&self, hash: &str, pointer: &str) -> io::Result<()> {
        let content_path = self.content_path(hash)?;
        let lock = self.locks.get(hash);
        let _guard = lock.blocking_write();
        fs::metadata(&content_path)?;
        self.update_sidecar(&content_path, |sidecar| {
            sidecar.points.insert(pointer.to_owned(), Utc::now());
        })
    }

    /// Removes `pointer` from the pointer set of the blob `hash`.
    ///
    /// An empty pointer set is allowed and is what makes the blob collectable.
    pub fn del_pointer(&self, hash: &str, pointer: &str) -> io::Result<()> {
        let content_path = self.content_path(hash)?;
        let lock = self.locks.get(hash);
        let _guard = lock.blocking_write();
        fs::metadata(&content_path)?;
        self.update_sidecar(&content_path, |sidecar| {
            sidecar.points.remove(pointer);
        })
    }

    /// Opens the blob `hash` for reading.
    ///
    /// The returned reader holds the shared per-hash lock until it is
    /// dropped, so the blob cannot be deleted while it is being read.
    pub fn get(&self, hash: &str) -> io::Result<BlobReader> {
        let content_path = self.content_path(hash)?;
        let guard = self.locks.get(hash).blocking_read_owned();
        let file = File::open(content_path)?;
        Ok(BlobReader {
            file,
            _guard: guard,
        })
    }

    /// Deletes the blob `hash` if its pointer set is empty.
    ///
    /// A pointer inserted since the caller looked surfaces as
    /// [ErrorKind::AlreadyExists]; the re-check under the exclusive lock is
    /// what makes the sweep safe against concurrent insertions.
    pub fn delete(&self, hash: &str) -> io::Result<()> {
        let content_path = self.content_path(hash)?;
        let sidecar_path = Self::sidecar_path(&content_path);
        let lock = self.locks.get(hash);
        let _guard = lock.blocking_write();
        let sidecar = read_sidecar(&sidecar_path)?;
        if !sidecar.points.is_empty() {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("blob {hash} is still referenced"),
            ));
        }
        fs::remove_file(&content_path)?;
        fs::remove_file(&sidecar_path)
    }

    /// Sweeps the store, deleting every blob whose pointer set is empty.
    ///
    /// Returns the number of blobs removed. Individual failures are logged
    /// and skipped so one bad entry does not halt the sweep.
    pub fn gc(&self) -> io::Result<usize> {
        debug!("running blob gc");
        let mut candidates = Vec::new();
        self.collect_unreferenced(&self.root, &mut candidates)?;
        let mut removed = 0;
        for hash in candidates {
            match self.delete(&hash) {
                Ok(()) => {
                    debug!(hash = %hash, "removed unreferenced blob");
                    removed += 1;
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    debug!(hash = %hash, "blob gained a pointer since enumeration, skipping");
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => warn!(hash = %hash, error = %err, "failed to remove blob"),
            }
        }
        Ok(removed)
    }

    fn collect_unreferenced(&self, dir: &Path, candidates: &mut Vec<String>) -> io::Result<()> {
        for entry in dir.read_dir()? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if entry.path() == self.staging {
                    continue;
                }
                self.collect_unreferenced(&entry.path(), candidates)?;
            } else if file_type.is_file() {
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                let Some(stem) = name.strip_suffix(SIDECAR_SUFFIX) else {
                    continue;
                };
                match read_sidecar(&entry.path()) {
                    Ok(sidecar) if sidecar.points.is_empty() => {
                        let prefix = dir
                            .file_name()
                            .and_then(|p| p.to_str())
                            .unwrap_or_default();
                        candidates.push(format!("{prefix}{stem}"));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(path = %entry.path().display(), error = %err, "unreadable blob sidecar")
                    }
                }
            }
        }
        Ok(())
    }

    fn update_sidecar(
        &self,
        content_path: &Path,
        apply: impl FnOnce(&mut Sidecar),
    ) -> io::Result<()> {
        let sidecar_path = Self::sidecar_path(content_path);
        let mut sidecar = match read_sidecar(&sidecar_path) {
            Ok(sidecar) => sidecar,
            Err(err) if err.kind() == ErrorKind::NotFound => Sidecar::default(),
            Err(err) => return Err(err),
        };
        apply(&mut sidecar);
        let data = serde_json::to_vec(&sidecar)?;
        fs::write(sidecar_path, data)
    }
}

fn read_sidecar(path: &Path) -> io::Result<Sidecar> {
    let data = fs::read(path)?;
    serde_json::from_slice(&data)
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, format!("{err}")))
}

/// Open handle on a stored blob.
///
/// Holds the shared per-hash lock; dropping the reader releases it.
#[derive(Debug)]
pub struct BlobReader {
    file: File,
    _guard: OwnedRwLockReadGuard<()>,
}

impl BlobReader {
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for BlobReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Write half of a staged blob insertion.
///
/// Bytes are written to the staging file and all four digests at once;
/// [BlobWriter::commit] moves the file to its content address and records the
/// sidecar. An uncommitted writer removes its staging file on drop, which is
/// how aborted downloads leave no trace.
pub struct BlobWriter {
    store: Arc<BlobStore>,
    file: Option<File>,
    staging_path: PathBuf,
    md5: Md5,
    sha1: Sha1,
    sha256: Sha256,
    sha512: Sha512,
    committed: bool,
}

impl BlobWriter {
    /// Finalizes the staged blob and returns its SHA-256 hex digest.
    ///
    /// If the content file already exists the staged copy is discarded (the
    /// bytes are identical by construction). If `pointer` is non-empty it is
    /// added to the pointer set either way.
    pub fn commit(mut self, pointer: &str) -> io::Result<String> {
        let mut file = self.file.take().expect("staging file present until drop");
        file.flush()?;
        drop(file);

        let md5sum = HEXLOWER.encode(&self.md5.finalize_reset());
        let sha1sum = HEXLOWER.encode(&self.sha1.finalize_reset());
        let sha256sum = HEXLOWER.encode(&self.sha256.finalize_reset());
        let sha512sum = HEXLOWER.encode(&self.sha512.finalize_reset());

        let content_path = self.store.content_path(&sha256sum)?;
        let lock = self.store.locks.get(&sha256sum);
        let _guard = lock.blocking_write();

        if let Some(parent) = content_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::metadata(&content_path) {
            Ok(stat) if stat.is_dir() => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("blob path {} is a directory", content_path.display()),
                ));
            }
            Ok(_) => {
                // Same content is already stored; keep it.
                fs::remove_file(&self.staging_path)?;
                self.committed = true;
                self.store.update_sidecar(&content_path, |sidecar| {
                    if !pointer.is_empty() {
                        sidecar.points.insert(pointer.to_owned(), Utc::now());
                    }
                })?;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::rename(&self.staging_path, &content_path)?;
                self.committed = true;
                self.store.update_sidecar(&content_path, |sidecar| {
                    sidecar.md5 = md5sum;
                    sidecar.sha1 = sha1sum;
                    sidecar.sha256 = sha256sum.clone();
                    sidecar.sha512 = sha512sum;
                    if !pointer.is_empty() {
                        sidecar.points.insert(pointer.to_owned(), Utc::now());
                    }
                })?;
            }
            Err(err) => return Err(err),
        }
        Ok(sha256sum)
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self.file.as_mut().expect("staging file present until drop");
        let n = file.write(buf)?;
        self.md5.update(&buf[..n]);
        self.sha1.update(&buf[..n]);
        self.sha256.update(&buf[..n]);
        self.sha512.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().expect("staging file present until drop").flush()
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.file.take());
            let _ = fs::remove_file(&self.staging_path);
        }
    }
}
