//!
//! On-disk fragment storage, one file per resource.
//!
//! The file is append-only: a small fixed header, then a sequence of
//! length-prefixed frames. A frame is either one page fragment or one
//! revision root (the per-commit metadata record). Nothing is ever updated
//! in place except the header's committed-revision field, which is the
//! commit point: fragments of an unfinished commit are unreachable garbage
//! after a crash because no root points at them and the committed revision
//! never advanced.
//!
//! Fragments carry only their own page key and revision. The database and
//! resource ids a [`PageReference`] needs are not stored; the reader injects
//! them from its [`ReaderContext`] when it builds references during
//! deserialization. Ids live in exactly one place that way, and renaming a
//! resource never rewrites data files.
//!
//! The in-memory fragment index (`(log_key, page_key)` to the ascending list
//! of [`FragmentMeta`]) is rebuilt by scanning the file on open.
//!

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use camino::{Utf8Path, Utf8PathBuf};
use metrics::disk_io_bytes_observe;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use utils::id::{DatabaseId, ResourceId};
use utils::revision::Revision;

use crate::page::{KeyValueLeafPage, PageError, PageReference};
use crate::segment_alloc::{SegmentAllocator, SizeClass};
use crate::versioning::{FragmentKind, FragmentMeta};

const MAGIC: &[u8; 8] = b"PGSTORE1";
const HEADER_BYTES: u64 = 16;

const FRAME_FRAGMENT: u8 = 0;
const FRAME_REVISION_ROOT: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("storage i/o failed")]
    Io(#[from] std::io::Error),

    #[error("corrupt storage file: {0}")]
    Corrupt(&'static str),

    #[error(transparent)]
    Page(#[from] PageError),
}

/// Ambient ids the reader injects into every reference it builds during
/// deserialization.
#[derive(Debug, Clone, Copy)]
pub struct ReaderContext {
    pub database_id: DatabaseId,
    pub resource_id: ResourceId,
}

impl ReaderContext {
    pub fn fragment_ref(&self, log_key: i32, meta: &FragmentMeta) -> PageReference {
        PageReference {
            database_id: self.database_id,
            resource_id: self.resource_id,
            log_key,
            page_offset: meta.offset as i64,
        }
    }
}

/// Per-commit metadata; what the revision-root cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionRoot {
    pub revision: Revision,
    pub commit_timestamp_millis: u64,
    pub fragments: u32,
}

struct FileInner {
    file: File,
    end: u64,
}

///
/// The fragment store of one open resource.
///
pub struct ResourceStorage {
    path: Utf8PathBuf,
    inner: Mutex<FileInner>,
    index: RwLock<HashMap<(i32, i64), Vec<FragmentMeta>>>,
    roots: RwLock<HashMap<i64, RevisionRoot>>,
    committed: AtomicI64,
}

impl ResourceStorage {
    /// Create or open the resource file at `path`, rebuilding the fragment
    /// index from its frames.
    pub fn open(path: &Utf8Path) -> Result<ResourceStorage, DiskError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let storage = ResourceStorage {
            path: path.to_owned(),
            inner: Mutex::new(FileInner { file: file.try_clone()?, end: HEADER_BYTES }),
            index: RwLock::new(HashMap::new()),
            roots: RwLock::new(HashMap::new()),
            committed: AtomicI64::new(Revision::BASE.as_i64()),
        };

        if len == 0 {
            let mut header = Vec::with_capacity(HEADER_BYTES as usize);
            header.extend_from_slice(MAGIC);
            header.write_i64::<LittleEndian>(Revision::BASE.as_i64())?;
            file.write_all(&header)?;
            file.sync_all()?;
            return Ok(storage);
        }

        storage.rebuild(&mut file, len)?;
        Ok(storage)
    }

    fn rebuild(&self, file: &mut File, len: u64) -> Result<(), DiskError> {
        let mut magic = [0u8; 8];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DiskError::Corrupt("bad magic"));
        }
        let committed = file.read_i64::<LittleEndian>()?;
        self.committed.store(committed, Ordering::Release);

        let mut offset = HEADER_BYTES;
        let mut index = self.index.write();
        let mut roots = self.roots.write();
        while offset < len {
            file.seek(SeekFrom::Start(offset))?;
            let frame_len = file.read_u32::<LittleEndian>()? as u64;
            if offset + 4 + frame_len > len {
                // Torn tail from a crashed append; everything before it is
                // intact and nothing after it was committed.
                debug!(offset, "ignoring torn frame tail");
                break;
            }
            let mut payload = vec![0u8; frame_len as usize];
            file.read_exact(&mut payload)?;
            let mut cursor = std::io::Cursor::new(&payload[..]);
            match cursor.read_u8()? {
                FRAME_FRAGMENT => {
                    let kind = decode_fragment_kind(cursor.read_u8()?)?;
                    let log_key = cursor.read_i32::<LittleEndian>()?;
                    let page_key = cursor.read_i64::<LittleEndian>()?;
                    let revision = Revision(cursor.read_i64::<LittleEndian>()?);
                    if revision.as_i64() <= committed {
                        index.entry((log_key, page_key)).or_default().push(
                            FragmentMeta {
                                revision,
                                kind,
                                offset,
                            },
                        );
                    }
                }
                FRAME_REVISION_ROOT => {
                    let revision = cursor.read_i64::<LittleEndian>()?;
                    let commit_timestamp_millis = cursor.read_u64::<LittleEndian>()?;
                    let fragments = cursor.read_u32::<LittleEndian>()?;
                    if revision <= committed {
                        roots.insert(
                            revision,
                            RevisionRoot {
                                revision: Revision(revision),
                                commit_timestamp_millis,
                                fragments,
                            },
                        );
                    }
                }
                _ => return Err(DiskError::Corrupt("unknown frame kind")),
            }
            offset += 4 + frame_len;
        }
        for metas in index.values_mut() {
            metas.sort_by_key(|m| m.revision);
        }
        self.inner.lock().end = offset;
        Ok(())
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn committed_revision(&self) -> Revision {
        Revision(self.committed.load(Ordering::Acquire))
    }

    /// Ascending fragment chain of one page.
    pub fn fragment_index(&self, log_key: i32, page_key: i64) -> Vec<FragmentMeta> {
        self.index
            .read()
            .get(&(log_key, page_key))
            .cloned()
            .unwrap_or_default()
    }

    /// Fragments since (and including) the page's most recent full image.
    pub fn chain_len_since_full(&self, log_key: i32, page_key: i64) -> usize {
        let index = self.index.read();
        let Some(metas) = index.get(&(log_key, page_key)) else {
            return 0;
        };
        let mut run = 0;
        for meta in metas.iter().rev() {
            run += 1;
            if meta.kind == FragmentKind::FullDump {
                break;
            }
        }
        run
    }

    pub fn revision_root(&self, revision: Revision) -> Option<RevisionRoot> {
        self.roots.read().get(&revision.as_i64()).copied()
    }

    /// Every page with persisted fragments, as `(log_key, page_key,
    /// fragment_count)`, sorted. Inspection tooling only; the hot paths go
    /// through [`Self::fragment_index`].
    pub fn fragment_inventory(&self) -> Vec<(i32, i64, usize)> {
        let index = self.index.read();
        let mut inventory: Vec<(i32, i64, usize)> = index
            .iter()
            .map(|(&(log_key, page_key), metas)| (log_key, page_key, metas.len()))
            .collect();
        inventory.sort_unstable();
        inventory
    }

    ///
    /// Append one fragment frame. The fragment becomes visible to readers
    /// only once [`Self::commit_revision`] advances past its revision; until
    /// then it is not in the index either.
    ///
    /// Returns the frame offset, which doubles as the fragment's
    /// `page_offset` in every reference to it.
    ///
    pub fn write_fragment(
        &self,
        log_key: i32,
        page: &KeyValueLeafPage,
        kind: FragmentKind,
    ) -> Result<u64, DiskError> {
        let mut payload = Vec::with_capacity(page.used_bytes() as usize + 64);
        payload.write_u8(FRAME_FRAGMENT)?;
        payload.write_u8(encode_fragment_kind(kind))?;
        payload.write_i32::<LittleEndian>(log_key)?;
        payload.write_i64::<LittleEndian>(page.page_key())?;
        payload.write_i64::<LittleEndian>(page.revision().as_i64())?;

        let slots: Vec<usize> = page.occupied_slots().collect();
        payload.write_u16::<LittleEndian>(slots.len() as u16)?;
        for slot in slots {
            let record = page.get_record(slot)?.expect("slot listed as occupied");
            payload.write_u16::<LittleEndian>(slot as u16)?;
            payload.write_u32::<LittleEndian>(record.data.len() as u32)?;
            payload.extend_from_slice(record.data);
            match record.dewey_id {
                Some(key) => {
                    payload.write_u8(1)?;
                    payload.write_u16::<LittleEndian>(key.len() as u16)?;
                    payload.extend_from_slice(key);
                }
                None => payload.write_u8(0)?,
            }
        }

        let offset = self.append_frame(&payload)?;
        Ok(offset)
    }

    /// Make `revision` durable: append its root frame, then advance the
    /// header's committed revision and publish the staged fragment index
    /// entries.
    pub fn commit_revision(
        &self,
        revision: Revision,
        staged: Vec<((i32, i64), FragmentMeta)>,
    ) -> Result<RevisionRoot, DiskError> {
        let root = RevisionRoot {
            revision,
            commit_timestamp_millis: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            fragments: staged.len() as u32,
        };

        let mut payload = Vec::with_capacity(32);
        payload.write_u8(FRAME_REVISION_ROOT)?;
        payload.write_i64::<LittleEndian>(root.revision.as_i64())?;
        payload.write_u64::<LittleEndian>(root.commit_timestamp_millis)?;
        payload.write_u32::<LittleEndian>(root.fragments)?;
        self.append_frame(&payload)?;

        {
            let mut inner = self.inner.lock();
            inner.file.sync_all()?;
            inner.file.seek(SeekFrom::Start(8))?;
            inner.file.write_i64::<LittleEndian>(revision.as_i64())?;
            inner.file.sync_all()?;
        }
        self.committed.store(revision.as_i64(), Ordering::Release);

        {
            let mut index = self.index.write();
            for (key, meta) in staged {
                let metas = index.entry(key).or_default();
                metas.push(meta);
                metas.sort_by_key(|m| m.revision);
            }
        }
        self.roots.write().insert(revision.as_i64(), root);
        debug!(revision = %revision, fragments = root.fragments, "committed revision");
        Ok(root)
    }

    fn append_frame(&self, payload: &[u8]) -> Result<u64, DiskError> {
        let mut inner = self.inner.lock();
        let offset = inner.end;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner
            .file
            .write_u32::<LittleEndian>(payload.len() as u32)?;
        inner.file.write_all(payload)?;
        inner.end = offset + 4 + payload.len() as u64;
        disk_io_bytes_observe("write", 4 + payload.len() as u64);
        Ok(offset)
    }

    ///
    /// Load and deserialize the fragment at `offset` into a fresh page.
    /// The page is unpublished; the caller inserts it into its cache.
    ///
    pub fn read_fragment(
        &self,
        offset: u64,
        dewey_ids: bool,
        allocator: &Arc<SegmentAllocator>,
    ) -> Result<Arc<KeyValueLeafPage>, DiskError> {
        let payload = {
            let mut inner = self.inner.lock();
            if offset + 4 > inner.end {
                return Err(DiskError::Corrupt("fragment offset beyond file end"));
            }
            inner.file.seek(SeekFrom::Start(offset))?;
            let frame_len = inner.file.read_u32::<LittleEndian>()? as usize;
            if offset + 4 + frame_len as u64 > inner.end {
                return Err(DiskError::Corrupt("fragment frame beyond file end"));
            }
            let mut payload = vec![0u8; frame_len];
            inner.file.read_exact(&mut payload)?;
            disk_io_bytes_observe("read", 4 + frame_len as u64);
            payload
        };

        let mut cursor = std::io::Cursor::new(&payload[..]);
        if cursor.read_u8()? != FRAME_FRAGMENT {
            return Err(DiskError::Corrupt("expected a fragment frame"));
        }
        let _kind = decode_fragment_kind(cursor.read_u8()?)?;
        let _log_key = cursor.read_i32::<LittleEndian>()?;
        let page_key = cursor.read_i64::<LittleEndian>()?;
        let revision = Revision(cursor.read_i64::<LittleEndian>()?);
        let count = cursor.read_u16::<LittleEndian>()? as usize;

        let class = SizeClass::fitting(payload.len()).unwrap_or(SizeClass::largest());
        let page =
            KeyValueLeafPage::new(page_key, revision, class, dewey_ids, Arc::clone(allocator))?;
        let page = scopeguard::guard(page, |page| page.reset());

        let mut dewey_buf = Vec::new();
        let mut data_buf = Vec::new();
        for _ in 0..count {
            let slot = cursor.read_u16::<LittleEndian>()? as usize;
            let data_len = cursor.read_u32::<LittleEndian>()? as usize;
            data_buf.resize(data_len, 0);
            cursor.read_exact(&mut data_buf)?;
            let dewey = if cursor.read_u8()? == 1 {
                let key_len = cursor.read_u16::<LittleEndian>()? as usize;
                dewey_buf.resize(key_len, 0);
                cursor.read_exact(&mut dewey_buf)?;
                Some(&dewey_buf[..])
            } else {
                None
            };
            page.put_record(slot, &data_buf, if dewey_ids { dewey } else { None })?;
        }
        Ok(scopeguard::ScopeGuard::into_inner(page))
    }
}

fn encode_fragment_kind(kind: FragmentKind) -> u8 {
    match kind {
        FragmentKind::FullDump => 0,
        FragmentKind::Delta => 1,
    }
}

fn decode_fragment_kind(raw: u8) -> Result<FragmentKind, DiskError> {
    match raw {
        0 => Ok(FragmentKind::FullDump),
        1 => Ok(FragmentKind::Delta),
        _ => Err(DiskError::Corrupt("unknown fragment kind")),
    }
}
