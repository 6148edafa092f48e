//! Encryption side: single streams, whole folders, and host-driven uploads.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use c4gh_core::config::{C4ghConfig, LayoutConfig};
use c4gh_core::upload::{ChunkStatus, UploadSession};
use c4gh_core::{C4ghError, C4ghResult, SEGMENT_SIZE};
use c4gh_crypto::{encrypted_len, SegmentEncryptor, SessionKey};

use crate::chunk::Chunk;
use crate::fs::{read_up_to, DescriptorBudget, FileSystem, OsFs};
use crate::scanner;
use crate::session::{EncryptSession, OpenMode};
use crate::walk::{list_files, walk_files};

/// Progress callback: (files_done, files_total, path).
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

const PART_SUFFIX: &str = ".part";

/// Byte counts for one encrypted or decrypted stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub segments: u64,
    pub plaintext_bytes: u64,
    pub ciphertext_bytes: u64,
}

/// Write `header` followed by every plaintext segment of `reader`, encrypted.
///
/// The writer is flushed before returning.
pub fn encrypt_stream<R, W>(
    key: &SessionKey,
    header: &[u8],
    reader: &mut R,
    writer: &mut W,
) -> C4ghResult<StreamStats>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut encryptor = SegmentEncryptor::new(key);
    let mut buf = Zeroizing::new(vec![0u8; SEGMENT_SIZE]);
    let mut stats = StreamStats::default();

    writer.write_all(header)?;
    stats.ciphertext_bytes += header.len() as u64;

    loop {
        let n = read_up_to(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let segment = encryptor.encrypt(&buf[..n])?;
        writer.write_all(&segment)?;
        stats.segments += 1;
        stats.plaintext_bytes += n as u64;
        stats.ciphertext_bytes += segment.len() as u64;
        if n < SEGMENT_SIZE {
            break;
        }
    }

    writer.flush()?;
    Ok(stats)
}

/// Summary of one `encrypt_folder` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FolderReport {
    pub files: u64,
    pub skipped: u64,
    pub plaintext_bytes: u64,
    pub ciphertext_bytes: u64,
}

/// State threaded through one folder walk.
struct TraversalContext<'a> {
    key: &'a SessionKey,
    header: &'a [u8],
    total: u64,
    report: FolderReport,
}

/// Encrypts every regular file under the data directory in place.
///
/// Each file is encrypted to `<name><suffix>.part`, renamed to
/// `<name><suffix>`, then the plaintext is removed. The first file that
/// fails stops the run; files already processed stay encrypted, the failed
/// file and everything after it stay plaintext.
pub struct FolderEncryptor<'a> {
    layout: &'a LayoutConfig,
    fs: &'a dyn FileSystem,
    budget: DescriptorBudget,
    progress: Option<&'a ProgressFn>,
}

impl<'a> FolderEncryptor<'a> {
    pub fn new(config: &'a C4ghConfig) -> Self {
        Self {
            layout: &config.layout,
            fs: &OsFs,
            budget: DescriptorBudget::new(config.crypto.max_open_descriptors),
            progress: None,
        }
    }

    pub fn with_fs(mut self, fs: &'a dyn FileSystem) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_progress(mut self, progress: &'a ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Open a session, encrypt the folder, and close the session whatever
    /// the outcome.
    pub fn run(&self, mode: OpenMode) -> C4ghResult<FolderReport> {
        let mut session = EncryptSession::open(mode, &self.layout.private_key_path())?;
        let result = self.run_with_session(&mut session);
        session.close();
        match &result {
            Ok(report) => info!(
                files = report.files,
                skipped = report.skipped,
                bytes = report.plaintext_bytes,
                "folder encrypted"
            ),
            Err(e) => warn!(error = %e, "folder encryption aborted"),
        }
        result
    }

    fn run_with_session(&self, session: &mut EncryptSession) -> C4ghResult<FolderReport> {
        let recipients = scanner::scan_with(self.fs, &self.layout.recv_keys_path(), &self.budget)?;
        session.set_recipients(recipients);
        session.create_session_key()?;
        let header = session.build_header()?;

        let data = self.layout.data_path();
        let total = match self.progress {
            Some(_) => list_files(self.fs, &data, &self.budget)?
                .iter()
                .filter(|p| !self.is_output(p))
                .count() as u64,
            None => 0,
        };

        let mut ctx = TraversalContext {
            key: session.session_key()?,
            header: &header,
            total,
            report: FolderReport::default(),
        };
        walk_files(self.fs, &data, &self.budget, |path| {
            self.visit(&mut ctx, path)
        })?;
        Ok(ctx.report)
    }

    fn is_output(&self, path: &Path) -> bool {
        let suffix = &self.layout.encrypted_suffix;
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        name.ends_with(suffix.as_str()) || name.ends_with(&format!("{suffix}{PART_SUFFIX}"))
    }

    fn visit(&self, ctx: &mut TraversalContext<'_>, path: &Path) -> C4ghResult<()> {
        if self.is_output(path) {
            debug!(path = %path.display(), "already encrypted, skipping");
            ctx.report.skipped += 1;
            return Ok(());
        }

        let stats = self.encrypt_file(ctx, path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "file encryption failed");
            e
        })?;

        ctx.report.files += 1;
        ctx.report.plaintext_bytes += stats.plaintext_bytes;
        ctx.report.ciphertext_bytes += stats.ciphertext_bytes;
        if let Some(progress) = self.progress {
            progress(ctx.report.files, ctx.total, &path.to_string_lossy());
        }
        Ok(())
    }

    fn encrypt_file(&self, ctx: &TraversalContext<'_>, path: &Path) -> C4ghResult<StreamStats> {
        let output = append_to_path(path, &self.layout.encrypted_suffix);
        let part = append_to_path(&output, PART_SUFFIX);

        let stats = {
            let _in_slot = self.budget.acquire()?;
            let mut reader = self.fs.open_read(path)?;
            let _out_slot = self.budget.acquire()?;
            let mut writer = self.fs.create(&part)?;
            match encrypt_stream(ctx.key, ctx.header, &mut reader, &mut writer) {
                Ok(stats) => stats,
                Err(e) => {
                    drop(writer);
                    discard(self.fs, &part);
                    return Err(e);
                }
            }
        };

        if let Err(e) = self.fs.rename(&part, &output) {
            discard(self.fs, &part);
            return Err(e.into());
        }
        if let Err(e) = self.fs.remove_file(path) {
            // Plaintext must not sit beside its ciphertext
            discard(self.fs, &output);
            return Err(e.into());
        }

        debug!(
            path = %path.display(),
            segments = stats.segments,
            bytes = stats.plaintext_bytes,
            "file encrypted"
        );
        Ok(stats)
    }
}

fn append_to_path(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn discard(fs: &dyn FileSystem, path: &Path) {
    if let Err(e) = fs.remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not remove partial output");
    }
}

/// Host-driven encryption of one file, one upload chunk at a time.
///
/// Chunk `i` is plaintext bytes `[i * 65536, (i + 1) * 65536)` encrypted as
/// one segment. Before each chunk the tracker is consulted: a chunk the host
/// marked aborted stops the stream, finished chunks are passed over.
pub struct UploadStream<'s, R> {
    file_id: String,
    reader: R,
    encryptor: SegmentEncryptor<'s>,
    header: Vec<u8>,
    cursor: u64,
    buf: Zeroizing<Vec<u8>>,
}

impl<'s, R: Read + Seek> UploadStream<'s, R> {
    pub fn new(session: &'s EncryptSession, file_id: impl Into<String>, reader: R) -> C4ghResult<Self> {
        Ok(Self {
            file_id: file_id.into(),
            reader,
            encryptor: SegmentEncryptor::new(session.session_key()?),
            header: session.build_header()?,
            cursor: 0,
            buf: Zeroizing::new(vec![0u8; SEGMENT_SIZE]),
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// The header, sent once ahead of the first chunk.
    pub fn header_chunk(&self) -> Chunk {
        Chunk::from_vec(self.header.clone())
    }

    /// Encrypt the next waiting chunk and mark it uploading.
    ///
    /// Returns `Ok(None)` once no chunk is left to send and
    /// [`C4ghError::Aborted`] while the host has any chunk of this file aborted.
    pub fn next_chunk(&mut self, tracker: &mut UploadSession) -> C4ghResult<Option<(u64, Chunk)>> {
        let file = tracker
            .file(&self.file_id)
            .ok_or_else(|| C4ghError::UploadState(format!("unknown file {}", self.file_id)))?;
        if file.is_aborted() {
            info!(file = %self.file_id, "upload aborted by host");
            return Err(C4ghError::Aborted);
        }
        let chunk_count = file.chunk_count;

        while self.cursor < chunk_count {
            let index = self.cursor;
            match tracker.status_of(&self.file_id, index) {
                Some(ChunkStatus::Waiting) => {
                    tracker.start_chunk(&self.file_id, index)?;
                    return match self.encrypt_chunk_at(tracker, index) {
                        Ok(chunk) => {
                            self.cursor += 1;
                            Ok(Some((index, chunk)))
                        }
                        Err(e) => {
                            tracker.fail_chunk(&self.file_id, index)?;
                            Err(e)
                        }
                    };
                }
                _ => self.cursor += 1,
            }
        }
        Ok(None)
    }

    /// Reset this file's failed and aborted chunks to waiting and rewind,
    /// so the next calls re-send exactly those chunks.
    pub fn resume(&mut self, tracker: &mut UploadSession) -> C4ghResult<usize> {
        let reset = tracker.resume_file(&self.file_id)?;
        self.cursor = 0;
        info!(file = %self.file_id, chunks = reset, "upload resumed");
        Ok(reset)
    }

    fn encrypt_chunk_at(&mut self, tracker: &UploadSession, index: u64) -> C4ghResult<Chunk> {
        self.reader
            .seek(SeekFrom::Start(index * SEGMENT_SIZE as u64))?;
        let n = read_up_to(&mut self.reader, &mut self.buf)?;
        if n == 0 {
            return Err(C4ghError::InvalidInput(format!(
                "file {} has no data for chunk {index}",
                self.file_id
            )));
        }
        let expected = tracker
            .file(&self.file_id)
            .and_then(|f| f.chunk(index))
            .map(|c| c.size);
        let produced = encrypted_len(n) as u64;
        if expected != Some(produced) {
            return Err(C4ghError::InvalidInput(format!(
                "chunk {index} of {} is {produced} bytes, tracker expects {expected:?}",
                self.file_id
            )));
        }
        let segment = self.encryptor.encrypt_at(index, &self.buf[..n])?;

        debug!(file = %self.file_id, chunk = index, bytes = segment.len(), "chunk encrypted");
        Ok(Chunk::from_vec(segment))
    }
}
