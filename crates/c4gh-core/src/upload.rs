//! Resumable upload tracking.
//!
//! An [`UploadSession`] is built from the host's file list at upload start and
//! mutated by per-chunk status events. Each chunk follows
//!
//! ```text
//! waiting -> uploading -> done | error
//!            uploading -> aborted
//! ```
//!
//! Terminal chunks only go back to `waiting` through an explicit resume.
//! Cancellation aborts the chunk in flight; a file with any aborted chunk is
//! not sent further until it is resumed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{C4ghError, C4ghResult};
use crate::{SEGMENT_OVERHEAD, SEGMENT_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Waiting,
    Uploading,
    Done,
    Error,
    Aborted,
}

impl ChunkStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkStatus::Done | ChunkStatus::Error | ChunkStatus::Aborted)
    }

    /// Forward transitions driven by upload events. Resume is handled separately.
    pub fn can_advance_to(self, next: ChunkStatus) -> bool {
        matches!(
            (self, next),
            (ChunkStatus::Waiting, ChunkStatus::Uploading)
                | (ChunkStatus::Uploading, ChunkStatus::Done)
                | (ChunkStatus::Uploading, ChunkStatus::Error)
                | (ChunkStatus::Uploading, ChunkStatus::Aborted)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunk {
    pub index: u64,
    /// Ciphertext bytes carried by this chunk
    pub size: u64,
    pub status: ChunkStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFile {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    /// Plaintext size in bytes
    pub total_size: u64,
    pub chunk_count: u64,
    pub chunks: Vec<UploadChunk>,
}

impl UploadFile {
    /// Lay out the ciphertext chunks for a plaintext of `total_size` bytes.
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: PathBuf, total_size: u64) -> Self {
        let segment = SEGMENT_SIZE as u64;
        let chunk_count = total_size.div_ceil(segment);
        let chunks = (0..chunk_count)
            .map(|index| {
                let plain = if index + 1 == chunk_count {
                    total_size - index * segment
                } else {
                    segment
                };
                UploadChunk {
                    index,
                    size: plain + SEGMENT_OVERHEAD as u64,
                    status: ChunkStatus::Waiting,
                }
            })
            .collect();

        Self {
            id: id.into(),
            name: name.into(),
            path,
            total_size,
            chunk_count,
            chunks,
        }
    }

    /// Aggregate status: any error wins, then any abort, then all-done.
    pub fn status(&self) -> ChunkStatus {
        let any = |s: ChunkStatus| self.chunks.iter().any(|c| c.status == s);
        if any(ChunkStatus::Error) {
            ChunkStatus::Error
        } else if any(ChunkStatus::Aborted) {
            ChunkStatus::Aborted
        } else if self.chunks.iter().all(|c| c.status == ChunkStatus::Done) {
            ChunkStatus::Done
        } else if any(ChunkStatus::Uploading) || any(ChunkStatus::Done) {
            ChunkStatus::Uploading
        } else {
            ChunkStatus::Waiting
        }
    }

    /// True while any chunk is aborted and not yet resumed.
    pub fn is_aborted(&self) -> bool {
        self.chunks.iter().any(|c| c.status == ChunkStatus::Aborted)
    }

    pub fn chunk(&self, index: u64) -> Option<&UploadChunk> {
        self.chunks.get(index as usize)
    }

    /// Lowest-index chunk still waiting to be sent.
    pub fn next_waiting(&self) -> Option<u64> {
        self.chunks
            .iter()
            .find(|c| c.status == ChunkStatus::Waiting)
            .map(|c| c.index)
    }

    pub fn done_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Done)
            .map(|c| c.size)
            .sum()
    }

    pub fn encrypted_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    fn chunk_mut(&mut self, index: u64) -> C4ghResult<&mut UploadChunk> {
        let id = &self.id;
        self.chunks
            .get_mut(index as usize)
            .ok_or_else(|| C4ghError::UploadState(format!("file {id} has no chunk {index}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub destination: String,
    pub files: Vec<UploadFile>,
}

impl UploadSession {
    pub fn new(id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
            files: Vec::new(),
        }
    }

    pub fn add_file(&mut self, file: UploadFile) {
        self.files.push(file);
    }

    pub fn file(&self, file_id: &str) -> Option<&UploadFile> {
        self.files.iter().find(|f| f.id == file_id)
    }

    fn file_mut(&mut self, file_id: &str) -> C4ghResult<&mut UploadFile> {
        self.files
            .iter_mut()
            .find(|f| f.id == file_id)
            .ok_or_else(|| C4ghError::UploadState(format!("unknown file {file_id}")))
    }

    pub fn status_of(&self, file_id: &str, index: u64) -> Option<ChunkStatus> {
        self.file(file_id)?.chunk(index).map(|c| c.status)
    }

    /// Apply a forward transition, rejecting anything the state machine forbids.
    pub fn advance(&mut self, file_id: &str, index: u64, next: ChunkStatus) -> C4ghResult<()> {
        let chunk = self.file_mut(file_id)?.chunk_mut(index)?;
        if !chunk.status.can_advance_to(next) {
            return Err(C4ghError::UploadState(format!(
                "chunk {index} of {file_id}: {:?} -> {next:?} not allowed",
                chunk.status
            )));
        }
        tracing::debug!(file = file_id, chunk = index, from = ?chunk.status, to = ?next, "chunk status");
        chunk.status = next;
        Ok(())
    }

    pub fn start_chunk(&mut self, file_id: &str, index: u64) -> C4ghResult<()> {
        self.advance(file_id, index, ChunkStatus::Uploading)
    }

    pub fn complete_chunk(&mut self, file_id: &str, index: u64) -> C4ghResult<()> {
        self.advance(file_id, index, ChunkStatus::Done)
    }

    pub fn fail_chunk(&mut self, file_id: &str, index: u64) -> C4ghResult<()> {
        self.advance(file_id, index, ChunkStatus::Error)
    }

    pub fn abort_chunk(&mut self, file_id: &str, index: u64) -> C4ghResult<()> {
        self.advance(file_id, index, ChunkStatus::Aborted)
    }

    /// Host-side cancellation of a whole file: every chunk in flight becomes
    /// aborted. Waiting chunks keep their status. Returns how many were aborted.
    pub fn abort_file(&mut self, file_id: &str) -> C4ghResult<usize> {
        let file = self.file_mut(file_id)?;
        let mut aborted = 0;
        for chunk in file
            .chunks
            .iter_mut()
            .filter(|c| c.status == ChunkStatus::Uploading)
        {
            chunk.status = ChunkStatus::Aborted;
            aborted += 1;
        }
        tracing::info!(file = file_id, aborted, "upload aborted");
        Ok(aborted)
    }

    /// Explicit resume of one chunk: any terminal state goes back to waiting.
    pub fn resume_chunk(&mut self, file_id: &str, index: u64) -> C4ghResult<()> {
        let chunk = self.file_mut(file_id)?.chunk_mut(index)?;
        if !chunk.status.is_terminal() {
            return Err(C4ghError::UploadState(format!(
                "chunk {index} of {file_id} is {:?}, only terminal chunks resume",
                chunk.status
            )));
        }
        chunk.status = ChunkStatus::Waiting;
        Ok(())
    }

    /// Resume a whole file: failed and aborted chunks are re-queued, done
    /// chunks stay done. Returns how many chunks were re-queued.
    pub fn resume_file(&mut self, file_id: &str) -> C4ghResult<usize> {
        let file = self.file_mut(file_id)?;
        let mut requeued = 0;
        for chunk in file
            .chunks
            .iter_mut()
            .filter(|c| matches!(c.status, ChunkStatus::Error | ChunkStatus::Aborted))
        {
            chunk.status = ChunkStatus::Waiting;
            requeued += 1;
        }
        tracing::info!(file = file_id, requeued, "upload resumed");
        Ok(requeued)
    }

    /// (done ciphertext bytes, total ciphertext bytes) across all files.
    pub fn progress(&self) -> (u64, u64) {
        self.files.iter().fold((0, 0), |(done, total), f| {
            (done + f.done_bytes(), total + f.encrypted_size())
        })
    }

    pub fn is_complete(&self) -> bool {
        self.files.iter().all(|f| f.status() == ChunkStatus::Done)
    }
}
