//! Chunk boundary planning and size adaptation.

use crate::DEFAULT_CHUNK_SIZE;

/// Upload status of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

/// One contiguous byte range of the source file.
#[derive(Debug, Clone)]
pub struct ChunkState {
    /// Sequence id; commit order is ascending index.
    pub index: u32,
    /// Byte offset within the file.
    pub offset: u64,
    /// Length of this chunk in bytes.
    pub len: u64,
    /// Attempts made so far.
    pub attempts: u32,
    pub status: ChunkStatus,
    /// Block identifier recorded once the chunk is staged.
    pub block_id: Option<String>,
}

impl ChunkState {
    /// Exclusive end offset of this chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Computes the ordered, non-overlapping chunk list for a file.
///
/// Covers `[0, file_size)` exactly once; chunk count is
/// `ceil(file_size / chunk_size)`. A zero `chunk_size` falls back to
/// [`DEFAULT_CHUNK_SIZE`].
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkState> {
    let chunk_size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    let mut chunks = Vec::new();
    let mut offset = 0u64;
    let mut index = 0u32;
    while offset < file_size {
        let len = chunk_size.min(file_size - offset);
        chunks.push(ChunkState {
            index,
            offset,
            len,
            attempts: 0,
            status: ChunkStatus::Pending,
            block_id: None,
        });
        offset += len;
        index += 1;
    }
    chunks
}

/// Picks a chunk size from the file size: larger files get larger chunks to
/// amortize per-chunk overhead.
pub fn adaptive_chunk_size(file_size: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    match file_size {
        s if s < 64 * MIB => 4 * MIB,
        s if s < 512 * MIB => 16 * MIB,
        s if s < 4096 * MIB => 32 * MIB,
        _ => 64 * MIB,
    }
}

/// Concurrency cap for a file: scaled inversely with size so huge uploads
/// don't monopolize memory with in-flight chunk buffers.
pub fn concurrency_for(file_size: u64) -> usize {
    const MIB: u64 = 1024 * 1024;
    match file_size {
        s if s < 64 * MIB => 8,
        s if s < 1024 * MIB => 4,
        _ => 2,
    }
}

/// Strips non-printable characters from a file name before it rides commit
/// metadata and content-disposition headers.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}
