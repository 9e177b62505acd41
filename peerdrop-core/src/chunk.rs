//! Transfer codec: split a file into chunks grouped in partitions (sender) and
//! reassemble arriving chunks while tracking progress (receiver).

use bytes::{Bytes, BytesMut};

use crate::protocol::{FileDescriptor, CHUNK_SIZE, PARTITION_SIZE};

/// What the chunker produced on one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkerEvent {
    Chunk(Bytes),
    /// A partition worth of chunks went out; the chunker pauses until `resume`.
    PartitionEnd { offset: u64 },
    /// Whole buffer consumed. Fires instead of a boundary at an exact multiple.
    FileEnd { offset: u64 },
}

/// Sender-side producer for one file. Pausable at partition boundaries, which
/// fall on exact multiples of the partition size; the caller resumes it once
/// the receiver acknowledges the partition.
#[derive(Debug)]
pub struct Chunker {
    data: Bytes,
    chunk_size: usize,
    partition_size: usize,
    offset: usize,
    partition_bytes: usize,
    paused: bool,
    finished: bool,
}

impl Chunker {
    pub fn new(data: Bytes) -> Self {
        Self::with_sizes(data, CHUNK_SIZE, PARTITION_SIZE)
    }

    /// Zero sizes fall back to the interop defaults.
    pub fn with_sizes(data: Bytes, chunk_size: usize, partition_size: usize) -> Self {
        Self {
            data,
            chunk_size: if chunk_size == 0 { CHUNK_SIZE } else { chunk_size },
            partition_size: if partition_size == 0 {
                PARTITION_SIZE
            } else {
                partition_size
            },
            offset: 0,
            partition_bytes: 0,
            paused: false,
            finished: false,
        }
    }

    /// Next step, or `None` while paused at a boundary or after the file ended.
    pub fn next_event(&mut self) -> Option<ChunkerEvent> {
        if self.paused || self.finished {
            return None;
        }
        if self.offset >= self.data.len() {
            self.finished = true;
            return Some(ChunkerEvent::FileEnd {
                offset: self.offset as u64,
            });
        }
        if self.partition_bytes >= self.partition_size {
            self.paused = true;
            self.partition_bytes = 0;
            return Some(ChunkerEvent::PartitionEnd {
                offset: self.offset as u64,
            });
        }
        // A chunk never straddles a partition edge.
        let budget = self.partition_size - self.partition_bytes;
        let end = (self.offset + self.chunk_size.min(budget)).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.partition_bytes += chunk.len();
        self.offset = end;
        Some(ChunkerEvent::Chunk(chunk))
    }

    /// Continue after a partition acknowledgement.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes emitted so far.
    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A completely received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub descriptor: FileDescriptor,
    pub data: Bytes,
}

/// Progress after one `unchunk`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DigestProgress {
    /// Bytes received for this file.
    pub bytes_received: u64,
    /// Fraction of this file, 0..=1.
    pub file_progress: f64,
    /// Fraction of the whole batch, 0..=1.
    pub total_progress: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Unchunked {
    InProgress(DigestProgress),
    Complete {
        progress: DigestProgress,
        file: ReceivedFile,
    },
}

/// Receiver-side accumulator for one file. Chunks are applied in arrival order.
#[derive(Debug)]
pub struct Digester {
    descriptor: FileDescriptor,
    total_size: u64,
    bytes_before: u64,
    buffers: Vec<Bytes>,
    bytes_received: u64,
    complete: bool,
}

impl Digester {
    /// `total_size` is the batch aggregate, `bytes_before` what earlier files
    /// in the batch already delivered.
    pub fn new(descriptor: FileDescriptor, total_size: u64, bytes_before: u64) -> Self {
        Self {
            descriptor,
            total_size,
            bytes_before,
            buffers: Vec::new(),
            bytes_received: 0,
            complete: false,
        }
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        &self.descriptor
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Append a chunk. Completes exactly once, when the declared size is reached.
    /// An empty chunk completes a zero-length file.
    pub fn unchunk(&mut self, chunk: Bytes) -> Result<Unchunked, DigestError> {
        if self.complete {
            return Err(DigestError::AlreadyComplete);
        }
        let received = self.bytes_received + chunk.len() as u64;
        if received > self.descriptor.size {
            return Err(DigestError::Overflow {
                declared: self.descriptor.size,
                received,
            });
        }
        if !chunk.is_empty() {
            self.buffers.push(chunk);
        }
        self.bytes_received = received;
        let progress = self.progress();
        if self.bytes_received < self.descriptor.size {
            return Ok(Unchunked::InProgress(progress));
        }
        self.complete = true;
        Ok(Unchunked::Complete {
            progress,
            file: ReceivedFile {
                descriptor: self.descriptor.clone(),
                data: self.concat(),
            },
        })
    }

    fn progress(&self) -> DigestProgress {
        DigestProgress {
            bytes_received: self.bytes_received,
            file_progress: ratio(self.bytes_received, self.descriptor.size),
            total_progress: ratio(self.bytes_before + self.bytes_received, self.total_size),
        }
    }

    fn concat(&mut self) -> Bytes {
        if self.buffers.len() == 1 {
            return self.buffers.pop().unwrap_or_default();
        }
        let mut out = BytesMut::with_capacity(self.bytes_received as usize);
        for buf in self.buffers.drain(..) {
            out.extend_from_slice(&buf);
        }
        out.freeze()
    }
}

/// `done / total` clamped to 0..=1; an empty total counts as finished.
pub fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).min(1.0)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DigestError {
    #[error("received {received} bytes for a file declared as {declared}")]
    Overflow { declared: u64, received: u64 },
    #[error("file already complete")]
    AlreadyComplete,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    fn sample(len: usize) -> Bytes {
        (0..len).map(|i| i as u8).collect::<Vec<u8>>().into()
    }

    fn descriptor(size: u64) -> FileDescriptor {
        FileDescriptor {
            name: "photo.png".into(),
            mime_type: "image/png".into(),
            size,
            relative_path: None,
        }
    }

    /// Runs the chunker to completion, resuming at every boundary.
    fn drain(chunker: &mut Chunker) -> (Vec<Bytes>, Vec<u64>, u64) {
        let mut chunks = Vec::new();
        let mut boundaries = Vec::new();
        loop {
            match chunker.next_event() {
                Some(ChunkerEvent::Chunk(c)) => chunks.push(c),
                Some(ChunkerEvent::PartitionEnd { offset }) => boundaries.push(offset),
                Some(ChunkerEvent::FileEnd { offset }) => return (chunks, boundaries, offset),
                None => chunker.resume(),
            }
        }
    }

    #[test]
    fn small_file_scenario() {
        let mut chunker = Chunker::with_sizes(sample(10), 4, 8);
        assert_eq!(chunker.next_event(), Some(ChunkerEvent::Chunk(sample(10).slice(0..4))));
        assert_eq!(chunker.next_event(), Some(ChunkerEvent::Chunk(sample(10).slice(4..8))));
        assert_eq!(chunker.next_event(), Some(ChunkerEvent::PartitionEnd { offset: 8 }));
        assert!(chunker.is_paused());
        assert_eq!(chunker.next_event(), None);
        chunker.resume();
        assert_eq!(chunker.next_event(), Some(ChunkerEvent::Chunk(sample(10).slice(8..10))));
        assert_eq!(chunker.next_event(), Some(ChunkerEvent::FileEnd { offset: 10 }));
        assert!(chunker.is_finished());
        assert_eq!(chunker.next_event(), None);
    }

    #[test]
    fn exact_multiple_ends_without_extra_boundary() {
        let mut chunker = Chunker::with_sizes(sample(16), 4, 8);
        let (chunks, boundaries, end) = drain(&mut chunker);
        assert_eq!(chunks.len(), 4);
        assert_eq!(boundaries, vec![8]);
        assert_eq!(end, 16);
    }

    #[test]
    fn empty_file_ends_immediately() {
        let mut chunker = Chunker::with_sizes(Bytes::new(), 4, 8);
        assert_eq!(chunker.next_event(), Some(ChunkerEvent::FileEnd { offset: 0 }));
    }

    #[test]
    fn zero_sizes_use_defaults() {
        let mut chunker = Chunker::with_sizes(sample(CHUNK_SIZE + 1), 0, 0);
        match chunker.next_event() {
            Some(ChunkerEvent::Chunk(c)) => assert_eq!(c.len(), CHUNK_SIZE),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn last_chunk_of_a_partition_is_cut_short() {
        let mut chunker = Chunker::with_sizes(sample(10), 3, 4);
        let (chunks, boundaries, end) = drain(&mut chunker);
        let lens: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(lens, vec![3, 1, 3, 1, 2]);
        assert_eq!(boundaries, vec![4, 8]);
        assert_eq!(end, 10);
    }

    #[test]
    fn default_sizes_cut_at_partition_edges() {
        let mut chunker = Chunker::new(sample(PARTITION_SIZE + 10_000));
        let (chunks, boundaries, _) = drain(&mut chunker);
        assert_eq!(boundaries, vec![PARTITION_SIZE as u64]);
        // 15 full chunks, then 40,000 bytes to reach the edge.
        assert_eq!(chunks[15].len(), 40_000);
        assert_eq!(chunks[16].len(), 10_000);

        let mut chunker = Chunker::new(sample(3 * PARTITION_SIZE));
        let (_, boundaries, _) = drain(&mut chunker);
        assert_eq!(boundaries, vec![1_000_000, 2_000_000]);
    }

    #[test]
    fn conservation_over_random_buffers() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let chunk_size = rng.gen_range(1..64);
            let partition_size = rng.gen_range(1..200);
            let len = rng.gen_range(0..2048);
            let mut data = vec![0u8; len];
            rng.fill_bytes(&mut data);
            let data = Bytes::from(data);

            let mut chunker = Chunker::with_sizes(data.clone(), chunk_size, partition_size);
            let (chunks, boundaries, end) = drain(&mut chunker);

            let rebuilt: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
            assert_eq!(rebuilt, data.to_vec());
            assert_eq!(end, len as u64);
            assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= chunk_size));
            let expected = len.div_ceil(partition_size).saturating_sub(1);
            assert_eq!(
                boundaries.len(),
                expected,
                "len={len} chunk={chunk_size} partition={partition_size}"
            );
            assert!(boundaries.iter().all(|b| b % partition_size as u64 == 0));
        }
    }

    #[test]
    fn digester_completes_once_with_identical_bytes() {
        let data = sample(1000);
        let mut digester = Digester::new(descriptor(1000), 1000, 0);
        let mut rng = rand::thread_rng();
        let mut offset = 0;
        let mut completed = None;
        while offset < data.len() {
            let end = (offset + rng.gen_range(1..97)).min(data.len());
            match digester.unchunk(data.slice(offset..end)).unwrap() {
                Unchunked::InProgress(p) => assert!(p.file_progress < 1.0),
                Unchunked::Complete { progress, file } => {
                    assert!(completed.is_none());
                    assert_eq!(progress.file_progress, 1.0);
                    assert_eq!(progress.total_progress, 1.0);
                    completed = Some(file);
                }
            }
            offset = end;
        }
        let file = completed.expect("digester never completed");
        assert_eq!(file.data, data);
        assert_eq!(file.descriptor.name, "photo.png");
        assert_eq!(
            digester.unchunk(Bytes::from_static(b"x")),
            Err(DigestError::AlreadyComplete)
        );
    }

    #[test]
    fn digester_tracks_batch_progress() {
        let mut digester = Digester::new(descriptor(50), 200, 100);
        match digester.unchunk(sample(25)).unwrap() {
            Unchunked::InProgress(p) => {
                assert_eq!(p.bytes_received, 25);
                assert_eq!(p.file_progress, 0.5);
                assert_eq!(p.total_progress, 125.0 / 200.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn digester_rejects_overflow() {
        let mut digester = Digester::new(descriptor(4), 4, 0);
        assert_eq!(
            digester.unchunk(sample(5)),
            Err(DigestError::Overflow {
                declared: 4,
                received: 5
            })
        );
    }

    #[test]
    fn zero_length_file_and_zero_total() {
        let mut digester = Digester::new(descriptor(0), 0, 0);
        match digester.unchunk(Bytes::new()).unwrap() {
            Unchunked::Complete { progress, file } => {
                assert_eq!(progress.total_progress, 1.0);
                assert!(file.data.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
