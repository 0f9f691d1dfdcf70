//! The disk spool: a per-source sequence of append-only, encrypted
//! segments. No mmap'd cyclic structure, no intrusive pointers — just an
//! arena of segments addressed by `(source, segment, offset)`. Old
//! segments are deleted only after every record within them has been
//! acknowledged by the sink.

use std::{collections::HashMap, path::PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::crypto::SpoolKey;

/// Errors raised by spool operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred against the spool directory.
    #[error("spool io error (source: {source_name}, reason: {message})")]
    Io {
        /// The source whose spool directory was being accessed.
        source_name: String,
        /// The error message.
        message: String,
    },

    /// A segment failed to decrypt, indicating corruption or tampering.
    #[error("spool segment corrupted (source: {source_name}, segment: {segment})")]
    Corrupted {
        /// The source.
        source_name: String,
        /// The segment sequence number.
        segment: u64,
    },
}

/// The address of a record within the spool: which source, which segment,
/// and its byte offset within that segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolAddress {
    /// The segment sequence number.
    pub segment: u64,
    /// Byte offset within the segment file.
    pub offset: u64,
}

struct SourceWriter {
    segment_seq: u64,
    file: tokio::fs::File,
    bytes_written: u64,
    writes_since_sync: u32,
}

/// Per-source append-only encrypted segment storage.
pub struct Spool {
    root: PathBuf,
    key: SpoolKey,
    max_segment_bytes: u64,
    fsync_every_writes: u32,
    writers: HashMap<String, SourceWriter>,
}

impl Spool {
    /// Creates a spool rooted at `root`, encrypting segments with `key`.
    /// `max_segment_bytes` bounds segment rotation size; `fsync_every_writes`
    /// batches fsync calls.
    pub fn new(root: PathBuf, key: SpoolKey, max_segment_bytes: u64, fsync_every_writes: u32) -> Self {
        Self {
            root,
            key,
            max_segment_bytes,
            fsync_every_writes: fsync_every_writes.max(1),
            writers: HashMap::new(),
        }
    }

    fn source_dir(&self, source_name: &str) -> PathBuf {
        self.root.join(source_name)
    }

    fn segment_path(&self, source_name: &str, segment: u64) -> PathBuf {
        self.source_dir(source_name).join(format!("{segment:06}.seg"))
    }

    /// Lists the segment sequence numbers present for `source_name`, sorted
    /// ascending.
    pub async fn list_segments(&self, source_name: &str) -> Result<Vec<u64>, Error> {
        let dir = self.source_dir(source_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| Error::Io {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;

        let mut segments = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::Io {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(seq) = name.strip_suffix(".seg").and_then(|s| s.parse::<u64>().ok()) {
                    segments.push(seq);
                }
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    async fn writer_for(&mut self, source_name: &str) -> Result<&mut SourceWriter, Error> {
        if !self.writers.contains_key(source_name) {
            tokio::fs::create_dir_all(self.source_dir(source_name))
                .await
                .map_err(|e| Error::Io {
                    source_name: source_name.to_string(),
                    message: e.to_string(),
                })?;

            let existing = self.list_segments(source_name).await?;
            let segment_seq = existing.last().copied().unwrap_or(0);
            let path = self.segment_path(source_name, segment_seq);
            let bytes_written = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);

            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| Error::Io {
                    source_name: source_name.to_string(),
                    message: e.to_string(),
                })?;

            let _ = self.writers.insert(
                source_name.to_string(),
                SourceWriter {
                    segment_seq,
                    file,
                    bytes_written,
                    writes_since_sync: 0,
                },
            );
        }

        Ok(self.writers.get_mut(source_name).expect("writer just inserted"))
    }

    /// Appends `payload` (already-serialized record bytes) to the current
    /// segment for `source_name`, encrypting it at rest. Rotates to a new
    /// segment when the current one would exceed `max_segment_bytes`.
    pub async fn append(&mut self, source_name: &str, payload: &[u8]) -> Result<SpoolAddress, Error> {
        let ciphertext = self
            .key
            .encrypt(payload)
            .map_err(|_| Error::Corrupted {
                source_name: source_name.to_string(),
                segment: 0,
            })?;

        let max_segment_bytes = self.max_segment_bytes;
        let fsync_every_writes = self.fsync_every_writes;

        let rotate = {
            let writer = self.writer_for(source_name).await?;
            writer.bytes_written + ciphertext.len() as u64 + 4 > max_segment_bytes
        };

        if rotate {
            self.rotate(source_name).await?;
        }

        let writer = self.writer_for(source_name).await?;
        let offset = writer.bytes_written;

        let len = ciphertext.len() as u32;
        writer.file.write_all(&len.to_le_bytes()).await.map_err(|e| Error::Io {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;
        writer.file.write_all(&ciphertext).await.map_err(|e| Error::Io {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;

        writer.bytes_written += 4 + ciphertext.len() as u64;
        writer.writes_since_sync += 1;

        if writer.writes_since_sync >= fsync_every_writes {
            writer.file.sync_all().await.map_err(|e| Error::Io {
                source_name: source_name.to_string(),
                message: e.to_string(),
            })?;
            writer.writes_since_sync = 0;
        }

        Ok(SpoolAddress {
            segment: writer.segment_seq,
            offset,
        })
    }

    async fn rotate(&mut self, source_name: &str) -> Result<(), Error> {
        let next_seq = self.writers.get(source_name).map(|w| w.segment_seq + 1).unwrap_or(0);
        let path = self.segment_path(source_name, next_seq);

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Io {
                source_name: source_name.to_string(),
                message: e.to_string(),
            })?;

        let _ = self.writers.insert(
            source_name.to_string(),
            SourceWriter {
                segment_seq: next_seq,
                file,
                bytes_written: 0,
                writes_since_sync: 0,
            },
        );
        Ok(())
    }

    /// Reads and decrypts every record payload in a segment, in file order.
    pub async fn read_segment(&self, source_name: &str, segment: u64) -> Result<Vec<Vec<u8>>, Error> {
        let path = self.segment_path(source_name, segment);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| Error::Io {
            source_name: source_name.to_string(),
            message: e.to_string(),
        })?;

        let mut records = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    return Err(Error::Io {
                        source_name: source_name.to_string(),
                        message: e.to_string(),
                    })
                }
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut ciphertext = vec![0u8; len];
            file.read_exact(&mut ciphertext).await.map_err(|e| Error::Io {
                source_name: source_name.to_string(),
                message: e.to_string(),
            })?;

            let plaintext = self.key.decrypt(&ciphertext).map_err(|_| Error::Corrupted {
                source_name: source_name.to_string(),
                segment,
            })?;
            records.push(plaintext);
        }

        Ok(records)
    }

    /// Deletes a segment file. Callers must ensure every record in the
    /// segment has already been acknowledged by the sink.
    pub async fn delete_segment(&self, source_name: &str, segment: u64) -> Result<(), Error> {
        let path = self.segment_path(source_name, segment);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io {
                source_name: source_name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::SpoolKey;

    async fn test_spool() -> (tempfile::TempDir, Spool) {
        let dir = tempfile::tempdir().unwrap();
        let key = SpoolKey::derive(b"pw", &dir.path().join("salt")).unwrap();
        let spool = Spool::new(dir.path().join("spool"), key, 1024 * 1024, 1);
        (dir, spool)
    }

    #[tokio::test]
    async fn append_and_read_round_trips() {
        let (_dir, mut spool) = test_spool().await;

        let addr1 = spool.append("plc-1", b"record-1").await.unwrap();
        let addr2 = spool.append("plc-1", b"record-2").await.unwrap();

        assert_eq!(addr1.segment, addr2.segment);
        assert!(addr2.offset > addr1.offset);

        let records = spool.read_segment("plc-1", addr1.segment).await.unwrap();
        assert_eq!(records, vec![b"record-1".to_vec(), b"record-2".to_vec()]);
    }

    #[tokio::test]
    async fn segment_sequence_numbers_increase_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let key = SpoolKey::derive(b"pw", &dir.path().join("salt")).unwrap();
        let mut spool = Spool::new(dir.path().join("spool"), key, 16, 1);

        for i in 0..5 {
            let _ = spool.append("plc-1", format!("r{i}").as_bytes()).await.unwrap();
        }

        let segments = spool.list_segments("plc-1").await.unwrap();
        let mut expected: Vec<u64> = (0..segments.len() as u64).collect();
        expected.sort_unstable();
        assert_eq!(segments, expected);
    }

    #[tokio::test]
    async fn delete_segment_is_idempotent() {
        let (_dir, mut spool) = test_spool().await;
        let addr = spool.append("plc-1", b"record").await.unwrap();
        spool.delete_segment("plc-1", addr.segment).await.unwrap();
        spool.delete_segment("plc-1", addr.segment).await.unwrap();
    }
}
