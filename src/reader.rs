//! Direct and chunked byte reading.

use std::io;

use tracing::debug;

use crate::config::PerformanceConfig;
use crate::file::FileHandle;

/// How a file's bytes will be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    Direct,
    Chunked { chunk_size: u64 },
}

impl ReadStrategy {
    /// Chunk only when enabled and the file is larger than one chunk.
    pub fn select(file_size: u64, config: &PerformanceConfig) -> Self {
        if config.enable_chunked_reading && config.chunk_size > 0 && file_size > config.chunk_size {
            Self::Chunked {
                chunk_size: config.chunk_size,
            }
        } else {
            Self::Direct
        }
    }
}

/// Read the whole file into one contiguous buffer.
///
/// In chunked mode slices are read in order and the task yields between
/// them. Any slice failure aborts the read and is returned as-is.
pub async fn read(file: &dyn FileHandle, config: &PerformanceConfig) -> io::Result<Vec<u8>> {
    let size = file.size();

    match ReadStrategy::select(size, config) {
        ReadStrategy::Direct => file.read_all().await,
        ReadStrategy::Chunked { chunk_size } => {
            let chunk_count = size.div_ceil(chunk_size);
            debug!(
                "Chunked read of '{}': {} bytes in {} chunks",
                file.name(),
                size,
                chunk_count
            );

            let mut buffer = Vec::with_capacity(size as usize);
            let mut offset = 0u64;
            while offset < size {
                let end = (offset + chunk_size).min(size);
                let chunk = file.read_range(offset, end).await?;
                buffer.extend_from_slice(&chunk);
                offset = end;

                tokio::task::yield_now().await;
            }

            Ok(buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records range reads and can fail on a given one.
    struct CountingFile {
        inner: MemoryFile,
        ranges: AtomicUsize,
        fail_on: Option<usize>,
    }

    #[async_trait::async_trait]
    impl FileHandle for CountingFile {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn mime_type(&self) -> Option<&str> {
            None
        }

        async fn read_all(&self) -> io::Result<Vec<u8>> {
            self.inner.read_all().await
        }

        async fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
            let n = self.ranges.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(n) {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "slice failed"));
            }
            self.inner.read_range(start, end).await
        }
    }

    fn counting(bytes: &[u8], fail_on: Option<usize>) -> CountingFile {
        CountingFile {
            inner: MemoryFile::new("data.csv", bytes.to_vec()),
            ranges: AtomicUsize::new(0),
            fail_on,
        }
    }

    fn chunked(chunk_size: u64) -> PerformanceConfig {
        PerformanceConfig {
            enable_chunked_reading: true,
            chunk_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_strategy_selection() {
        let config = chunked(10);
        assert_eq!(ReadStrategy::select(10, &config), ReadStrategy::Direct);
        assert_eq!(
            ReadStrategy::select(11, &config),
            ReadStrategy::Chunked { chunk_size: 10 }
        );

        let disabled = PerformanceConfig {
            enable_chunked_reading: false,
            chunk_size: 10,
            ..Default::default()
        };
        assert_eq!(ReadStrategy::select(1000, &disabled), ReadStrategy::Direct);
        assert_eq!(ReadStrategy::select(1000, &chunked(0)), ReadStrategy::Direct);
    }

    #[tokio::test]
    async fn test_chunked_read_concatenates_in_order() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let file = counting(&bytes, None);

        let read_back = read(&file, &chunked(64)).await.unwrap();
        assert_eq!(read_back, bytes);
        assert_eq!(file.ranges.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn test_small_file_reads_directly() {
        let file = counting(b"Name\nJohn\n", None);
        let read_back = read(&file, &chunked(64)).await.unwrap();
        assert_eq!(read_back, b"Name\nJohn\n");
        assert_eq!(file.ranges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slice_failure_aborts() {
        let file = counting(&[7u8; 100], Some(2));
        let err = read(&file, &chunked(10)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(file.ranges.load(Ordering::SeqCst), 3);
    }
}
