//! File handles the pipeline reads from.
//!
//! Defines the [`FileHandle`] trait so uploads held in memory and files on disk
//! go through the same validation and reading path.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Async source of a file's metadata and bytes.
#[async_trait::async_trait]
pub trait FileHandle: Send + Sync {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    /// MIME type, when the source supplied one.
    fn mime_type(&self) -> Option<&str>;
    async fn read_all(&self) -> io::Result<Vec<u8>>;
    /// Read bytes in `[start, end)`. `end` is clamped to the file size.
    async fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>>;
}

/// A file whose bytes are already in memory, e.g. a multipart upload.
#[derive(Debug, Clone)]
pub struct MemoryFile {
    name: String,
    mime_type: Option<String>,
    bytes: Arc<[u8]>,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
            bytes: bytes.into(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        let mime_type = mime_type.into();
        self.mime_type = if mime_type.is_empty() {
            None
        } else {
            Some(mime_type)
        };
        self
    }
}

#[async_trait::async_trait]
impl FileHandle for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    async fn read_all(&self) -> io::Result<Vec<u8>> {
        Ok(self.bytes.to_vec())
    }

    async fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        let len = self.bytes.len();
        let start = (start as usize).min(len);
        let end = (end as usize).clamp(start, len);
        Ok(self.bytes[start..end].to_vec())
    }
}

/// A file on the local filesystem. Bytes are read lazily.
#[derive(Debug, Clone)]
pub struct DiskFile {
    path: PathBuf,
    name: String,
    size: u64,
    mime_type: Option<String>,
}

impl DiskFile {
    /// Stat the file and guess its MIME type from the extension.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = guess_mime_type(&name).map(str::to_string);

        Ok(Self {
            path,
            name,
            size: metadata.len(),
            mime_type,
        })
    }
}

#[async_trait::async_trait]
impl FileHandle for DiskFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    async fn read_all(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    async fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        let end = end.min(self.size);
        if start >= end {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// MIME type for the spreadsheet extensions we know about.
pub fn guess_mime_type(file_name: &str) -> Option<&'static str> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    match ext.as_str() {
        "xlsx" | "xlsm" => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        "xls" => Some("application/vnd.ms-excel"),
        "xlsb" => Some("application/vnd.ms-excel.sheet.binary.macroEnabled.12"),
        "ods" => Some("application/vnd.oasis.opendocument.spreadsheet"),
        "csv" => Some("text/csv"),
        _ => None,
    }
}
