/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

use std::fmt;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{invalid_input, Error};

/// Caller-supplied producer of upload body data.
///
/// Chunks are pulled by a single sequential reader, so a source is never read
/// concurrently with itself. A chunk may be smaller than the requested limit;
/// the client coalesces chunks into full-size parts. A source must not return
/// empty chunks, and the bytes it produces must add up to the content length
/// declared in [`InputStream::from_part_source`] — the reader stops asking
/// once that length is reached.
#[async_trait]
pub trait PartSource: Send {
    /// Produce the next chunk of at most `limit` bytes, or `None` at the end
    /// of the stream.
    async fn next_chunk(&mut self, limit: usize) -> Result<Option<Bytes>, Error>;
}

/// Body of an upload: where the bytes come from and how many there are.
///
/// Every stream has an exact length, known when the meta request is
/// submitted; multipart planning depends on it.
pub struct InputStream {
    pub(crate) source: Source,
}

pub(crate) enum Source {
    /// Bytes already in memory.
    Memory(Bytes),
    /// A slice of a file on disk.
    File(FileSlice),
    /// Caller-supplied source with a declared length.
    Custom {
        source: Box<dyn PartSource>,
        content_length: u64,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct FileSlice {
    pub(crate) path: PathBuf,
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

impl InputStream {
    /// Stream an entire file.
    ///
    /// The file's size is captured here; the upload fails if the file changes
    /// underneath the transfer.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::file_slice().path(path).build()
    }

    /// Configure a stream over part of a file, with an explicit offset and
    /// length.
    pub fn file_slice() -> FileSliceBuilder {
        FileSliceBuilder::default()
    }

    /// Stream from a caller-supplied [`PartSource`] that will produce exactly
    /// `content_length` bytes.
    pub fn from_part_source(source: impl PartSource + 'static, content_length: u64) -> Self {
        Self {
            source: Source::Custom {
                source: Box::new(source),
                content_length,
            },
        }
    }

    /// Total number of bytes the stream will produce.
    pub fn content_length(&self) -> u64 {
        match &self.source {
            Source::Memory(data) => data.len() as u64,
            Source::File(slice) => slice.length,
            Source::Custom { content_length, .. } => *content_length,
        }
    }
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Memory(_) => "memory",
            Source::File(_) => "file",
            Source::Custom { .. } => "custom",
        };
        f.debug_struct("InputStream")
            .field("source", &source)
            .field("content_length", &self.content_length())
            .finish()
    }
}

impl Default for InputStream {
    fn default() -> Self {
        Self {
            source: Source::Memory(Bytes::new()),
        }
    }
}

impl From<Bytes> for InputStream {
    fn from(value: Bytes) -> Self {
        Self {
            source: Source::Memory(value),
        }
    }
}

impl From<Vec<u8>> for InputStream {
    fn from(value: Vec<u8>) -> Self {
        Self::from(Bytes::from(value))
    }
}

impl From<&'static [u8]> for InputStream {
    fn from(value: &'static [u8]) -> Self {
        Self::from(Bytes::from_static(value))
    }
}

impl From<&'static str> for InputStream {
    fn from(value: &'static str) -> Self {
        Self::from(Bytes::from_static(value.as_bytes()))
    }
}

/// Builder for a file-backed [`InputStream`].
#[derive(Debug, Default)]
pub struct FileSliceBuilder {
    path: Option<PathBuf>,
    offset: u64,
    length: Option<u64>,
}

impl FileSliceBuilder {
    /// The file to read from. Required.
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Byte offset to start reading at. Defaults to the start of the file.
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Number of bytes to read. Defaults to the rest of the file after
    /// `offset`.
    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    /// Check the slice against the file's current size and build the stream.
    pub fn build(self) -> Result<InputStream, Error> {
        let path = self
            .path
            .ok_or_else(|| invalid_input("a file path is required"))?;
        let file_len = fs::metadata(&path)?.len();

        let length = match self.length {
            Some(length) => length,
            None => file_len.saturating_sub(self.offset),
        };
        let in_bounds = self
            .offset
            .checked_add(length)
            .map(|end| end <= file_len)
            .unwrap_or(false);
        if !in_bounds {
            return Err(invalid_input(format!(
                "slice of {length} bytes at offset {} is outside the {file_len} byte file",
                self.offset
            )));
        }

        Ok(InputStream {
            source: Source::File(FileSlice {
                path,
                offset: self.offset,
                length,
            }),
        })
    }
}
