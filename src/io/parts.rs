/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Splitting an upload body into numbered parts.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, ErrorKind};
use crate::io::stream::{InputStream, PartSource, Source};

/// One part of an upload body. Part numbers start at 1 and follow stream
/// order.
#[derive(Debug, Clone)]
pub(crate) struct PartData {
    pub(crate) part_number: u32,
    pub(crate) data: Bytes,
}

/// Cuts an [`InputStream`] into consecutive parts of `part_size` bytes, with
/// the final part carrying the remainder.
///
/// The splitter has a single owner, the upload's body reader task, so parts
/// come out strictly in stream order without any internal locking. The
/// stream's declared content length is authoritative: splitting stops once it
/// is consumed, and a custom source that dries up early is an error.
pub(crate) struct PartSplitter {
    input: SplitterInput,
    part_size: usize,
    next_part_number: u32,
    bytes_left: u64,
}

enum SplitterInput {
    /// The unconsumed tail of an in-memory body.
    Memory(Bytes),
    /// File reads are seek-based against an absolute position, so the handle
    /// is opened once and shuttled through `spawn_blocking`.
    File {
        path: PathBuf,
        file: Option<File>,
        position: u64,
    },
    /// Caller-supplied source; `carry` holds bytes pulled but not yet cut
    /// into a part.
    Custom {
        source: Box<dyn PartSource>,
        carry: BytesMut,
    },
}

impl PartSplitter {
    pub(crate) fn new(stream: InputStream, part_size: usize) -> Self {
        debug_assert!(part_size > 0);
        let bytes_left = stream.content_length();
        let input = match stream.source {
            Source::Memory(data) => SplitterInput::Memory(data),
            Source::File(slice) => SplitterInput::File {
                path: slice.path,
                file: None,
                position: slice.offset,
            },
            Source::Custom { source, .. } => SplitterInput::Custom {
                source,
                carry: BytesMut::new(),
            },
        };

        Self {
            input,
            part_size,
            next_part_number: 1,
            bytes_left,
        }
    }

    /// Cut the next part. `None` once the declared length is exhausted.
    pub(crate) async fn next_part(&mut self) -> Result<Option<PartData>, Error> {
        if self.bytes_left == 0 {
            return Ok(None);
        }
        let take = (self.part_size as u64).min(self.bytes_left) as usize;

        let data = match &mut self.input {
            SplitterInput::Memory(rest) => rest.split_to(take),
            SplitterInput::File {
                path,
                file,
                position,
            } => {
                let data = read_at(path.clone(), file, *position, take).await?;
                *position += take as u64;
                data
            }
            SplitterInput::Custom { source, carry } => fill_from_source(source, carry, take).await?,
        };

        self.bytes_left -= take as u64;
        let part_number = self.next_part_number;
        self.next_part_number += 1;
        Ok(Some(PartData { part_number, data }))
    }
}

impl fmt::Debug for PartSplitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let input = match &self.input {
            SplitterInput::Memory(_) => "memory",
            SplitterInput::File { .. } => "file",
            SplitterInput::Custom { .. } => "custom",
        };
        f.debug_struct("PartSplitter")
            .field("input", &input)
            .field("part_size", &self.part_size)
            .field("next_part_number", &self.next_part_number)
            .field("bytes_left", &self.bytes_left)
            .finish()
    }
}

/// Read exactly `len` bytes at `position`, opening the file on first use.
async fn read_at(
    path: PathBuf,
    file: &mut Option<File>,
    position: u64,
    len: usize,
) -> Result<Bytes, Error> {
    let opened = file.take();
    let (handle, data) = tokio::task::spawn_blocking(move || {
        let mut handle = match opened {
            Some(handle) => handle,
            None => File::open(path)?,
        };
        handle.seek(SeekFrom::Start(position))?;
        let mut buf = vec![0u8; len];
        handle.read_exact(&mut buf)?;
        Ok::<_, std::io::Error>((handle, Bytes::from(buf)))
    })
    .await??;

    *file = Some(handle);
    Ok(data)
}

/// Coalesce source chunks until a full part of `take` bytes is buffered.
async fn fill_from_source(
    source: &mut Box<dyn PartSource>,
    carry: &mut BytesMut,
    take: usize,
) -> Result<Bytes, Error> {
    while carry.len() < take {
        let want = take - carry.len();
        match source.next_chunk(want).await? {
            Some(chunk) if chunk.is_empty() => {
                return Err(Error::new(
                    ErrorKind::IoError,
                    "part source returned an empty chunk",
                ));
            }
            Some(chunk) if chunk.len() > want => {
                return Err(Error::new(
                    ErrorKind::IoError,
                    "part source returned more than the requested limit",
                ));
            }
            Some(chunk) => carry.extend_from_slice(&chunk),
            None => {
                return Err(Error::new(
                    ErrorKind::IoError,
                    "part source ended before its declared content length",
                ));
            }
        }
    }
    Ok(carry.split_to(take).freeze())
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Write;

    use async_trait::async_trait;
    use tempfile::NamedTempFile;

    use super::*;

    fn patterned(len: usize) -> Bytes {
        (0..len).map(|i| (i % 239) as u8).collect::<Vec<u8>>().into()
    }

    async fn split_all(mut splitter: PartSplitter) -> Vec<PartData> {
        let mut parts = Vec::new();
        while let Some(part) = splitter.next_part().await.unwrap() {
            assert_eq!(parts.len() as u32 + 1, part.part_number);
            parts.push(part);
        }
        parts
    }

    fn reassemble(parts: &[PartData]) -> Vec<u8> {
        parts.iter().flat_map(|p| p.data.iter().copied()).collect()
    }

    #[tokio::test]
    async fn test_memory_split_sizes_and_order() {
        let body = patterned(26);
        let splitter = PartSplitter::new(InputStream::from(body.clone()), 10);

        let parts = split_all(splitter).await;
        let sizes: Vec<usize> = parts.iter().map(|p| p.data.len()).collect();
        assert_eq!(vec![10, 10, 6], sizes);
        assert_eq!(&body[..], &reassemble(&parts)[..]);
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_stub_part() {
        let body = patterned(30);
        let splitter = PartSplitter::new(InputStream::from(body), 10);
        assert_eq!(3, split_all(splitter).await.len());
    }

    #[tokio::test]
    async fn test_file_slice_split() {
        let body = patterned(64);
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&body).unwrap();

        // Skip 16, read 40 of the 64 bytes.
        let stream = InputStream::file_slice()
            .path(tmp.path())
            .offset(16)
            .length(40)
            .build()
            .unwrap();
        let parts = split_all(PartSplitter::new(stream, 16)).await;

        let sizes: Vec<usize> = parts.iter().map(|p| p.data.len()).collect();
        assert_eq!(vec![16, 16, 8], sizes);
        assert_eq!(&body[16..56], &reassemble(&parts)[..]);
    }

    struct ScriptedSource {
        chunks: VecDeque<Bytes>,
    }

    #[async_trait]
    impl PartSource for ScriptedSource {
        async fn next_chunk(&mut self, limit: usize) -> Result<Option<Bytes>, Error> {
            match self.chunks.front_mut() {
                None => Ok(None),
                Some(chunk) => {
                    let take = limit.min(chunk.len());
                    let piece = chunk.split_to(take);
                    if chunk.is_empty() {
                        self.chunks.pop_front();
                    }
                    Ok(Some(piece))
                }
            }
        }
    }

    #[tokio::test]
    async fn test_custom_source_chunks_coalesce_into_parts() {
        let body = patterned(22);
        // Source hands data back in awkward pieces; parts still come out
        // full-sized.
        let chunks = vec![
            body.slice(0..3),
            body.slice(3..4),
            body.slice(4..17),
            body.slice(17..22),
        ];
        let stream = InputStream::from_part_source(
            ScriptedSource {
                chunks: chunks.into(),
            },
            body.len() as u64,
        );

        let parts = split_all(PartSplitter::new(stream, 8)).await;
        let sizes: Vec<usize> = parts.iter().map(|p| p.data.len()).collect();
        assert_eq!(vec![8, 8, 6], sizes);
        assert_eq!(&body[..], &reassemble(&parts)[..]);
    }

    #[tokio::test]
    async fn test_custom_source_early_end_is_an_error() {
        let stream = InputStream::from_part_source(
            ScriptedSource {
                chunks: vec![patterned(4)].into(),
            },
            // Declared longer than the source can produce.
            12,
        );

        let mut splitter = PartSplitter::new(stream, 8);
        let err = splitter.next_part().await.unwrap_err();
        assert_eq!(&ErrorKind::IoError, err.kind());
    }
}
