//! Leftborder spill file: a flat run of native-endian `u32` records, one per
//! entry in index order, no header. Written through a fixed buffer and mapped
//! back as a private copy-on-write view so claims never touch the file.

use byteorder::{NativeEndian, WriteBytesExt};
use log::info;
use memmap2::{MmapMut, MmapOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::index::IndexError;

/// Records buffered before a write.
pub const SPILL_BUFFER_ENTRIES: usize = 1024;

/// Buffered writer for the spill file.
pub struct LeftborderWriter {
    out: BufWriter<NamedTempFile>,
    buffer: Vec<u32>,
    written: usize,
}

impl LeftborderWriter {
    /// Create the temporary file in `dir`, or in the system temp dir.
    pub fn create(dir: Option<&Path>) -> Result<Self, IndexError> {
        let file = match dir {
            Some(d) => NamedTempFile::new_in(d)?,
            None => NamedTempFile::new()?,
        };
        Ok(Self {
            out: BufWriter::new(file),
            buffer: Vec::with_capacity(SPILL_BUFFER_ENTRIES),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        self.out.get_ref().path()
    }

    #[inline]
    pub fn push(&mut self, value: u32) -> Result<(), IndexError> {
        self.buffer.push(value);
        if self.buffer.len() == SPILL_BUFFER_ENTRIES {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<(), IndexError> {
        for &v in &self.buffer {
            self.out.write_u32::<NativeEndian>(v)?;
        }
        self.written += self.buffer.len();
        self.buffer.clear();
        Ok(())
    }

    /// Number of records pushed so far.
    pub fn len(&self) -> usize {
        self.written + self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush everything and map the file back in.
    pub fn finish(mut self) -> Result<MappedLeftborder, IndexError> {
        self.flush_buffer()?;
        self.out.flush()?;
        let file = self
            .out
            .into_inner()
            .map_err(|e| IndexError::Io(e.into_error()))?;
        info!(
            "spilled {} leftborder entries ({} bytes) to {}",
            self.written,
            self.written * 4,
            file.path().display()
        );
        MappedLeftborder::load(file, self.written)
    }
}

/// Memory-mapped spill file, viewed as `[u32]`.
pub struct MappedLeftborder {
    map: Option<MmapMut>,
    len: usize,
    file: NamedTempFile,
}

impl MappedLeftborder {
    /// Map `len` records of `file`. The file is removed when this is dropped.
    pub fn load(file: NamedTempFile, len: usize) -> Result<Self, IndexError> {
        let bytes = file.as_file().metadata()?.len() as usize;
        if bytes != len * 4 {
            return Err(IndexError::Cast(format!(
                "spill file holds {bytes} bytes, expected {}",
                len * 4
            )));
        }
        if len == 0 {
            return Ok(Self {
                map: None,
                len,
                file,
            });
        }
        // SAFETY: the temporary file is owned by this struct and not written
        // through any other handle while mapped; the mapping is private.
        let mut map = unsafe { MmapOptions::new().len(bytes).map_copy(file.as_file())? };
        bytemuck::try_cast_slice_mut::<u8, u32>(&mut map[..])
            .map_err(|e| IndexError::Cast(format!("{e:?}")))?;
        Ok(Self {
            map: Some(map),
            len,
            file,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u32] {
        match &self.map {
            Some(map) => bytemuck::cast_slice(&map[..]),
            None => &[],
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u32] {
        match &mut self.map {
            Some(map) => bytemuck::cast_slice_mut(&mut map[..]),
            None => &mut [],
        }
    }
}
