//! Segmented file device.
//!
//! The logical address space is split into fixed-size segments, each backed
//! by its own file (`<base>.0`, `<base>.1`, ...). Truncation below an offset
//! deletes whole segment files, which is how `shift_begin_address` reclaims
//! disk space.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::utility::is_power_of_two;

use super::traits::{IoFuture, StorageDevice};

pub struct FileDevice {
    dir: PathBuf,
    base_name: String,
    segment_size: u64,
    segments: RwLock<HashMap<u64, Arc<File>>>,
}

impl FileDevice {
    /// Open (or create) a segmented device under `dir`.
    ///
    /// `segment_size` must be a power of two.
    pub fn new<P: AsRef<Path>>(dir: P, base_name: &str, segment_size: u64) -> io::Result<Self> {
        if !is_power_of_two(segment_size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment size must be a power of two",
            ));
        }
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(FileDevice {
            dir: dir.as_ref().to_path_buf(),
            base_name: base_name.to_string(),
            segment_size,
            segments: RwLock::new(HashMap::new()),
        })
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", self.base_name, segment))
    }

    fn segment_file(&self, segment: u64) -> io::Result<Arc<File>> {
        if let Some(file) = self.segments.read().get(&segment) {
            return Ok(file.clone());
        }
        let mut segments = self.segments.write();
        if let Some(file) = segments.get(&segment) {
            return Ok(file.clone());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.segment_path(segment))?;
        let file = Arc::new(file);
        segments.insert(segment, file.clone());
        Ok(file)
    }

    /// Split `[offset, offset + len)` into per-segment chunks.
    fn chunks(&self, offset: u64, len: u64) -> Vec<(u64, u64, u64)> {
        // (segment, in-segment offset, chunk length)
        let mut out = Vec::new();
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let segment = pos / self.segment_size;
            let seg_off = pos % self.segment_size;
            let chunk = (self.segment_size - seg_off).min(end - pos);
            out.push((segment, seg_off, chunk));
            pos += chunk;
        }
        out
    }

    fn write_sync(&self, offset: u64, data: &[u8]) -> io::Result<usize> {
        let mut written = 0usize;
        for (segment, seg_off, chunk) in self.chunks(offset, data.len() as u64) {
            let file = self.segment_file(segment)?;
            file.write_all_at(&data[written..written + chunk as usize], seg_off)?;
            written += chunk as usize;
        }
        Ok(written)
    }

    fn read_sync(&self, offset: u64, length: u32) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; length as usize];
        let mut filled = 0usize;
        for (segment, seg_off, chunk) in self.chunks(offset, length as u64) {
            let exists = self.segment_path(segment).exists()
                || self.segments.read().contains_key(&segment);
            if exists {
                let file = self.segment_file(segment)?;
                let buf = &mut out[filled..filled + chunk as usize];
                let mut read = 0usize;
                // Zero-fill past EOF.
                while read < buf.len() {
                    match file.read_at(&mut buf[read..], seg_off + read as u64) {
                        Ok(0) => break,
                        Ok(n) => read += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            filled += chunk as usize;
        }
        Ok(out)
    }

    fn truncate_sync(&self, offset: u64) -> io::Result<()> {
        let last_dead_segment = offset / self.segment_size;
        let mut segments = self.segments.write();
        for segment in 0..last_dead_segment {
            segments.remove(&segment);
            let path = self.segment_path(segment);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

impl StorageDevice for FileDevice {
    fn write<'a>(&'a self, offset: u64, data: &'a [u8]) -> IoFuture<'a, usize> {
        Box::pin(async move { self.write_sync(offset, data) })
    }

    fn read(&self, offset: u64, length: u32) -> IoFuture<'_, Vec<u8>> {
        Box::pin(async move { self.read_sync(offset, length) })
    }

    fn sync(&self) -> IoFuture<'_, ()> {
        Box::pin(async move {
            let segments = self.segments.read();
            for file in segments.values() {
                file.sync_data()?;
            }
            Ok(())
        })
    }

    fn truncate_until(&self, offset: u64) -> IoFuture<'_, ()> {
        Box::pin(async move { self.truncate_sync(offset) })
    }

    fn sector_size(&self) -> usize {
        512
    }
}
