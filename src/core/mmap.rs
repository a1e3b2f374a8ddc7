use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::core::{Error, Result};

/// A read/write shared file mapping. Every process that maps the same file
/// sees the same physical pages, usually at a different virtual address.
/// The file handle is closed once mapped; the pages stay shared.
pub struct MmapFile {
    map: MmapMut,
    len: usize,
    path: PathBuf,
}

impl MmapFile {
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            map,
            len,
            path: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self {
            map,
            len,
            path: path.to_path_buf(),
        })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Base address of this process's view of the mapping.
    pub fn base_ptr(&self) -> *mut u8 {
        self.map.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renames the backing file; the mapping itself is unaffected.
    pub fn rename(&mut self, to: &Path) -> Result<()> {
        std::fs::rename(&self.path, to)?;
        self.path = to.to_path_buf();
        Ok(())
    }

    pub fn lock(&self) -> Result<()> {
        #[cfg(unix)]
        {
            let res = unsafe { libc::mlock(self.map.as_ptr() as *const libc::c_void, self.len) };
            if res != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }
        Ok(())
    }
}
