//! File-backed growable vectors of plain-old-data records.
//!
//! Layout on disk is a `u64` element count followed by the packed records.
//! The file is sized to the reserved capacity while the vector is live and
//! truncated back to the logical length on drop, so a persisted vector always
//! reopens with `capacity == len`.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::ptr;

use memmap2::{MmapMut, MmapOptions};

use crate::Error;

/// Bytes reserved for the length prefix.
const HEADER: usize = mem::size_of::<u64>();

/// Growth quantum for appends. Reservations past capacity are rounded up to
/// this step; the excess is a sparse hole until it is written.
const GROW_STEP: usize = 1 << 30;

/// Marker for element types that may live in an [`MmVec`].
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` value types that tolerate any byte
/// pattern read back from disk and contain no pointers, so that a stored
/// vector stays valid across processes.
pub unsafe trait Pod: Copy + 'static {}

unsafe impl Pod for u8 {}
unsafe impl Pod for u32 {}

/// How to attach an [`MmVec`] to its backing file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Unlinked scratch file next to the given path; contents vanish on drop.
    Temporary,
    /// Create or truncate the file at the given path.
    Create,
    /// Open a previously persisted vector; capacity equals the stored length.
    Open,
}

pub struct MmVec<T: Pod> {
    file: File,
    map: MmapMut,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> MmVec<T> {
    pub fn init(path: &Path, mode: Mode) -> Result<Self, Error> {
        match mode {
            Mode::Temporary => {
                let dir = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent,
                    _ => Path::new("."),
                };
                Self::create_in(tempfile::tempfile_in(dir)?)
            }
            Mode::Create => Self::create_in(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)?,
            ),
            Mode::Open => Self::open_in(OpenOptions::new().read(true).write(true).open(path)?, path),
        }
    }

    fn create_in(file: File) -> Result<Self, Error> {
        file.set_len(HEADER as u64)?;
        // SAFETY: the mapping covers exactly the region we just allocated and
        // the file stays open for the lifetime of the vector.
        let map = unsafe { MmapOptions::new().len(HEADER).map_mut(&file)? };
        let mut vec = Self {
            file,
            map,
            capacity: 0,
            _marker: PhantomData,
        };
        vec.set_len(0);
        Ok(vec)
    }

    fn open_in(mut file: File, path: &Path) -> Result<Self, Error> {
        let mut prefix = [0u8; HEADER];
        file.read_exact(&mut prefix)?;
        let len = u64::from_ne_bytes(prefix) as usize;
        let bytes = HEADER + len * mem::size_of::<T>();
        if (file.metadata()?.len() as usize) < bytes {
            return Err(Error::ShortFile(path.to_owned()));
        }
        // SAFETY: the file is at least `bytes` long, checked above.
        let map = unsafe { MmapOptions::new().len(bytes).map_mut(&file)? };
        Ok(Self {
            file,
            map,
            capacity: len,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        let mut prefix = [0u8; HEADER];
        prefix.copy_from_slice(&self.map[..HEADER]);
        u64::from_ne_bytes(prefix) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn set_len(&mut self, len: usize) {
        self.map[..HEADER].copy_from_slice(&(len as u64).to_ne_bytes());
    }

    fn base(&self) -> *const T {
        // The header is 8 bytes and mappings are page-aligned, so the element
        // region is aligned for any Pod type used here.
        unsafe { self.map.as_ptr().add(HEADER) as *const T }
    }

    fn base_mut(&mut self) -> *mut T {
        unsafe { self.map.as_mut_ptr().add(HEADER) as *mut T }
    }

    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.base(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len();
        unsafe { std::slice::from_raw_parts_mut(self.base_mut(), len) }
    }

    /// Grows the backing file and remaps so that at least `n` elements fit.
    ///
    /// Either the new mapping is installed or the old one stays valid; a
    /// failed growth never leaves the vector unusable.
    pub fn reserve(&mut self, n: usize) -> Result<(), Error> {
        if n <= self.capacity {
            return Ok(());
        }
        let bytes = HEADER + n * mem::size_of::<T>();
        self.file.set_len(bytes as u64).map_err(Error::Alloc)?;
        // SAFETY: the file was just extended to `bytes`.
        let map = unsafe {
            MmapOptions::new()
                .len(bytes)
                .map_mut(&self.file)
                .map_err(Error::Alloc)?
        };
        self.map = map;
        self.capacity = n;
        Ok(())
    }

    fn grow_for(&mut self, additional: usize) -> Result<(), Error> {
        let needed = additional * mem::size_of::<T>();
        let step = needed.div_ceil(GROW_STEP) * GROW_STEP;
        self.reserve(self.capacity + step / mem::size_of::<T>())
    }

    pub fn push(&mut self, value: T) -> Result<(), Error> {
        let len = self.len();
        if len == self.capacity {
            self.grow_for(1)?;
        }
        unsafe { ptr::write(self.base_mut().add(len), value) };
        self.set_len(len + 1);
        Ok(())
    }

    pub fn extend_from_slice(&mut self, values: &[T]) -> Result<(), Error> {
        let len = self.len();
        if len + values.len() > self.capacity {
            self.grow_for(len + values.len() - self.capacity)?;
        }
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), self.base_mut().add(len), values.len())
        };
        self.set_len(len + values.len());
        Ok(())
    }

    /// Sets the logical length to `n`, filling any new tail with `value`.
    /// Shrinking only moves the length; storage is never released early.
    pub fn resize(&mut self, n: usize, value: T) -> Result<(), Error> {
        if n > self.capacity {
            self.grow_for(n - self.capacity)?;
        }
        for index in self.len()..n {
            unsafe { ptr::write(self.base_mut().add(index), value) };
        }
        self.set_len(n);
        Ok(())
    }
}

impl<T: Pod> Deref for MmVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Pod> DerefMut for MmVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Pod> Drop for MmVec<T> {
    fn drop(&mut self) {
        let bytes = HEADER + self.len() * mem::size_of::<T>();
        let _ = self.map.flush();
        let _ = self.file.set_len(bytes as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values");
        {
            let mut vec: MmVec<u32> = MmVec::init(&path, Mode::Create).unwrap();
            for value in 0..100u32 {
                vec.push(value * 3).unwrap();
            }
            assert_eq!(vec.len(), 100);
            assert_eq!(vec[99], 297);
        }
        // Drop truncated the file to header + contents.
        let on_disk = std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk, (HEADER + 100 * mem::size_of::<u32>()) as u64);

        let vec: MmVec<u32> = MmVec::init(&path, Mode::Open).unwrap();
        assert_eq!(vec.len(), 100);
        assert_eq!(vec.capacity(), 100);
        assert!(vec.iter().enumerate().all(|(i, &v)| v == i as u32 * 3));
    }

    #[test]
    fn reserve_keeps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values");
        let mut vec: MmVec<u32> = MmVec::init(&path, Mode::Create).unwrap();
        vec.extend_from_slice(&[1, 2, 3]).unwrap();
        vec.reserve(1 << 20).unwrap();
        assert_eq!(vec.as_slice(), &[1, 2, 3]);
        assert!(vec.capacity() >= 1 << 20);
    }

    #[test]
    fn resize_fills_with_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values");
        let mut vec: MmVec<u32> = MmVec::init(&path, Mode::Create).unwrap();
        vec.resize(11, 7).unwrap();
        assert_eq!(vec.len(), 11);
        assert!(vec.iter().all(|&v| v == 7));
        vec.resize(4, 0).unwrap();
        assert_eq!(vec.len(), 4);
    }

    #[test]
    fn temporary_vectors_leave_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        let mut vec: MmVec<u8> = MmVec::init(&path, Mode::Temporary).unwrap();
        vec.extend_from_slice(b"xyzzy").unwrap();
        assert_eq!(vec.as_slice(), b"xyzzy");
        assert!(!path.exists());
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(MmVec::<u32>::init(&path, Mode::Open).is_err());
    }
}
