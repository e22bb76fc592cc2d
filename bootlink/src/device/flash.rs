//! Flash driver interface and reference drivers.
//!
//! The engine only talks to flash through [`FlashDriver`]. Two drivers are
//! provided: [`MemoryFlash`] keeps everything in RAM, [`FileFlash`] backs the
//! firmware area with an image file and stores the image state in a footer
//! after it:
//!
//! ```text
//! +---------------------------+-------------------------------------------+
//! | firmware area (capacity)  | magic "BLNK" | state u8 | length | hash   |
//! |                           |  u32 LE      |          | u32 LE | 32 B   |
//! +---------------------------+-------------------------------------------+
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::FlashError;
use crate::protocol::message::{Digest, HASH_LEN};

/// Value of an erased flash byte.
pub const ERASED_BYTE: u8 = 0xFF;

/// Footer magic ("BLNK").
pub const FOOTER_MAGIC: u32 = 0x4B4E_4C42;
/// Footer size in bytes.
pub const FOOTER_LEN: u64 = 4 + 1 + 4 + HASH_LEN as u64;

/// A byte range of the firmware area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Start offset.
    pub offset: u32,
    /// Length in bytes.
    pub length: u32,
}

impl Region {
    /// Create a region.
    pub const fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset, `None` on overflow.
    pub fn end(&self) -> Option<u32> {
        self.offset.checked_add(self.length)
    }

    fn check(&self, capacity: u32) -> Result<(), FlashError> {
        match self.end() {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(FlashError::OutOfBounds {
                offset: self.offset,
                length: self.length,
                capacity,
            }),
        }
    }
}

/// Persistent state of the firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "state", rename_all = "snake_case"))]
pub enum ImageState {
    /// Nothing written since the last full erase.
    #[default]
    Empty,
    /// Partial or rejected data; must not be booted.
    Unbootable {
        /// Bytes written before the image was invalidated.
        written: u32,
    },
    /// A verified image.
    Bootable {
        /// Image length.
        length: u32,
        /// SHA-256 of the image.
        hash: Digest,
    },
}

impl ImageState {
    /// Whether the image may be booted.
    pub fn is_bootable(&self) -> bool {
        matches!(self, Self::Bootable { .. })
    }
}

/// Flash memory primitives.
pub trait FlashDriver: Send {
    /// Size of the firmware area in bytes.
    fn capacity(&self) -> u32;

    /// Erase `region` back to [`ERASED_BYTE`].
    fn erase(&mut self, region: Region) -> Result<(), FlashError>;

    /// Program `data` at `offset`. The target bytes must be erased.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Read `length` bytes at `offset`.
    fn read(&mut self, offset: u32, length: u32) -> Result<Vec<u8>, FlashError>;

    /// Current image state.
    fn image_state(&self) -> ImageState;

    /// Persist a new image state.
    fn set_image_state(&mut self, state: ImageState) -> Result<(), FlashError>;
}

impl<F: FlashDriver + ?Sized> FlashDriver for Box<F> {
    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn erase(&mut self, region: Region) -> Result<(), FlashError> {
        (**self).erase(region)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(offset, data)
    }

    fn read(&mut self, offset: u32, length: u32) -> Result<Vec<u8>, FlashError> {
        (**self).read(offset, length)
    }

    fn image_state(&self) -> ImageState {
        (**self).image_state()
    }

    fn set_image_state(&mut self, state: ImageState) -> Result<(), FlashError> {
        (**self).set_image_state(state)
    }
}

/// RAM-backed flash.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    data: Vec<u8>,
    state: ImageState,
    fail_at: Option<u32>,
}

impl MemoryFlash {
    /// Create an erased flash of `capacity` bytes.
    pub fn new(capacity: u32) -> Self {
        Self {
            data: vec![ERASED_BYTE; capacity as usize],
            state: ImageState::Empty,
            fail_at: None,
        }
    }

    /// Make every write that reaches `offset` fail.
    #[must_use]
    pub fn with_write_fault(mut self, offset: u32) -> Self {
        self.fail_at = Some(offset);
        self
    }

    /// Raw contents.
    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl FlashDriver for MemoryFlash {
    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    fn erase(&mut self, region: Region) -> Result<(), FlashError> {
        region.check(self.capacity())?;
        let start = region.offset as usize;
        self.data[start..start + region.length as usize].fill(ERASED_BYTE);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let region = Region::new(offset, data.len() as u32);
        region.check(self.capacity())?;
        if let (Some(fail_at), Some(end)) = (self.fail_at, region.end()) {
            if end > fail_at {
                return Err(FlashError::Driver(format!("program failed at 0x{fail_at:08X}")));
            }
        }
        let start = offset as usize;
        let target = &mut self.data[start..start + data.len()];
        if let Some(pos) = target.iter().position(|b| *b != ERASED_BYTE) {
            return Err(FlashError::NotErased(offset + pos as u32));
        }
        target.copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, offset: u32, length: u32) -> Result<Vec<u8>, FlashError> {
        Region::new(offset, length).check(self.capacity())?;
        let start = offset as usize;
        Ok(self.data[start..start + length as usize].to_vec())
    }

    fn image_state(&self) -> ImageState {
        self.state.clone()
    }

    fn set_image_state(&mut self, state: ImageState) -> Result<(), FlashError> {
        self.state = state;
        Ok(())
    }
}

/// Image-file-backed flash.
#[derive(Debug)]
pub struct FileFlash {
    path: PathBuf,
    file: File,
    capacity: u32,
    state: ImageState,
}

impl FileFlash {
    /// Open an existing image, or create an erased one of `capacity` bytes.
    pub fn open_or_create(path: impl AsRef<Path>, capacity: u32) -> Result<Self, FlashError> {
        let path = path.as_ref();
        if path.exists() {
            let flash = Self::open(path)?;
            if flash.capacity != capacity {
                return Err(FlashError::Driver(format!(
                    "{} holds {} bytes, expected {capacity}",
                    path.display(),
                    flash.capacity
                )));
            }
            return Ok(flash);
        }

        debug!("Creating flash image {} ({capacity} bytes)", path.display());
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let erased = vec![ERASED_BYTE; 64 * 1024];
        let mut left = capacity as usize;
        while left > 0 {
            let n = left.min(erased.len());
            file.write_all(&erased[..n])?;
            left -= n;
        }

        let mut flash = Self {
            path: path.to_path_buf(),
            file,
            capacity,
            state: ImageState::Empty,
        };
        flash.write_footer()?;
        Ok(flash)
    }

    /// Open an existing image; capacity is taken from the file size.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, FlashError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let capacity = len
            .checked_sub(FOOTER_LEN)
            .and_then(|c| u32::try_from(c).ok())
            .ok_or_else(|| FlashError::Driver(format!("{} is not a flash image", path.display())))?;

        file.seek(SeekFrom::Start(u64::from(capacity)))?;
        let state = read_footer(&mut file)?;
        debug!(
            "Opened flash image {} ({capacity} bytes, {state:?})",
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            capacity,
            state,
        })
    }

    /// Image file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_footer(&mut self) -> Result<(), FlashError> {
        self.file.seek(SeekFrom::Start(u64::from(self.capacity)))?;
        let mut footer = Vec::with_capacity(FOOTER_LEN as usize);
        encode_footer(&mut footer, &self.state)?;
        self.file.write_all(&footer)?;
        self.file.flush()?;
        Ok(())
    }
}

fn encode_footer(out: &mut Vec<u8>, state: &ImageState) -> Result<(), FlashError> {
    out.write_u32::<LittleEndian>(FOOTER_MAGIC)?;
    let (tag, length, hash) = match state {
        ImageState::Empty => (0u8, 0, [0u8; HASH_LEN]),
        ImageState::Unbootable { written } => (1, *written, [0u8; HASH_LEN]),
        ImageState::Bootable { length, hash } => {
            let mut raw = [0u8; HASH_LEN];
            raw[..hash.len()].copy_from_slice(hash);
            (2, *length, raw)
        },
    };
    out.write_u8(tag)?;
    out.write_u32::<LittleEndian>(length)?;
    out.write_all(&hash)?;
    Ok(())
}

fn read_footer<R: Read>(reader: &mut R) -> Result<ImageState, FlashError> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != FOOTER_MAGIC {
        return Err(FlashError::Driver(format!(
            "bad image footer magic 0x{magic:08X}"
        )));
    }
    let tag = reader.read_u8()?;
    let length = reader.read_u32::<LittleEndian>()?;
    let mut hash = [0u8; HASH_LEN];
    reader.read_exact(&mut hash)?;

    Ok(match tag {
        0 => ImageState::Empty,
        1 => ImageState::Unbootable { written: length },
        2 => ImageState::Bootable {
            length,
            hash: Digest::from(hash),
        },
        other => {
            return Err(FlashError::Driver(format!("unknown image state {other}")));
        },
    })
}

impl FlashDriver for FileFlash {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn erase(&mut self, region: Region) -> Result<(), FlashError> {
        region.check(self.capacity)?;
        trace!("Erasing 0x{:08X}+{}", region.offset, region.length);
        self.file.seek(SeekFrom::Start(u64::from(region.offset)))?;
        let erased = [ERASED_BYTE; 4096];
        let mut left = region.length as usize;
        while left > 0 {
            let n = left.min(erased.len());
            self.file.write_all(&erased[..n])?;
            left -= n;
        }
        self.file.flush()?;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let current = self.read(offset, data.len() as u32)?;
        if let Some(pos) = current.iter().position(|b| *b != ERASED_BYTE) {
            return Err(FlashError::NotErased(offset + pos as u32));
        }
        self.file.seek(SeekFrom::Start(u64::from(offset)))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, offset: u32, length: u32) -> Result<Vec<u8>, FlashError> {
        Region::new(offset, length).check(self.capacity)?;
        self.file.seek(SeekFrom::Start(u64::from(offset)))?;
        let mut buf = vec![0u8; length as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn image_state(&self) -> ImageState {
        self.state.clone()
    }

    fn set_image_state(&mut self, state: ImageState) -> Result<(), FlashError> {
        self.state = state;
        self.write_footer()
    }
}

/// Flash shared between sessions.
///
/// Access is serialised by a mutex; erase/write exclusivity across sessions
/// is the job of [`crate::engine::guard::SessionRegistry`].
#[derive(Debug)]
pub struct SharedFlash<F> {
    inner: Arc<Mutex<F>>,
}

impl<F> Clone for SharedFlash<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: FlashDriver> SharedFlash<F> {
    /// Share `flash`.
    pub fn new(flash: F) -> Self {
        Self {
            inner: Arc::new(Mutex::new(flash)),
        }
    }

    /// Run `f` with the driver locked.
    pub fn with<T>(&self, f: impl FnOnce(&mut F) -> Result<T, FlashError>) -> Result<T, FlashError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| FlashError::Driver("flash lock poisoned".into()))?;
        f(&mut *guard)
    }
}

impl<F: FlashDriver> FlashDriver for SharedFlash<F> {
    fn capacity(&self) -> u32 {
        self.inner.lock().map(|f| f.capacity()).unwrap_or(0)
    }

    fn erase(&mut self, region: Region) -> Result<(), FlashError> {
        self.with(|f| f.erase(region))
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.with(|f| f.write(offset, data))
    }

    fn read(&mut self, offset: u32, length: u32) -> Result<Vec<u8>, FlashError> {
        self.with(|f| f.read(offset, length))
    }

    fn image_state(&self) -> ImageState {
        self.inner
            .lock()
            .map(|f| f.image_state())
            .unwrap_or(ImageState::Unbootable { written: 0 })
    }

    fn set_image_state(&mut self, state: ImageState) -> Result<(), FlashError> {
        self.with(|f| f.set_image_state(state))
    }
}
