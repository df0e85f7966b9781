#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use std::path::PathBuf;

use embedded_storage::nor_flash::{ErrorType, NorFlashError, NorFlashErrorKind};
use spiftl::platform::Flash;
use spiftl::{EB_BYTES, LBA_BYTES};

/// 256 KiB: 64 erase blocks, the geometry used by the end-to-end scenarios.
pub const SMALL_FLASH: usize = 256 * 1024;

/// RAM-backed flash with an operation log and fault injection. Only erase
/// and program count as operations; block reads model memory-mapped access.
pub struct RamFlash {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    /// Erases of blocks that were already blank. The metadata path re-erases
    /// when rotating epochs, so these are tolerated but kept countable.
    pub redundant_erases: usize,
    erased: Vec<bool>,
    image_path: Option<PathBuf>,
    write_buffer_size: usize,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Program { eb: u16, offset: usize, len: usize },
    Erase { eb: u16 },
}

impl RamFlash {
    pub fn new(bytes: usize) -> Self {
        Self {
            buf: vec![0u8; bytes],
            fail_after_operation: usize::MAX,
            operations: Vec::new(),
            redundant_erases: 0,
            erased: vec![false; bytes / EB_BYTES],
            image_path: None,
            write_buffer_size: 128,
        }
    }

    pub fn new_with_fault(bytes: usize, fail_after_operation: usize) -> Self {
        Self {
            fail_after_operation,
            ..Self::new(bytes)
        }
    }

    /// Backs `serialize`/`deserialize` with a file, like real host emulation.
    pub fn with_image(mut self, path: PathBuf) -> Self {
        self.image_path = Some(path);
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    pub fn programs(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Program { .. }))
            .count()
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    /// Erase blocks whose contents start with the metadata signature,
    /// paired with the epoch from their header word.
    pub fn metadata_blocks(&self) -> Vec<(u16, u32)> {
        let mut hits = Vec::new();
        for eb in 0..(self.buf.len() / EB_BYTES) as u16 {
            let block = &self.buf[eb as usize * EB_BYTES..];
            if &block[..8] == b"SPIFTL01" {
                let word = u32::from_le_bytes(block[8..12].try_into().unwrap());
                hits.push((eb, word >> 8));
            }
        }
        hits
    }

    /// Flips one payload byte in every block of the newest generation.
    pub fn corrupt_newest_generation(&mut self) {
        let newest = self
            .metadata_blocks()
            .iter()
            .map(|&(_, epoch)| epoch)
            .max()
            .expect("no metadata on flash");
        for (eb, epoch) in self.metadata_blocks() {
            if epoch == newest {
                self.buf[eb as usize * EB_BYTES + 100] ^= 0xa5;
            }
        }
    }

    fn tick(&mut self, op: Operation) -> Result<(), RamFlashError> {
        if self.operations.len() >= self.fail_after_operation {
            return Err(RamFlashError);
        }
        self.operations.push(op);
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub struct RamFlashError;

impl NorFlashError for RamFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl ErrorType for RamFlash {
    type Error = RamFlashError;
}

impl Flash for RamFlash {
    fn size(&self) -> usize {
        self.buf.len()
    }

    fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    fn read_eb(&mut self, eb: u16) -> Result<&[u8], RamFlashError> {
        let offset = eb as usize * EB_BYTES;
        Ok(&self.buf[offset..offset + EB_BYTES])
    }

    fn erase_block(&mut self, eb: u16) -> Result<(), RamFlashError> {
        self.tick(Operation::Erase { eb })?;
        if self.erased[eb as usize] {
            self.redundant_erases += 1;
        }
        self.erased[eb as usize] = true;
        let offset = eb as usize * EB_BYTES;
        self.buf[offset..offset + EB_BYTES].fill(0);
        Ok(())
    }

    fn program(&mut self, eb: u16, offset: usize, data: &[u8]) -> Result<(), RamFlashError> {
        assert!(offset.is_multiple_of(self.write_buffer_size));
        assert!(data.len().is_multiple_of(self.write_buffer_size));
        assert!(offset + data.len() <= EB_BYTES);
        self.tick(Operation::Program {
            eb,
            offset,
            len: data.len(),
        })?;
        self.erased[eb as usize] = false;
        let offset = eb as usize * EB_BYTES + offset;
        self.buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, eb: u16, offset: usize, dest: &mut [u8]) -> Result<(), RamFlashError> {
        assert!(offset + dest.len() <= EB_BYTES);
        let offset = eb as usize * EB_BYTES + offset;
        dest.copy_from_slice(&self.buf[offset..offset + dest.len()]);
        Ok(())
    }

    fn deserialize(&mut self) -> Result<(), RamFlashError> {
        if let Some(path) = &self.image_path {
            if let Ok(image) = std::fs::read(path) {
                if image.len() == self.buf.len() {
                    self.buf = image;
                }
            }
        }
        Ok(())
    }

    fn serialize(&mut self) -> Result<(), RamFlashError> {
        if let Some(path) = &self.image_path {
            std::fs::write(path, &self.buf).map_err(|_| RamFlashError)?;
        }
        Ok(())
    }
}

/// Deterministic sector payload so tests can verify contents after any
/// amount of shuffling by the collector.
pub fn sector(tag: u64) -> [u8; LBA_BYTES] {
    let mut data = [0u8; LBA_BYTES];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (tag as u8)
            .wrapping_add((tag >> 8) as u8)
            .wrapping_mul(31)
            .wrapping_add(i as u8);
    }
    data[..8].copy_from_slice(&tag.to_le_bytes());
    data
}
