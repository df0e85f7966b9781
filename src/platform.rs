use embedded_storage::nor_flash::{ErrorType, NorFlash, ReadNorFlash};

use crate::EB_BYTES;

/// Largest program granularity a driver may ask for. The metadata stream
/// writer keeps one buffer of this size on the stack.
pub const MAX_WRITE_BUFFER_BYTES: usize = 512;

/// Byte-level access to an SPI NOR flash, sliced into 4 KiB erase blocks.
///
/// Two kinds of implementation compile in statically: a RAM-backed simulator
/// for host testing and [`NorFlashAdapter`] wrapping a real driver. Errors
/// reuse the `embedded-storage` [`ErrorType`] machinery; the translation
/// layer collapses them all into a single hard fault.
pub trait Flash: ErrorType {
    /// Total device bytes. At most 16 MiB and a multiple of 4096.
    fn size(&self) -> usize;

    /// Preferred program granularity. A power of two in 128..=512.
    fn write_buffer_size(&self) -> usize;

    /// Borrow the current contents of one erase block. The returned slice is
    /// 4096 bytes and stays valid until the next program or erase of that
    /// block. Implementations without memory-mapped flash may return a
    /// per-block cache buffer.
    fn read_eb(&mut self, eb: u16) -> Result<&[u8], Self::Error>;

    /// Erase one 4 KiB block.
    fn erase_block(&mut self, eb: u16) -> Result<(), Self::Error>;

    /// Program within one block. `offset` and `data.len()` are multiples of
    /// [`Flash::write_buffer_size`].
    fn program(&mut self, eb: u16, offset: usize, data: &[u8]) -> Result<(), Self::Error>;

    /// Copy-based read. Never crosses a block boundary.
    fn read(&mut self, eb: u16, offset: usize, dest: &mut [u8]) -> Result<(), Self::Error>;

    /// Host-emulation hook to restore simulated flash contents before
    /// startup. No-op on real hardware.
    fn deserialize(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Host-emulation hook to save simulated flash contents after a persist.
    /// No-op on real hardware.
    fn serialize(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<T: Flash> Flash for &mut T {
    fn size(&self) -> usize {
        (**self).size()
    }

    fn write_buffer_size(&self) -> usize {
        (**self).write_buffer_size()
    }

    fn read_eb(&mut self, eb: u16) -> Result<&[u8], Self::Error> {
        (**self).read_eb(eb)
    }

    fn erase_block(&mut self, eb: u16) -> Result<(), Self::Error> {
        (**self).erase_block(eb)
    }

    fn program(&mut self, eb: u16, offset: usize, data: &[u8]) -> Result<(), Self::Error> {
        (**self).program(eb, offset, data)
    }

    fn read(&mut self, eb: u16, offset: usize, dest: &mut [u8]) -> Result<(), Self::Error> {
        (**self).read(eb, offset, dest)
    }

    fn deserialize(&mut self) -> Result<(), Self::Error> {
        (**self).deserialize()
    }

    fn serialize(&mut self) -> Result<(), Self::Error> {
        (**self).serialize()
    }
}

/// Adapts any `embedded-storage` NOR driver whose erase unit is one 4 KiB
/// block. Block reads go through an internal cache buffer, so this also
/// works for drivers without memory-mapped access.
pub struct NorFlashAdapter<T> {
    inner: T,
    write_buffer_size: usize,
    cache: [u8; EB_BYTES],
}

impl<T> NorFlashAdapter<T>
where
    T: NorFlash + ReadNorFlash,
{
    /// Wraps `inner`, programming in `write_buffer_size` units. The size
    /// must be a power of two in 128..=512 and a multiple of the driver's
    /// `WRITE_SIZE`; construction of the translation layer validates it.
    pub fn new(inner: T, write_buffer_size: usize) -> Self {
        const {
            assert!(
                T::ERASE_SIZE == EB_BYTES,
                "driver erase unit must be one 4 KiB block"
            )
        };
        Self {
            inner,
            write_buffer_size,
            cache: [0; EB_BYTES],
        }
    }

    /// Hands the wrapped driver back.
    pub fn release(self) -> T {
        self.inner
    }
}

impl<T> ErrorType for NorFlashAdapter<T>
where
    T: NorFlash + ReadNorFlash,
{
    type Error = T::Error;
}

impl<T> Flash for NorFlashAdapter<T>
where
    T: NorFlash + ReadNorFlash,
{
    fn size(&self) -> usize {
        self.inner.capacity()
    }

    fn write_buffer_size(&self) -> usize {
        self.write_buffer_size
    }

    fn read_eb(&mut self, eb: u16) -> Result<&[u8], Self::Error> {
        self.inner
            .read(eb as u32 * EB_BYTES as u32, &mut self.cache)?;
        Ok(&self.cache)
    }

    fn erase_block(&mut self, eb: u16) -> Result<(), Self::Error> {
        let from = eb as u32 * EB_BYTES as u32;
        self.inner.erase(from, from + EB_BYTES as u32)
    }

    fn program(&mut self, eb: u16, offset: usize, data: &[u8]) -> Result<(), Self::Error> {
        self.inner
            .write(eb as u32 * EB_BYTES as u32 + offset as u32, data)
    }

    fn read(&mut self, eb: u16, offset: usize, dest: &mut [u8]) -> Result<(), Self::Error> {
        self.inner
            .read(eb as u32 * EB_BYTES as u32 + offset as u32, dest)
    }
}
