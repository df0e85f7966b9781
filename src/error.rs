use thiserror::Error;

/// Errors surfaced by FTL operations. Marked non-exhaustive so variants can
/// be added without breaking the API. A caller would typically only handle
/// `LbaOutOfRange`; the remaining variants describe a device that needs
/// attention rather than a retryable condition.
#[derive(Error, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The flash must report at most 16 MiB, a multiple of the 4 KiB erase
    /// block size, and enough room for data blocks after the metadata and
    /// garbage collection reserve.
    #[error("invalid flash size")]
    InvalidFlashSize,

    /// The driver's preferred program granularity must be a power of two
    /// between 128 and 512 bytes.
    #[error("invalid write buffer size")]
    InvalidWriteBufferSize,

    /// The logical block address is outside the device. Nothing was changed.
    #[error("logical block address out of range")]
    LbaOutOfRange,

    /// The flash driver reported an erase, program, or read failure. The
    /// instance latches a fault, refuses further mutation, and `check()`
    /// reports false from then on.
    #[error("internal flash error")]
    Flash,

    /// No erased block was available where one was required, during garbage
    /// collection or metadata allocation. The device is full or aged beyond
    /// repair. Latches a fault like [`Error::Flash`].
    #[error("no free erase block")]
    NoFreeEraseBlock,

    /// Garbage collection could not find any block worth reclaiming even
    /// though free space is exhausted. Latches a fault.
    #[error("no reclaimable erase block")]
    NoVictim,
}
