#![doc = include_str!("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

pub mod error;
mod gc;
mod map;
mod meta;
pub mod platform;

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::error::Error;
use crate::map::{EB_META, EbStateTable, L2pEntry};
use crate::platform::Flash;

#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// Erase block size in bytes, the SPI NOR sector-erase granularity.
pub const EB_BYTES: usize = 4096;
/// Host-visible logical block size in bytes.
pub const LBA_BYTES: usize = 512;

pub(crate) const LBAS_PER_EB: usize = EB_BYTES / LBA_BYTES;

/// Erase block numbers must fit the 12-bit field of a packed map entry.
pub(crate) const MAX_FLASH_BYTES: usize = 16 * 1024 * 1024;

/// Target window between the youngest and oldest block's erase count. The
/// collector relocates any block that falls this far behind the hottest one;
/// the observed spread stays within the window plus one.
pub const MAX_PE_DIFF: u8 = 64;

/// Table sizes derived from the device size.
pub(crate) struct Geometry {
    pub(crate) erase_blocks: usize,
    pub(crate) meta_eb_bytes: usize,
    pub(crate) meta_ebs: usize,
    pub(crate) flash_lbas: usize,
}

/// Works out how many blocks go to metadata and how many logical blocks the
/// host gets. Three blocks stay reserved as garbage collection headroom, and
/// the metadata reservation covers two complete generations.
pub(crate) fn derive_geometry(flash_bytes: usize) -> Option<Geometry> {
    if flash_bytes == 0 || flash_bytes > MAX_FLASH_BYTES || !flash_bytes.is_multiple_of(EB_BYTES) {
        return None;
    }
    let erase_blocks = flash_bytes / EB_BYTES;
    let theoretical_lbas = erase_blocks * LBAS_PER_EB;
    let meta_eb_bytes = erase_blocks + erase_blocks.div_ceil(2) + 2 * theoretical_lbas + 4;
    let meta_ebs = 2 * (1 + meta_eb_bytes / (EB_BYTES - 64));
    let reserved = 3 + meta_ebs;
    if erase_blocks <= reserved {
        return None;
    }
    Some(Geometry {
        erase_blocks,
        meta_eb_bytes,
        meta_ebs,
        flash_lbas: (erase_blocks - reserved) * LBAS_PER_EB,
    })
}

/// Point-in-time counters for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FtlStatistics {
    /// Blocks free for the collector: erased blocks, plus the open write
    /// frontier until it fills. Stays at three or more between operations.
    pub empty_ebs: usize,
    /// Logical blocks with a valid mapping.
    pub valid_lbas: usize,
    /// Erase count of the most-cycled block, including the global offset.
    pub highest_pe_count: u32,
    /// Amount folded out of the per-block 8-bit counters so far.
    pub pe_count_offset: u32,
    /// Generation number of the current metadata.
    pub metadata_epoch: u32,
}

/// The translation layer. Owns all in-RAM tables for its lifetime and talks
/// to the flash only through the [`Flash`] capability it was given.
///
/// Single threaded by design: every operation runs to completion and the
/// caller serializes requests. The only concurrency the layer handles is
/// power loss, which recovery resolves from the newest intact metadata
/// generation.
pub struct Ftl<T: Flash> {
    pub(crate) flash: T,

    pub(crate) flash_bytes: usize,
    pub(crate) erase_blocks: u16,
    pub(crate) meta_eb_bytes: usize,
    pub(crate) flash_lbas: usize,
    pub(crate) write_buffer_size: usize,

    /// Erase cycles per block, windowed; real count is this plus
    /// `pe_count_offset`.
    pub(crate) pe_count: Vec<u8>,
    pub(crate) ebs: EbStateTable,
    /// Blocks holding the two live metadata generations. `None` slots are
    /// pending allocation during a persist.
    pub(crate) meta_eb_list: Vec<Option<u16>>,
    pub(crate) l2p: Vec<L2pEntry>,

    pub(crate) pe_count_offset: u32,
    pub(crate) highest_pe: u8,
    /// Free blocks, counting the open frontier until it fills.
    pub(crate) empty_ebs: u16,
    pub(crate) valid_lbas: u32,
    pub(crate) metadata_age: u8,
    pub(crate) metadata_epoch: u32,

    /// Open write frontier: the block being filled and its next free sector.
    pub(crate) open_eb: Option<u16>,
    pub(crate) open_next_idx: u8,
    /// Rotating victim-scan position, kept across collections so scans
    /// amortize over the whole device.
    pub(crate) gc_cursor: u16,

    pub(crate) faulted: bool,
}

impl<T: Flash> Ftl<T> {
    /// Sizes every table for the given device. Fails if the flash reports an
    /// unsupported size or program granularity. The instance starts blank;
    /// call [`Ftl::start`] to recover state from flash or format.
    pub fn new(flash: T) -> Result<Ftl<T>, Error> {
        let flash_bytes = flash.size();
        let geo = derive_geometry(flash_bytes).ok_or(Error::InvalidFlashSize)?;

        let write_buffer_size = flash.write_buffer_size();
        if !write_buffer_size.is_power_of_two() || !(128..=LBA_BYTES).contains(&write_buffer_size) {
            return Err(Error::InvalidWriteBufferSize);
        }

        Ok(Ftl {
            flash,
            flash_bytes,
            erase_blocks: geo.erase_blocks as u16,
            meta_eb_bytes: geo.meta_eb_bytes,
            flash_lbas: geo.flash_lbas,
            write_buffer_size,
            pe_count: vec![0; geo.erase_blocks],
            ebs: EbStateTable::new(geo.erase_blocks),
            meta_eb_list: vec![None; geo.meta_ebs],
            l2p: vec![L2pEntry::INVALID; geo.flash_lbas],
            pe_count_offset: 0,
            highest_pe: 0,
            empty_ebs: geo.erase_blocks as u16,
            valid_lbas: 0,
            metadata_age: 0,
            metadata_epoch: meta::INITIAL_EPOCH,
            open_eb: None,
            open_next_idx: 0,
            gc_cursor: 0,
            faulted: false,
        })
    }

    /// Restores state from the newest intact metadata generation on flash,
    /// or formats if no generation can be loaded.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::Flash);
        }
        let result = self.start_inner();
        self.latching(result)
    }

    fn start_inner(&mut self) -> Result<(), Error> {
        self.flash.deserialize().map_err(|_| Error::Flash)?;
        let mut found = self.populate_metadata_map()?;
        if self.load_highest_epoch_metadata(&mut found)? {
            #[cfg(feature = "defmt")]
            trace!("restored metadata epoch {}", self.metadata_epoch);
            self.metadata_age = 0;
            Ok(())
        } else {
            self.format_inner()
        }
    }

    /// Writes the complete state to flash as a new metadata generation. The
    /// previous generation stays intact until the one after this.
    pub fn persist(&mut self) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::Flash);
        }
        let result = self.persist_inner();
        self.latching(result)
    }

    /// Resets to an empty device, wiping any metadata still on flash.
    pub fn format(&mut self) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::Flash);
        }
        let result = self.format_inner();
        self.latching(result)
    }

    /// Stores one 512-byte sector. Allocates a fresh write frontier when
    /// none is open, which may trigger garbage collection.
    pub fn write(&mut self, lba: usize, data: &[u8; LBA_BYTES]) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::Flash);
        }
        let result = self.write_inner(lba, data);
        self.latching(result)
    }

    fn write_inner(&mut self, lba: usize, data: &[u8; LBA_BYTES]) -> Result<(), Error> {
        if lba >= self.flash_lbas {
            return Err(Error::LbaOutOfRange);
        }
        let dest = match self.open_eb {
            Some(eb) => eb,
            None => {
                let eb = self.select_best_eb()?;
                self.open_eb = Some(eb);
                self.open_next_idx = 0;
                eb
            }
        };
        #[cfg(feature = "defmt")]
        trace!("write lba {} to eb {} idx {}", lba, dest, self.open_next_idx);

        self.flash
            .program(dest, self.open_next_idx as usize * LBA_BYTES, data)
            .map_err(|_| Error::Flash)?;

        let old = self.l2p[lba];
        if old.valid() {
            self.ebs.dec_valid(old.eb());
            if self.ebs.get(old.eb()) == 0 && old.eb() != dest {
                self.empty_ebs += 1;
            }
        } else {
            self.valid_lbas += 1;
        }
        self.ebs.inc_valid(dest);
        self.l2p[lba] = L2pEntry::map(dest, self.open_next_idx);
        self.open_next_idx += 1;
        if self.open_next_idx as usize >= LBAS_PER_EB {
            self.open_eb = None;
            self.open_next_idx = 0;
            // the filled frontier leaves the free count only now; top the
            // collector's reserve back up before returning
            self.empty_ebs -= 1;
            self.ensure_gc_headroom()?;
        }
        self.age_metadata()
    }

    /// Reads one sector. Logical blocks that were never written, or were
    /// trimmed, read back as zeros.
    pub fn read(&mut self, lba: usize, dest: &mut [u8; LBA_BYTES]) -> Result<(), Error> {
        if lba >= self.flash_lbas {
            return Err(Error::LbaOutOfRange);
        }
        let entry = self.l2p[lba];
        if entry.valid() {
            let result = self
                .flash
                .read(entry.eb(), entry.idx() as usize * LBA_BYTES, dest)
                .map_err(|_| Error::Flash);
            self.latching(result)
        } else {
            dest.fill(0);
            Ok(())
        }
    }

    /// Drops the mapping for one sector. Trimming an unmapped sector is a
    /// no-op, so the operation is idempotent.
    pub fn trim(&mut self, lba: usize) -> Result<(), Error> {
        if self.faulted {
            return Err(Error::Flash);
        }
        let result = self.trim_inner(lba);
        self.latching(result)
    }

    fn trim_inner(&mut self, lba: usize) -> Result<(), Error> {
        if lba >= self.flash_lbas {
            return Err(Error::LbaOutOfRange);
        }
        let entry = self.l2p[lba];
        if !entry.valid() {
            return Ok(());
        }
        #[cfg(feature = "defmt")]
        trace!("trim lba {} from eb {} idx {}", lba, entry.eb(), entry.idx());
        self.ebs.dec_valid(entry.eb());
        self.valid_lbas -= 1;
        if self.ebs.get(entry.eb()) == 0 && Some(entry.eb()) != self.open_eb {
            self.empty_ebs += 1;
        }
        self.l2p[lba] = L2pEntry::INVALID;
        self.age_metadata()
    }

    /// Verifies every structural invariant by recomputing it from the raw
    /// tables: free and metadata block counts, erase-count spread, and that
    /// the map never points at metadata or doubles up a sector. Returns
    /// false if anything disagrees or the instance has latched a fault.
    pub fn check(&self) -> bool {
        if self.faulted {
            return false;
        }
        let blocks = self.erase_blocks as usize;
        let mut empty = 0u16;
        let mut metas = 0usize;
        let mut max_pe = 0u8;
        let mut min_pe = u8::MAX;
        for eb in 0..blocks {
            let state = self.ebs.get(eb as u16);
            // the tracked count carries the open frontier until it fills
            if state == 0 || Some(eb as u16) == self.open_eb {
                empty += 1;
            }
            if state == EB_META {
                metas += 1;
            }
            max_pe = max_pe.max(self.pe_count[eb]);
            min_pe = min_pe.min(self.pe_count[eb]);
        }

        let mut ok = true;
        if metas > self.meta_eb_list.len() {
            #[cfg(feature = "defmt")]
            warn!("check: {} metadata blocks, expected at most {}", metas, self.meta_eb_list.len());
            ok = false;
        }
        if empty != self.empty_ebs {
            #[cfg(feature = "defmt")]
            warn!("check: {} free blocks counted, tracked {}", empty, self.empty_ebs);
            ok = false;
        }
        if max_pe != self.highest_pe {
            #[cfg(feature = "defmt")]
            warn!("check: highest erase count {} != tracked {}", max_pe, self.highest_pe);
            ok = false;
        }
        if max_pe - min_pe > MAX_PE_DIFF + 1 {
            #[cfg(feature = "defmt")]
            warn!("check: erase count spread {} over limit", max_pe - min_pe);
            ok = false;
        }

        let mut sectors_seen = vec![0u8; blocks];
        let mut mapped = vec![0u8; blocks];
        let mut valid = 0u32;
        for (_lba, entry) in self.l2p.iter().enumerate() {
            if !entry.valid() {
                continue;
            }
            valid += 1;
            let eb = entry.eb();
            if eb as usize >= blocks || self.ebs.is_meta(eb) {
                #[cfg(feature = "defmt")]
                warn!("check: lba {} points at metadata eb {}", _lba, eb);
                ok = false;
                continue;
            }
            if sectors_seen[eb as usize] & 1 << entry.idx() != 0 {
                #[cfg(feature = "defmt")]
                warn!("check: lba {} cross-linked in eb {} idx {}", _lba, eb, entry.idx());
                ok = false;
            }
            sectors_seen[eb as usize] |= 1 << entry.idx();
            mapped[eb as usize] += 1;
        }
        if valid != self.valid_lbas {
            #[cfg(feature = "defmt")]
            warn!("check: {} valid lbas counted, tracked {}", valid, self.valid_lbas);
            ok = false;
        }
        for eb in 0..blocks {
            let state = self.ebs.get(eb as u16);
            if state != EB_META && state != mapped[eb] {
                #[cfg(feature = "defmt")]
                warn!("check: eb {} state {} but {} lbas map to it", eb, state, mapped[eb]);
                ok = false;
            }
        }
        ok
    }

    /// Number of logical blocks the host may address.
    pub fn lba_count(&self) -> usize {
        self.flash_lbas
    }

    /// Number of erase blocks on the device.
    pub fn eb_count(&self) -> usize {
        self.erase_blocks as usize
    }

    /// Total erase cycles endured by one block.
    pub fn pe_count(&self, eb: usize) -> u32 {
        self.pe_count_offset + self.pe_count[eb] as u32
    }

    /// Amount folded out of the windowed per-block counters so far.
    pub fn pe_count_offset(&self) -> u32 {
        self.pe_count_offset
    }

    /// Snapshot of the global counters.
    pub fn statistics(&self) -> FtlStatistics {
        FtlStatistics {
            empty_ebs: self.empty_ebs as usize,
            valid_lbas: self.valid_lbas as usize,
            highest_pe_count: self.pe_count_offset + self.highest_pe as u32,
            pe_count_offset: self.pe_count_offset,
            metadata_epoch: self.metadata_epoch,
        }
    }

    /// Latches the fault flag on errors that mean the device state can no
    /// longer be trusted.
    pub(crate) fn latching<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if let Err(Error::Flash | Error::NoFreeEraseBlock | Error::NoVictim) = &result {
            self.faulted = true;
        }
        result
    }
}
