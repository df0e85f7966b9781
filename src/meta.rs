//! Durable metadata: a signed, checksummed, epoch-tagged serialization of
//! the complete translation state, spread over a rotating chain of erase
//! blocks.
//!
//! Each metadata block is laid out as
//!
//! ```text
//! signature[8] | epoch:24 index:8 (LE u32) | payload[4080] | crc32 (LE)
//! ```
//!
//! and one generation concatenates the payloads of index 0.. into a single
//! stream: geometry header, erase counters, state nibbles, the map entries
//! as big-endian words, the 32-bit counter offset, then zero padding to the
//! end of the last block. Two generations coexist on flash at all times;
//! a persist first frees whichever slots hold a stale or corrupt epoch,
//! then writes the new generation into freshly allocated young blocks, so
//! power loss mid-write always leaves the previous epoch intact.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;

use crate::error::Error;
use crate::map::{EB_META, L2pEntry};
use crate::platform::{Flash, MAX_WRITE_BUFFER_BYTES};
use crate::{EB_BYTES, Ftl, LBA_BYTES};

#[cfg(feature = "defmt")]
use defmt::{trace, warn};

pub(crate) const META_SIG: [u8; 8] = *b"SPIFTL01";

/// Epochs 0 and 1 stand for the all-empty states seen on factory flash; a
/// formatted device starts counting at 2.
pub(crate) const INITIAL_EPOCH: u32 = 2;

/// Signature plus the epoch/index word.
const HEADER_LEN: usize = 12;
/// Payload bytes end here; the trailing word is the checksum.
const PAYLOAD_END: usize = EB_BYTES - 4;

const FTL_INFO_LEN: usize = 12;

/// Streaming CRC-32, IEEE 802.3 polynomial (reflected 0xEDB88320). The
/// metadata stream crosses many write-buffer flushes, so the sum has to be
/// fed incrementally rather than over one contiguous buffer.
pub(crate) struct MetaCrc32 {
    crc: u32,
}

impl MetaCrc32 {
    pub(crate) fn new() -> Self {
        Self { crc: 0xffff_ffff }
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.crc ^= byte as u32;
            for _ in 0..8 {
                if self.crc & 1 != 0 {
                    self.crc = (self.crc >> 1) ^ 0xedb8_8320;
                } else {
                    self.crc >>= 1;
                }
            }
        }
    }

    pub(crate) fn finalize(&self) -> u32 {
        !self.crc
    }

    pub(crate) fn reset(&mut self) {
        self.crc = 0xffff_ffff;
    }
}

/// Checksum of a full block image, excluding its trailing checksum word.
fn block_crc(block: &[u8]) -> u32 {
    let mut crc = MetaCrc32::new();
    crc.update(&block[..PAYLOAD_END]);
    crc.finalize()
}

/// Geometry header at the front of every generation, serialized field by
/// field, little endian, no padding. A reloaded stream must match the
/// running geometry byte for byte or the generation is rejected.
#[derive(PartialEq, Eq)]
struct FtlInfo {
    eb_bytes: u16,
    lba_bytes: u16,
    flash_bytes: u32,
    meta_eb_bytes: u16,
    flash_lbas: u16,
}

impl FtlInfo {
    fn to_bytes(&self) -> [u8; FTL_INFO_LEN] {
        let mut bytes = [0u8; FTL_INFO_LEN];
        bytes[0..2].copy_from_slice(&self.eb_bytes.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.lba_bytes.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.flash_bytes.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.meta_eb_bytes.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.flash_lbas.to_le_bytes());
        bytes
    }
}

/// Write-side stream state for one persist. The buffer lives on the stack
/// and only its prefix up to the driver's program granularity is used, so
/// persisting allocates nothing.
struct MetaWriter {
    /// Blocks still to be filled, front first.
    queue: VecDeque<u16>,
    wb: [u8; MAX_WRITE_BUFFER_BYTES],
    /// Byte offset within the current block, header included.
    offset: usize,
    /// Logical index of the current block within the generation.
    index: u8,
    crc: MetaCrc32,
}

/// Read-side cursor over an ordered generation chain.
struct MetaReader {
    queue: VecDeque<u16>,
    buf: Vec<u8>,
    offset: usize,
}

impl<T: Flash> Ftl<T> {
    fn current_info(&self) -> FtlInfo {
        FtlInfo {
            eb_bytes: EB_BYTES as u16,
            lba_bytes: LBA_BYTES as u16,
            flash_bytes: self.flash_bytes as u32,
            meta_eb_bytes: self.meta_eb_bytes as u16,
            flash_lbas: self.flash_lbas as u16,
        }
    }

    /// Serialized length of one generation, headers and padding excluded.
    fn stream_len(&self) -> usize {
        FTL_INFO_LEN
            + self.pe_count.len()
            + self.ebs.raw().len()
            + 2 * self.flash_lbas
            + 4
    }

    pub(crate) fn persist_inner(&mut self) -> Result<(), Error> {
        self.write_metadata()?;
        self.flash.serialize().map_err(|_| Error::Flash)
    }

    fn write_metadata(&mut self) -> Result<(), Error> {
        let mut writer = self.open_metadata_stream()?;

        for byte in self.current_info().to_bytes() {
            self.md_write_u8(&mut writer, byte)?;
        }
        for i in 0..self.pe_count.len() {
            let byte = self.pe_count[i];
            self.md_write_u8(&mut writer, byte)?;
        }
        for i in 0..self.ebs.raw().len() {
            let byte = self.ebs.raw()[i];
            self.md_write_u8(&mut writer, byte)?;
        }
        for lba in 0..self.flash_lbas {
            let bits = self.l2p[lba].bits();
            self.md_write_u16(&mut writer, bits)?;
        }
        let offset = self.pe_count_offset;
        self.md_write_u32(&mut writer, offset)?;

        self.md_close(&mut writer)
    }

    /// Retires whichever metadata slots hold a corrupt image or an epoch
    /// older than the current one, keeps the generation being shadowed, and
    /// allocates young blocks for the new epoch.
    fn open_metadata_stream(&mut self) -> Result<MetaWriter, Error> {
        #[cfg(feature = "defmt")]
        trace!("serializing metadata epoch {}", self.metadata_epoch + 1);

        for slot in 0..self.meta_eb_list.len() {
            let Some(eb) = self.meta_eb_list[slot] else {
                continue;
            };
            let (intact, epoch) = {
                let block = self.flash.read_eb(eb).map_err(|_| Error::Flash)?;
                let stored = u32::from_le_bytes(block[PAYLOAD_END..].try_into().unwrap());
                let word = u32::from_le_bytes(block[8..12].try_into().unwrap());
                (block_crc(block) == stored, word >> 8)
            };
            if intact && epoch >= self.metadata_epoch {
                continue;
            }
            if intact {
                // stale but readable; erase it so startup never has to scan
                // a pile of superseded generations
                self.flash.erase_block(eb).map_err(|_| Error::Flash)?;
            }
            self.ebs.set(eb, 0);
            self.meta_eb_list[slot] = None;
            self.empty_ebs += 1;
            #[cfg(feature = "defmt")]
            trace!("retired metadata eb {}", eb);
        }

        let mut queue = VecDeque::new();
        for slot in 0..self.meta_eb_list.len() {
            if self.meta_eb_list[slot].is_some() {
                continue;
            }
            let eb = self.lowest_empty_eb().ok_or(Error::NoFreeEraseBlock)?;
            self.ebs.set_meta(eb);
            self.meta_eb_list[slot] = Some(eb);
            self.empty_ebs -= 1;
            queue.push_back(eb);
        }

        self.metadata_epoch += 1;
        Ok(MetaWriter {
            queue,
            wb: [0u8; MAX_WRITE_BUFFER_BYTES],
            offset: 0,
            index: 0,
            crc: MetaCrc32::new(),
        })
    }

    fn md_write_u8(&mut self, w: &mut MetaWriter, byte: u8) -> Result<(), Error> {
        let wbs = self.write_buffer_size;
        if w.offset == PAYLOAD_END {
            // seal the block: the checksum rides in the tail of its last buffer
            let crc = w.crc.finalize().to_le_bytes();
            w.wb[wbs - 4..wbs].copy_from_slice(&crc);
            let eb = w.queue.pop_front().ok_or(Error::NoFreeEraseBlock)?;
            self.flash
                .program(eb, EB_BYTES - wbs, &w.wb[..wbs])
                .map_err(|_| Error::Flash)?;
            w.crc.reset();
            w.offset = 0;
            w.index += 1;
        }
        if w.offset == 0 {
            w.wb[..wbs].fill(0);
            w.wb[..8].copy_from_slice(&META_SIG);
            w.crc.update(&META_SIG);
            let word = (self.metadata_epoch << 8 | w.index as u32).to_le_bytes();
            w.wb[8..12].copy_from_slice(&word);
            w.crc.update(&word);
            w.offset = HEADER_LEN;
        }
        w.wb[w.offset % wbs] = byte;
        w.crc.update(&[byte]);
        w.offset += 1;
        if w.offset % wbs == 0 {
            let eb = *w.queue.front().ok_or(Error::NoFreeEraseBlock)?;
            if w.offset == wbs {
                // first flush into a block: erase the destination now
                self.erase_eb(eb)?;
                self.ebs.set_meta(eb);
            }
            self.flash
                .program(eb, w.offset - wbs, &w.wb[..wbs])
                .map_err(|_| Error::Flash)?;
            w.wb[..wbs].fill(0);
        }
        Ok(())
    }

    fn md_write_u16(&mut self, w: &mut MetaWriter, value: u16) -> Result<(), Error> {
        self.md_write_u8(w, (value >> 8) as u8)?;
        self.md_write_u8(w, value as u8)
    }

    fn md_write_u32(&mut self, w: &mut MetaWriter, value: u32) -> Result<(), Error> {
        self.md_write_u8(w, (value >> 24) as u8)?;
        self.md_write_u8(w, (value >> 16) as u8)?;
        self.md_write_u8(w, (value >> 8) as u8)?;
        self.md_write_u8(w, value as u8)
    }

    /// Zero-pads through the end of the current block so its checksum gets
    /// written. Stops right after the seal, before anything lands in a
    /// block beyond the stream.
    fn md_close(&mut self, w: &mut MetaWriter) -> Result<(), Error> {
        while w.offset > HEADER_LEN + 1 {
            self.md_write_u8(w, 0)?;
        }
        Ok(())
    }

    /// Scans every block for a signed, checksummed metadata header and
    /// groups the hits by epoch.
    pub(crate) fn populate_metadata_map(&mut self) -> Result<BTreeMap<u32, Vec<u16>>, Error> {
        let mut found: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
        for eb in 0..self.erase_blocks {
            let epoch = {
                let block = self.flash.read_eb(eb).map_err(|_| Error::Flash)?;
                if block[..8] != META_SIG {
                    continue;
                }
                let stored = u32::from_le_bytes(block[PAYLOAD_END..].try_into().unwrap());
                if block_crc(block) != stored {
                    #[cfg(feature = "defmt")]
                    warn!("metadata signature with bad checksum in eb {}", eb);
                    continue;
                }
                u32::from_le_bytes(block[8..12].try_into().unwrap()) >> 8
            };
            #[cfg(feature = "defmt")]
            trace!("found metadata epoch {} in eb {}", epoch, eb);
            found.entry(epoch).or_default().push(eb);
        }
        Ok(found)
    }

    /// Tries generations from the newest epoch down until one reconstructs
    /// cleanly. Returns Ok(false) when none does and the caller should
    /// format instead.
    pub(crate) fn load_highest_epoch_metadata(
        &mut self,
        found: &mut BTreeMap<u32, Vec<u16>>,
    ) -> Result<bool, Error> {
        while let Some((&epoch, _)) = found.last_key_value() {
            let blocks = found.remove(&epoch).unwrap_or_default();
            if epoch == 0 {
                continue;
            }
            if self.try_load_generation(epoch, &blocks)? {
                return Ok(true);
            }
            #[cfg(feature = "defmt")]
            warn!("metadata epoch {} rejected", epoch);
        }
        Ok(false)
    }

    fn try_load_generation(&mut self, epoch: u32, found: &[u16]) -> Result<bool, Error> {
        #[cfg(feature = "defmt")]
        trace!("loading metadata epoch {}", epoch);

        // order the chain by the per-block index byte; the first missing
        // index ends it
        let mut chain = VecDeque::new();
        'indices: for index in 0..self.meta_eb_list.len() {
            let want = epoch << 8 | index as u32;
            for &eb in found {
                let word = {
                    let block = self.flash.read_eb(eb).map_err(|_| Error::Flash)?;
                    u32::from_le_bytes(block[8..12].try_into().unwrap())
                };
                if word == want {
                    chain.push_back(eb);
                    continue 'indices;
                }
            }
            break;
        }
        if chain.len() * (PAYLOAD_END - HEADER_LEN) < self.stream_len() {
            return Ok(false);
        }

        let mut reader = self.md_open_reader(chain)?;

        let mut info = [0u8; FTL_INFO_LEN];
        for i in 0..FTL_INFO_LEN {
            info[i] = self.md_read_u8(&mut reader)?;
        }
        if info != self.current_info().to_bytes() {
            return Ok(false);
        }

        // checksums were verified during the scan; from here everything is
        // pulled in blindly
        self.highest_pe = 0;
        for i in 0..self.pe_count.len() {
            let byte = self.md_read_u8(&mut reader)?;
            self.pe_count[i] = byte;
            if byte > self.highest_pe {
                self.highest_pe = byte;
            }
        }

        for i in 0..self.ebs.raw().len() {
            let byte = self.md_read_u8(&mut reader)?;
            self.ebs.raw_mut()[i] = byte;
        }
        for slot in self.meta_eb_list.iter_mut() {
            *slot = None;
        }
        self.empty_ebs = 0;
        let mut meta_seen = 0;
        for eb in 0..self.erase_blocks {
            match self.ebs.get(eb) {
                0 => self.empty_ebs += 1,
                EB_META => {
                    if meta_seen == self.meta_eb_list.len() {
                        return Ok(false);
                    }
                    self.meta_eb_list[meta_seen] = Some(eb);
                    meta_seen += 1;
                }
                _ => {}
            }
        }

        self.valid_lbas = 0;
        for lba in 0..self.flash_lbas {
            let bits = self.md_read_u16(&mut reader)?;
            let entry = L2pEntry::from_bits(bits);
            self.l2p[lba] = entry;
            if entry.valid() {
                self.valid_lbas += 1;
            }
        }

        self.pe_count_offset = self.md_read_u32(&mut reader)?;
        self.metadata_epoch = epoch;
        self.open_eb = None;
        self.open_next_idx = 0;
        Ok(true)
    }

    fn md_open_reader(&mut self, queue: VecDeque<u16>) -> Result<MetaReader, Error> {
        let mut reader = MetaReader {
            queue,
            buf: vec![0; EB_BYTES],
            offset: 0,
        };
        let eb = *reader.queue.front().ok_or(Error::Flash)?;
        self.flash
            .read(eb, 0, &mut reader.buf)
            .map_err(|_| Error::Flash)?;
        Ok(reader)
    }

    fn md_read_u8(&mut self, r: &mut MetaReader) -> Result<u8, Error> {
        if r.offset >= PAYLOAD_END {
            r.queue.pop_front();
            let eb = *r.queue.front().ok_or(Error::Flash)?;
            self.flash
                .read(eb, 0, &mut r.buf)
                .map_err(|_| Error::Flash)?;
            r.offset = 0;
        }
        if r.offset < HEADER_LEN {
            r.offset = HEADER_LEN;
        }
        let byte = r.buf[r.offset];
        r.offset += 1;
        Ok(byte)
    }

    fn md_read_u16(&mut self, r: &mut MetaReader) -> Result<u16, Error> {
        Ok((self.md_read_u8(r)? as u16) << 8 | self.md_read_u8(r)? as u16)
    }

    fn md_read_u32(&mut self, r: &mut MetaReader) -> Result<u32, Error> {
        Ok((self.md_read_u8(r)? as u32) << 24
            | (self.md_read_u8(r)? as u32) << 16
            | (self.md_read_u8(r)? as u32) << 8
            | self.md_read_u8(r)? as u32)
    }

    /// Wipes the in-RAM state back to an empty device, claims the first
    /// blocks for metadata, and erases anything on flash that still carries
    /// a metadata signature.
    pub(crate) fn format_inner(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("formatting");
        for entry in self.l2p.iter_mut() {
            *entry = L2pEntry::INVALID;
        }
        self.pe_count.fill(0);
        self.ebs.zero();
        self.pe_count_offset = 0;
        self.highest_pe = 0;
        self.valid_lbas = 0;
        self.empty_ebs = self.erase_blocks;
        for slot in 0..self.meta_eb_list.len() {
            let eb = slot as u16;
            self.ebs.set_meta(eb);
            self.meta_eb_list[slot] = Some(eb);
            self.empty_ebs -= 1;
        }
        self.metadata_age = 0;
        self.metadata_epoch = INITIAL_EPOCH;
        self.open_eb = None;
        self.open_next_idx = 0;

        for eb in 0..self.erase_blocks {
            let stale = {
                let block = self.flash.read_eb(eb).map_err(|_| Error::Flash)?;
                block[..8] == META_SIG
            };
            if stale {
                #[cfg(feature = "defmt")]
                trace!("format erasing eb {}", eb);
                self.flash.erase_block(eb).map_err(|_| Error::Flash)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_check_value() {
        // the standard CRC-32 check input
        let mut crc = MetaCrc32::new();
        crc.update(b"123456789");
        assert_eq!(crc.finalize(), 0xcbf4_3926);
    }

    #[test]
    fn crc32_is_streamable() {
        let data = b"metadata spans many write buffer flushes";
        let mut whole = MetaCrc32::new();
        whole.update(data);

        let mut pieces = MetaCrc32::new();
        for chunk in data.chunks(7) {
            pieces.update(chunk);
        }
        assert_eq!(whole.finalize(), pieces.finalize());

        pieces.reset();
        pieces.update(data);
        assert_eq!(whole.finalize(), pieces.finalize());
    }

    #[test]
    fn ftl_info_layout_is_pinned() {
        let info = FtlInfo {
            eb_bytes: 4096,
            lba_bytes: 512,
            flash_bytes: 256 * 1024,
            meta_eb_bytes: 1124,
            flash_lbas: 472,
        };
        assert_eq!(
            info.to_bytes(),
            [
                0x00, 0x10, // 4096
                0x00, 0x02, // 512
                0x00, 0x00, 0x04, 0x00, // 262144
                0x64, 0x04, // 1124
                0xd8, 0x01, // 472
            ]
        );
    }
}
