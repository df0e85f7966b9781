//! Garbage collection and the static wear-leveling policy: victim scoring,
//! relocation of live sectors, erase accounting with counter rollover, and
//! the selector that hands the write path a fresh block.

use crate::error::Error;
use crate::map::{EB_META, L2pEntry};
use crate::platform::{Flash, MAX_WRITE_BUFFER_BYTES};
use crate::{EB_BYTES, Ftl, LBA_BYTES, LBAS_PER_EB, MAX_PE_DIFF};

#[cfg(feature = "defmt")]
use defmt::trace;

/// Scores above this mark a block as aged out. The selector keeps
/// collecting while any such block remains, which is what forces cold data
/// off young flash even when the host only ever rewrites a few sectors.
const AGED_OUT_SCORE: i32 = 10;

impl<T: Flash> Ftl<T> {
    /// Erases `eb` and accounts the cycle. When a counter would run past
    /// 250, the whole table shifts down by the leveling window and the
    /// difference moves into the global offset, preserving relative order.
    pub(crate) fn erase_eb(&mut self, eb: u16) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("erase eb {}", eb);
        self.flash.erase_block(eb).map_err(|_| Error::Flash)?;
        if self.pe_count[eb as usize] > 250 {
            for pe in self.pe_count.iter_mut() {
                *pe = pe.saturating_sub(MAX_PE_DIFF);
            }
            self.highest_pe -= MAX_PE_DIFF;
            self.pe_count_offset += MAX_PE_DIFF as u32;
        }
        let pe = &mut self.pe_count[eb as usize];
        *pe += 1;
        if *pe > self.highest_pe {
            self.highest_pe = *pe;
        }
        self.ebs.set(eb, 0);
        Ok(())
    }

    /// Free block with the smallest erase count, so relocated data lands on
    /// the youngest flash. Ties go to the highest block number. The open
    /// write frontier is never handed out, even if all its sectors have
    /// been invalidated again.
    pub(crate) fn lowest_empty_eb(&self) -> Option<u16> {
        let mut best = None;
        let mut best_pe = u8::MAX;
        for eb in 0..self.erase_blocks {
            if self.ebs.get(eb) != 0 || Some(eb) == self.open_eb {
                continue;
            }
            if best.is_none() || self.pe_count[eb as usize] <= best_pe {
                best_pe = self.pe_count[eb as usize];
                best = Some(eb);
            }
        }
        best
    }

    /// Victim attractiveness, higher is better. Blocks that fell a whole
    /// leveling window behind the hottest one outrank everything, oldest
    /// first; blocks close to the edge of the window come next; otherwise
    /// the emptiest block wins. Free and metadata blocks score zero.
    pub(crate) fn gc_score(&self, eb: u16) -> i32 {
        let state = self.ebs.get(eb);
        if state == 0 || state == EB_META {
            return 0;
        }
        let delta = self.highest_pe as i32 - self.pe_count[eb as usize] as i32;
        let window = MAX_PE_DIFF as i32;
        if delta >= window {
            10 + delta - window
        } else if delta > window * 7 / 8 {
            9
        } else {
            8 - state as i32
        }
    }

    /// Moves valid sectors out of `src` into `dest`, appending at the
    /// destination's fill cursor. There is no reverse map, so this scans the
    /// whole L2P; a block holds at most eight sectors and the early exit
    /// bounds the work.
    fn collect_valid_lbas(&mut self, src: u16, dest: u16) -> Result<(), Error> {
        let mut buf = [0u8; MAX_WRITE_BUFFER_BYTES];
        let chunk = self.write_buffer_size;
        for lba in 0..self.flash_lbas {
            if self.ebs.get(dest) as usize >= LBAS_PER_EB {
                break;
            }
            let entry = self.l2p[lba];
            if !entry.valid() || entry.eb() != src {
                continue;
            }
            let dest_idx = self.ebs.get(dest);
            #[cfg(feature = "defmt")]
            trace!("move lba {} to eb {} idx {}", lba, dest, dest_idx);
            let src_off = entry.idx() as usize * LBA_BYTES;
            let dest_off = dest_idx as usize * LBA_BYTES;
            for piece in (0..LBA_BYTES).step_by(chunk) {
                self.flash
                    .read(src, src_off + piece, &mut buf[..chunk])
                    .map_err(|_| Error::Flash)?;
                self.flash
                    .program(dest, dest_off + piece, &buf[..chunk])
                    .map_err(|_| Error::Flash)?;
            }
            self.ebs.dec_valid(src);
            if self.ebs.get(src) == 0 {
                self.empty_ebs += 1;
            }
            self.l2p[lba] = L2pEntry::map(dest, dest_idx);
            self.ebs.inc_valid(dest);
        }
        Ok(())
    }

    /// One reclamation pass: erase the youngest free block and fill it with
    /// valid sectors from the highest-scoring victims. Returns the last
    /// victim's score so the caller can tell whether aged-out blocks remain.
    pub(crate) fn garbage_collect(&mut self) -> Result<i32, Error> {
        let blocks = self.erase_blocks;
        let dest = self.lowest_empty_eb().ok_or(Error::NoFreeEraseBlock)?;
        self.erase_eb(dest)?;
        self.empty_ebs -= 1;

        let mut score = 0;
        // at least one sector moves per pass, so eight passes fill the block
        for _ in 0..LBAS_PER_EB {
            if self.ebs.get(dest) as usize >= LBAS_PER_EB {
                break;
            }
            let mut eb = self.gc_cursor;
            let mut skipped = 0;
            while self.ebs.is_meta(eb) || eb == dest {
                eb = (eb + 1) % blocks;
                skipped += 1;
                if skipped > blocks {
                    return Err(Error::NoVictim);
                }
            }
            score = self.gc_score(eb);
            let mut step = 1;
            while step < blocks && score < 8 {
                let candidate = (eb + step) % blocks;
                if candidate != dest && self.gc_score(candidate) > score {
                    eb = candidate;
                    score = self.gc_score(eb);
                }
                step += 1;
            }
            self.gc_cursor = eb;
            if score <= 0 || eb == dest {
                return Err(Error::NoVictim);
            }
            self.collect_valid_lbas(eb, dest)?;
        }
        Ok(score)
    }

    /// Guarantees an erased, non-metadata block for a new write frontier.
    /// The handed-out block stays in the free count until the frontier
    /// fills; the write path gives it back and tops the reserve up again
    /// when it closes.
    pub(crate) fn select_best_eb(&mut self) -> Result<u16, Error> {
        self.ensure_gc_headroom()?;
        let eb = self.lowest_empty_eb().ok_or(Error::NoFreeEraseBlock)?;
        #[cfg(feature = "defmt")]
        trace!("opened eb {} for writing", eb);
        self.erase_eb(eb)?;
        Ok(eb)
    }

    /// Collects until at least three blocks are free and no aged-out block
    /// remains. Runs before a frontier is handed out and again when one
    /// fills, so the reserve holds whenever the write path returns. The
    /// age condition, not space pressure, is what drives static leveling
    /// even under workloads that only rewrite a few sectors.
    pub(crate) fn ensure_gc_headroom(&mut self) -> Result<(), Error> {
        let mut score = 0;
        while self.empty_ebs < 3 || score > AGED_OUT_SCORE {
            score = self.garbage_collect()?;
            self.meta_age_rewrite()?;
        }
        Ok(())
    }

    /// Metadata blocks are rewritten far more often than data, so they age
    /// out too: any one that fell a whole window behind gets copied byte for
    /// byte onto young flash and its old home freed.
    pub(crate) fn meta_age_rewrite(&mut self) -> Result<(), Error> {
        for slot in 0..self.meta_eb_list.len() {
            let Some(src) = self.meta_eb_list[slot] else {
                continue;
            };
            let delta = self.highest_pe as i32 - self.pe_count[src as usize] as i32;
            if delta < MAX_PE_DIFF as i32 {
                continue;
            }
            let dest = self.lowest_empty_eb().ok_or(Error::NoFreeEraseBlock)?;
            if dest == src {
                return Err(Error::NoFreeEraseBlock);
            }
            #[cfg(feature = "defmt")]
            trace!("aged-out metadata moved from eb {} to {}", src, dest);
            self.erase_eb(dest)?;
            let mut buf = [0u8; MAX_WRITE_BUFFER_BYTES];
            let chunk = self.write_buffer_size;
            for offset in (0..EB_BYTES).step_by(chunk) {
                self.flash
                    .read(src, offset, &mut buf[..chunk])
                    .map_err(|_| Error::Flash)?;
                self.flash
                    .program(dest, offset, &buf[..chunk])
                    .map_err(|_| Error::Flash)?;
            }
            // the freed source and consumed destination cancel out, so the
            // free-block count is untouched
            self.ebs.set(src, 0);
            self.ebs.set_meta(dest);
            self.meta_eb_list[slot] = Some(dest);
        }
        Ok(())
    }

    /// Called once per mutating operation. Every 256th call persists the
    /// metadata and then checks the metadata blocks themselves for age-out.
    pub(crate) fn age_metadata(&mut self) -> Result<(), Error> {
        self.metadata_age = self.metadata_age.wrapping_add(1);
        if self.metadata_age == 0 {
            self.persist_inner()?;
            self.meta_age_rewrite()?;
        }
        Ok(())
    }
}
