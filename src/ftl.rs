#[cfg(test)]
use std::{println as info, println as warn, println as debug};

#[cfg(not(test))]
use log::*;

use std::collections::HashMap;

use byte_unit::Byte;
use num_integer::div_rem;
use thiserror::Error;

use crate::config::{Addr, BlockId, Config, Counter, PageOff, PAGE_BYTES};
use crate::event::{AddrLevel, Event, EventKind, PhysAddr};
use crate::nand::Nand;

const WORD_BITS: usize = u64::BITS as usize;

/// Why a translate call failed. All causes coalesce into one failed host
/// event; the caller may keep submitting events afterwards.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FtlError {
    #[error("logical address {0} beyond usable capacity")]
    LbaOutOfRange(Addr),
    #[error("read of a never-written page")]
    ReadOfEmptyPage,
    #[error("no log block available")]
    NoLogBlockAvailable,
    #[error("no cleaning block available")]
    NoCleaningBlockAvailable,
    #[error("block remapping failed")]
    RemapFailed,
    #[error("operation not handled by the translation layer")]
    UnknownOperation,
}

/// Log-block translation layer.
///
/// Every logical block owns one data block (offset-mapped in `l2p`).
/// Out-of-place updates accumulate in an optional log block per data block
/// (`d2l`), in append order; the last entry for a page offset is the live
/// copy. When a log block fills up, its pages are merged back into the
/// data block through a borrowed cleaning block.
pub struct Ftl {
    cfg: Config,
    // one bit per logical page, set once the page has ever been programmed
    written: Vec<u64>,
    erase_count: Vec<Counter>,
    // per logical block: physical data block = logical block + offset
    l2p: Vec<isize>,
    // per physical data block: log block = data block + offset, 0 = none
    d2l: Vec<isize>,
    // per active log block (keyed by its first-page address): ordered data
    // page offsets, one per programmed log page
    log_pages: HashMap<Addr, Vec<PageOff>>,
    // unmapped spare blocks, most recently freed on top
    op_blocks: Vec<Addr>,
    start_time: f64,
}

impl Ftl {
    pub fn new(cfg: &Config) -> Ftl {
        let usable = cfg.usable_pages();
        let raw = cfg.raw_pages();

        info!(
            "physical capacity: {} bytes, {}",
            raw * PAGE_BYTES,
            Byte::from(raw * PAGE_BYTES)
                .get_appropriate_unit(true)
                .to_string()
        );
        info!(
            "usable capacity: {} bytes, {}",
            usable * PAGE_BYTES,
            Byte::from(usable * PAGE_BYTES)
                .get_appropriate_unit(true)
                .to_string()
        );

        let mut op_blocks = Vec::with_capacity(cfg.num_op_blocks());
        let mut pba = usable;
        while pba < raw {
            op_blocks.push(pba);
            pba += cfg.block_size;
        }

        Ftl {
            cfg: cfg.clone(),
            written: vec![0; usable.div_ceil(WORD_BITS)],
            erase_count: vec![0; cfg.num_physical_blocks()],
            l2p: vec![0; cfg.num_logical_blocks()],
            d2l: vec![0; cfg.num_physical_blocks()],
            log_pages: HashMap::new(),
            op_blocks,
            start_time: 0.0,
        }
    }

    /// Resolve one host event. On success the event's physical address is
    /// populated; table updates and any cleaning traffic into `nand` have
    /// already happened.
    pub fn translate(&mut self, event: &mut Event, nand: &mut Nand) -> Result<(), FtlError> {
        let lba = event.lba;
        debug!("[translate] input LBA {lba}");

        if lba >= self.cfg.usable_pages() {
            warn!("[translate] LBA {lba} not accessible");
            return Err(FtlError::LbaOutOfRange(lba));
        }
        self.start_time = event.start_time;

        let physical = self.physical_addr(lba);
        let (_, page) = div_rem(lba, self.cfg.block_size);
        let data_addr = physical - page;
        debug!("[translate] data block address is {data_addr}");

        match event.kind {
            EventKind::Write => self.translate_write(event, nand, lba, page, data_addr),
            EventKind::Read => self.translate_read(event, lba, page, data_addr, physical),
            EventKind::Erase => {
                warn!("[translate] unknown operation");
                Err(FtlError::UnknownOperation)
            }
        }
    }

    fn translate_write(
        &mut self,
        event: &mut Event,
        nand: &mut Nand,
        lba: Addr,
        page: PageOff,
        data_addr: Addr,
    ) -> Result<(), FtlError> {
        let bs = self.cfg.block_size;

        // never-written pages program straight into the data block
        if self.is_empty(lba) {
            self.mark_written(lba);
            event.addr = Some(self.page_addr(data_addr + page));
            debug!("[translate] wrote to an empty page");
            return Ok(());
        }

        if let Some(log_addr) = self.log_block_of(data_addr) {
            debug!("[translate] data block {data_addr} maps to log block {log_addr}");
            let list = self
                .log_pages
                .entry(log_addr)
                .or_insert_with(|| Vec::with_capacity(bs));
            let log_page = list.len();
            if log_page < bs {
                list.push(page);
                event.addr = Some(self.page_addr(log_addr + log_page));
                debug!("[translate] appended page {page} at log page {log_page}");
                return Ok(());
            }

            debug!("[translate] mapped log block has no free page");
            let logical_block = lba - page;
            let mut data_addr = data_addr;
            let mut log_addr = log_addr;
            if self.over_erase_limit(data_addr) {
                data_addr = self.remap_data_block(nand, logical_block, data_addr, log_addr)?;
            }
            if self.over_erase_limit(log_addr) {
                log_addr = self.remap_log_block(nand, logical_block, data_addr, log_addr)?;
            }
            self.clean(nand, logical_block, data_addr, log_addr)?;

            // the merged log block starts over with this write as page 0
            let mut list = Vec::with_capacity(bs);
            list.push(page);
            self.log_pages.insert(log_addr, list);
            event.addr = Some(self.page_addr(log_addr));
            debug!("[translate] cleaned, restarting log block {log_addr} with page {page}");
            return Ok(());
        }

        // first update for this data block: bind a fresh log block
        let log_addr = self
            .next_unmapped_log_block(nand)
            .ok_or(FtlError::NoLogBlockAvailable)?;
        debug!("[translate] found free log block {log_addr}");
        self.bind_log_block(data_addr, log_addr);
        let mut list = Vec::with_capacity(bs);
        list.push(page);
        self.log_pages.insert(log_addr, list);
        event.addr = Some(self.page_addr(log_addr));
        Ok(())
    }

    fn translate_read(
        &mut self,
        event: &mut Event,
        lba: Addr,
        page: PageOff,
        data_addr: Addr,
        physical: Addr,
    ) -> Result<(), FtlError> {
        if self.is_empty(lba) {
            warn!("[translate] read of an empty page");
            return Err(FtlError::ReadOfEmptyPage);
        }

        if let Some(log_addr) = self.log_block_of(data_addr) {
            if let Some(log_page) = self
                .log_pages
                .get(&log_addr)
                .and_then(|list| last_occurrence(list, page))
            {
                event.addr = Some(self.page_addr(log_addr + log_page));
                debug!("[translate] reading log page {log_page} in block {log_addr}");
                return Ok(());
            }
        }

        event.addr = Some(self.page_addr(physical));
        debug!("[translate] reading original data block page");
        Ok(())
    }

    // ---- emptiness bitmap ----------------------------------------------

    /// True while the logical page has never been programmed.
    pub fn is_empty(&self, lba: Addr) -> bool {
        self.written[lba / WORD_BITS] & (1u64 << (lba % WORD_BITS)) == 0
    }

    fn mark_written(&mut self, lba: Addr) {
        self.written[lba / WORD_BITS] |= 1u64 << (lba % WORD_BITS);
    }

    fn logical_block_all_empty(&self, logical_addr: Addr) -> bool {
        (0..self.cfg.block_size).all(|i| self.is_empty(logical_addr + i))
    }

    // ---- mapping tables ------------------------------------------------

    /// Current physical page of `lba` ignoring any log block copy.
    pub fn physical_addr(&self, lba: Addr) -> Addr {
        let (lblock, page) = div_rem(lba, self.cfg.block_size);
        let pblock = (lblock as isize + self.l2p[lblock]) as Addr;
        pblock * self.cfg.block_size + page
    }

    fn set_data_block(&mut self, logical_addr: Addr, physical_addr: Addr) {
        let lblock = logical_addr / self.cfg.block_size;
        let pblock = physical_addr / self.cfg.block_size;
        self.l2p[lblock] = pblock as isize - lblock as isize;
    }

    /// Log block bound to this data block, if any.
    pub fn log_block_of(&self, data_addr: Addr) -> Option<Addr> {
        let dblock = data_addr / self.cfg.block_size;
        let offset = self.d2l[dblock];
        if offset == 0 {
            // a data block is never its own log block, so 0 means unbound
            None
        } else {
            Some(((dblock as isize + offset) as Addr) * self.cfg.block_size)
        }
    }

    fn bind_log_block(&mut self, data_addr: Addr, log_addr: Addr) {
        let dblock = data_addr / self.cfg.block_size;
        let lblock = log_addr / self.cfg.block_size;
        self.d2l[dblock] = lblock as isize - dblock as isize;
    }

    fn unbind_log_block(&mut self, data_addr: Addr) {
        if let Some(log_addr) = self.log_block_of(data_addr) {
            self.log_pages.remove(&log_addr);
        }
        self.d2l[data_addr / self.cfg.block_size] = 0;
    }

    // ---- erase budget --------------------------------------------------

    fn over_erase_limit(&self, pba: Addr) -> bool {
        self.erase_count[pba / self.cfg.block_size] >= self.cfg.block_erases
    }

    fn bump_erase_count(&mut self, pba: Addr) {
        let block = pba / self.cfg.block_size;
        debug_assert!(
            self.erase_count[block] < self.cfg.block_erases,
            "erasing block {block} past its budget"
        );
        self.erase_count[block] += 1;
    }

    // ---- spare pool ----------------------------------------------------

    /// Pop the next usable spare block, discarding worn-out blocks on the
    /// way. An empty pool first tries to regenerate itself by shuffling a
    /// worn (data, log) pair against a lightly-worn data block.
    fn next_unmapped_log_block(&mut self, nand: &mut Nand) -> Option<Addr> {
        if self.op_blocks.is_empty() && !self.shuffle_data_log(nand) {
            return None;
        }
        while let Some(pba) = self.op_blocks.pop() {
            if !self.over_erase_limit(pba) {
                return Some(pba);
            }
            debug!("dropping worn out spare block {pba}");
        }
        None
    }

    // ---- cleaning ------------------------------------------------------

    /// Pick a merge buffer: the data block of an entirely unwritten logical
    /// block, least worn first, with erase budget left.
    fn find_empty_data_block(&self) -> Option<(Addr, Addr)> {
        let bs = self.cfg.block_size;
        let mut best = None;
        let mut min_count = self.cfg.block_erases;
        for lblock in 0..self.cfg.num_logical_blocks() {
            let logical_addr = lblock * bs;
            if !self.logical_block_all_empty(logical_addr) {
                continue;
            }
            let data_addr = self.physical_addr(logical_addr);
            let count = self.erase_count[data_addr / bs];
            if count < min_count {
                min_count = count;
                best = Some((logical_addr, data_addr));
            }
        }
        best
    }

    /// Merge a full log block back into its data block through a borrowed
    /// cleaning block, then leave both the log block and the cleaning block
    /// erased. Charges one erase to each of the three blocks involved.
    fn clean(
        &mut self,
        nand: &mut Nand,
        logical_block: Addr,
        data_addr: Addr,
        log_addr: Addr,
    ) -> Result<(), FtlError> {
        let bs = self.cfg.block_size;

        let Some((_, cln_addr)) = self.find_empty_data_block() else {
            warn!("[clean] no empty data block left");
            return Err(FtlError::NoCleaningBlockAvailable);
        };
        debug!("[clean] data block {data_addr}, log block {log_addr}, cleaning block {cln_addr}");

        let list = self.log_pages.get(&log_addr).cloned().unwrap_or_default();

        // live copies out of data + log into the cleaning block
        for page in 0..bs {
            if self.is_empty(logical_block + page) {
                continue;
            }
            let src = match last_occurrence(&list, page) {
                Some(log_page) => log_addr + log_page,
                None => data_addr + page,
            };
            self.issue_copy(nand, logical_block + page, src, cln_addr + page);
        }

        self.issue_erase(nand, logical_block, data_addr);
        self.issue_erase(nand, logical_block, log_addr);

        // merged content back into the data block
        for page in 0..bs {
            if self.is_empty(logical_block + page) {
                continue;
            }
            self.issue_copy(nand, logical_block + page, cln_addr + page, data_addr + page);
        }

        self.issue_erase(nand, logical_block, cln_addr);

        self.bump_erase_count(data_addr);
        self.bump_erase_count(log_addr);
        self.bump_erase_count(cln_addr);

        Ok(())
    }

    /// Move a worn-out data block's role to a fresh block so the pending
    /// merge can erase something with budget left. Prefers stealing the
    /// data block of an unwritten logical block; falls back to the spare
    /// pool. The log block stays bound, now to the new data block.
    fn remap_data_block(
        &mut self,
        nand: &mut Nand,
        logical_block: Addr,
        old_data_addr: Addr,
        log_addr: Addr,
    ) -> Result<Addr, FtlError> {
        let bs = self.cfg.block_size;

        let (donor_logical, new_data_addr) = match self.find_empty_data_block() {
            Some((donor, data)) => (Some(donor), data),
            None => {
                warn!("[remap_data_block] no empty data block left");
                let data = self
                    .next_unmapped_log_block(nand)
                    .ok_or(FtlError::RemapFailed)?;
                (None, data)
            }
        };

        // only pages whose live copy still sits in the old data block move;
        // pages shadowed by the log block stay where they are
        let list = self.log_pages.get(&log_addr).cloned().unwrap_or_default();
        for page in 0..bs {
            if self.is_empty(logical_block + page) || last_occurrence(&list, page).is_some() {
                continue;
            }
            self.issue_copy(
                nand,
                logical_block + page,
                old_data_addr + page,
                new_data_addr + page,
            );
        }
        debug!("[remap_data_block] moved pages to new data block {new_data_addr}");

        if let Some(donor) = donor_logical {
            self.set_data_block(donor, old_data_addr);
        }
        self.set_data_block(logical_block, new_data_addr);
        self.d2l[old_data_addr / bs] = 0;
        self.bind_log_block(new_data_addr, log_addr);

        Ok(new_data_addr)
    }

    /// Compact a worn-out log block's live entries into a fresh log block,
    /// preserving append order, and rebind the data block to it.
    fn remap_log_block(
        &mut self,
        nand: &mut Nand,
        logical_block: Addr,
        data_addr: Addr,
        old_log_addr: Addr,
    ) -> Result<Addr, FtlError> {
        let bs = self.cfg.block_size;

        let new_log_addr = self
            .next_unmapped_log_block(nand)
            .ok_or(FtlError::RemapFailed)?;

        let old_list = self.log_pages.get(&old_log_addr).cloned().unwrap_or_default();
        let mut new_list = Vec::with_capacity(bs);
        for page in 0..bs {
            if self.is_empty(logical_block + page) {
                continue;
            }
            if let Some(log_page) = last_occurrence(&old_list, page) {
                self.issue_copy(
                    nand,
                    logical_block + page,
                    old_log_addr + log_page,
                    new_log_addr + new_list.len(),
                );
                new_list.push(page);
            }
        }
        debug!("[remap_log_block] moved pages to new log block {new_log_addr}");

        self.unbind_log_block(data_addr);
        self.bind_log_block(data_addr, new_log_addr);
        self.log_pages.insert(new_log_addr, new_list);

        Ok(new_log_addr)
    }

    // ---- wear balancing ------------------------------------------------

    /// Regenerate the spare pool when it runs dry: merge away the log block
    /// of the most-worn (data, log) pair, hand its freed log block to the
    /// least-worn unmapped data block, and push that younger block into the
    /// pool where erases concentrate.
    fn shuffle_data_log(&mut self, nand: &mut Nand) -> bool {
        let bs = self.cfg.block_size;
        let limit = self.cfg.block_erases;

        // most-worn mapped pair, both sides still below the limit
        let mut pair = None;
        let mut max_count = 0;
        for dblock in 0..self.cfg.num_physical_blocks() {
            let data_addr = dblock * bs;
            let Some(log_addr) = self.log_block_of(data_addr) else {
                continue;
            };
            let data_count = self.erase_count[dblock];
            let log_count = self.erase_count[log_addr / bs];
            if data_count != limit && log_count != limit && data_count + log_count >= max_count {
                max_count = data_count + log_count;
                pair = Some((data_addr, log_addr));
            }
        }
        let Some((worn_data, worn_log)) = pair else {
            return false;
        };
        let Some(worn_logical) = self.logical_block_of(worn_data) else {
            return false;
        };

        // least-worn data block with no log bound, with comfortable budget
        let mut min_data = None;
        let mut min_count = limit + 1;
        for lblock in 0..self.cfg.num_logical_blocks() {
            let data_addr = self.physical_addr(lblock * bs);
            if self.log_block_of(data_addr).is_some() {
                continue;
            }
            let count = self.erase_count[data_addr / bs];
            if count < min_count {
                min_count = count;
                min_data = Some(data_addr);
            }
        }
        let Some(young_data) = min_data else {
            return false;
        };
        if min_count >= limit - 1 {
            return false;
        }

        // free up the worn log block
        if self.clean(nand, worn_logical, worn_data, worn_log).is_err() {
            return false;
        }
        self.unbind_log_block(worn_data);

        // the merge above may have moved data blocks around, so resolve the
        // young block's owner only now
        let Some(young_logical) = self.logical_block_of(young_data) else {
            return false;
        };

        for page in 0..bs {
            if self.is_empty(young_logical + page) {
                continue;
            }
            self.issue_copy(nand, young_logical + page, young_data + page, worn_log + page);
        }

        self.issue_erase(nand, young_logical, young_data);
        self.set_data_block(young_logical, worn_log);
        self.op_blocks.push(young_data);

        info!("[shuffle_data_log] log block {worn_log} <-> data block {young_data}");
        true
    }

    fn logical_block_of(&self, data_addr: Addr) -> Option<Addr> {
        let bs = self.cfg.block_size;
        (0..self.cfg.num_logical_blocks())
            .map(|lblock| lblock * bs)
            .find(|&logical_addr| self.physical_addr(logical_addr) == data_addr)
    }

    // ---- event plumbing ------------------------------------------------

    fn page_addr(&self, pba: Addr) -> PhysAddr {
        PhysAddr::from_flat(&self.cfg, pba, AddrLevel::Page)
    }

    fn issue_copy(&self, nand: &mut Nand, lba: Addr, src: Addr, dst: Addr) {
        let mut read = Event::new(EventKind::Read, lba, 1, self.start_time);
        read.addr = Some(self.page_addr(src));
        let _ = nand.issue(&mut read);

        let mut write = Event::new(EventKind::Write, lba, 1, self.start_time);
        write.addr = Some(self.page_addr(dst));
        let _ = nand.issue(&mut write);
    }

    fn issue_erase(&self, nand: &mut Nand, lba: Addr, block_addr: Addr) {
        debug_assert!(block_addr % self.cfg.block_size == 0);
        let mut erase = Event::new(EventKind::Erase, lba, 1, self.start_time);
        erase.addr = Some(PhysAddr::from_flat(&self.cfg, block_addr, AddrLevel::Block));
        let _ = nand.issue(&mut erase);
    }

    // ---- introspection -------------------------------------------------

    pub fn l2p_offset(&self, lblock: BlockId) -> isize {
        self.l2p[lblock]
    }

    pub fn d2l_offset(&self, dblock: BlockId) -> isize {
        self.d2l[dblock]
    }

    pub fn log_page_list(&self, log_addr: Addr) -> Option<&[PageOff]> {
        self.log_pages.get(&log_addr).map(Vec::as_slice)
    }

    pub fn erase_count_of(&self, pba: Addr) -> Counter {
        self.erase_count[pba / self.cfg.block_size]
    }

    pub fn pool_len(&self) -> usize {
        self.op_blocks.len()
    }

    /// Panic if the mapping state is inconsistent: data blocks in range and
    /// unique, log bindings pointing at listed blocks, page lists within
    /// block capacity, erase counters within budget, and no block playing
    /// two roles across data, log and spare pool.
    pub fn check_consistency(&self) {
        let bs = self.cfg.block_size;
        let num_phy = self.cfg.num_physical_blocks();
        let mut roles: HashMap<BlockId, &str> = HashMap::new();

        for lblock in 0..self.cfg.num_logical_blocks() {
            let data_block = self.physical_addr(lblock * bs) / bs;
            assert!(
                data_block < num_phy,
                "data block {data_block} of logical block {lblock} out of range"
            );
            if let Some(role) = roles.insert(data_block, "data") {
                panic!("block {data_block} is both {role} and data");
            }
        }

        for dblock in 0..num_phy {
            let offset = self.d2l[dblock];
            if offset == 0 {
                continue;
            }
            let log_block = (dblock as isize + offset) as BlockId;
            assert!(
                log_block < num_phy && log_block != dblock,
                "log binding of block {dblock} out of range"
            );
            assert!(
                self.log_pages.contains_key(&(log_block * bs)),
                "log block {log_block} has no page list"
            );
            if let Some(role) = roles.insert(log_block, "log") {
                panic!("block {log_block} is both {role} and log");
            }
        }

        for &pba in &self.op_blocks {
            if let Some(role) = roles.insert(pba / bs, "spare") {
                panic!("block {} is both {role} and spare", pba / bs);
            }
        }

        for (log_addr, list) in &self.log_pages {
            assert!(
                list.len() <= bs,
                "log block at {log_addr} lists {} pages",
                list.len()
            );
            assert!(
                list.iter().all(|&page| page < bs),
                "log block at {log_addr} lists an out-of-range page offset"
            );
        }

        for (block, &count) in self.erase_count.iter().enumerate() {
            assert!(
                count <= self.cfg.block_erases,
                "block {block} erased {count} times, over budget"
            );
        }
    }

    /// Log a wear and occupancy summary, mirroring what the write path has
    /// done to the mapping so far.
    pub fn print_wear_report(&self) {
        let bs = self.cfg.block_size;
        let num_logical = self.cfg.num_logical_blocks();

        let empty = (0..num_logical)
            .filter(|&lblock| self.logical_block_all_empty(lblock * bs))
            .count();
        info!("{empty} empty data blocks");

        for erases in 0..=self.cfg.block_erases {
            let data_blocks = (0..num_logical)
                .filter(|&lblock| {
                    self.erase_count[self.physical_addr(lblock * bs) / bs] == erases
                })
                .count();
            if data_blocks > 0 {
                info!("{data_blocks} data blocks have {erases} erases");
            }
        }

        let mut logs_in_use = 0;
        for erases in 0..=self.cfg.block_erases {
            let log_blocks = (0..num_logical)
                .filter_map(|lblock| self.log_block_of(self.physical_addr(lblock * bs)))
                .filter(|&log_addr| self.erase_count[log_addr / bs] == erases)
                .count();
            if log_blocks > 0 {
                info!("{log_blocks} log blocks have {erases} erases");
            }
            logs_in_use += log_blocks;
        }
        info!("log blocks in use: {logs_in_use}");
        info!(
            "spare blocks left: {} of {}",
            self.op_blocks.len(),
            self.cfg.num_op_blocks()
        );
    }
}

/// Index of the last entry equal to `page`, the live copy under
/// latest-write-wins.
fn last_occurrence(list: &[PageOff], page: PageOff) -> Option<usize> {
    list.iter().rposition(|&entry| entry == page)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_cfg() -> Config {
        Config {
            plane_size: 4,
            block_size: 4,
            block_erases: 3,
            overprovisioning: 50.0,
            ..Config::default()
        }
        .validated()
        .unwrap()
    }

    fn setup() -> (Config, Ftl, Nand) {
        let cfg = reference_cfg();
        let ftl = Ftl::new(&cfg);
        let nand = Nand::new(&cfg);
        (cfg, ftl, nand)
    }

    fn run(ftl: &mut Ftl, nand: &mut Nand, kind: EventKind, lba: Addr) -> Result<Event, FtlError> {
        let mut event = Event::new(kind, lba, 1, 0.0);
        ftl.translate(&mut event, nand)?;
        let _ = nand.issue(&mut event);
        Ok(event)
    }

    #[test]
    fn last_occurrence_prefers_latest() {
        assert_eq!(last_occurrence(&[0, 2, 0, 1], 0), Some(2));
        assert_eq!(last_occurrence(&[0, 2, 0, 1], 1), Some(3));
        assert_eq!(last_occurrence(&[0, 2, 0, 1], 3), None);
        assert_eq!(last_occurrence(&[], 0), None);
    }

    #[test]
    fn bitmap_marks_stick() {
        let (cfg, mut ftl, _) = setup();
        for lba in 0..cfg.usable_pages() {
            assert!(ftl.is_empty(lba));
        }
        ftl.mark_written(3);
        assert!(!ftl.is_empty(3));
        assert!(ftl.is_empty(2));
        assert!(ftl.is_empty(4));
    }

    #[test]
    fn pool_initialized_with_overprovision_blocks() {
        let (cfg, ftl, _) = setup();
        assert_eq!(ftl.pool_len(), cfg.num_op_blocks());
        assert_eq!(ftl.op_blocks, vec![8, 12]);
    }

    #[test]
    fn pop_discards_worn_spares() {
        let (_, mut ftl, mut nand) = setup();
        ftl.erase_count[3] = 3; // top of the pool, at the limit
        assert_eq!(ftl.next_unmapped_log_block(&mut nand), Some(8));
        assert_eq!(ftl.pool_len(), 0);
    }

    #[test]
    fn lba_out_of_range_fails() {
        let (cfg, mut ftl, mut nand) = setup();
        let err = run(&mut ftl, &mut nand, EventKind::Write, cfg.usable_pages()).unwrap_err();
        assert_eq!(err, FtlError::LbaOutOfRange(cfg.usable_pages()));
    }

    #[test]
    fn host_erase_is_rejected() {
        let (_, mut ftl, mut nand) = setup();
        let err = run(&mut ftl, &mut nand, EventKind::Erase, 0).unwrap_err();
        assert_eq!(err, FtlError::UnknownOperation);
    }

    #[test]
    fn virgin_write_programs_data_block_in_place() {
        let (cfg, mut ftl, mut nand) = setup();
        let event = run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        assert_eq!(event.addr, Some(PhysAddr::from_flat(&cfg, 0, AddrLevel::Page)));
        assert_eq!(ftl.l2p_offset(0), 0);
        assert_eq!(ftl.d2l_offset(0), 0);
        assert!(!ftl.is_empty(0));
        ftl.check_consistency();
    }

    #[test]
    fn second_write_goes_to_a_log_block() {
        let (cfg, mut ftl, mut nand) = setup();
        run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        let event = run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        // LIFO pool: block 3 (first page 12) is on top
        assert_eq!(event.addr, Some(PhysAddr::from_flat(&cfg, 12, AddrLevel::Page)));
        assert_eq!(ftl.d2l_offset(0), 3);
        assert_eq!(ftl.log_page_list(12), Some(&[0][..]));
        ftl.check_consistency();
    }

    #[test]
    fn read_resolves_latest_log_copy() {
        let (cfg, mut ftl, mut nand) = setup();
        run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        run(&mut ftl, &mut nand, EventKind::Write, 1).unwrap();
        run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        assert_eq!(ftl.log_page_list(12), Some(&[0, 0][..]));

        let event = run(&mut ftl, &mut nand, EventKind::Read, 0).unwrap();
        assert_eq!(event.addr, Some(PhysAddr::from_flat(&cfg, 13, AddrLevel::Page)));
        // page 1 has no log copy, reads stay in the data block
        let event = run(&mut ftl, &mut nand, EventKind::Read, 1).unwrap();
        assert_eq!(event.addr, Some(PhysAddr::from_flat(&cfg, 1, AddrLevel::Page)));
    }

    #[test]
    fn read_before_write_fails() {
        let (_, mut ftl, mut nand) = setup();
        let err = run(&mut ftl, &mut nand, EventKind::Read, 3).unwrap_err();
        assert_eq!(err, FtlError::ReadOfEmptyPage);
    }

    #[test]
    fn full_log_block_triggers_cleaning() {
        let (cfg, mut ftl, mut nand) = setup();
        // first write lands in the data block, four more fill the log block
        for _ in 0..5 {
            run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        }
        assert_eq!(ftl.log_page_list(12), Some(&[0, 0, 0, 0][..]));

        // the sixth write merges and restarts the log block
        let event = run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        assert_eq!(event.addr, Some(PhysAddr::from_flat(&cfg, 12, AddrLevel::Page)));
        assert_eq!(ftl.log_page_list(12), Some(&[0][..]));
        // data block 0, log block 3 and cleaning block 1 each paid one erase
        assert_eq!(ftl.erase_count_of(0), 1);
        assert_eq!(ftl.erase_count_of(12), 1);
        assert_eq!(ftl.erase_count_of(4), 1);
        assert_eq!(nand.total_erases(), 3);
        ftl.check_consistency();

        let event = run(&mut ftl, &mut nand, EventKind::Read, 0).unwrap();
        assert_eq!(event.addr, Some(PhysAddr::from_flat(&cfg, 12, AddrLevel::Page)));
        assert_eq!(nand.write_rejects(), 0);
        assert_eq!(nand.read_rejects(), 0);
    }

    #[test]
    fn cleaning_without_empty_block_fails() {
        let (cfg, mut ftl, mut nand) = setup();
        // touch every logical block so no cleaning block is left
        for lblock in 0..cfg.num_logical_blocks() {
            run(&mut ftl, &mut nand, EventKind::Write, lblock * cfg.block_size).unwrap();
        }
        for _ in 0..4 {
            run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        }
        let err = run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap_err();
        assert_eq!(err, FtlError::NoCleaningBlockAvailable);
        // failure is not fatal, other pages still translate
        run(&mut ftl, &mut nand, EventKind::Read, 0).unwrap();
    }

    #[test]
    fn shuffle_regenerates_the_pool() {
        let cfg = Config {
            plane_size: 8,
            block_size: 4,
            block_erases: 3,
            overprovisioning: 25.0,
            ..Config::default()
        }
        .validated()
        .unwrap();
        let mut ftl = Ftl::new(&cfg);
        let mut nand = Nand::new(&cfg);

        // bind both spares as log blocks of data blocks 0 and 1
        for lba in [0, 0, 4, 4] {
            run(&mut ftl, &mut nand, EventKind::Write, lba).unwrap();
        }
        assert_eq!(ftl.pool_len(), 0);

        // make the (data 1, log) pair the most worn so the shuffle picks it
        ftl.erase_count[1] = 1;
        assert!(ftl.shuffle_data_log(&mut nand));

        // the young data block 2 moved into the pool, its logical block now
        // lives in the freed ex-log block
        assert_eq!(ftl.pool_len(), 1);
        assert_eq!(ftl.op_blocks, vec![8]);
        assert_eq!(ftl.l2p_offset(2), 4);
        // the worn pair was merged, so data block 1 lost its log binding
        assert_eq!(ftl.d2l_offset(1), 0);
        ftl.check_consistency();
    }

    #[test]
    fn shuffle_fails_without_a_young_block() {
        let (_, mut ftl, mut nand) = setup();
        // no (data, log) pair exists yet
        assert!(!ftl.shuffle_data_log(&mut nand));

        run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        // the only unmapped data block is too close to its erase limit
        ftl.erase_count[1] = 2;
        assert!(!ftl.shuffle_data_log(&mut nand));
    }

    #[test]
    fn worn_data_block_is_remapped_before_cleaning() {
        let cfg = Config {
            plane_size: 8,
            block_size: 4,
            block_erases: 3,
            overprovisioning: 25.0,
            ..Config::default()
        }
        .validated()
        .unwrap();
        let mut ftl = Ftl::new(&cfg);
        let mut nand = Nand::new(&cfg);

        for lba in [0, 0, 0, 0, 0] {
            run(&mut ftl, &mut nand, EventKind::Write, lba).unwrap();
        }
        // pretend the data block just hit its limit
        ftl.erase_count[0] = 3;

        // next overflow write remaps logical block 0 onto a fresh data block
        run(&mut ftl, &mut nand, EventKind::Write, 0).unwrap();
        assert_ne!(ftl.l2p_offset(0), 0);
        let new_data = ftl.physical_addr(0);
        assert!(ftl.log_block_of(new_data).is_some());
        ftl.check_consistency();
    }
}
