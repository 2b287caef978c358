use std::collections::HashMap;

use log::trace;
use thiserror::Error;

use crate::config::{Addr, Config, Counter};
use crate::event::{AddrLevel, Event, EventKind, PhysAddr};

/// NAND page state machine. A page programs only from `Empty` and only an
/// erase of the whole block brings it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Empty,
    Valid,
    Invalid,
}

#[derive(Debug, Error)]
pub enum NandError {
    #[error("address out of range or missing")]
    InvalidAddress,
    #[error("address level {0:?} wrong for this operation")]
    WrongAddrLevel(AddrLevel),
    #[error("read of a page in state {0:?}")]
    ReadNotValid(PageState),
    #[error("program of a page in state {0:?}")]
    ProgramNotEmpty(PageState),
    #[error("block has no erases remaining")]
    EraseBudgetExhausted,
}

#[derive(Debug)]
struct NandBlock {
    pages: Vec<PageState>,
    erases_remaining: Counter,
}

impl NandBlock {
    fn new(cfg: &Config) -> NandBlock {
        NandBlock {
            pages: vec![PageState::Empty; cfg.block_size],
            erases_remaining: cfg.block_erases,
        }
    }
}

struct Plane {
    blocks: Vec<NandBlock>,
}

struct Die {
    planes: Vec<Plane>,
}

struct Package {
    dies: Vec<Die>,
}

/// The simulated device. Hardware timing beyond per-operation latency
/// (bus scheduling, RAM buffering) is not modeled.
pub struct Nand {
    cfg: Config,
    packages: Vec<Package>,
    total_erases: Counter,
    read_rejects: Counter,
    write_rejects: Counter,
    erase_rejects: Counter,
    // most recent programmed location per logical page
    ref_map: HashMap<Addr, PhysAddr>,
}

impl Nand {
    pub fn new(cfg: &Config) -> Nand {
        let packages = (0..cfg.ssd_size)
            .map(|_| Package {
                dies: (0..cfg.package_size)
                    .map(|_| Die {
                        planes: (0..cfg.die_size)
                            .map(|_| Plane {
                                blocks: (0..cfg.plane_size).map(|_| NandBlock::new(cfg)).collect(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Nand {
            cfg: cfg.clone(),
            packages,
            total_erases: 0,
            read_rejects: 0,
            write_rejects: 0,
            erase_rejects: 0,
            ref_map: HashMap::new(),
        }
    }

    fn block_mut(&mut self, addr: &PhysAddr) -> Result<&mut NandBlock, NandError> {
        self.packages
            .get_mut(addr.package)
            .and_then(|p| p.dies.get_mut(addr.die))
            .and_then(|d| d.planes.get_mut(addr.plane))
            .and_then(|pl| pl.blocks.get_mut(addr.block))
            .ok_or(NandError::InvalidAddress)
    }

    fn block(&self, addr: &PhysAddr) -> Result<&NandBlock, NandError> {
        self.packages
            .get(addr.package)
            .and_then(|p| p.dies.get(addr.die))
            .and_then(|d| d.planes.get(addr.plane))
            .and_then(|pl| pl.blocks.get(addr.block))
            .ok_or(NandError::InvalidAddress)
    }

    /// Apply one fully-resolved event to the array and charge its latency.
    pub fn issue(&mut self, event: &mut Event) -> Result<(), NandError> {
        let addr = event.addr.ok_or(NandError::InvalidAddress)?;
        let result = match event.kind {
            EventKind::Read => self.read(event, &addr),
            EventKind::Write => self.write(event, &addr),
            EventKind::Erase => self.erase(event, &addr),
        };
        if let Err(ref e) = result {
            trace!("nand: rejected {:?} at {:?}: {e}", event.kind, addr);
        }
        result
    }

    fn read(&mut self, event: &mut Event, addr: &PhysAddr) -> Result<(), NandError> {
        if addr.level != AddrLevel::Page {
            self.read_rejects += 1;
            return Err(NandError::WrongAddrLevel(addr.level));
        }
        let delay = self.cfg.page_read_delay;
        let block = self.block(addr)?;
        let state = *block.pages.get(addr.page).ok_or(NandError::InvalidAddress)?;
        if state != PageState::Valid {
            self.read_rejects += 1;
            return Err(NandError::ReadNotValid(state));
        }
        event.incr_time_taken(delay);
        Ok(())
    }

    fn write(&mut self, event: &mut Event, addr: &PhysAddr) -> Result<(), NandError> {
        if addr.level != AddrLevel::Page {
            self.write_rejects += 1;
            return Err(NandError::WrongAddrLevel(addr.level));
        }
        let state = *self
            .block(addr)?
            .pages
            .get(addr.page)
            .ok_or(NandError::InvalidAddress)?;
        if state != PageState::Empty {
            self.write_rejects += 1;
            return Err(NandError::ProgramNotEmpty(state));
        }
        self.block_mut(addr)?.pages[addr.page] = PageState::Valid;
        event.incr_time_taken(self.cfg.page_write_delay);
        self.ref_map.insert(event.lba, *addr);
        Ok(())
    }

    fn erase(&mut self, event: &mut Event, addr: &PhysAddr) -> Result<(), NandError> {
        if addr.level != AddrLevel::Block {
            self.erase_rejects += 1;
            return Err(NandError::WrongAddrLevel(addr.level));
        }
        if self.block(addr)?.erases_remaining == 0 {
            self.erase_rejects += 1;
            return Err(NandError::EraseBudgetExhausted);
        }
        let block = self.block_mut(addr)?;
        block.erases_remaining -= 1;
        block.pages.fill(PageState::Empty);
        self.total_erases += 1;
        event.incr_time_taken(self.cfg.block_erase_delay);
        Ok(())
    }

    /// State of a single page, for consistency checks.
    pub fn page_state(&self, addr: &PhysAddr) -> Option<PageState> {
        self.block(addr).ok()?.pages.get(addr.page).copied()
    }

    /// Erases already consumed by the block containing `addr`.
    pub fn erases_performed(&self, addr: &PhysAddr) -> Option<Counter> {
        self.block(addr)
            .ok()
            .map(|b| self.cfg.block_erases - b.erases_remaining)
    }

    /// Where the most recent program for this logical page landed.
    pub fn last_write_addr(&self, lba: Addr) -> Option<PhysAddr> {
        self.ref_map.get(&lba).copied()
    }

    pub fn total_erases(&self) -> Counter {
        self.total_erases
    }

    pub fn read_rejects(&self) -> Counter {
        self.read_rejects
    }

    pub fn write_rejects(&self) -> Counter {
        self.write_rejects
    }

    pub fn erase_rejects(&self) -> Counter {
        self.erase_rejects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config {
            plane_size: 4,
            block_size: 4,
            block_erases: 2,
            overprovisioning: 50.0,
            ..Config::default()
        }
        .validated()
        .unwrap()
    }

    fn page(cfg: &Config, flat: Addr) -> PhysAddr {
        PhysAddr::from_flat(cfg, flat, AddrLevel::Page)
    }

    fn block(cfg: &Config, flat: Addr) -> PhysAddr {
        PhysAddr::from_flat(cfg, flat, AddrLevel::Block)
    }

    fn issued(nand: &mut Nand, kind: EventKind, lba: Addr, addr: PhysAddr) -> Result<f64, NandError> {
        let mut ev = Event::new(kind, lba, 1, 0.0);
        ev.addr = Some(addr);
        nand.issue(&mut ev)?;
        Ok(ev.time_taken)
    }

    #[test]
    fn program_then_read() {
        let cfg = cfg();
        let mut nand = Nand::new(&cfg);
        let taken = issued(&mut nand, EventKind::Write, 0, page(&cfg, 5)).unwrap();
        assert_eq!(taken, cfg.page_write_delay);
        assert_eq!(nand.page_state(&page(&cfg, 5)), Some(PageState::Valid));
        assert_eq!(nand.last_write_addr(0), Some(page(&cfg, 5)));
        let taken = issued(&mut nand, EventKind::Read, 0, page(&cfg, 5)).unwrap();
        assert_eq!(taken, cfg.page_read_delay);
    }

    #[test]
    fn read_of_empty_page_rejected() {
        let cfg = cfg();
        let mut nand = Nand::new(&cfg);
        assert!(issued(&mut nand, EventKind::Read, 0, page(&cfg, 0)).is_err());
        assert_eq!(nand.read_rejects(), 1);
    }

    #[test]
    fn no_overwrite_without_erase() {
        let cfg = cfg();
        let mut nand = Nand::new(&cfg);
        issued(&mut nand, EventKind::Write, 0, page(&cfg, 0)).unwrap();
        assert!(matches!(
            issued(&mut nand, EventKind::Write, 0, page(&cfg, 0)),
            Err(NandError::ProgramNotEmpty(PageState::Valid))
        ));
        assert_eq!(nand.write_rejects(), 1);

        issued(&mut nand, EventKind::Erase, 0, block(&cfg, 0)).unwrap();
        assert_eq!(nand.page_state(&page(&cfg, 0)), Some(PageState::Empty));
        issued(&mut nand, EventKind::Write, 0, page(&cfg, 0)).unwrap();
    }

    #[test]
    fn erase_budget_enforced() {
        let cfg = cfg();
        let mut nand = Nand::new(&cfg);
        issued(&mut nand, EventKind::Erase, 0, block(&cfg, 0)).unwrap();
        issued(&mut nand, EventKind::Erase, 0, block(&cfg, 0)).unwrap();
        assert_eq!(nand.erases_performed(&block(&cfg, 0)), Some(2));
        assert!(matches!(
            issued(&mut nand, EventKind::Erase, 0, block(&cfg, 0)),
            Err(NandError::EraseBudgetExhausted)
        ));
        assert_eq!(nand.total_erases(), 2);
    }

    #[test]
    fn erase_needs_block_level_address() {
        let cfg = cfg();
        let mut nand = Nand::new(&cfg);
        assert!(matches!(
            issued(&mut nand, EventKind::Erase, 0, page(&cfg, 0)),
            Err(NandError::WrongAddrLevel(AddrLevel::Page))
        ));
    }
}
