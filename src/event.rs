use num_integer::div_rem;

use crate::config::{Addr, Config};

/// I/O request kinds the simulator understands. Erase never arrives from
/// the host, the translation layer emits it while cleaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
    Erase,
}

/// How much of a `PhysAddr` is meaningful. Page-level for reads and
/// writes, block-level for erases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddrLevel {
    None,
    Package,
    Die,
    Plane,
    Block,
    Page,
}

/// Hierarchical address of a page (or block) on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysAddr {
    pub package: usize,
    pub die: usize,
    pub plane: usize,
    pub block: usize,
    pub page: usize,
    pub level: AddrLevel,
}

impl PhysAddr {
    /// Decompose a flat physical page index into the device hierarchy by
    /// successive division.
    pub fn from_flat(cfg: &Config, flat: Addr, level: AddrLevel) -> PhysAddr {
        let (block_index, page) = div_rem(flat, cfg.block_size);
        PhysAddr {
            package: (block_index / cfg.plane_size / cfg.die_size / cfg.package_size)
                % cfg.ssd_size,
            die: (block_index / cfg.plane_size / cfg.die_size) % cfg.package_size,
            plane: (block_index / cfg.plane_size) % cfg.die_size,
            block: block_index % cfg.plane_size,
            page,
            level,
        }
    }
}

/// One host or internal I/O request, carrying its timing as it moves
/// through the simulator.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub lba: Addr,
    pub size: usize,
    pub start_time: f64,
    pub time_taken: f64,
    pub addr: Option<PhysAddr>,
}

impl Event {
    pub fn new(kind: EventKind, lba: Addr, size: usize, start_time: f64) -> Event {
        debug_assert!(start_time >= 0.0, "event start time must not be negative");
        Event {
            kind,
            lba,
            size,
            start_time,
            time_taken: 0.0,
            addr: None,
        }
    }

    pub fn incr_time_taken(&mut self, time: f64) {
        self.time_taken += time;
    }
}
