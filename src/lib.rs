//! SSD simulator built around a log-block flash translation layer.
//!
//! Host reads and writes arrive as [`Event`]s, the [`Ftl`] resolves them to
//! physical pages (triggering cleaning and wear balancing as needed), and
//! the [`Nand`] array applies them under real flash constraints: pages
//! program only when erased, erases work on whole blocks, and every block
//! has a finite erase budget.

pub mod config;
pub mod event;
pub mod ftl;
pub mod nand;

use log::warn;

pub use config::{Addr, Config, ConfigError};
pub use event::{AddrLevel, Event, EventKind, PhysAddr};
pub use ftl::{Ftl, FtlError};
pub use nand::{Nand, NandError, PageState};

/// One simulated drive: geometry, translation state and the flash array.
pub struct Ssd {
    ftl: Ftl,
    nand: Nand,
}

impl Ssd {
    pub fn new(cfg: &Config) -> Ssd {
        Ssd {
            ftl: Ftl::new(cfg),
            nand: Nand::new(cfg),
        }
    }

    /// Accept one host request, translate it and apply it to the flash
    /// array. Returns the completed event with its resolved physical
    /// address and the time it took. Cleaning traffic spawned by the
    /// translation goes to the same array before the host event itself is
    /// applied.
    pub fn event_arrive(
        &mut self,
        kind: EventKind,
        lba: Addr,
        size: usize,
        start_time: f64,
    ) -> Result<Event, FtlError> {
        let mut event = Event::new(kind, lba, size, start_time);
        self.ftl.translate(&mut event, &mut self.nand)?;
        if let Err(e) = self.nand.issue(&mut event) {
            warn!("host {:?} at LBA {} rejected by the array: {e}", kind, lba);
        }
        Ok(event)
    }

    pub fn ftl(&self) -> &Ftl {
        &self.ftl
    }

    pub fn nand(&self) -> &Nand {
        &self.nand
    }
}
