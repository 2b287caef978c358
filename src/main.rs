use std::env;
use std::fs::File;
use std::process;

use log::{error, info, LevelFilter};
use simplelog::{ConfigBuilder, WriteLogger};
use time::macros::format_description;

use ftlsim::{Config, EventKind, Ssd};

fn main() {
    let config_path = env::args().nth(1).unwrap_or_else(|| "ssd.conf".to_string());
    let cfg = match Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{config_path}: {e}");
            process::exit(2);
        }
    };

    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();
    let log_file = match File::create(&cfg.log_file) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("{}: {e}", cfg.log_file);
            process::exit(2);
        }
    };
    WriteLogger::init(LevelFilter::Debug, log_cfg, log_file).unwrap();

    let usable = cfg.usable_pages();
    let mut ssd = Ssd::new(&cfg);
    let mut clock = 0.0;
    let mut failures = 0;

    // fill half the drive, then keep rewriting a hot quarter to push log
    // blocks through allocation, cleaning and wear balancing; the cold
    // half stays unwritten so the cleaner always finds a merge buffer
    for lba in 0..usable / 2 {
        clock += drive(&mut ssd, EventKind::Write, lba, clock, &mut failures);
    }
    info!("initial fill done at {clock:.6}");

    for round in 0..8 {
        for lba in 0..usable / 4 {
            clock += drive(&mut ssd, EventKind::Write, lba, clock, &mut failures);
        }
        info!("rewrite round {round} done at {clock:.6}");
    }

    for lba in 0..usable / 2 {
        clock += drive(&mut ssd, EventKind::Read, lba, clock, &mut failures);
    }

    info!("workload finished at {clock:.6}, {failures} failed events");
    ssd.ftl().print_wear_report();

    if ssd.nand().write_rejects() > 0 || ssd.nand().read_rejects() > 0 {
        error!(
            "array rejected traffic: {} writes, {} reads",
            ssd.nand().write_rejects(),
            ssd.nand().read_rejects()
        );
        process::exit(1);
    }
}

fn drive(ssd: &mut Ssd, kind: EventKind, lba: usize, clock: f64, failures: &mut usize) -> f64 {
    match ssd.event_arrive(kind, lba, 1, clock) {
        Ok(event) => event.time_taken,
        Err(e) => {
            info!("{kind:?} at LBA {lba} failed: {e}");
            *failures += 1;
            0.0
        }
    }
}
