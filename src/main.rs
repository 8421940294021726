#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use renesas_boot_mode::protocol::MemoryArea;
use renesas_boot_mode::{Options, Programmer, Session, State};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "9600")]
    baud: u32,

    #[structopt(flatten)]
    options: Options,

    /// Query and log the boot program status after connecting
    #[structopt(long)]
    status: bool,

    /// Output file for the user boot area
    #[structopt(long, default_value = "user_boot.bin")]
    user_boot_out: PathBuf,

    /// Output file for the user area
    #[structopt(long, default_value = "user.bin")]
    user_out: PathBuf,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .map_err(|e| anyhow::anyhow!("Error connecting to serial port {}: {:?}", o.port, e))?;

    let mut s = Session::new(p);

    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::default_bar()
        .template("{msg} [{bar:40}] {bytes}/{total_bytes} ({eta})")
        .progress_chars("=> "));

    // Output for the area being dumped, written block by block so a failed
    // dump leaves what was read on disk
    let out: Rc<RefCell<Option<File>>> = Rc::new(RefCell::new(None));
    let write_err: Rc<RefCell<Option<io::Error>>> = Rc::new(RefCell::new(None));

    let (b, o2, e2) = (bar.clone(), out.clone(), write_err.clone());
    let mut current = None;
    s.on_block(Box::new(move |area, block, n, total| {
        if current != Some(area) {
            current = Some(area);
            b.reset();
            b.set_length(total);
            b.set_message(&area.to_string());
        }
        b.set_position(n as u64);

        if let Some(f) = o2.borrow_mut().as_mut() {
            if let Err(e) = f.write_all(block) {
                e2.borrow_mut().get_or_insert(e);
            }
        }
    }));

    info!("Connecting to bootloader");

    s.step().context("Error connecting to bootloader")?;

    info!("Bootloader connected!");

    if o.status {
        let status = s.status().context("Error reading status")?;
        info!("Status: 0x{:02x} error: 0x{:02x}", status.status, status.error);
    }

    while s.state() != State::Done {
        if let State::MemoryDump(area) = s.state() {
            let path = output_path(&o, area);
            let f = File::create(path)
                .with_context(|| format!("Error creating {}", path.display()))?;
            *out.borrow_mut() = Some(f);
        }

        let res = s.step();

        if let Some(e) = write_err.borrow_mut().take() {
            bar.abandon();
            return Err(e).context("Error writing output");
        }

        let image = match res {
            Ok(Some(i)) => i,
            Ok(None) => continue,
            Err(e) => {
                bar.abandon();
                if let State::MemoryDump(area) = e.step {
                    error!("{} is incomplete", output_path(&o, area).display());
                }
                return Err(e.into());
            }
        };

        bar.finish_and_clear();

        let path = output_path(&o, image.area);
        if let Some(mut f) = out.borrow_mut().take() {
            f.flush().with_context(|| format!("Error writing {}", path.display()))?;
        }

        info!("Wrote {} ({}) from {} to {}",
            bytefmt::format(image.data.len() as u64), image.range, image.area, path.display());
    }

    info!("Dump complete");

    Ok(())
}

fn output_path(o: &Args, area: MemoryArea) -> &PathBuf {
    match area {
        MemoryArea::UserBoot => &o.user_boot_out,
        MemoryArea::User => &o.user_out,
    }
}
