use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use rad_topology::region::RadRegion;
use rad_topology::settings::SETTINGS;
use rad_topology::TOPOLOGY;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rad-region",
    about = "creates a memory-resident shared region on the home RAD and keeps writing to it"
)]
struct Opt {
    #[structopt(long, help = "Region size in bytes. Defaults to the region_size setting.")]
    size: Option<u64>,
    #[structopt(
        long,
        help = "Directory holding the region files. Defaults to the region_dir setting."
    )]
    dir: Option<String>,
    #[structopt(long, default_value = "0", help = "Passes over the region; 0 runs forever.")]
    iterations: u64,
    #[structopt(long, default_value = "1000", help = "Pause between passes, in milliseconds.")]
    interval_ms: u64,
}

fn main() -> Result<()> {
    fil_logger::init();
    let opts = Opt::from_args();

    let home_rad = TOPOLOGY.home_rad()?;
    let size = opts.size.unwrap_or(SETTINGS.region_size);
    let dir = opts.dir.as_deref().unwrap_or(&SETTINGS.region_dir);

    let mut region = RadRegion::create(&*TOPOLOGY, home_rad, size, dir)
        .with_context(|| format!("failed to create region on RAD {}", home_rad))?;
    println!(
        "Mapped {} bytes at '{}' on RAD {}",
        region.len(),
        region.path().display(),
        region.rad()
    );

    let mut pass = 0;
    while opts.iterations == 0 || pass < opts.iterations {
        let touched = region.touch(SETTINGS.region_touch_stride);
        info!("pass {}: touched {} words", pass, touched);
        pass += 1;
        thread::sleep(Duration::from_millis(opts.interval_ms));
    }
    region.flush()?;
    Ok(())
}
