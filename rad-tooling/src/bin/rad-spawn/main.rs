use std::process::Command;

use anyhow::{ensure, Context, Result};
use log::info;
use rad_topology::placement::spawn_on_rad;
use rad_topology::{RadAggregator, TOPOLOGY};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rad-spawn",
    about = "runs a program once on every RAD that has both memory and active CPUs"
)]
struct Opt {
    #[structopt(long, help = "Wait for every child to exit and fail if any of them failed.")]
    wait: bool,
    #[structopt(help = "Program to run, followed by its arguments.", required = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    fil_logger::init();
    let opts = Opt::from_args();
    let (program, args) = opts
        .command
        .split_first()
        .context("no program given")?;

    let rads = RadAggregator::new(&*TOPOLOGY).rads_with_cpus_and_memory()?;
    let mut children = Vec::with_capacity(rads.len());
    for rad in rads {
        println!("Creating process on RAD {}", rad);
        let mut command = Command::new(program);
        command.args(args);
        let child = spawn_on_rad(&*TOPOLOGY, rad, &mut command)
            .with_context(|| format!("failed to create process on RAD {}", rad))?;
        children.push((rad, child));
    }

    if opts.wait {
        for (rad, mut child) in children {
            let status = child.wait()?;
            info!("process {} on RAD {} exited with {}", child.id(), rad, status);
            ensure!(status.success(), "process on RAD {} failed: {}", rad, status);
        }
    }
    println!("All done.");
    Ok(())
}
