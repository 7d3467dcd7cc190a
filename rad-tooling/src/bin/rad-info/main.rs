use anyhow::Result;
use rad_tooling::TopologyReport;
use rad_topology::TOPOLOGY;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rad-info",
    about = "prints the RADs of this host with their active CPUs and memory"
)]
struct Opt {
    #[structopt(long, help = "Print the report as JSON.")]
    json: bool,
}

fn main() -> Result<()> {
    fil_logger::init();
    let opts = Opt::from_args();

    let report = TopologyReport::collect(&*TOPOLOGY)?;
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}
