use anyhow::Result;

use rad_topology::settings::SETTINGS;

fn main() -> Result<()> {
    println!("{:#?}", *SETTINGS);
    Ok(())
}
