//! watchpost_probe - list local camera indices that can be opened.

use anyhow::Result;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "List openable local camera indices")]
struct Args {
    /// Probe indices 0..max.
    #[arg(long, default_value_t = 10)]
    max: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    probe(args.max)
}

#[cfg(feature = "ingest-v4l2")]
fn probe(max: u32) -> Result<()> {
    let found = watchpost::ingest::probe_devices(max);
    if found.is_empty() {
        println!("no cameras found in 0..{max}");
    } else {
        for index in found {
            println!("{index}\t/dev/video{index}");
        }
    }
    Ok(())
}

#[cfg(not(feature = "ingest-v4l2"))]
fn probe(_max: u32) -> Result<()> {
    anyhow::bail!("camera probing requires the ingest-v4l2 feature")
}
