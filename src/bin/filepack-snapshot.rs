//! Make a point-in-time snapshot of a storage file.

use std::path::PathBuf;

use anyhow::{bail, Error};

use filepack::snapshot::snapshot_in_time;
use filepack::TimeStamp;

const USAGE: &str = "Usage: filepack-snapshot INPUT [UTC-TIME] [OUTPUT]

Make a point-in-time snapshot of a storage file containing just the
current records as of the given time.

The UTC time has the form YYYY-MM-DD[THH:MM[:SS]]; time components
default to midnight and the whole argument defaults to now. If OUTPUT
is omitted a name is derived from INPUT and the time.
";

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.len() > 3 {
        bail!("{}", USAGE);
    }

    let input = PathBuf::from(&args[0]);
    if !input.exists() {
        bail!("{:?} does not exist", input);
    }

    let (stamp, stamp_text) = match args.get(1) {
        Some(text) => (TimeStamp::parse(text)?, text.clone()),
        None => {
            let now = TimeStamp::now();
            (now, format!("{}", now).replace(' ', "T"))
        }
    };

    let output = match args.get(2) {
        Some(path) => PathBuf::from(path),
        None => {
            let name = input.to_string_lossy();
            match name.strip_suffix(".fs") {
                Some(stem) => PathBuf::from(format!("{}{}.fs", stem, stamp_text)),
                None => PathBuf::from(format!("{}{}", name, stamp_text)),
            }
        }
    };

    let size = snapshot_in_time(&input, stamp.as_tid(), &output)?;
    log::info!("wrote {:?}, {} bytes", output, size);
    Ok(())
}
