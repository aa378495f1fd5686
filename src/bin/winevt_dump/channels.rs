use anyhow::{Context, Result};
use clap::{ArgMatches, Command};
use std::io::Write;
use std::process::exit;
use winevt::EventLog;

pub fn command() -> Command {
    Command::new("channels").about("Lists the names of all channels")
}

pub fn run(log: &EventLog, _matches: &ArgMatches, output: &mut dyn Write) -> Result<()> {
    let channels = log
        .channels()
        .context("Failed to open the channel enumeration")?;

    for name in channels {
        let name = name.context("Failed to read the next channel name")?;
        try_writeln!(output, "{}", name);
    }
    Ok(())
}
