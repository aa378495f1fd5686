use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use indoc::indoc;
use log::info;
use std::io::Write;
use std::path::Path;
use winevt::EventLog;

use super::{
    OutputFormat, dump_record, message_or_warn, read_bookmark_file, record_output_args,
    write_bookmark_file,
};

pub fn command() -> Command {
    record_output_args(
        Command::new("tail")
            .about("Follows a channel, printing records as they arrive")
            .long_about(indoc!(
                r#"
                Follows a channel, printing records as they arrive.

                Only new records are printed unless `--from-start` is given. With
                `--bookmark-file`, following resumes after the record saved in the file, and
                the file is updated after every printed record. With `--idle-timeout`,
                following stops once a single wait for new records times out.
            "#
            ))
            .arg(
                Arg::new("channel")
                    .required(true)
                    .value_name("CHANNEL")
                    .help("Channel to follow, e.g. `Microsoft-Windows-Sysmon/Operational`."),
            )
            .arg(
                Arg::new("from-start")
                    .long("from-start")
                    .action(ArgAction::SetTrue)
                    .help("Replays the records already in the channel first."),
            )
            .arg(
                Arg::new("bookmark-file")
                    .long("bookmark-file")
                    .value_name("FILE")
                    .help("Resumes after the bookmark saved in FILE and keeps it updated."),
            )
            .arg(
                Arg::new("idle-timeout")
                    .long("idle-timeout")
                    .value_parser(clap::value_parser!(u32))
                    .value_name("MS")
                    .help("Exits when no record arrives for MS milliseconds."),
            ),
    )
}

pub fn run(
    log: &EventLog,
    matches: &ArgMatches,
    format: OutputFormat,
    output: &mut dyn Write,
) -> Result<()> {
    let channel = matches.get_one::<String>("channel").expect("required");
    let filter = matches.get_one::<String>("filter").expect("has default");
    let idle_timeout = matches.get_one::<u32>("idle-timeout").copied();
    let max = matches.get_one::<usize>("max").copied();
    let with_message = matches.get_flag("message");
    let bookmark_path = matches.get_one::<String>("bookmark-file").map(Path::new);

    let bookmark = match bookmark_path {
        Some(path) => match read_bookmark_file(path)? {
            Some(markup) => Some(
                log.bookmark_from(&markup)
                    .with_context(|| format!("Invalid bookmark in `{}`", path.display()))?,
            ),
            None => None,
        },
        None => None,
    };

    let mut subscription = log
        .subscribe(channel, filter, bookmark, !matches.get_flag("from-start"))
        .with_context(|| format!("Failed to subscribe to `{}`", channel))?
        .with_render_mode(format.render_mode());
    if let Some(idle_timeout) = idle_timeout {
        subscription.set_wait_timeout(idle_timeout);
    }
    info!(
        "Following `{}` from {:?}",
        channel,
        subscription.start_position()
    );

    let mut written = 0usize;
    while max.is_none_or(|max| written < max) {
        if !subscription.advance()? {
            if idle_timeout.is_some() && subscription.timed_out() {
                break;
            }
            continue;
        }

        let record = subscription.render()?;
        let message = if with_message {
            message_or_warn(subscription.render_message())
        } else {
            None
        };
        dump_record(output, &record, message, format)?;
        output.flush()?;

        if let Some(path) = bookmark_path {
            write_bookmark_file(path, &subscription.bookmark()?)?;
        }
        written += 1;
    }
    info!("Printed {} records from `{}`", written, channel);

    Ok(())
}
