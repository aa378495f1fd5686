use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use indoc::indoc;
use log::info;
use std::io::Write;
use std::path::Path;
use winevt::{EventLog, QueryDirection, SeekTarget};

use super::{
    OutputFormat, dump_record, message_or_warn, read_bookmark_file, record_output_args,
    write_bookmark_file,
};

pub fn command() -> Command {
    record_output_args(
        Command::new("query")
            .about("Dumps the records of a channel that match a query")
            .long_about(indoc!(
                r#"
                Dumps the records of a channel that match a query.

                The cursor can first be moved with `--seek` (first, last or current, optionally
                combined with `|strict`) and `--offset`. With `--bookmark-file`, dumping starts
                after the record saved in the file, and the last dumped record is saved back.
            "#
            ))
            .arg(
                Arg::new("channel")
                    .required(true)
                    .value_name("CHANNEL")
                    .help("Channel to query, e.g. `Application`."),
            )
            .arg(
                Arg::new("timeout")
                    .long("timeout")
                    .value_parser(clap::value_parser!(u32))
                    .default_value("0")
                    .value_name("MS")
                    .help("Milliseconds to wait for each record."),
            )
            .arg(
                Arg::new("seek")
                    .long("seek")
                    .value_name("ORIGIN")
                    .conflicts_with("bookmark-file")
                    .help("Moves the cursor before dumping, e.g. `last` or `first|strict`."),
            )
            .arg(
                Arg::new("offset")
                    .long("offset")
                    .value_parser(clap::value_parser!(i64))
                    .allow_negative_numbers(true)
                    .value_name("N")
                    .help("Offset from the seek origin (default: 0, or 1 after a bookmark)."),
            )
            .arg(
                Arg::new("reverse")
                    .long("reverse")
                    .action(ArgAction::SetTrue)
                    .help("Newest records first."),
            )
            .arg(
                Arg::new("bookmark-file")
                    .long("bookmark-file")
                    .value_name("FILE")
                    .help("Resumes after the bookmark saved in FILE and saves the last dumped record."),
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
    let timeout = *matches.get_one::<u32>("timeout").expect("has default");
    let offset = matches.get_one::<i64>("offset").copied();
    let max = matches.get_one::<usize>("max").copied();
    let with_message = matches.get_flag("message");
    let direction = if matches.get_flag("reverse") {
        QueryDirection::Reverse
    } else {
        QueryDirection::Forward
    };

    let mut query = log
        .query_with_direction(channel, filter, direction)
        .with_context(|| format!("Failed to query channel `{}`", channel))?
        .with_timeout(timeout)
        .with_render_mode(format.render_mode());

    let bookmark_path = matches.get_one::<String>("bookmark-file").map(Path::new);
    let mut bookmark = None;

    if let Some(path) = bookmark_path {
        match read_bookmark_file(path)? {
            Some(markup) => {
                let saved = log
                    .bookmark_from(&markup)
                    .with_context(|| format!("Invalid bookmark in `{}`", path.display()))?;
                query.set_offset(offset.unwrap_or(1));
                if !query.seek(SeekTarget::Bookmark(&saved)) {
                    bail!("Failed to seek to the bookmark saved in `{}`", path.display());
                }
                bookmark = Some(saved);
            }
            None => bookmark = Some(log.bookmark()?),
        }
    } else if let Some(origin) = matches.get_one::<String>("seek") {
        query.set_offset(offset.unwrap_or(0));
        if !query.seek_to(origin)? {
            bail!("Failed to seek to `{}` with offset {}", origin, query.offset());
        }
    }

    let mut written = 0usize;
    while max.is_none_or(|max| written < max) && query.advance()? {
        let record = query.render()?;
        let message = if with_message {
            message_or_warn(query.render_message())
        } else {
            None
        };
        dump_record(output, &record, message, format)?;

        if let (Some(bookmark), Some(current)) = (bookmark.as_mut(), query.current()) {
            bookmark.update(current)?;
        }
        written += 1;
    }
    info!("Dumped {} records from `{}`", written, channel);

    if let (Some(path), Some(bookmark)) = (bookmark_path, &bookmark) {
        if written > 0 {
            write_bookmark_file(path, &bookmark.render()?)?;
        }
    }
    Ok(())
}
