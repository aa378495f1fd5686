use anyhow::{Context, Result, bail, format_err};
use clap::{Arg, ArgAction, ArgMatches, Command};
use dialoguer::Confirm;
use indoc::indoc;
use log::{LevelFilter, warn};
use simplelog::{Config, WriteLogger};

use winevt::{EventLog, MemoryEventLog, RenderMode, RenderedRecord};

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::process::exit;

/// Tries to write a line to a given target, aborts program if fails.
macro_rules! try_writeln {
    ($($arg:tt)*) => (
        match writeln!($($arg)*) {
            Ok(_) => {},
            Err(e) => {
                eprintln!("{}", &e);
                exit(1)
            }
        }
    );
}

mod channels;
mod query;
mod tail;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Xml,
    Json,
    Jsonl,
}

impl OutputFormat {
    fn from_matches(matches: &ArgMatches) -> Self {
        match matches.get_one::<String>("output-format").map(String::as_str) {
            Some("json") => OutputFormat::Json,
            Some("jsonl") => OutputFormat::Jsonl,
            _ => OutputFormat::Xml,
        }
    }

    pub fn render_mode(self) -> RenderMode {
        match self {
            OutputFormat::Xml => RenderMode::Xml,
            OutputFormat::Json | OutputFormat::Jsonl => RenderMode::Structured,
        }
    }
}

/// Arguments shared by the subcommands that print records.
pub fn record_output_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("output-format")
                .short('o')
                .long("format")
                .value_parser(["xml", "json", "jsonl"])
                .default_value("xml")
                .help("Sets the output format")
                .long_help(indoc!(
                    r#"Sets the output format:
                        "xml"   - prints the event markup of each record.
                        "json"  - prints system fields and typed values, indented.
                        "jsonl" - same as json, one record per line.
                    "#
                )),
        )
        .arg(
            Arg::new("filter")
                .long("filter")
                .default_value("*")
                .value_name("XPATH")
                .help("Structured query selecting records, e.g. `*[System[(Level <= 3)]]`."),
        )
        .arg(
            Arg::new("message")
                .long("message")
                .action(ArgAction::SetTrue)
                .help("Adds the formatted event message to JSON output as `Message`."),
        )
        .arg(
            Arg::new("max")
                .long("max")
                .value_parser(clap::value_parser!(usize))
                .value_name("N")
                .help("Stops after printing N records."),
        )
}

/// Writes one rendered record, with `message` added to JSON output when present.
pub fn dump_record(
    output: &mut dyn Write,
    record: &RenderedRecord,
    message: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let structured = match record {
        RenderedRecord::Xml(xml) => {
            try_writeln!(output, "{}", xml);
            return Ok(());
        }
        RenderedRecord::Structured(structured) => structured,
    };

    let mut json = structured.to_json_value();
    if let (Some(message), Some(object)) = (message, json.as_object_mut()) {
        object.insert("Message".to_string(), serde_json::Value::String(message));
    }

    let text = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&json)?,
        _ => serde_json::to_string(&json)?,
    };
    try_writeln!(output, "{}", text);
    Ok(())
}

/// The formatted message, or `None` (logged) when the provider has none.
pub fn message_or_warn(message: winevt::Result<String>) -> Option<String> {
    match message {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("Failed to format event message: {}", e);
            None
        }
    }
}

/// Reads a previously saved bookmark, `None` if the file does not exist yet.
pub fn read_bookmark_file(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let markup = fs::read_to_string(path)
        .with_context(|| format!("Failed to read bookmark file `{}`", path.display()))?;
    Ok(Some(markup))
}

pub fn write_bookmark_file(path: &Path, markup: &str) -> Result<()> {
    fs::write(path, markup)
        .with_context(|| format!("Failed to write bookmark file `{}`", path.display()))
}

fn cli() -> Command {
    Command::new("winevt_dump")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Utility to read the Windows Event Log")
        .long_about(indoc!(
            r#"
            Utility to read the Windows Event Log: list channels, dump records matching a
            query, or follow a channel as new records arrive.

            On hosts without an event-log service, pass `--from-json` with a snapshot of the
            form {"channels": {"<name>": [<record>, ...]}}.
        "#
        ))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("from-json")
                .long("from-json")
                .global(true)
                .value_name("SNAPSHOT")
                .help("Reads records from a JSON snapshot instead of the live event log."),
        )
        .arg(
            Arg::new("output-target")
                .long("output")
                .short('f')
                .global(true)
                .value_name("FILE")
                .help(
                    "Writes output to the file specified instead of stdout, errors will still be printed to stderr. \
                     Will ask for confirmation before overwriting files, to allow overwriting, pass `--no-confirm-overwrite`. \
                     Will create parent directories if needed.",
                ),
        )
        .arg(
            Arg::new("no-confirm-overwrite")
                .long("no-confirm-overwrite")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("When set, will not ask for confirmation before overwriting files, useful for automation"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::Count)
                .help("-v - info, -vv - debug, -vvv - trace."),
        )
        .subcommand(channels::command())
        .subcommand(query::command())
        .subcommand(tail::command())
}

fn try_to_initialize_logging(verbosity: u8) {
    let level = match verbosity {
        0 => return,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        3 => LevelFilter::Trace,
        _ => {
            eprintln!("using more than -vvv does not affect verbosity level");
            LevelFilter::Trace
        }
    };

    // stdout may carry records, so logs go to stderr.
    if let Err(e) = WriteLogger::init(level, Config::default(), io::stderr()) {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

fn open_log(snapshot: Option<&String>) -> Result<EventLog> {
    match snapshot {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open snapshot at `{}`", path))?;
            let store = MemoryEventLog::from_json_reader(BufReader::new(file))
                .with_context(|| format!("Failed to parse snapshot at `{}`", path))?;
            Ok(EventLog::with_api(store))
        }
        None => local_log(),
    }
}

#[cfg(windows)]
fn local_log() -> Result<EventLog> {
    Ok(EventLog::local())
}

#[cfg(not(windows))]
fn local_log() -> Result<EventLog> {
    bail!("Reading the live event log requires Windows, pass `--from-json <SNAPSHOT>` instead")
}

/// If `prompt` is passed, will display a confirmation prompt before overwriting files.
fn create_output_file(path: impl AsRef<Path>, prompt: bool) -> Result<File> {
    let p = path.as_ref();

    if p.is_dir() {
        bail!(
            "There is a directory at {}, refusing to overwrite",
            p.display()
        );
    }

    if p.exists() {
        if prompt {
            match Confirm::new()
                .with_prompt(format!(
                    "Are you sure you want to override output file at {}",
                    p.display()
                ))
                .default(false)
                .interact()
            {
                Ok(true) => Ok(File::create(p)?),
                Ok(false) => bail!("Cancelled"),
                Err(e) => Err(format_err!(
                    "Failed to write confirmation prompt to term caused by\n{}",
                    e
                )),
            }
        } else {
            Ok(File::create(p)?)
        }
    } else {
        // Ok to assume p is not an existing directory
        match p.parent() {
            Some(parent) => {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    fs::create_dir_all(parent)?;
                }
                Ok(File::create(p)?)
            }
            None => bail!("Output file cannot be root."),
        }
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let (name, sub) = matches
        .subcommand()
        .context("A subcommand is required")?;

    try_to_initialize_logging(sub.get_count("verbose"));
    let log = open_log(sub.get_one::<String>("from-json"))?;

    let mut output: Box<dyn Write> = match sub.get_one::<String>("output-target") {
        Some(path) => {
            let file = create_output_file(path, !sub.get_flag("no-confirm-overwrite"))
                .with_context(|| {
                    format!("An error occurred while creating output file at `{}`", path)
                })?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(io::stdout()),
    };

    match name {
        "channels" => channels::run(&log, sub, output.as_mut())?,
        "query" => query::run(&log, sub, OutputFormat::from_matches(sub), output.as_mut())?,
        "tail" => tail::run(&log, sub, OutputFormat::from_matches(sub), output.as_mut())?,
        other => bail!("Unknown subcommand `{}`", other),
    }

    output.flush()?;
    Ok(())
}

fn main() {
    let matches = cli().get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("{:?}", e);
        exit(1);
    }
}
