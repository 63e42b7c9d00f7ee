//! pgvc - command-line host for the snapshot store.

use std::path::PathBuf;
use std::process::ExitCode;

use pgvc::repository::{CancellationToken, Repository, RepositoryOptions, SnapshotOptions};
use pgvc::telemetry;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Init,
    Snapshot { message: String, author: Option<String> },
    Stash { message: String, author: Option<String> },
    StashList,
    StashApply { index: u64 },
    Status,
    Log { limit: Option<usize> },
    Branches,
    Breaker { reset: bool },
}

#[derive(Debug)]
struct Cli {
    project: PathBuf,
    verbose: bool,
    command: Command,
}

enum Parsed {
    Run(Cli),
    Help,
    Version,
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(Parsed::Run(cli)) => cli,
        Ok(Parsed::Help) => {
            print_help();
            return ExitCode::SUCCESS;
        }
        Ok(Parsed::Version) => {
            println!("pgvc v{}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("Error: {}", message);
            eprintln!("Run 'pgvc --help' for usage.");
            return ExitCode::from(2);
        }
    };

    telemetry::init(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_args(args: &[String]) -> Result<Parsed, String> {
    let mut project = PathBuf::from(".");
    let mut verbose = false;
    let mut message: Option<String> = None;
    let mut author: Option<String> = None;
    let mut limit: Option<usize> = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-C" => {
                i += 1;
                project = PathBuf::from(args.get(i).ok_or("-C needs a directory")?);
            }
            "-v" | "--verbose" => verbose = true,
            "-m" | "--message" => {
                i += 1;
                message = Some(args.get(i).ok_or("-m needs a message")?.clone());
            }
            "-a" | "--author" => {
                i += 1;
                author = Some(args.get(i).ok_or("-a needs an author")?.clone());
            }
            "-n" => {
                i += 1;
                let value = args.get(i).ok_or("-n needs a number")?;
                limit = Some(value.parse().map_err(|_| format!("invalid number '{}'", value))?);
            }
            "-h" | "--help" => return Ok(Parsed::Help),
            "--version" => return Ok(Parsed::Version),
            arg if arg.starts_with('-') => return Err(format!("unknown option: {}", arg)),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let name = positional.next().ok_or("missing command")?;
    let require_message = |message: Option<String>| message.ok_or(format!("'{}' needs -m <message>", name));
    let command = match name.as_str() {
        "init" => Command::Init,
        "snapshot" => Command::Snapshot {
            message: require_message(message)?,
            author,
        },
        "stash" => Command::Stash {
            message: require_message(message)?,
            author,
        },
        "stash-list" => Command::StashList,
        "stash-apply" => {
            let value = positional.next().ok_or("stash-apply needs a stash index")?;
            let index = value.parse().map_err(|_| format!("invalid stash index '{}'", value))?;
            Command::StashApply { index }
        }
        "status" => Command::Status,
        "log" => Command::Log { limit },
        "branches" => Command::Branches,
        "breaker" => match positional.next().as_deref() {
            None => Command::Breaker { reset: false },
            Some("reset") => Command::Breaker { reset: true },
            Some(other) => return Err(format!("unknown breaker action '{}'", other)),
        },
        other => return Err(format!("unknown command '{}'", other)),
    };
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument '{}'", extra));
    }

    Ok(Parsed::Run(Cli {
        project,
        verbose,
        command,
    }))
}

fn default_author() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "pgvc".to_string())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if cli.command == Command::Init {
        let repo = Repository::init(&cli.project)?;
        println!("Initialized empty repository in {}", repo.control_dir().display());
        return Ok(());
    }

    let repo = Repository::open_with(RepositoryOptions::new(&cli.project))?;
    let recovery = repo.last_recovery();
    if recovery.marker_in_use {
        eprintln!("Another pgvc process is writing to this project; try again once it finishes");
    }
    if !recovery.is_clean() {
        eprintln!(
            "Recovered from an interrupted operation ({} backup set(s) kept under .pgvc-work/recovered)",
            recovery.quarantined.len()
        );
    }

    match cli.command {
        Command::Init => {}
        Command::Snapshot { message, author } => {
            let author = author.unwrap_or_else(default_author);
            let summary = repo.create_snapshot(&message, &author, &SnapshotOptions::default())?;
            println!(
                "[{} {}] {} ({} files, {} hashed)",
                summary.reference.trim_start_matches("refs/heads/"),
                summary.commit.short(),
                message,
                summary.files,
                summary.hashed
            );
        }
        Command::Stash { message, author } => {
            let author = author.unwrap_or_else(default_author);
            let summary = repo.create_stash(&message, &author)?;
            println!("Saved stash {} ({}): {}", summary.index, summary.commit.short(), message);
        }
        Command::StashList => {
            let stashes = repo.list_stashes()?;
            if stashes.is_empty() {
                println!("No stashes.");
            }
            for stash in stashes {
                println!(
                    "stash {}: {} {} {}",
                    stash.index,
                    stash.commit.short(),
                    stash.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    stash.message.lines().next().unwrap_or("")
                );
            }
        }
        Command::StashApply { index } => {
            let summary = repo.apply_stash(index, &CancellationToken::new())?;
            println!(
                "Applied stash {}: {} written, {} deleted, {} unchanged",
                index, summary.written, summary.deleted, summary.unchanged
            );
        }
        Command::Status => {
            let changes = repo.status()?;
            if changes.is_empty() {
                println!("Nothing changed.");
            }
            for change in changes {
                println!("{}", change);
            }
        }
        Command::Log { limit } => {
            for info in repo.history(limit)? {
                println!(
                    "{} {} {} {}",
                    info.id.short(),
                    info.commit.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    info.commit.author,
                    info.summary()
                );
            }
        }
        Command::Branches => {
            let current = repo.refs().head_branch()?;
            for (branch, commit) in repo.list_branches()? {
                let marker = if current.as_ref() == Some(&branch) { '*' } else { ' ' };
                println!("{} {} {}", marker, branch, commit.short());
            }
        }
        Command::Breaker { reset } => {
            if reset {
                repo.reset_breaker()?;
            }
            println!("{}", repo.breaker_status()?);
        }
    }
    Ok(())
}

fn print_help() {
    println!("pgvc - embedded snapshot store");
    println!();
    println!("Usage: pgvc [OPTIONS] <COMMAND>");
    println!();
    println!("Commands:");
    println!("  init                        Create .pgvc in the project directory");
    println!("  snapshot -m MSG [-a NAME]   Snapshot the working tree onto HEAD");
    println!("  stash -m MSG [-a NAME]      Save the working tree as a stash");
    println!("  stash-list                  List stashes");
    println!("  stash-apply N               Restore the working tree to stash N");
    println!("  status                      Show changes since HEAD");
    println!("  log [-n N]                  Show snapshot history");
    println!("  branches                    List branches");
    println!("  breaker [reset]             Show or reset the circuit breaker");
    println!();
    println!("Options:");
    println!("  -C DIR                      Project directory (default: .)");
    println!("  -v, --verbose               Enable debug logging");
    println!("  -h, --help                  Show this help message");
    println!("  --version                   Show version");
}
