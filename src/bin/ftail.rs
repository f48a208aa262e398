use std::io;
use std::io::Write;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Arg, ArgAction, Command};

use ftail::FollowOptions;

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let app = Command::new("ftail")
        .about("follow an append-only file across rotations, like `tail -F`")
        .arg(
            Arg::new("FILE")
                .required(true)
                .help("path of the file to follow"),
        )
        .arg(
            Arg::new("POSITION_FILE")
                .long("position-file")
                .short('p')
                .help("path of the file used to persist the read position"),
        )
        .arg(
            Arg::new("GLOB")
                .long("glob")
                .short('g')
                .action(ArgAction::Append)
                .help("glob pattern matching rotated predecessors of FILE (repeatable)"),
        );

    let args = app.get_matches();
    let path = args.get_one::<String>("FILE").unwrap();

    let mut options = FollowOptions::default();
    if let Some(position_file) = args.get_one::<String>("POSITION_FILE") {
        options = options.with_position_file_path(position_file);
    }
    if let Some(globs) = args.get_many::<String>("GLOB") {
        options = options.with_rotated_file_globs(globs.cloned().collect());
    }

    let mut reader = ftail::open(path, options).with_context(|| format!("opening {path}"))?;

    // A closed stdout (`ftail ... | head`, for instance) is the clean way
    // for a follow loop to end; everything else is a failure.
    let mut stdout = io::stdout();
    loop {
        match io::copy(&mut reader, &mut stdout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e).context("copying to stdout"),
        }
        match stdout.flush() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e).context("flushing stdout"),
        }
        thread::sleep(Duration::from_secs(1));
    }
}
