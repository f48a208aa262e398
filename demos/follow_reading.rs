use std::io::Read;

use clap::{Arg, Command};
use ftail::FollowOptions;

// running this with a log path will keep printing whatever gets appended,
// across rotations, resuming where it left off on each execution
fn main() -> Result<(), anyhow::Error> {
    let app = Command::new("follow_reading")
        .arg(
            Arg::new("FILE_PATH")
                .long("path")
                .short('p')
                .required(true)
                .help("path to file that is possibly rotated"),
        )
        .arg(
            Arg::new("POSITION_FILE")
                .long("position-file")
                .short('r')
                .help("path to file used to persist the read position"),
        );

    let args = app.get_matches();

    let mut options = FollowOptions::default().with_read_from_head(true);
    if let Some(position_file) = args.get_one::<String>("POSITION_FILE") {
        options = options.with_position_file_path(position_file);
    }
    let mut reader = ftail::open(args.get_one::<String>("FILE_PATH").unwrap(), options)?;

    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf)? {
            0 => std::thread::sleep(std::time::Duration::from_millis(200)),
            n => print!("{}", String::from_utf8_lossy(&buf[..n])),
        }
    }
}
