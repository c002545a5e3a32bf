use env_logger::Target;
use log::LevelFilter;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

fn level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn open_log_file(path: &Path) -> io::Result<Target> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Target::Pipe(Box::new(file)))
}

/// Initialise `env_logger`. `RUST_LOG` wins over `-v`.
pub fn init(log_file: Option<&Path>, verbose: u8) {
    // Fall back to stderr when the file cannot be opened.
    let target = match log_file.map(open_log_file) {
        Some(Ok(target)) => target,
        Some(Err(err)) => {
            eprintln!("Cannot open log file, logging to stderr: {}", err);
            Target::Stderr
        }
        None => Target::Stderr,
    };

    env_logger::Builder::new()
        .filter_level(level(verbose))
        .parse_default_env()
        .target(target)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_level() {
        assert_eq!(level(0), LevelFilter::Info);
        assert_eq!(level(1), LevelFilter::Debug);
        assert_eq!(level(5), LevelFilter::Trace);
    }

    #[test]
    fn log_file_parent_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/toolbox.log");
        assert!(open_log_file(&path).is_ok());
        assert!(path.exists());
    }
}
