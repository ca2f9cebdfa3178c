use std::fs::{DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use env_logger::{Builder, Env, Target};

/// Sets up the global logger.
///
/// Debug runs log to stderr. Otherwise records are appended to `log_path`,
/// falling back to stderr if the file cannot be opened. `RUST_LOG` overrides
/// the default `info` filter.
pub fn init(log_path: &Path, debug: bool) {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    let mut fallback = None;
    if !debug {
        match open_log_file(log_path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => fallback = Some(e),
        }
    }
    builder.init();

    if let Some(e) = fallback {
        log::warn!(
            "failed to open log file {}, logging to stderr: {}",
            log_path.display(),
            e
        );
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        DirBuilder::new().recursive(true).mode(0o711).create(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
