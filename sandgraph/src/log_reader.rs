//! Line-oriented trace log reader.
//!
//! The sandbox writes one self-describing JSON record per line. Logs can be
//! large, so records are yielded lazily; a malformed line is skipped rather
//! than failing the whole analysis, and a missing log file is treated as an
//! empty one (not every analysis enables every tracer).

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde_json::Value;

/// Stream the records of a single log file, in file order.
pub fn read_records(path: &Path) -> Box<dyn Iterator<Item = Value>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!("log file {} not readable ({err}), treating as empty", path.display());
            return Box::new(std::iter::empty());
        }
    };

    let path = path.to_path_buf();
    let lines = BufReader::new(file).lines().enumerate();
    Box::new(lines.filter_map(move |(lineno, line)| {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!("{}:{}: unreadable line ({err})", path.display(), lineno + 1);
                return None;
            }
        };
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(record) if record.is_object() => Some(record),
            Ok(_) => {
                debug!("{}:{}: record is not an object", path.display(), lineno + 1);
                None
            }
            Err(err) => {
                debug!("{}:{}: malformed record ({err})", path.display(), lineno + 1);
                None
            }
        }
    }))
}

/// Stream the records of several log files, file by file in the given order.
pub fn read_all_records(paths: &[PathBuf]) -> impl Iterator<Item = Value> {
    let paths: Vec<PathBuf> = paths.to_vec();
    paths.into_iter().flat_map(|path| read_records(&path))
}
