//! Append-only log files in a host directory, standing in for the
//! aggregator's SD card.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use canopy_core::aggregator::{LogError, LogName, LogSink};

pub struct FileLogSink {
    dir: PathBuf,
}

impl FileLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

/// Copy as much of `text` as fits.
fn truncated<const N: usize>(text: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for c in text.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

impl LogSink for FileLogSink {
    fn append_line(&mut self, name: &LogName, line: &str) -> Result<(), LogError> {
        let fail = |e: std::io::Error| LogError::Append {
            name: truncated(name.as_str()),
            details: truncated(&e.to_string()),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(name.as_str()))
            .map_err(fail)?;
        writeln!(file, "{line}").map_err(fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::MacAddress;

    #[test]
    fn test_lines_are_appended() {
        let dir = std::env::temp_dir().join(format!("canopy-sink-{}", std::process::id()));
        let mut sink = FileLogSink::new(&dir).unwrap();
        let name = LogName::system(&MacAddress([0xC4, 0x5B, 0xBE, 0xE4, 0xFE, 0x08])).unwrap();

        sink.append_line(&name, "first").unwrap();
        sink.append_line(&name, "second").unwrap();

        let text = fs::read_to_string(dir.join("C45BBEE4FE08_sys.log")).unwrap();
        assert_eq!(text, "first\nsecond\n");
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_truncated() {
        let s: heapless::String<4> = truncated("abcdef");
        assert_eq!(s.as_str(), "abcd");
    }
}
