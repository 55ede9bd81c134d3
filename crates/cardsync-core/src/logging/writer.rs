//! Append-only JSONL file per peer instance.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::LogLine;

/// Appends log lines to `<dir>/raw/<date>_<peer>.jsonl`
pub struct PeerLogWriter {
    peer: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl PeerLogWriter {
    /// Open (or create) today's file for `peer`, creating `raw/` as needed.
    pub fn new(logs_dir: impl AsRef<Path>, peer: impl Into<String>) -> std::io::Result<Self> {
        let peer = peer.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, peer));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            peer,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line and flush it, so a crash loses at most the line in
    /// flight.
    pub fn write(&self, line: &LogLine) -> std::io::Result<()> {
        let json = line
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for PeerLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every peer's lines under `<dir>/raw`, ordered by timestamp.
///
/// Lines that fail to parse are skipped.
pub fn read_all_lines(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<LogLine>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut lines = Vec::new();
    for dir_entry in fs::read_dir(&raw_dir)? {
        let path = dir_entry?.path();
        if path.extension().map(|e| e != "jsonl").unwrap_or(true) {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        lines.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .filter_map(|line| LogLine::from_json_line(line).ok()),
        );
    }

    lines.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_creates_raw_dir() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let writer = PeerLogWriter::new(&logs_dir, "offer").unwrap();

        assert!(logs_dir.join("raw").is_dir());
        assert!(writer.path().exists());
        assert!(writer.path().to_string_lossy().ends_with("_offer.jsonl"));
    }

    #[test]
    fn test_two_peers_merge_in_order() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let offer = PeerLogWriter::new(&logs_dir, "offer").unwrap();
        let answer = PeerLogWriter::new(&logs_dir, "answer").unwrap();

        offer
            .write(&LogLine::new("info", "offer", "t", "offer created"))
            .unwrap();
        answer
            .write(&LogLine::new("info", "answer", "t", "answer created"))
            .unwrap();
        // A torn line from a crashed writer
        std::fs::write(logs_dir.join("raw").join("junk.jsonl"), "{\"ts\":").unwrap();

        let lines = read_all_lines(&logs_dir).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ts <= lines[1].ts);

        let peers: Vec<_> = lines.iter().map(|l| l.peer.as_str()).collect();
        assert!(peers.contains(&"offer"));
        assert!(peers.contains(&"answer"));
    }

    #[test]
    fn test_missing_dir_reads_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_all_lines(temp.path().join("nope")).unwrap().is_empty());
    }
}
