//! Append-only JSONL files, one per participant per day.
//!
//! Separate files mean concurrent participants never interleave partial
//! lines; [`read_entries`] merges them back into one timeline.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::LogEntry;

/// Appends entries to `<logs_dir>/<date>_<participant>.jsonl`.
pub struct ParticipantLogWriter {
    participant: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ParticipantLogWriter {
    /// Open (or create) today's file for `participant`, creating `logs_dir`
    /// if needed.
    pub fn new(logs_dir: impl AsRef<Path>, participant: impl Into<String>) -> std::io::Result<Self> {
        let participant = participant.into();
        let logs_dir = logs_dir.as_ref();
        fs::create_dir_all(logs_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = logs_dir.join(format!("{}_{}.jsonl", date, file_safe(&participant)));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            participant,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line and flush.
    pub fn write(&self, entry: &LogEntry) -> std::io::Result<()> {
        let json = entry
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

impl Drop for ParticipantLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every `.jsonl` file under `logs_dir`, sorted by timestamp.
///
/// Lines that fail to parse are skipped.
pub fn read_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<LogEntry>> {
    let logs_dir = logs_dir.as_ref();
    if !logs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for dir_entry in fs::read_dir(logs_dir)? {
        let path = dir_entry?.path();
        if path.extension().is_some_and(|e| e == "jsonl") {
            let content = fs::read_to_string(&path)?;
            entries.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .filter_map(|line| LogEntry::from_json_line(line).ok()),
            );
        }
    }

    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}

fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_writer_appends_lines() {
        let temp = TempDir::new().unwrap();
        let writer = ParticipantLogWriter::new(temp.path().join("logs"), "replica-1").unwrap();

        writer.write(&LogEntry::new("info", "replica-1", "t", "first")).unwrap();
        writer.write(&LogEntry::new("debug", "replica-1", "t", "second")).unwrap();

        let content = fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("second"));
        assert!(writer.path().to_string_lossy().ends_with("_replica-1.jsonl"));
    }

    #[test]
    fn test_read_entries_merges_participants() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("logs");

        let authority = ParticipantLogWriter::new(&dir, "authority").unwrap();
        let replica = ParticipantLogWriter::new(&dir, "replica").unwrap();
        authority.write(&LogEntry::new("info", "authority", "t", "sent")).unwrap();
        replica.write(&LogEntry::new("info", "replica", "t", "applied")).unwrap();
        fs::write(dir.join("junk.jsonl"), "not json\n").unwrap();

        let entries = read_entries(&dir).unwrap();
        assert_eq!(entries.len(), 2);
        let participants: Vec<_> = entries.iter().map(|e| e.participant.as_str()).collect();
        assert!(participants.contains(&"authority"));
        assert!(participants.contains(&"replica"));
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_entries(temp.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_file_safe_names() {
        assert_eq!(file_safe("a/b c"), "a_b_c");
    }
}
