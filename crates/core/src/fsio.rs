//! Small file helpers shared by the manifest store and the sandbox builder.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Write `bytes` to `path` so that readers observe either the previous
/// content or the new content, never a partial file.
///
/// The data goes to a sibling temp file (random suffix, same directory so the
/// rename stays on one filesystem), is flushed to disk, then renamed over the
/// target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix: u64 = rand::random();
    let tmp = dir.join(format!(".{file_name}_{suffix:016x}.tmp"));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Last `lines` lines of a text file. A missing file yields an empty tail.
pub fn read_tail(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    let content = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| (*l).to_string()).collect())
}

/// Append one line to a log file, creating it if needed.
pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}
