use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub fn open_reader<P: AsRef<Path>>(path: P) -> Result<BufReader<File>> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("Failed to open file: {:?}", path.as_ref()))?;
    Ok(BufReader::new(file))
}

pub fn create_writer<P: AsRef<Path>>(path: P) -> Result<BufWriter<File>> {
    let file = File::create(path.as_ref())
        .with_context(|| format!("Failed to create file: {:?}", path.as_ref()))?;
    Ok(BufWriter::new(file))
}

/// Reads the next line without its terminator. `None` means end of stream.
/// A blank line is still a line: positional files may legitimately hold
/// empty generations.
pub fn next_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = String::new();
    let read = reader.read_line(&mut buf).context("Failed to read line")?;
    if read == 0 {
        return Ok(None);
    }
    if buf.ends_with('\n') {
        buf.pop();
        if buf.ends_with('\r') {
            buf.pop();
        }
    }
    Ok(Some(buf))
}

pub fn read_lines<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let mut reader = open_reader(&path)?;
    let mut lines = Vec::new();
    while let Some(line) = next_line(&mut reader)
        .with_context(|| format!("Failed to read {:?}", path.as_ref()))?
    {
        lines.push(line);
    }
    Ok(lines)
}

pub fn write_lines<P: AsRef<Path>, S: AsRef<str>>(path: P, lines: &[S]) -> Result<()> {
    let mut writer = create_writer(&path)?;
    for line in lines {
        writeln!(writer, "{}", line.as_ref())?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush {:?}", path.as_ref()))?;
    Ok(())
}

/// Progress bar used by the long-running scans.
pub fn progress_bar(len: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Spinner for streams whose length is unknown up front.
pub fn progress_spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {pos} {msg}")?,
    );
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn next_line_keeps_blank_lines_and_strips_terminators() {
        let mut reader = Cursor::new("a\r\n\nb");
        assert_eq!(next_line(&mut reader).unwrap().as_deref(), Some("a"));
        assert_eq!(next_line(&mut reader).unwrap().as_deref(), Some(""));
        assert_eq!(next_line(&mut reader).unwrap().as_deref(), Some("b"));
        assert_eq!(next_line(&mut reader).unwrap(), None);
    }

    #[test]
    fn write_then_read_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines.txt");
        write_lines(&path, &["one", "", "three"]).unwrap();
        assert_eq!(read_lines(&path).unwrap(), vec!["one", "", "three"]);
    }
}
