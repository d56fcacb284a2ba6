use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Serialises result lines from parallel search workers into one output file.
/// Queries finish in arbitrary order; each line is written atomically.
pub struct SyncOut {
    writer: Mutex<BufWriter<File>>,
}

impl SyncOut {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Cannot create output file {}", path.display()))?;
        Ok(SyncOut { writer: Mutex::new(BufWriter::new(file)) })
    }

    pub fn write(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock().expect("output writer poisoned");
        writer.write_all(line.as_bytes())?;
        Ok(())
    }

    /// The header names every user bin once, then marks the start of the
    /// per-query section.
    pub fn write_header(&self, bin_paths: &[Vec<PathBuf>]) -> Result<()> {
        let mut writer = self.writer.lock().expect("output writer poisoned");
        for (bin_id, files) in bin_paths.iter().enumerate() {
            let joined = files
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(",");
            writeln!(writer, "#{bin_id}\t{joined}")?;
        }
        writeln!(writer, "#QUERY_NAME\tUSER_BINS")?;
        Ok(())
    }

    pub fn finish(self) -> Result<()> {
        let mut writer = self.writer.into_inner().expect("output writer poisoned");
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_then_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let out = SyncOut::create(&path).unwrap();
        out.write_header(&[vec![PathBuf::from("a.fa")], vec![PathBuf::from("b.fa"), PathBuf::from("c.fa")]])
            .unwrap();
        out.write("q1\t0,1\n").unwrap();
        out.finish().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "#0\ta.fa\n#1\tb.fa,c.fa\n#QUERY_NAME\tUSER_BINS\nq1\t0,1\n");
    }
}
