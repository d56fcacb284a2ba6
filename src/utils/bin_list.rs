use anyhow::{Context, Result, bail, ensure};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub const MINIMISER_EXTENSION: &str = "minimiser";

/// Reads a bin list: one user bin per line, whitespace-separated file paths,
/// `#` lines are comments. Every referenced file must exist.
pub fn read_bin_list(path: &Path) -> Result<Vec<Vec<PathBuf>>> {
    let file =
        File::open(path).with_context(|| format!("Cannot open bin list {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut bins: Vec<Vec<PathBuf>> = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let files: Vec<PathBuf> = line.split_whitespace().map(PathBuf::from).collect();
        for file in &files {
            ensure!(file.exists(), "The file {} does not exist.", file.display());
        }
        bins.push(files);
    }

    ensure!(!bins.is_empty(), "The bin list {} is empty.", path.display());
    Ok(bins)
}

pub fn is_minimiser_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == MINIMISER_EXTENSION)
}

/// A bin list is either all sequence files or all minimiser files; mixing the
/// two in one list is rejected.
pub fn all_minimiser_input(bins: &[Vec<PathBuf>]) -> Result<bool> {
    let mut minimiser = 0usize;
    let mut total = 0usize;
    for files in bins {
        for file in files {
            total += 1;
            minimiser += usize::from(is_minimiser_file(file));
        }
    }
    if minimiser != 0 && minimiser != total {
        bail!("The bin list mixes sequence files and minimiser files.");
    }
    Ok(minimiser == total && total > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_comments_and_multi_file_bins() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.fa");
        let b = dir.path().join("b.fa");
        let c = dir.path().join("c.fa");
        for path in [&a, &b, &c] {
            std::fs::write(path, ">s\nACGT\n").unwrap();
        }
        let list = dir.path().join("bins.txt");
        let mut file = File::create(&list).unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file, "{}", a.display()).unwrap();
        writeln!(file, "{} {}", b.display(), c.display()).unwrap();
        drop(file);

        let bins = read_bin_list(&list).unwrap();
        assert_eq!(bins.len(), 2);
        assert_eq!(bins[1].len(), 2);
        assert!(!all_minimiser_input(&bins).unwrap());
    }

    #[test]
    fn empty_and_missing_inputs_fail() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("bins.txt");
        std::fs::write(&list, "# only comments\n").unwrap();
        assert!(read_bin_list(&list).unwrap_err().to_string().contains("empty"));

        std::fs::write(&list, "/nonexistent/file.fa\n").unwrap();
        assert!(read_bin_list(&list).unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn mixed_content_is_rejected() {
        let bins =
            vec![vec![PathBuf::from("a.minimiser")], vec![PathBuf::from("b.fa")]];
        assert!(all_minimiser_input(&bins).is_err());
        let bins = vec![vec![PathBuf::from("a.minimiser")], vec![PathBuf::from("b.minimiser")]];
        assert!(all_minimiser_input(&bins).unwrap());
    }
}
