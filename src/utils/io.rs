use crate::hash::{MinimiserHasher, Shape};
use anyhow::{Context, Result, ensure};
use memmap2::Mmap;
use needletail::parse_fastx_file;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Streams `(id, sequence)` pairs of a FASTA/FASTQ file (gzip transparent).
pub fn for_each_record(
    path: &Path,
    mut f: impl FnMut(&[u8], &[u8]) -> Result<()>,
) -> Result<()> {
    let mut reader = parse_fastx_file(path)
        .with_context(|| format!("Cannot open sequence file {}", path.display()))?;
    while let Some(record) = reader.next() {
        let record =
            record.with_context(|| format!("Malformed record in {}", path.display()))?;
        f(record.id(), &record.seq())?;
    }
    Ok(())
}

/// Computes the canonical minimisers of every sequence in `files` and feeds
/// them to `sink`.
pub fn hash_sequence_files(
    files: &[PathBuf],
    hasher: &mut MinimiserHasher,
    mut sink: impl FnMut(u64),
) -> Result<()> {
    let mut scratch: Vec<u64> = Vec::new();
    for file in files {
        for_each_record(file, |_, seq| {
            scratch.clear();
            hasher.hashes_into(seq, &mut scratch);
            for &hash in &scratch {
                sink(hash);
            }
            Ok(())
        })?;
    }
    Ok(())
}

/// Streams the raw little-endian u64 values of a `.minimiser` file via mmap.
pub fn for_each_minimiser_value(path: &Path, mut f: impl FnMut(u64)) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("Cannot open minimiser file {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };
    ensure!(mmap.len() % 8 == 0, "The minimiser file {} is truncated.", path.display());
    for chunk in mmap.chunks_exact(8) {
        f(u64::from_le_bytes(chunk.try_into()?));
    }
    Ok(())
}

pub fn write_minimiser_values(path: &Path, values: impl Iterator<Item = u64>) -> Result<u64> {
    let mut writer = BufWriter::new(
        File::create(path).with_context(|| format!("Cannot create {}", path.display()))?,
    );
    let mut count = 0u64;
    for value in values {
        writer.write_all(&value.to_le_bytes())?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

/// Sidecar of a `.minimiser` file:
/// `<shape-bits>\t<window>\t<cutoff>\t<count>\n`.
#[derive(Debug, Clone, PartialEq)]
pub struct MinimiserHeader {
    pub shape: Shape,
    pub window: u32,
    pub cutoff: u16,
    pub count: u64,
}

pub fn write_minimiser_header(path: &Path, header: &MinimiserHeader) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Cannot create {}", path.display()))?;
    writeln!(
        file,
        "{}\t{}\t{}\t{}",
        header.shape.to_literal(),
        header.window,
        header.cutoff,
        header.count
    )?;
    Ok(())
}

pub fn read_minimiser_header(path: &Path) -> Result<MinimiserHeader> {
    let mut content = String::new();
    File::open(path)
        .with_context(|| format!("Cannot open header file {}", path.display()))?
        .read_to_string(&mut content)?;
    let mut fields = content.trim_end().split('\t');
    let (Some(shape), Some(window), Some(cutoff), Some(count)) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        anyhow::bail!("Malformed minimiser header {}", path.display());
    };
    Ok(MinimiserHeader {
        shape: Shape::from_string(shape)?,
        window: window.parse()?,
        cutoff: cutoff.parse()?,
        count: count.parse()?,
    })
}

#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub id: String,
    pub seq: Vec<u8>,
}

/// Pulls query records in bounded chunks so that arbitrarily large query
/// files never exhaust memory.
pub struct ChunkedQueryReader {
    reader: Box<dyn needletail::parser::FastxReader>,
}

impl ChunkedQueryReader {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = parse_fastx_file(path)
            .with_context(|| format!("Cannot open query file {}", path.display()))?;
        Ok(ChunkedQueryReader { reader })
    }

    /// Fills `out` with up to `limit` records; returns false once the file is
    /// exhausted and nothing was read.
    pub fn next_chunk(&mut self, limit: usize, out: &mut Vec<QueryRecord>) -> Result<bool> {
        out.clear();
        while out.len() < limit {
            let Some(record) = self.reader.next() else { break };
            let record = record.context("Malformed query record")?;
            out.push(QueryRecord {
                id: String::from_utf8_lossy(record.id()).into_owned(),
                seq: record.seq().into_owned(),
            });
        }
        Ok(!out.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimiser_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.minimiser");
        let values = vec![0u64, 1, u64::MAX, 0xDEADBEEF];
        assert_eq!(write_minimiser_values(&path, values.iter().copied()).unwrap(), 4);
        let mut read = Vec::new();
        for_each_minimiser_value(&path, |v| read.push(v)).unwrap();
        assert_eq!(read, values);
    }

    #[test]
    fn truncated_minimiser_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.minimiser");
        std::fs::write(&path, [0u8; 7]).unwrap();
        assert!(for_each_minimiser_value(&path, |_| {}).is_err());
    }

    #[test]
    fn header_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.header");
        let header = MinimiserHeader {
            shape: Shape::from_string("1101").unwrap(),
            window: 8,
            cutoff: 3,
            count: 42,
        };
        write_minimiser_header(&path, &header).unwrap();
        assert_eq!(read_minimiser_header(&path).unwrap(), header);
    }

    #[test]
    fn fasta_records_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.fa");
        std::fs::write(&path, ">one\nACGT\n>two\nGGGG\n").unwrap();
        let mut ids = Vec::new();
        for_each_record(&path, |id, seq| {
            ids.push((String::from_utf8_lossy(id).into_owned(), seq.len()));
            Ok(())
        })
        .unwrap();
        assert_eq!(ids, vec![("one".into(), 4), ("two".into(), 4)]);

        let mut reader = ChunkedQueryReader::open(&path).unwrap();
        let mut chunk = Vec::new();
        assert!(reader.next_chunk(1, &mut chunk).unwrap());
        assert_eq!(chunk[0].id, "one");
        assert!(reader.next_chunk(10, &mut chunk).unwrap());
        assert_eq!(chunk.len(), 1);
        assert!(!reader.next_chunk(10, &mut chunk).unwrap());
    }
}
