use crate::hash::Shape;
use crate::hibf::Hibf;
use crate::ibf::Ibf;
use anyhow::{Context, Result, bail};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const INDEX_MAGIC: [u8; 4] = *b"RPTX";
pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub tmax: usize,
    pub fpr: f64,
    pub relaxed_fpr: f64,
    pub sketch_bits: u8,
    pub empty_bin_fraction: f64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            tmax: 64,
            fpr: 0.05,
            relaxed_fpr: 0.3,
            sketch_bits: 12,
            empty_bin_fraction: 0.0001,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum IndexStructure {
    Ibf(Ibf),
    Hibf(Hibf),
}

/// The persistent index: everything a search needs to reproduce the build's
/// hashing, plus either a flat or a hierarchical filter.
#[derive(Debug, Serialize, Deserialize)]
pub struct RaptorIndex {
    pub window: u32,
    pub shape: Shape,
    pub parts: u32,
    /// Outer index is the user bin id; the inner list holds the files
    /// contributing to that user bin. Never renumbered.
    pub bin_path: Vec<Vec<PathBuf>>,
    pub config: IndexConfig,
    pub structure: IndexStructure,
}

impl RaptorIndex {
    pub fn ibf(&self) -> Result<&Ibf> {
        match &self.structure {
            IndexStructure::Ibf(ibf) => Ok(ibf),
            IndexStructure::Hibf(_) => bail!("The index is an HIBF, but a flat IBF was expected."),
        }
    }

    pub fn hibf(&self) -> Result<&Hibf> {
        match &self.structure {
            IndexStructure::Hibf(hibf) => Ok(hibf),
            IndexStructure::Ibf(_) => bail!("The index is a flat IBF, but an HIBF was expected."),
        }
    }

    pub fn hibf_mut(&mut self) -> Result<&mut Hibf> {
        match &mut self.structure {
            IndexStructure::Hibf(hibf) => Ok(hibf),
            IndexStructure::Ibf(_) => bail!("The index is a flat IBF, but an HIBF was expected."),
        }
    }

    pub fn is_hibf(&self) -> bool {
        matches!(self.structure, IndexStructure::Hibf(_))
    }

    pub fn store(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
        }
        let file = File::create(path)
            .with_context(|| format!("Cannot create output file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&INDEX_MAGIC)?;
        writer.write_u32::<LittleEndian>(INDEX_VERSION)?;
        bincode2::serialize_into(&mut writer, self)
            .map_err(|e| anyhow::anyhow!("Failed to write index: {}", e))?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Cannot open index file {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .with_context(|| format!("The index file {} is truncated.", path.display()))?;
        if magic != INDEX_MAGIC {
            bail!("The file {} is not a raptor index.", path.display());
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != INDEX_VERSION {
            bail!(
                "Unsupported index version {} in {} (expected {}).",
                version,
                path.display(),
                INDEX_VERSION
            );
        }
        bincode2::deserialize_from(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to read index {}: {}", path.display(), e))
    }
}

/// File name of one partition of a partitioned index: `<base>_<part>`.
pub fn part_path(base: &Path, part: u32) -> PathBuf {
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(format!("_{part}"));
    base.with_file_name(name)
}
