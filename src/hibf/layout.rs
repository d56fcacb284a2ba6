use anyhow::{Context, Result, bail, ensure};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// One user bin placed in a layout node. `bin_index` is the first technical
/// bin inside the node, `number_of_bins` the split width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutRecord {
    pub user_bin: usize,
    pub bin_index: usize,
    pub number_of_bins: usize,
}

/// One IBF of the layout tree. Children are merged bins, keyed by the
/// technical bin they occupy in this node.
#[derive(Debug, Default, PartialEq)]
pub struct LayoutNode {
    pub max_bin_id: usize,
    pub technical_bins: usize,
    pub children: Vec<(usize, LayoutNode)>,
    pub records: Vec<LayoutRecord>,
}

impl LayoutNode {
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|(_, child)| child.node_count()).sum::<usize>()
    }

    fn at_path_mut(&mut self, path: &[usize]) -> Option<&mut LayoutNode> {
        match path {
            [] => Some(self),
            [head, rest @ ..] => self
                .children
                .iter_mut()
                .find(|(bin, _)| bin == head)
                .and_then(|(_, child)| child.at_path_mut(rest)),
        }
    }

    /// Derives `technical_bins` bottom-up and checks that no two placements
    /// claim the same bin.
    fn finalise(&mut self) -> Result<()> {
        let mut highest = 0usize;
        let mut claimed: Vec<(usize, usize)> = Vec::new();
        for (bin, child) in &mut self.children {
            child.finalise()?;
            claimed.push((*bin, *bin + 1));
            highest = highest.max(*bin + 1);
        }
        for record in &self.records {
            claimed.push((record.bin_index, record.bin_index + record.number_of_bins));
            highest = highest.max(record.bin_index + record.number_of_bins);
        }
        claimed.sort_unstable();
        for pair in claimed.windows(2) {
            if pair[1].0 < pair[0].1 {
                bail!(
                    "The layout places more than one user bin into technical bin {}.",
                    pair[1].0
                );
            }
        }
        self.technical_bins = highest;
        ensure!(self.technical_bins > 0, "The layout contains an empty IBF node.");
        ensure!(
            self.max_bin_id < self.technical_bins,
            "The layout names max bin {} but only has {} technical bins.",
            self.max_bin_id,
            self.technical_bins
        );
        self.children.sort_by_key(|(bin, _)| *bin);
        Ok(())
    }
}

/// A parsed layout: the tree plus the user-bin file lists in record order
/// (the record order defines the user-bin ids).
#[derive(Debug)]
pub struct Layout {
    pub root: LayoutNode,
    pub bin_paths: Vec<Vec<PathBuf>>,
}

pub fn is_layout_file(path: &Path) -> bool {
    let Ok(file) = File::open(path) else { return false };
    let mut first_line = String::new();
    let _ = BufReader::new(file).read_line(&mut first_line);
    first_line.starts_with("#HIGH_LEVEL_IBF")
}

/// Parses the layout format consumed by the hierarchical build:
///
/// ```text
/// #HIGH_LEVEL_IBF max_bin_id:2
/// #MERGED_BIN_2 max_bin_id:0
/// #FILES	BIN_INDICES	NUMBER_OF_BINS
/// big.fa	0	1
/// split.fa	1	1
/// small_a.fa,small_b.fa	2;0	1;1
/// ```
///
/// Semicolons separate tree levels, commas separate the files of one user
/// bin. Merged bins must be declared in a header line before any record
/// refers to them.
pub fn parse_layout(path: &Path) -> Result<Layout> {
    let file =
        File::open(path).with_context(|| format!("Cannot open layout file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut root: Option<LayoutNode> = None;
    let mut bin_paths: Vec<Vec<PathBuf>> = Vec::new();

    let parse_max_bin = |line: &str| -> Result<usize> {
        let tag = "max_bin_id:";
        let start = line
            .find(tag)
            .with_context(|| format!("Layout header without {tag} field: {line}"))?;
        Ok(line[start + tag.len()..].trim().parse()?)
    };

    for (line_number, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#HIGH_LEVEL_IBF") {
            ensure!(root.is_none(), "Duplicate #HIGH_LEVEL_IBF header in {}", path.display());
            root = Some(LayoutNode { max_bin_id: parse_max_bin(rest)?, ..LayoutNode::default() });
            continue;
        }

        if let Some(rest) = line.strip_prefix("#MERGED_BIN_") {
            let root = root
                .as_mut()
                .context("The layout must start with a #HIGH_LEVEL_IBF header.")?;
            let path_field = rest.split_whitespace().next().unwrap_or_default();
            let indices = parse_semicolon_indices(path_field)?;
            let (last, prefix) = indices.split_last().context("Empty merged bin path")?;
            let parent = root
                .at_path_mut(prefix)
                .with_context(|| format!("Merged bin {path_field} declared before its parent"))?;
            parent.children.push((
                *last,
                LayoutNode { max_bin_id: parse_max_bin(rest)?, ..LayoutNode::default() },
            ));
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let root = root
            .as_mut()
            .context("The layout must start with a #HIGH_LEVEL_IBF header.")?;
        let mut columns = line.split('\t');
        let (Some(files), Some(indices), Some(counts)) =
            (columns.next(), columns.next(), columns.next())
        else {
            bail!("Malformed layout record in line {}: {}", line_number + 1, line);
        };

        let files: Vec<PathBuf> = files.split(',').map(PathBuf::from).collect();
        let indices = parse_semicolon_indices(indices)?;
        let counts = parse_semicolon_indices(counts)?;
        ensure!(
            indices.len() == counts.len() && !indices.is_empty(),
            "Bin indices and bin counts disagree in line {}: {}",
            line_number + 1,
            line
        );

        let user_bin = bin_paths.len();
        bin_paths.push(files);

        let (bin_index, prefix) = indices.split_last().expect("checked above");
        let node = root.at_path_mut(prefix).with_context(|| {
            format!("Layout record references an undeclared merged bin in line {}", line_number + 1)
        })?;
        node.records.push(LayoutRecord {
            user_bin,
            bin_index: *bin_index,
            number_of_bins: *counts.last().expect("checked above"),
        });
    }

    let mut root = root.context("The layout must start with a #HIGH_LEVEL_IBF header.")?;
    ensure!(!bin_paths.is_empty(), "The layout file contains no user bins.");
    root.finalise()?;
    Ok(Layout { root, bin_paths })
}

fn parse_semicolon_indices(field: &str) -> Result<Vec<usize>> {
    field
        .split(';')
        .map(|part| part.trim().parse::<usize>().map_err(Into::into))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("Invalid index list: {field}"))
}

/// Greedy stand-in for the external layout planner: user bins are packed into
/// at most `tmax` technical bins per IBF, balancing merged groups by total
/// cardinality. Used when building an HIBF straight from a bin list and for
/// rebuilds.
pub fn plan(user_bins: &[(usize, u64)], tmax: usize) -> LayoutNode {
    assert!(tmax >= 2, "tmax was validated to be at least 2");
    let mut sorted: Vec<(usize, u64)> = user_bins.to_vec();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    if sorted.len() <= tmax {
        let records = sorted
            .iter()
            .enumerate()
            .map(|(bin_index, &(user_bin, _))| LayoutRecord { user_bin, bin_index, number_of_bins: 1 })
            .collect();
        return LayoutNode {
            max_bin_id: 0,
            technical_bins: sorted.len(),
            children: Vec::new(),
            records,
        };
    }

    // Largest first into the currently lightest group keeps the merged bins
    // balanced.
    let mut groups: Vec<(u64, Vec<(usize, u64)>)> = vec![(0, Vec::new()); tmax];
    for &(user_bin, cardinality) in &sorted {
        let lightest = groups
            .iter_mut()
            .min_by_key(|(total, _)| *total)
            .expect("tmax is at least 2");
        lightest.0 += cardinality;
        lightest.1.push((user_bin, cardinality));
    }
    groups.sort_by(|a, b| b.0.cmp(&a.0));

    let mut node = LayoutNode {
        max_bin_id: 0,
        technical_bins: 0,
        children: Vec::new(),
        records: Vec::new(),
    };
    for (bin_index, (_, members)) in groups.into_iter().filter(|(_, m)| !m.is_empty()).enumerate() {
        if members.len() == 1 {
            node.records.push(LayoutRecord {
                user_bin: members[0].0,
                bin_index,
                number_of_bins: 1,
            });
        } else {
            node.children.push((bin_index, plan(&members, tmax)));
        }
        node.technical_bins = bin_index + 1;
    }
    node.children.sort_by_key(|(bin, _)| *bin);
    node
}
