use raptor::build::{self, BuildArgs};
use raptor::search::{self, SearchArgs};
use raptor::update::{RebuildKind, insert_user_bin};
use raptor::utils::CommonArgs;
use raptor::RaptorIndex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

fn common() -> CommonArgs {
    CommonArgs { threads: 2, verbose: false }
}

fn build_args(input: &Path, output: &Path) -> BuildArgs {
    BuildArgs {
        common: common(),
        input: input.to_path_buf(),
        output: output.to_path_buf(),
        kmer: None,
        shape: None,
        window: None,
        size: "1m".to_string(),
        hash: 2,
        fpr: 0.05,
        relaxed_fpr: 0.3,
        tmax: 64,
        parts: 1,
        hibf: false,
        compute_minimiser: false,
        disable_cutoffs: false,
    }
}

fn search_args(index: &Path, query: &Path, output: &Path) -> SearchArgs {
    SearchArgs {
        common: common(),
        index: index.to_path_buf(),
        query: query.to_path_buf(),
        output: output.to_path_buf(),
        error: 0,
        threshold: None,
        query_length: None,
        tau: 0.9999,
        p_max: 0.15,
        cache_thresholds: false,
    }
}

fn random_seq(len: usize, seed: u64) -> String {
    let mut state = seed.wrapping_add(0x9E3779B97F4A7C15);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            [b'A', b'C', b'G', b'T'][(state >> 33) as usize % 4] as char
        })
        .collect()
}

fn write_fasta(path: &Path, sequences: &[(&str, &str)]) {
    let mut content = String::new();
    for (id, seq) in sequences {
        content.push_str(&format!(">{id}\n{seq}\n"));
    }
    fs::write(path, content).unwrap();
}

/// One FASTA file per user bin; returns the bin list path.
fn write_bins(dir: &Path, sequences: &[String]) -> PathBuf {
    let mut list = String::new();
    for (bin, seq) in sequences.iter().enumerate() {
        let path = dir.join(format!("bin{bin}.fa"));
        write_fasta(&path, &[(&format!("seq{bin}"), seq)]);
        list.push_str(&format!("{}\n", path.display()));
    }
    let list_path = dir.join("bins.txt");
    fs::write(&list_path, list).unwrap();
    list_path
}

/// Parses the search output into query id -> hit bins, checking the header.
fn parse_output(path: &Path, expected_bins: usize) -> BTreeMap<String, Vec<u64>> {
    let content = fs::read_to_string(path).unwrap();
    let mut header_bins = 0;
    let mut saw_terminator = false;
    let mut results = BTreeMap::new();
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix('#') {
            if rest == "QUERY_NAME\tUSER_BINS" {
                saw_terminator = true;
            } else {
                header_bins += 1;
            }
            continue;
        }
        let (id, bins) = line.split_once('\t').expect("every record line has a tab");
        let bins: Vec<u64> =
            bins.split(',').filter(|s| !s.is_empty()).map(|s| s.parse().unwrap()).collect();
        results.insert(id.to_string(), bins);
    }
    assert_eq!(header_bins, expected_bins);
    assert!(saw_terminator);
    results
}

#[test]
fn flat_ibf_with_distinct_kmers() {
    let dir = tempfile::tempdir().unwrap();
    let kmers = ["AAAAAAAAAA", "ACACACACAC", "AGGAGGAGGA", "CCCCCCCCCC"];
    let sequences: Vec<String> = kmers.iter().map(|k| k.to_string()).collect();
    let list = write_bins(dir.path(), &sequences);

    let index = dir.path().join("flat.index");
    let mut args = build_args(&list, &index);
    args.kmer = Some(10);
    args.size = "8k".to_string(); // 1024 bits per bin at 64 padded bins
    build::run(&args).unwrap();

    let query = dir.path().join("query.fa");
    write_fasta(
        &query,
        &[
            ("q0", kmers[0]),
            ("q1", kmers[1]),
            ("q2", kmers[2]),
            ("q3", kmers[3]),
            ("unrelated", "GATTACAGAT"),
        ],
    );
    let out = dir.path().join("result.txt");
    search::run(&search_args(&index, &query, &out)).unwrap();

    let results = parse_output(&out, 4);
    assert_eq!(results["q0"], vec![0]);
    assert_eq!(results["q1"], vec![1]);
    assert_eq!(results["q2"], vec![2]);
    assert_eq!(results["q3"], vec![3]);
    assert_eq!(results["unrelated"], Vec::<u64>::new());
}

#[test]
fn windowed_search_returns_the_source_bin() {
    let dir = tempfile::tempdir().unwrap();
    let sequences: Vec<String> = (0..4).map(|bin| random_seq(200, bin as u64)).collect();
    let list = write_bins(dir.path(), &sequences);

    let index = dir.path().join("windowed.index");
    let mut args = build_args(&list, &index);
    args.kmer = Some(19);
    args.window = Some(19);
    build::run(&args).unwrap();

    let query = dir.path().join("query.fa");
    write_fasta(&query, &[("q", &sequences[2][..100])]);
    let out = dir.path().join("result.txt");
    let mut sargs = search_args(&index, &query, &out);
    sargs.tau = 0.99;
    search::run(&sargs).unwrap();

    assert_eq!(parse_output(&out, 4)["q"], vec![2]);
}

#[test]
fn gapped_shape_tolerates_mutations_at_gap_positions() {
    let dir = tempfile::tempdir().unwrap();
    let sequences: Vec<String> = (0..4).map(|bin| random_seq(200, 100 + bin as u64)).collect();
    let list = write_bins(dir.path(), &sequences);

    let index = dir.path().join("gapped.index");
    let mut args = build_args(&list, &index);
    args.shape = Some("10101010101010101".to_string());
    build::run(&args).unwrap();

    // A 17-mer of bin 1 with a mutation at position 1 (a gap in the shape).
    let mut query: Vec<u8> = sequences[1][10..27].into();
    query[1] = if query[1] == b'A' { b'C' } else { b'A' };
    let query_file = dir.path().join("query.fa");
    write_fasta(&query_file, &[("mutated", std::str::from_utf8(&query).unwrap())]);
    let out = dir.path().join("result.txt");
    search::run(&search_args(&index, &query_file, &out)).unwrap();

    assert!(parse_output(&out, 4)["mutated"].contains(&1));
}

#[test]
fn partitioned_ibf_matches_the_monolithic_build() {
    let dir = tempfile::tempdir().unwrap();
    let sequences: Vec<String> = (0..8).map(|bin| random_seq(200, 1000 + bin as u64)).collect();
    let list = write_bins(dir.path(), &sequences);

    let query = dir.path().join("query.fa");
    let mut query_records: Vec<(String, String)> = Vec::new();
    for (bin, seq) in sequences.iter().enumerate() {
        for i in 0..3usize {
            let start = 20 * i;
            query_records.push((format!("q{bin}_{i}"), seq[start..start + 50].to_string()));
        }
    }
    let query_refs: Vec<(&str, &str)> =
        query_records.iter().map(|(id, seq)| (id.as_str(), seq.as_str())).collect();
    write_fasta(&query, &query_refs);

    let mono_index = dir.path().join("mono.index");
    let mut args = build_args(&list, &mono_index);
    args.kmer = Some(13);
    build::run(&args).unwrap();

    let part_index = dir.path().join("parts.index");
    let mut args = build_args(&list, &part_index);
    args.kmer = Some(13);
    args.parts = 4;
    build::run(&args).unwrap();
    for part in 0..4 {
        assert!(raptor::index::part_path(&part_index, part).exists());
    }

    let mono_out = dir.path().join("mono.txt");
    search::run(&search_args(&mono_index, &query, &mono_out)).unwrap();
    let part_out = dir.path().join("parts.txt");
    search::run(&search_args(&part_index, &query, &part_out)).unwrap();

    assert_eq!(parse_output(&mono_out, 8), parse_output(&part_out, 8));
}

#[test]
fn three_level_hibf_finds_the_right_user_bin() {
    let dir = tempfile::tempdir().unwrap();
    let sequences: Vec<String> = (0..64).map(|bin| random_seq(150, 5000 + bin as u64)).collect();
    let list = write_bins(dir.path(), &sequences);

    let index = dir.path().join("hibf.index");
    let mut args = build_args(&list, &index);
    args.kmer = Some(15);
    args.hibf = true;
    args.tmax = 4; // forces a three-level tree over 64 user bins
    build::run(&args).unwrap();

    let loaded = RaptorIndex::load(&index).unwrap();
    let hibf = loaded.hibf().unwrap();
    assert!(hibf.ibf_vector.len() > 5, "expected a deep tree");

    let query = dir.path().join("query.fa");
    write_fasta(&query, &[("q37", &sequences[37][20..80])]);
    let out = dir.path().join("result.txt");
    search::run(&search_args(&index, &query, &out)).unwrap();

    assert_eq!(parse_output(&out, 64)["q37"], vec![37]);
}

#[test]
fn hibf_from_a_layout_file_honours_splits() {
    let dir = tempfile::tempdir().unwrap();
    let sequences: Vec<String> = (0..4).map(|bin| random_seq(120, 7000 + bin as u64)).collect();
    for (bin, seq) in sequences.iter().enumerate() {
        write_fasta(&dir.path().join(format!("bin{bin}.fa")), &[(&format!("s{bin}"), seq)]);
    }

    let layout = dir.path().join("layout.txt");
    let layout_text = format!(
        "#HIGH_LEVEL_IBF max_bin_id:0\n\
         #MERGED_BIN_2 max_bin_id:0\n\
         #FILES\tBIN_INDICES\tNUMBER_OF_BINS\n\
         {}\t0\t2\n\
         {}\t2;0\t1;1\n\
         {}\t2;1\t1;1\n\
         {}\t3\t1\n",
        dir.path().join("bin0.fa").display(),
        dir.path().join("bin1.fa").display(),
        dir.path().join("bin2.fa").display(),
        dir.path().join("bin3.fa").display(),
    );
    fs::write(&layout, layout_text).unwrap();

    let index = dir.path().join("layout.index");
    let mut args = build_args(&layout, &index);
    args.kmer = Some(15);
    build::run(&args).unwrap();

    let query = dir.path().join("query.fa");
    write_fasta(
        &query,
        &[
            ("q0", &sequences[0][..80]), // split user bin
            ("q1", &sequences[1][..80]), // behind the merged bin
            ("q3", &sequences[3][..80]),
        ],
    );
    let out = dir.path().join("result.txt");
    search::run(&search_args(&index, &query, &out)).unwrap();

    let results = parse_output(&out, 4);
    assert_eq!(results["q0"], vec![0]);
    assert_eq!(results["q1"], vec![1]);
    assert_eq!(results["q3"], vec![3]);
}

#[test]
fn online_insert_triggers_a_rebuild_and_stays_queryable() {
    let dir = tempfile::tempdir().unwrap();
    let sequences: Vec<String> = (0..50).map(|bin| random_seq(150, 9000 + bin as u64)).collect();
    let list = write_bins(dir.path(), &sequences);

    let index_path = dir.path().join("hibf.index");
    let mut args = build_args(&list, &index_path);
    args.kmer = Some(15);
    args.hibf = true;
    args.tmax = 8;
    build::run(&args).unwrap();

    // The new user bin is far larger than anything the existing IBFs were
    // sized for: the split needed to keep the FPR within target blows the
    // root IBF past tmax.
    let big = random_seq(20_000, 777);
    let big_file = dir.path().join("big.fa");
    write_fasta(&big_file, &[("big", &big)]);

    let mut index = RaptorIndex::load(&index_path).unwrap();
    let report = insert_user_bin(&mut index, vec![big_file]).unwrap();
    assert_eq!(report.user_bin, 50);
    assert!(report.rebuild.is_some(), "expected a rebuild trigger");

    let updated_path = dir.path().join("updated.index");
    index.store(&updated_path).unwrap();

    let query = dir.path().join("query.fa");
    write_fasta(&query, &[("new", &big[100..200]), ("old", &sequences[7][10..110])]);
    let out = dir.path().join("result.txt");
    search::run(&search_args(&updated_path, &query, &out)).unwrap();

    let results = parse_output(&out, 51);
    assert_eq!(results["new"], vec![50]);
    assert!(results["old"].contains(&7), "pre-insert content must stay queryable");
}

#[test]
fn online_insert_rebuilds_the_breached_merged_bin() {
    let dir = tempfile::tempdir().unwrap();
    // Three levels: the root holds one huge user bin and one merged bin; the
    // middle IBF consists of a single merged bin routing to the leaf IBF with
    // two small user bins. The root is sized generously by its huge bin, so
    // an insert into the leaf breaches the middle merged bin first.
    let huge = random_seq(5015, 31);
    let small_a = random_seq(150, 32);
    let small_b = random_seq(150, 33);
    write_fasta(&dir.path().join("huge.fa"), &[("huge", &huge)]);
    write_fasta(&dir.path().join("small_a.fa"), &[("a", &small_a)]);
    write_fasta(&dir.path().join("small_b.fa"), &[("b", &small_b)]);

    let layout = dir.path().join("layout.txt");
    fs::write(
        &layout,
        format!(
            "#HIGH_LEVEL_IBF max_bin_id:0\n\
             #MERGED_BIN_1 max_bin_id:0\n\
             #MERGED_BIN_1;0 max_bin_id:0\n\
             {}\t0\t1\n\
             {}\t1;0;0\t1;1;1\n\
             {}\t1;0;1\t1;1;1\n",
            dir.path().join("huge.fa").display(),
            dir.path().join("small_a.fa").display(),
            dir.path().join("small_b.fa").display(),
        ),
    )
    .unwrap();

    let index_path = dir.path().join("deep.index");
    let mut args = build_args(&layout, &index_path);
    args.kmer = Some(15);
    args.relaxed_fpr = 0.05;
    build::run(&args).unwrap();

    let new_bin = random_seq(114, 42); // exactly 100 15-mers
    let new_file = dir.path().join("new.fa");
    write_fasta(&new_file, &[("new", &new_bin)]);

    let mut index = RaptorIndex::load(&index_path).unwrap();
    let report = insert_user_bin(&mut index, vec![new_file]).unwrap();
    assert_eq!(report.user_bin, 3);
    match report.rebuild {
        Some(RebuildKind::Partial { ibf_idx, bin_idx }) => {
            assert_eq!((ibf_idx, bin_idx), (1, 0), "the middle merged bin was breached");
        }
        other => panic!("expected a partial rebuild, got {other:?}"),
    }

    let updated_path = dir.path().join("updated.index");
    index.store(&updated_path).unwrap();

    let query = dir.path().join("query.fa");
    write_fasta(
        &query,
        &[
            ("new", &new_bin[..60]),
            ("a", &small_a[..60]),
            ("huge", &huge[500..560]),
        ],
    );
    let out = dir.path().join("result.txt");
    search::run(&search_args(&updated_path, &query, &out)).unwrap();

    let results = parse_output(&out, 4);
    assert_eq!(results["new"], vec![3]);
    assert_eq!(results["a"], vec![1]);
    assert_eq!(results["huge"], vec![0]);
}
