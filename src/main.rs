use clap::{Parser, Subcommand};

use raptor::build;
use raptor::prepare;
use raptor::search;
use raptor::update;

#[derive(Parser)]
#[command(
    name = "raptor",
    version,
    about = concat!("Raptor: A fast pre-filter for querying very large collections of nucleotide sequences\nVersion: ", env!("CARGO_PKG_VERSION")),
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an index over a set of user bins
    Build(build::BuildArgs),

    /// Query an index for membership of reads
    Search(search::SearchArgs),

    /// Precompute cutoff-filtered minimiser files
    Prepare(prepare::PrepareArgs),

    /// Insert new user bins into an existing HIBF index
    Update(update::UpdateArgs),
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Build(args) => build::run(&args),
        Commands::Search(args) => search::run(&args),
        Commands::Prepare(args) => prepare::run(&args),
        Commands::Update(args) => update::run(&args),
    };

    if let Err(error) = result {
        eprintln!("[Error] {error:#}");
        std::process::exit(1);
    }
}
