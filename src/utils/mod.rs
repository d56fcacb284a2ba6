pub mod bin_list;
pub mod io;
pub mod partition;
pub mod sync_out;

use anyhow::Result;
use clap::Parser;

/// Arguments shared by every subcommand.
#[derive(Debug, Clone, Parser)]
pub struct CommonArgs {
    /// Number of threads for parallel processing
    #[arg(short = 't', long, default_value_t = num_cpus::get())]
    pub threads: usize,

    /// Enable verbose output
    #[arg(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

impl CommonArgs {
    /// Configures the global rayon pool once; later calls are no-ops.
    pub fn init_thread_pool(&self) -> Result<()> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build_global()
            .ok();
        Ok(())
    }
}
