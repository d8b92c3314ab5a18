pub mod cli;
pub mod errors;
pub mod external_tools;
pub mod matrix;
pub mod pileup;
pub mod pipeline;
pub mod reference;
pub mod region;
pub mod render;
pub mod toolkit;
pub mod tracks;
mod utils;
pub mod window;
pub mod writer;

use cli::GraphArgs;
use errors::Result;
use pipeline::RunSummary;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

pub fn run_from_args(args: GraphArgs) -> Result<RunSummary> {
    pipeline::run(&args)
}
