use mimalloc::MiMalloc;
use std::process::ExitCode;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    genome_graphs::init_tracing();
    match genome_graphs::cli::parse_from_env().and_then(genome_graphs::run_from_args) {
        Ok(summary) if summary.has_failures() => {
            for failure in &summary.failed {
                eprintln!("genome_graphs: {} failed: {}", failure.region, failure.reason);
            }
            ExitCode::from(2)
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("genome_graphs: {error}");
            ExitCode::from(1)
        }
    }
}
