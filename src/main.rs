//! quire - incremental EPUB compiler

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use quire::{CompilerConfig, Project};

#[derive(Parser)]
#[command(name = "quire")]
#[command(version, about = "Incremental EPUB compiler", long_about = None)]
#[command(after_help = "EXAMPLES:
    quire --target ibooks              Build the ibooks target of the project here
    quire my-book -t kindle --release  Release build of another project")]
struct Cli {
    /// Project directory containing a *.book.yml file
    #[arg(value_name = "PROJECT", default_value = ".")]
    project: PathBuf,

    /// Target to build (defaults to the first target of the book)
    #[arg(short, long)]
    target: Option<String>,

    /// Escalate XML problems and duplicate global ids to errors
    #[arg(long)]
    release: bool,

    /// Archive path (defaults to <slug>-<target>.epub in the project)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Only print warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .without_time()
        .init();

    match build(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build(cli: &Cli) -> Result<(), quire::Error> {
    let project = Project::open(&cli.project)?;
    let target = match &cli.target {
        Some(target) => target.clone(),
        None => project
            .book()
            .targets
            .first()
            .map(|t| t.name.clone())
            .ok_or_else(|| quire::Error::UnknownTarget("<none>".to_string()))?,
    };

    let mut config = CompilerConfig::new().with_release(cli.release);
    if let Some(output) = &cli.output {
        config = config.with_output(output);
    }

    let report = project.compiler().with_config(config).compile(&target)?;

    if !cli.quiet {
        println!(
            "{}: {} processed, {} up to date, {} written, {} removed",
            report.target, report.processed, report.skipped, report.written, report.removed
        );
        for unresolved in &report.unresolved_global_ids {
            println!("  unresolved global id `{}` in {}", unresolved.id, unresolved.file);
        }
        println!("  -> {}", report.archive.display());
    }
    Ok(())
}
