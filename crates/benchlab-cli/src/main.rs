use anyhow::Result;
use benchlab_runner::{
    Layout, Matrix, MatrixRequest, RunOptions, RunSummary, ShufflePolicy,
    DEFAULT_BENCHMARKS_FILE, DEFAULT_CONFIGURATIONS_FILE,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "benchlab",
    version,
    about = "Build and run every benchmark under every configuration",
    long_about = "Fetches the packages listed in the benchmarks document, builds one test \
binary per benchmark and configuration, and runs them (by default inside a docker \
image built from this directory). Binaries, build timings and per-configuration \
output land in ./testbin. The directory must not contain gopath/pkg or gopath/bin."
)]
struct Cli {
    /// Print commands and other details; repeat for more.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct MatrixArgs {
    /// Document declaring [[Benchmarks]].
    #[arg(short = 'B', long, default_value = DEFAULT_BENCHMARKS_FILE)]
    benchmarks_file: PathBuf,
    /// Document declaring [[Configurations]].
    #[arg(short = 'C', long, default_value = DEFAULT_CONFIGURATIONS_FILE)]
    configurations_file: PathBuf,
    /// Comma-separated benchmark names (default is all).
    #[arg(short = 'b', long, default_value = "")]
    benchmarks: String,
    /// Comma-separated configuration names (default is all).
    #[arg(short = 'c', long, default_value = "")]
    configurations: String,
}

impl MatrixArgs {
    fn request(&self) -> MatrixRequest {
        MatrixRequest {
            benchmarks_file: self.benchmarks_file.clone(),
            configurations_file: self.configurations_file.clone(),
            benchmarks: benchlab_runner::parse_name_set(&self.benchmarks),
            configurations: benchlab_runner::parse_name_set(&self.configurations),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, build and run the matrix.
    Run {
        #[command(flatten)]
        matrix: MatrixArgs,
        /// Run repetitions per benchmark and configuration.
        #[arg(short = 'N', long, default_value_t = 1)]
        repetitions: usize,
        /// Pass -a to every build. Repeat or assign a value: a total other
        /// than 1 instead builds that many times, for benchmarking the
        /// builds themselves.
        #[arg(
            short = 'a',
            long,
            action = ArgAction::Append,
            num_args = 0..=1,
            default_missing_value = "1",
            allow_negative_numbers = true
        )]
        build_all: Vec<i32>,
        /// Build-order shuffling: 0 none, 1 configurations per benchmark,
        /// 2 benchmark/configuration pairs, 3 across repetitions.
        #[arg(short = 's', long, default_value_t = 2)]
        shuffle: u8,
        /// Seed for build-order shuffling.
        #[arg(long)]
        seed: Option<u64>,
        /// Run everything outside the sandbox.
        #[arg(short = 'U', long)]
        unsandboxed: bool,
        /// Exclude what cannot run in the sandbox.
        #[arg(short = 'S', long)]
        require_sandbox: bool,
        /// Fetch sources and dependencies, then stop.
        #[arg(short = 'g', long)]
        get_only: bool,
        /// Skip fetch and build, running in this existing image.
        #[arg(short = 'r', long)]
        run_container: Option<String>,
        /// Run tests instead of benchmarks.
        #[arg(short = 'T', long)]
        tests: bool,
        #[arg(long)]
        json: bool,
        /// Passed to every test binary.
        #[arg(last = true)]
        extra: Vec<String>,
    },
    /// List benchmarks and configurations after selection.
    List {
        #[command(flatten)]
        matrix: MatrixArgs,
        #[arg(long)]
        json: bool,
    },
    /// Print benchmark rows for a wiki table.
    Wiki {
        #[command(flatten)]
        matrix: MatrixArgs,
    },
    /// Create the Dockerfile and sample documents in this directory.
    Init {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command, cli.verbose);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// `RUST_LOG` wins; otherwise each `-v` lowers the threshold one step.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn run_command(command: Commands, verbose: u8) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            matrix,
            repetitions,
            build_all,
            shuffle,
            seed,
            unsandboxed,
            require_sandbox,
            get_only,
            run_container,
            tests,
            json,
            extra,
        } => {
            let options = RunOptions {
                repetitions,
                build_all: build_all.iter().sum(),
                shuffle: ShufflePolicy::try_from(shuffle)?,
                seed,
                verbose,
                test_mode: tests,
                no_sandbox: unsandboxed,
                require_sandbox,
                get_only,
                run_container,
                extra_args: extra,
                echo: !json,
                ..RunOptions::default()
            };
            let mut todo = benchlab_runner::load(&matrix.request(), &options)?;
            if verbose > 1 {
                println!("{}", benchlab_runner::render_matrix(&todo)?);
            }
            let layout = Layout::new(&std::env::current_dir()?);
            let summary = benchlab_runner::run(&mut todo, &options, &layout)?;
            if json {
                return Ok(Some(summary_json(&summary)));
            }
            print!("{}", summary.render());
            Ok(None)
        }
        Commands::List { matrix, json } => {
            let todo = benchlab_runner::load(&matrix.request(), &RunOptions::default())?;
            if json {
                return Ok(Some(listing_json(&todo)));
            }
            print_listing(&todo);
            Ok(None)
        }
        Commands::Wiki { matrix } => {
            let todo =
                benchlab_runner::load_matrix(&matrix.benchmarks_file, &matrix.configurations_file)?;
            for bench in &todo.benchmarks {
                println!("{}", bench.wiki_row());
            }
            Ok(None)
        }
        Commands::Init { json } => {
            let layout = Layout::new(&std::env::current_dir()?);
            let report = benchlab_runner::init(&layout)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "created": report.created.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                    "kept": report.kept.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                })));
            }
            for path in &report.created {
                println!("Created {}", path.display());
            }
            for path in &report.kept {
                println!("Kept existing {}", path.display());
            }
            Ok(None)
        }
    }
}

fn summary_json(summary: &RunSummary) -> Value {
    json!({
        "ok": summary.is_clean(),
        "image": summary.image,
        "failures": summary.failures,
        "build_failures": summary.build_failures,
    })
}

fn listing_json(todo: &Matrix) -> Value {
    json!({
        "ok": true,
        "benchmarks": todo.benchmarks.iter().map(|b| json!({
            "name": b.name,
            "repo": b.repo,
            "disabled": b.disabled,
            "not_sandboxed": b.not_sandboxed,
        })).collect::<Vec<_>>(),
        "configurations": todo.configurations.iter().map(|c| json!({
            "name": c.name,
            "root": c.root,
            "disabled": c.disabled,
        })).collect::<Vec<_>>(),
    })
}

fn print_listing(todo: &Matrix) {
    println!("Benchmarks:");
    for b in &todo.benchmarks {
        let mut s = format!("{} (repo={})", b.name, b.repo);
        if b.disabled {
            s.push_str(" (disabled)");
        }
        println!("   {}", s);
    }
    println!("Configurations:");
    for c in &todo.configurations {
        let mut s = c.name.clone();
        if let Some(root) = &c.root {
            s.push_str(&format!(" (goroot={})", root));
        }
        if c.disabled {
            s.push_str(" (disabled)");
        }
        println!("   {}", s);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::List { json, .. } | Commands::Init { json } => *json,
        Commands::Wiki { .. } => false,
    }
}
