//! Course generator CLI.
//!
//! Turns an interview transcript into a complete course: outline, pages,
//! summaries and quizzes. Every stage is checkpointed under the run
//! directory, so an interrupted run picks up where it stopped when started
//! again with the same `--run-id`.
//!
//! ```bash
//! cargo run -p course -- --transcript interview.json --run-id spanish-01
//! ```

mod report;

use anyhow::{bail, Context, Result};
use clap::Parser;
use claude::Claude;
use course_core::{
    ClaudeGenerator, CourseAssembler, FileCheckpointStore, FileCourseSink, PipelineConfig,
    RunProgress, Transcript,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Generate a course from an interview transcript.
#[derive(Parser, Debug)]
#[command(name = "course", version, about)]
struct Args {
    /// Interview transcript (JSON with a "conversation" array)
    #[arg(short, long)]
    transcript: PathBuf,

    /// Run identity; reuse it to resume an interrupted run
    #[arg(short, long)]
    run_id: Option<String>,

    /// Pipeline configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding run directories (overrides the config file)
    #[arg(long)]
    runs_dir: Option<PathBuf>,

    /// Claude model (overrides the config file)
    #[arg(long, env = "COURSE_MODEL")]
    model: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the outcome as JSON instead of a summary
    #[arg(long)]
    json: bool,

    /// Seconds between progress log lines (0 disables them)
    #[arg(long, default_value_t = 30)]
    progress_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args.log_level);

    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        bail!(
            "ANTHROPIC_API_KEY environment variable not set. \
             Set it in a .env file or with: export ANTHROPIC_API_KEY=your_key_here"
        );
    }

    let config = load_config(&args)?;
    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().format("run_%Y%m%d_%H%M%S").to_string());

    let transcript = Transcript::load(&args.transcript)
        .await
        .with_context(|| format!("loading transcript {}", args.transcript.display()))?;

    let mut client = Claude::from_env().context("creating Claude client")?;
    if let Some(model) = &config.model {
        client = client.with_model(model.clone());
    }
    let generator = ClaudeGenerator::new(client)
        .with_max_tokens(config.max_tokens)
        .with_temperature(config.temperature);

    tracing::info!(
        run_id = %run_id,
        model = generator.model(),
        runs_dir = %config.runs_dir.display(),
        "starting course generation"
    );

    let assembler = CourseAssembler::new(
        Arc::new(generator),
        Arc::new(FileCheckpointStore::new(&config.runs_dir)),
        Arc::new(FileCourseSink::new(&config.runs_dir)),
        config,
    );

    let cancel = CancellationToken::new();
    spawn_ctrl_c(cancel.clone());

    let progress = RunProgress::new();
    let every = Duration::from_secs(args.progress_interval);
    let reporter = (args.progress_interval > 0)
        .then(|| spawn_progress_log(progress.clone(), every));

    let result = assembler.run(&run_id, &transcript, &cancel, &progress).await;
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    match result {
        Ok(outcome) => {
            if args.json {
                println!("{}", report::outcome_json(&run_id, &outcome)?);
            } else {
                print!("{}", report::outcome_text(&run_id, &outcome));
            }
            Ok(())
        }
        Err(e) => {
            eprint!("{}", report::failure_text(&run_id, &e, &progress.snapshot()));
            Err(e).context("course generation failed")
        }
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(dir) = &args.runs_dir {
        config = config.with_runs_dir(dir);
    }
    if let Some(model) = &args.model {
        config = config.with_model(model);
    }
    config.validate()?;
    Ok(config)
}

/// First Ctrl-C stops scheduling new work; in-flight calls still finish.
fn spawn_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight calls and stopping");
            cancel.cancel();
        }
    });
}

fn spawn_progress_log(progress: RunProgress, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snap = progress.snapshot();
            if snap.status.is_terminal() {
                break;
            }
            tracing::info!(
                status = ?snap.status,
                stage = ?snap.stage,
                modules = %format!("{}/{}", snap.modules.succeeded, snap.modules.attempted),
                chapters = %format!("{}/{}", snap.chapters.succeeded, snap.chapters.attempted),
                pages = %format!("{}/{}", snap.pages.succeeded, snap.pages.attempted),
                "progress"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "course",
            "--transcript",
            "interview.json",
            "--run-id",
            "r1",
            "--runs-dir",
            "/tmp/runs",
        ])
        .unwrap();
        assert_eq!(args.transcript, PathBuf::from("interview.json"));
        assert_eq!(args.run_id.as_deref(), Some("r1"));
        assert_eq!(args.log_level, "info");
        assert!(!args.json);

        let config = load_config(&args).unwrap();
        assert_eq!(config.runs_dir, PathBuf::from("/tmp/runs"));
    }

    #[test]
    fn test_transcript_is_required() {
        assert!(Args::try_parse_from(["course"]).is_err());
    }
}
