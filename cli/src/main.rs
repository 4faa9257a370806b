//! `sitrack` CLI: scenario runs, replay import/export, configuration dump.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use finder_core::{ClaimIndex, CombinatorialFinder, FinderConfig, FinderData, FinderStatistics};
use sim::gun::Event;
use sim::replay::{load_replay, save_replay, ReplayLog};
use sim::scenarios::{Scenario, ScenarioKind};
use sim::TruthMetrics;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "sitrack", about = "Silicon combinatorial track finder CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a named scenario, find its tracks and report metrics.
    RunScenario {
        #[arg(value_enum)]
        scenario: ScenarioKind,
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Finder configuration JSON replacing the scenario's
        #[arg(long)]
        config: Option<PathBuf>,
        /// Process seeds on the rayon pool
        #[arg(long)]
        parallel: bool,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Also save the generated events
        #[arg(long)]
        save_replay: Option<PathBuf>,
    },
    /// Rerun the finder on a previously recorded log.
    Replay {
        /// Path to replay JSON file
        input: PathBuf,
        /// Finder configuration JSON replacing the recorded one
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        parallel: bool,
        /// Output metrics to a JSON file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the default finder configuration as JSON.
    DefaultConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::RunScenario {
            scenario,
            seed,
            config,
            parallel,
            output,
            save_replay: save_path,
        } => {
            run_scenario(
                scenario,
                seed,
                config.as_deref(),
                parallel,
                output.as_deref(),
                save_path.as_deref(),
            )?;
        }
        Commands::Replay {
            input,
            config,
            parallel,
            output,
        } => {
            run_replay(&input, config.as_deref(), parallel, output.as_deref())?;
        }
        Commands::DefaultConfig => {
            println!("{}", serde_json::to_string_pretty(&FinderConfig::default())?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<FinderConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

/// Finder output of a whole run.
struct RunSummary {
    statistics: FinderStatistics,
    truth: TruthMetrics,
    elapsed_s: f64,
}

fn find_all(config: &FinderConfig, events: &[Event], parallel: bool) -> Result<RunSummary> {
    let finder = CombinatorialFinder::new(config.clone());
    let min_clusters = finder.config().cuts.min_clusters as usize;
    let mut statistics = FinderStatistics::default();
    let mut truth = TruthMetrics::default();
    let start = std::time::Instant::now();

    for (n, event) in events.iter().enumerate() {
        let index = event.index();
        let tracks = if parallel {
            let (tracks, s) = finder.find_tracks_parallel(&event.seeds, &index, &ClaimIndex::new())?;
            statistics = statistics.merge(&s);
            tracks
        } else {
            let mut data = FinderData::new();
            let mut claims = ClaimIndex::new();
            let tracks = finder.find_tracks(&mut data, &event.seeds, &index, &mut claims)?;
            statistics = statistics.merge(&data.take_statistics());
            tracks
        };
        tracing::info!(
            event = n,
            seeds = event.seeds.len(),
            tracks = tracks.len(),
            "event processed"
        );
        truth.accumulate(event, &tracks, min_clusters);
    }

    Ok(RunSummary {
        statistics,
        truth,
        elapsed_s: start.elapsed().as_secs_f64(),
    })
}

fn print_summary(summary: &RunSummary) {
    let t = &summary.truth;
    println!("{}", summary.statistics);
    println!(
        "Truth: {} events, {} tracks, efficiency {:.1}%, fakes {:.1}%, duplicates {:.1}%, pT resolution {:.2}%",
        t.n_events,
        t.n_tracks,
        100.0 * t.efficiency(),
        100.0 * t.fake_rate(),
        100.0 * t.duplicate_rate(),
        100.0 * t.pt_resolution(),
    );
    println!("Elapsed: {:.3}s", summary.elapsed_s);
}

fn write_metrics(path: &Path, name: &str, seed: u64, summary: &RunSummary) -> Result<()> {
    let json = serde_json::json!({
        "scenario": name,
        "seed": seed,
        "elapsed_s": summary.elapsed_s,
        "statistics": summary.statistics,
        "truth": summary.truth,
        "efficiency": summary.truth.efficiency(),
        "fake_rate": summary.truth.fake_rate(),
        "pt_resolution": summary.truth.pt_resolution(),
    });
    std::fs::write(path, serde_json::to_string_pretty(&json)?)?;
    println!("Metrics saved to {}", path.display());
    Ok(())
}

fn run_scenario(
    kind: ScenarioKind,
    seed: u64,
    config_path: Option<&Path>,
    parallel: bool,
    output_path: Option<&Path>,
    replay_path: Option<&Path>,
) -> Result<()> {
    let mut scenario = Scenario::build(kind, seed);
    if let Some(path) = config_path {
        scenario.config = load_config(path)?;
    }

    println!(
        "Running scenario '{}' (seed={}, events={}, particles/event={})...",
        scenario.name, seed, scenario.n_events, scenario.gun.n_particles
    );
    let events = scenario.generate();
    let summary = find_all(&scenario.config, &events, parallel)?;
    print_summary(&summary);

    if let Some(rpath) = replay_path {
        let log = ReplayLog {
            scenario_name: scenario.name.clone(),
            seed,
            config: scenario.config.clone(),
            events,
        };
        save_replay(&log, rpath)?;
        println!("Replay saved to {}", rpath.display());
    }

    if let Some(opath) = output_path {
        write_metrics(opath, &scenario.name, seed, &summary)?;
    }

    Ok(())
}

fn run_replay(
    input: &Path,
    config_path: Option<&Path>,
    parallel: bool,
    output_path: Option<&Path>,
) -> Result<()> {
    let mut log = load_replay(input).with_context(|| format!("loading {}", input.display()))?;
    if let Some(path) = config_path {
        log.config = load_config(path)?;
    }
    println!(
        "Replaying '{}' ({} events)...",
        log.scenario_name,
        log.events.len()
    );

    let summary = find_all(&log.config, &log.events, parallel)?;
    print_summary(&summary);

    if let Some(opath) = output_path {
        write_metrics(opath, &log.scenario_name, log.seed, &summary)?;
    }

    Ok(())
}
