// src/main.rs
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;

use tesscope::drivers::{ReplayRecord, SimulatedDriverFactory};
use tesscope::{
    AnalysisUpdate, AnalyzedFrame, BenchConfig, ChannelId, ChannelSelection, ControlHandle,
    FrameRecorder, RecordingSource, RunController, RunSummary, SourceConfig, Unit,
};

#[derive(Parser)]
#[command(name = "tesscope")]
#[command(about = "Acquire, replay and analyse cryogenic-sensor traces")]
struct Cli {
    /// Bench description (JSON). Defaults to a single simulated ADC "adc1".
    #[arg(long, global = true)]
    bench: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay recorded JSON Lines files
    Replay {
        files: Vec<PathBuf>,
        /// Start over from the first file instead of stopping
        #[arg(long)]
        looping: bool,
        #[command(flatten)]
        analysis: AnalysisArgs,
    },
    /// Acquire from the simulated ADC
    Simulate {
        #[arg(long, default_value = "adc1")]
        adc: String,
        /// Stop after this many delivered frames (Ctrl-C otherwise)
        #[arg(long)]
        frames: Option<u64>,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Inject a piled-up pulse every N events
        #[arg(long)]
        pileup_every: Option<u64>,
        #[command(flatten)]
        analysis: AnalysisArgs,
    },
    /// Acquire from the simulated ADC and write raw frames for later replay
    Record {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "adc1")]
        adc: String,
        #[arg(long, default_value_t = 100)]
        frames: u64,
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Comma-separated channel list
        #[arg(long, value_delimiter = ',')]
        channels: Vec<ChannelId>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum UnitArg {
    Raw,
    Physical,
}

#[derive(Args)]
struct AnalysisArgs {
    /// Comma-separated channel list (default: every channel of the source)
    #[arg(long, value_delimiter = ',')]
    channels: Vec<ChannelId>,
    #[arg(long, value_enum, default_value = "raw")]
    unit: UnitArg,
    /// Report power spectral density instead of time traces
    #[arg(long)]
    psd: bool,
    /// Running average over N frames
    #[arg(long)]
    avg: Option<usize>,
    #[arg(long)]
    pileup: bool,
}

impl AnalysisArgs {
    fn update(&self) -> AnalysisUpdate {
        AnalysisUpdate {
            unit: Some(match self.unit {
                UnitArg::Raw => Unit::Raw,
                UnitArg::Physical => Unit::Physical,
            }),
            compute_psd: Some(self.psd),
            pileup_rejection: Some(self.pileup),
            running_average_enabled: Some(self.avg.is_some()),
            window_size: self.avg,
            ..Default::default()
        }
    }
}

fn install_ctrlc(handle: ControlHandle) -> Result<()> {
    ctrlc::set_handler(move || handle.stop()).context("failed to install Ctrl-C handler")
}

fn print_frame(frame: &AnalyzedFrame) {
    let seq = frame.sequence.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
    let mut line = format!("#{seq:>6} n={:<3}", frame.averaged_frames);
    if frame.pileup_rejected {
        line.push_str(" [pile-up]");
    }
    for (id, data) in frame.channels.iter().zip(&frame.data) {
        if let Some(freqs) = &frame.frequencies_hz {
            // strongest non-DC bin
            let peak = data
                .iter()
                .enumerate()
                .skip(1)
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(k, p)| (freqs[k], p.sqrt()));
            if let Some((f, asd)) = peak {
                line.push_str(&format!("  ch{id}: peak {f:.1} Hz {asd:.3e} {}", frame.y_label()));
            }
        } else {
            let n = data.len().max(1) as f64;
            let mean = data.iter().sum::<f64>() / n;
            let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            line.push_str(&format!("  ch{id}: mean {mean:.4} max {max:.4} {}", frame.y_label()));
        }
    }
    println!("{line}");
}

fn print_summary(summary: &RunSummary) {
    println!(
        "run ended ({:?}): {} read, {} delivered, {} skipped, {} analysis errors",
        summary.end,
        summary.frames_read,
        summary.frames_delivered,
        summary.frames_skipped,
        summary.analysis_errors
    );
}

fn device_config(adc: &str, channels: Vec<ChannelId>) -> SourceConfig {
    SourceConfig::Device {
        adc_name: adc.to_owned(),
        channels,
        sample_rate_hz: None,
        trace_length_ms: None,
        voltage_min: None,
        voltage_max: None,
        trigger: None,
    }
}

fn default_channels(bench: &BenchConfig, adc: &str, requested: Vec<ChannelId>) -> Vec<ChannelId> {
    if !requested.is_empty() {
        return requested;
    }
    bench
        .adc_setup(adc)
        .map(|setup| setup.channels.clone())
        .unwrap_or_default()
}

/// Channel ids of the first record, used when replaying without `--channels`.
fn recorded_channels(files: &[PathBuf]) -> Result<Vec<ChannelId>> {
    let Some(first) = files.first() else {
        return Ok(Vec::new());
    };
    let text = fs::read_to_string(first).with_context(|| format!("failed to read {}", first.display()))?;
    let Some(line) = text.lines().find(|l| !l.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    let record: ReplayRecord = serde_json::from_str(line)
        .with_context(|| format!("failed to parse first record of {}", first.display()))?;
    Ok(record.channels)
}

/// Runs until the source ends, Ctrl-C, or `limit` delivered frames.
fn drive(controller: &mut RunController, limit: Option<u64>) -> Result<RunSummary> {
    let handle = controller.handle();
    install_ctrlc(handle.clone())?;
    let mut delivered = 0u64;
    let summary = controller.run(&mut |frame: AnalyzedFrame| {
        print_frame(&frame);
        delivered += 1;
        if limit.is_some_and(|n| delivered >= n) {
            handle.stop();
        }
    })?;
    print_summary(&summary);
    Ok(summary)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let bench = match &cli.bench {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::default(),
    };

    match cli.command {
        Commands::Replay {
            files,
            looping,
            analysis,
        } => {
            let mut controller =
                RunController::new(bench, Box::new(SimulatedDriverFactory::default()));
            let selection = if analysis.channels.is_empty() {
                ChannelSelection::new(recorded_channels(&files)?)
            } else {
                ChannelSelection::new(analysis.channels.iter().copied())
            };
            controller.configure(SourceConfig::Replay { files, looping }, selection)?;
            controller.update_analysis_config(&analysis.update())?;
            drive(&mut controller, None)?;
        }
        Commands::Simulate {
            adc,
            frames,
            seed,
            pileup_every,
            analysis,
        } => {
            let channels = default_channels(&bench, &adc, analysis.channels.clone());
            let factory = SimulatedDriverFactory {
                seed,
                paced: true,
                pileup_every,
            };
            let mut controller = RunController::new(bench, Box::new(factory));
            let selection = ChannelSelection::new(channels.iter().copied());
            controller.configure(device_config(&adc, channels), selection)?;
            controller.update_analysis_config(&analysis.update())?;
            drive(&mut controller, frames)?;
        }
        Commands::Record {
            out,
            adc,
            frames,
            seed,
            channels,
        } => {
            let channels = default_channels(&bench, &adc, channels);
            let factory = SimulatedDriverFactory {
                seed,
                paced: true,
                pileup_every: None,
            };
            let mut controller = RunController::new(bench, Box::new(factory));
            let source = controller.open_source(&device_config(&adc, channels.clone()))?;
            let recorder = FrameRecorder::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            controller.configure_with(
                Box::new(RecordingSource::new(source, recorder)),
                ChannelSelection::new(channels),
            )?;
            let summary = drive(&mut controller, Some(frames))?;
            info!("{} frames recorded to {}", summary.frames_read, out.display());
        }
    }
    Ok(())
}
