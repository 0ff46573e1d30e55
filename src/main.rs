use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::exit;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use log::warn;

use tapsync::logging::init_logging;
use tapsync::{
    Command, Experiment, ExperimentConfig, SerialPortLink, SessionEvent, TrialOutcome, TrialSpec,
    DEFAULT_BAUD_RATE,
};

#[derive(Parser, Debug)]
#[command(name = "tapsync", about = "Run tapping trials against a serial tapping pad")]
struct Args {
    /// Serial port of the pad (e.g., /dev/ttyACM0 or COM6)
    #[arg(required_unless_present = "list_ports")]
    port: Option<String>,
    /// Experiment config (JSON)
    #[arg(short, long, required_unless_present = "list_ports")]
    config: Option<PathBuf>,
    /// Baud rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    /// Append one JSON line per finished trial to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

/// Prints progress and writes finished trials as JSON lines.
struct Reporter {
    sink: Option<BufWriter<File>>,
    write_error: Option<std::io::Error>,
}

impl Reporter {
    fn new(path: Option<&PathBuf>) -> Result<Self> {
        let sink = match path {
            Some(p) => {
                let file = File::options()
                    .create(true)
                    .append(true)
                    .open(p)
                    .with_context(|| format!("Failed to open output file {}", p.display()))?;
                Some(BufWriter::new(file))
            }
            None => None,
        };
        Ok(Self {
            sink,
            write_error: None,
        })
    }

    fn on_event(&mut self, event: &SessionEvent<'_>) {
        match event {
            SessionEvent::TrialStarted { index, spec } => {
                println!("[Trial {}] {}", index + 1, describe(spec));
            }
            SessionEvent::EventObserved { .. } => {}
            SessionEvent::TrialEnded { record, .. } => {
                println!(
                    "  taps: {} | releases: {} | tones: {}",
                    record.taps.len(),
                    record.releases.len(),
                    record.tones.len()
                );
                if let Some(sink) = self.sink.as_mut() {
                    let result = serde_json::to_writer(&mut *sink, record)
                        .map_err(std::io::Error::from)
                        .and_then(|_| sink.write_all(b"\n"))
                        .and_then(|_| sink.flush());
                    if let Err(e) = result {
                        warn!("failed to write trial record: {}", e);
                        self.write_error.get_or_insert(e);
                    }
                }
            }
            SessionEvent::ScoreComputed { score, .. } => match score {
                Some(score) => println!("  YOUR SCORE IS: {score}"),
                None => println!("  No score (not enough continuation taps)"),
            },
            SessionEvent::TrialAborted { error, .. } => {
                println!("  Trial aborted: {error}");
            }
        }
    }
}

fn describe(spec: &TrialSpec) -> String {
    let label = spec.label().unwrap_or("-");
    match spec {
        TrialSpec::TapCounting {
            target_releases, ..
        } => format!("tap counting ({label}), {target_releases} releases"),
        TrialSpec::SyncContinuation { params, .. } => format!(
            "sync-continuation ({label}), octave {}, IOI {} ms",
            params.octave(),
            params.ioi_ms()
        ),
    }
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    if args.list_ports {
        for name in SerialPortLink::available_ports()? {
            println!("{name}");
        }
        return Ok(());
    }

    let (Some(port), Some(config_path)) = (args.port.as_deref(), args.config.as_deref()) else {
        anyhow::bail!("a serial port and a config file are required");
    };
    let config = ExperimentConfig::load(config_path)?;
    let plan = config.trial_plan()?;
    if plan.is_empty() {
        anyhow::bail!("config {} lists no trials", config_path.display());
    }
    let mut reporter = Reporter::new(args.output.as_ref())?;

    let link = SerialPortLink::open(port, args.baud)
        .with_context(|| format!("Failed to open serial port {port}"))?;
    println!("--- Connecting to tapping pad on {} ---", link.path());
    let mut experiment = Experiment::connect(link, config.handshake)
        .context("Connection failed")?;
    println!("Connection successful!");

    let mut observer = |event: &SessionEvent<'_>| reporter.on_event(event);
    for spec in plan {
        thread::sleep(config.pretrial_delay);
        let scored = matches!(spec, TrialSpec::SyncContinuation { .. });
        match experiment.execute(Command::BeginTrial(spec), &mut observer)? {
            Some(TrialOutcome::Completed { .. }) if scored => thread::sleep(config.score_display),
            _ => {}
        }
    }
    experiment.execute(Command::Abort, &mut observer)?;

    println!("Done. {} trials run.", experiment.trials_run());
    if let Some(e) = reporter.write_error.take() {
        return Err(e).context("Some trial records could not be saved");
    }
    Ok(())
}
