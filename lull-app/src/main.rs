//! Lull - slowed + reverb music player
//!
//! Plays a file through the time/pitch and reverb chain, or renders it to a
//! WAV file with the same settings.

mod session;

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use lull_audio::{CpalOutput, PlaybackController, StageParams, TransportState};
use lull_library::Config;
use session::{OfflineOutput, Session};

/// How often the transport is polled while playing
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sample rate for export-only sessions
const EXPORT_SAMPLE_RATE: u32 = 48000;

#[derive(Debug, Parser)]
#[command(name = "lull", version, about = "Slowed + reverb music player")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Play a file
    Play {
        file: PathBuf,
        #[command(flatten)]
        stages: StageArgs,
    },
    /// Render a file with the stage settings to a WAV file
    Export {
        file: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        stages: StageArgs,
    },
    /// Reopen the last session where it left off
    Resume,
}

#[derive(Debug, Args)]
struct StageArgs {
    /// Playback rate (0.5 - 2.0)
    #[arg(long)]
    rate: Option<f32>,
    /// Pitch shift in cents (-1200 - 1200)
    #[arg(long)]
    pitch: Option<f32>,
    /// Reverb wet mix in percent (0 - 100)
    #[arg(long)]
    reverb: Option<f32>,
    /// Let rate changes drive pitch, like a turntable
    #[arg(long)]
    linked: bool,
}

impl StageArgs {
    /// Overlay the given flags on `base`
    fn apply(&self, base: StageParams) -> StageParams {
        let mut params = base;
        params.pitch_linked = self.linked || base.pitch_linked;
        if let Some(rate) = self.rate {
            params.rate = rate;
            if params.pitch_linked {
                params.pitch_cents = StageParams::linked_pitch(rate);
            }
        }
        if let Some(pitch) = self.pitch {
            params.pitch_cents = pitch;
        }
        if let Some(reverb) = self.reverb {
            params.reverb_mix = reverb;
        }
        params.clamped()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Play { file, stages } => play(Some((file, stages))),
        Command::Resume => play(None),
        Command::Export {
            file,
            output,
            stages,
        } => export(file, output, stages),
    }
}

/// Play `file` with the given flags, or resume the persisted session
fn play(file: Option<(PathBuf, StageArgs)>) -> Result<()> {
    let controller = PlaybackController::new(CpalOutput::open)
        .context("Failed to open audio output")?;
    let mut session = Session::new(controller, Config::config_path());

    match file {
        Some((file, stages)) => {
            let base = session.config().stage_params();
            session.controller().apply_params(stages.apply(base));
            let summary = session
                .load_asset(&file)
                .with_context(|| format!("Failed to load {}", file.display()))?;
            println!(
                "{} - {} ({:.1}s)",
                summary.artist, summary.title, summary.duration
            );
        }
        None => match session.restore().context("Failed to restore session")? {
            Some(summary) => println!("Resuming {} - {}", summary.artist, summary.title),
            None => anyhow::bail!("No previous session to resume"),
        },
    }

    let (ended_tx, ended_rx) = unbounded();
    session.controller().set_listener(move |change| {
        if change.state == TransportState::Finished {
            let _ = ended_tx.send(());
        }
    });

    session.controller().play().context("Failed to start playback")?;
    println!("Commands: p (play/pause), s <secs> (seek), r <rate>, t <cents>, v <mix>, l (link), q (quit)");

    let commands = spawn_stdin_reader();
    run_loop(&session, &commands, &ended_rx);

    session
        .persist()
        .context("Failed to save session")?;
    Ok(())
}

fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn run_loop(session: &Session, commands: &Receiver<String>, ended: &Receiver<()>) {
    let controller = session.controller();
    loop {
        controller.poll();
        if ended.try_recv().is_ok() {
            println!("End of track");
            return;
        }

        let line = match commands.recv_timeout(POLL_INTERVAL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let arg = parts.next().and_then(|v| v.parse::<f64>().ok());

        let result = match (verb, arg) {
            ("q", _) => return,
            ("p", _) => {
                if controller.is_playing() {
                    controller.pause()
                } else {
                    controller.play()
                }
            }
            ("s", Some(secs)) => controller.seek(secs),
            ("r", Some(rate)) => {
                controller.set_rate(rate as f32);
                Ok(())
            }
            ("t", Some(cents)) => {
                controller.set_pitch(cents as f32);
                Ok(())
            }
            ("v", Some(mix)) => {
                controller.set_reverb_mix(mix as f32);
                Ok(())
            }
            ("l", _) => {
                let linked = !controller.params().pitch_linked;
                controller.set_pitch_linked(linked);
                Ok(())
            }
            _ => {
                println!("Unknown command: {}", line.trim());
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                let params = controller.params();
                println!(
                    "{:.1}/{:.1}s  rate {:.2}  pitch {:.0}c  reverb {:.0}%{}",
                    controller.current_time(),
                    controller.duration(),
                    params.rate,
                    params.pitch_cents,
                    params.reverb_mix,
                    if params.pitch_linked { "  (linked)" } else { "" }
                );
            }
            Err(e) => eprintln!("{}", e),
        }
    }
}

fn export(file: PathBuf, output: PathBuf, stages: StageArgs) -> Result<()> {
    let controller = PlaybackController::new(|_feed| Ok(OfflineOutput::new(EXPORT_SAMPLE_RATE)))?;
    let mut session = Session::new(controller, Config::config_path());

    session
        .controller()
        .apply_params(stages.apply(StageParams::default()));
    session
        .load_asset(&file)
        .with_context(|| format!("Failed to load {}", file.display()))?;

    let (done_tx, done_rx) = unbounded();
    let worker = session.export(output, move |result| {
        let _ = done_tx.send(result);
    })?;

    let report = done_rx
        .recv()
        .context("Export worker exited without a result")??;
    let _ = worker.join();
    if let Some(e) = &report.resume_error {
        eprintln!("Playback was not resumed: {}", e);
    }

    println!(
        "Wrote {} ({:.2}s)",
        report.output.display(),
        report.duration_secs()
    );
    Ok(())
}
