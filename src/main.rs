use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt as _;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use voicedesk::actions::StatusUpdate;
use voicedesk::live::build_setup_message;
use voicedesk::voice::{
    CapturedFrame, ChunkId, InputStream as _, Microphone, OUTPUT_SAMPLE_RATE, PlaybackScheduler,
    Speaker, meter, samples_to_wav,
};
use voicedesk::{
    ActionLog, Command as SessionCommand, Config, CpalBackend, Notifier, SessionController,
    WsConnector, prompt,
};

/// voicedesk - Realtime voice assistant front-end
#[derive(Parser)]
#[command(name = "voicedesk", version, about)]
struct Cli {
    /// Prebuilt voice to request (overrides config)
    #[arg(long, env = "VOICEDESK_VOICE")]
    voice: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to a WAV file
        #[arg(long)]
        wav: Option<PathBuf>,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
    /// Print the session setup message, including tool declarations
    Tools,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voicedesk=info",
        1 => "info,voicedesk=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load();
    if let Some(voice) = cli.voice {
        config.live.voice = voice;
    }
    tracing::debug!(?config, "loaded configuration");

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, wav } => test_mic(duration, wav).await,
            Command::TestSpeaker => test_speaker().await,
            Command::Tools => print_tools(&config),
        };
    }

    interactive(config).await
}

/// Run a live session driven from the terminal
#[allow(clippy::future_not_send)]
async fn interactive(config: Config) -> anyhow::Result<()> {
    let connector = WsConnector::from_config(&config.live)?;

    let notifier = Notifier::new(&config.notifications);
    let log = notifier.log();
    let updates = notifier.subscribe();
    let (action_tx, action_rx) = mpsc::unbounded_channel();
    tokio::spawn(notifier.run(action_rx));
    tokio::spawn(print_actions(log, updates));

    let mut controller = SessionController::new(
        config,
        Arc::new(connector),
        Box::new(CpalBackend),
        action_tx,
    );

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    spawn_input(cmd_tx);

    let mut status = controller.subscribe();
    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticker.tick().await;
            if status.has_changed().is_err() {
                break;
            }
            let current = *status.borrow_and_update();
            let ring = meter::ring(current.meter(), started.elapsed().as_secs_f64() * 1000.0);
            eprint!(
                "\r{} {:<12} r={:>5.1}",
                meter::render_bar(current.meter(), 30),
                current.state.to_string(),
                ring.radius
            );
            let _ = std::io::stderr().flush();
        }
    });

    println!("Press Enter to connect or disconnect, q then Enter to quit.");
    controller.run(cmd_rx).await;
    println!();

    Ok(())
}

/// Forward Enter, `q` and Ctrl-C to the session
fn spawn_input(commands: mpsc::UnboundedSender<SessionCommand>) {
    let ctrl_c = commands.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c.send(SessionCommand::Shutdown);
        }
    });

    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            let command = match lines.next_line().await {
                Ok(Some(line)) if line.trim().eq_ignore_ascii_case("q") => SessionCommand::Shutdown,
                Ok(Some(_)) => SessionCommand::Toggle,
                Ok(None) | Err(_) => SessionCommand::Shutdown,
            };
            let stop = command == SessionCommand::Shutdown;
            if commands.send(command).is_err() || stop {
                break;
            }
        }
    });
}

/// Print actions as they move through delivery
async fn print_actions(
    log: Arc<tokio::sync::RwLock<ActionLog>>,
    mut updates: broadcast::Receiver<StatusUpdate>,
) {
    loop {
        let update = match updates.recv().await {
            Ok(update) => update,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "missed action updates");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let log = log.read().await;
        if let Some(event) = log.get(&update.id) {
            eprintln!(
                "\n[{}] {} - {} ({})",
                event.timestamp.format("%H:%M:%S"),
                event.title,
                event.message,
                update.status
            );
        }
    }
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64, wav: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::unbounded_channel::<CapturedFrame>();
    let mut mic = Microphone::open(tx)?;

    let sample_rate = mic.sample_rate();
    println!("Sample rate: {sample_rate} Hz");
    println!("---");

    let mut recorded = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut peak = 0u8;
    let mut next_report = tokio::time::Instant::now() + Duration::from_secs(1);
    let mut second = 0;

    while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        peak = peak.max(frame.volume);
        if wav.is_some() {
            recorded.extend_from_slice(&frame.samples);
        }

        if tokio::time::Instant::now() >= next_report {
            second += 1;
            let state = voicedesk::MeterState {
                is_active: true,
                volume: peak,
                is_agent_talking: false,
            };
            println!("[{second:2}s] {}", meter::render_bar(state, 40));
            peak = 0;
            next_report += Duration::from_secs(1);
        }
    }

    mic.stop()?;

    if let Some(path) = wav {
        let bytes = samples_to_wav(&recorded, sample_rate)?;
        std::fs::write(&path, bytes)?;
        println!("\nWrote {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the volume stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with three back-to-back tones
#[allow(clippy::future_not_send)]
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear three rising tones with no gaps\n");

    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<ChunkId>();
    let speaker = Speaker::open(ended_tx)?;
    let mut scheduler = PlaybackScheduler::new(Box::new(speaker), OUTPUT_SAMPLE_RATE);

    for frequency in [440.0_f32, 554.37, 659.25] {
        let chunk = scheduler.schedule(tone(frequency, 0.6))?;
        println!(
            "{} at {:.3}s for {:.3}s",
            chunk.id, chunk.start, chunk.duration
        );
    }

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(id) = ended_rx.recv().await {
            if scheduler.on_chunk_ended(id) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    scheduler.close();

    println!("\n---");
    if finished {
        println!("If you heard the tones, your speakers are working!");
    } else {
        println!("Playback did not finish in time.");
    }
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Sine tone at the output rate
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn tone(frequency: f32, seconds: f32) -> Vec<f32> {
    let rate = OUTPUT_SAMPLE_RATE as f32;
    let len = (rate * seconds) as usize;
    (0..len)
        .map(|i| (2.0 * std::f32::consts::PI * frequency * i as f32 / rate).sin() * 0.3)
        .collect()
}

/// Print the setup message sent at the start of every session
fn print_tools(config: &Config) -> anyhow::Result<()> {
    let instruction = prompt::system_instruction(&config.notifications.support_email);
    let setup = build_setup_message(&config.live, instruction);
    println!("{}", serde_json::to_string_pretty(&setup)?);
    Ok(())
}
