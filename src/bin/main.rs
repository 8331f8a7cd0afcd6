use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::mpsc;

use voxstream::backends::fast_local::FastLocalBackend;
use voxstream::backends::openai::ParallelOpenAIProcessor;
use voxstream::backends::precise::PreciseServerClient;
use voxstream::backends::RecognitionBackend;
use voxstream::capture::MicrophoneCapture;
use voxstream::config::{PipelineConfig, RecognitionMode};
use voxstream::file_input::decode_file_to_frames;
use voxstream::whisper_transcriber::WhisperTranscriber;
use voxstream::{AudioProcessor, AudioSource, PipelineEvent};

/// Real-time streaming speech recognition pipeline.
#[derive(Parser)]
#[command(name = "voxstream")]
#[command(about = "Capture, segment, and transcribe audio in real time")]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Recognition backend to use, overriding the config file
    #[arg(long, value_enum)]
    mode: Option<CliMode>,

    /// Path to a whisper.cpp GGML model file, required for fast-local mode
    #[arg(long)]
    model: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliMode {
    FastLocal,
    PreciseHttp,
    CloudHttp,
}

impl From<CliMode> for RecognitionMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::FastLocal => RecognitionMode::FastLocal,
            CliMode::PreciseHttp => RecognitionMode::PreciseHttp,
            CliMode::CloudHttp => RecognitionMode::CloudHttp,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Stream from a microphone device
    Mic {
        /// Device name; defaults to the system default input device
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Transcribe an existing audio or video file
    File {
        /// Path to the input file
        path: PathBuf,
    },
    /// List available input devices and exit
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        for name in voxstream::capture::list_input_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(mode) = cli.mode {
        config.recognition.mode = mode.into();
    }

    let (result_tx, result_rx) = mpsc::unbounded_channel();
    let backend: Arc<dyn RecognitionBackend> = build_backend(&config, cli.model.as_deref(), result_tx)?;

    let processor = Arc::new(AudioProcessor::new(config.clone(), backend)?);
    processor
        .on_event(Arc::new(|event: PipelineEvent| match event {
            PipelineEvent::MergedTextReady { text } => println!("{}", text),
            PipelineEvent::Error(message) => error!("pipeline error: {}", message),
            other => info!("{:?}", other),
        }))
        .await;

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();

    // Held for the microphone case so the cpal stream isn't torn down early.
    let mut _mic_guard: Option<MicrophoneCapture> = None;

    let source = match &cli.command {
        Commands::Mic { device } => {
            let capture = MicrophoneCapture::start(device.as_deref(), frame_tx.clone())
                .context("starting microphone capture")?;
            let name = capture.device_name().to_string();
            _mic_guard = Some(capture);
            AudioSource::Microphone { device_name: Some(name) }
        }
        Commands::File { path } => {
            let path = path.clone();
            let tx = frame_tx.clone();
            let decode_path = path.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = decode_file_to_frames(&decode_path, tx) {
                    error!("file decode failed: {}", e);
                }
            });
            AudioSource::AudioFile { path }
        }
        Commands::Devices => unreachable!(),
    };

    processor.start_processing(source, result_rx).await?;

    tokio::select! {
        _ = async {
            while let Some(frame) = frame_rx.recv().await {
                let is_last = frame.is_last;
                processor.feed_frame(frame).await;
                if is_last {
                    break;
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
        }
    }

    processor.stop_processing().await?;
    Ok(())
}

fn build_backend(
    config: &PipelineConfig,
    model_path: Option<&std::path::Path>,
    result_tx: mpsc::UnboundedSender<(String, std::time::Instant)>,
) -> Result<Arc<dyn RecognitionBackend>> {
    Ok(match config.recognition.mode {
        RecognitionMode::FastLocal => {
            let default_path = WhisperTranscriber::default_model_dir().join("ggml-base.bin");
            let path = model_path.unwrap_or(&default_path);
            let transcriber = WhisperTranscriber::load(path, config.recognition.use_gpu)
                .context("loading whisper model for fast-local mode")?;
            Arc::new(FastLocalBackend::new(
                Arc::new(transcriber),
                config.recognition.language.clone(),
                result_tx,
            ))
        }
        RecognitionMode::PreciseHttp => Arc::new(PreciseServerClient::new(
            config.recognition.precise_server_url.clone(),
            config.recognition.language.clone(),
            config.recognition.use_gpu,
            result_tx,
        )),
        RecognitionMode::CloudHttp => Arc::new(ParallelOpenAIProcessor::new(
            config.processor.clone(),
            config.recognition.openai_server_url.clone(),
            config.recognition.openai_model.clone(),
            result_tx,
        )),
    })
}
