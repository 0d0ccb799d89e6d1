use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use voxbridge::audio::segmenter::SpeechSegmenter;
use voxbridge::audio::vad::SpeechClassifier;
use voxbridge::audio::wav::{read_wav_mono, segment_samples};
use voxbridge::cli::{Cli, Commands, log_filter};
use voxbridge::config::Config;
use voxbridge::defaults;
use voxbridge::pipeline::{AudioPipeline, BargeInDetector, ChannelSink, EnergySource};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_filter(cli.quiet, cli.verbose))),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    config.validate().context("invalid configuration")?;

    match cli.command {
        Commands::Devices => list_audio_devices(),
        Commands::Segment { file, json } => segment_file(&config, &file, json),
        Commands::Listen {
            input,
            output,
            no_barge_in,
        } => {
            let mut config = config;
            if input.is_some() {
                config.audio.input_device = input;
            }
            if output.is_some() {
                config.audio.output_device = output;
            }
            if no_barge_in {
                config.barge_in.enabled = false;
            }
            listen(config).await
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Load config from an explicit path, or the default path with fallback.
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path())?,
    };
    Ok(config.with_env_overrides())
}

#[cfg(feature = "cpal-audio")]
fn discovery() -> Result<Arc<dyn voxbridge::audio::devices::DeviceDiscovery>> {
    Ok(Arc::new(voxbridge::audio::cpal_io::CpalDiscovery::new()))
}

#[cfg(not(feature = "cpal-audio"))]
fn discovery() -> Result<Arc<dyn voxbridge::audio::devices::DeviceDiscovery>> {
    anyhow::bail!("voxbridge was built without the cpal-audio feature")
}

fn list_audio_devices() -> Result<()> {
    use voxbridge::audio::devices::Direction;

    let discovery = discovery()?;
    for direction in [Direction::Input, Direction::Output] {
        let devices = discovery.list_devices(direction)?;
        let default = discovery.default_device(direction);
        println!("Available {} devices:", direction);
        if devices.is_empty() {
            println!("  (none)");
        }
        for device in devices {
            let marker = if default.as_ref().is_some_and(|d| d.index == device.index) {
                " (default)"
            } else {
                ""
            };
            println!("  [{}] {}{}", device.index, device.name, marker);
        }
    }
    Ok(())
}

fn segment_file(config: &Config, path: &Path, json: bool) -> Result<()> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let samples = read_wav_mono(BufReader::new(file), config.audio.sample_rate)?;

    let classifier = SpeechClassifier::new(config.frame_format(), config.vad.mode, config.vad.backend)?;
    let mut segmenter = SpeechSegmenter::new(classifier, config.segmenter_config())?;
    let segments = segment_samples(&mut segmenter, &samples);

    for segment in &segments {
        if json {
            let line = serde_json::json!({
                "sequence": segment.sequence,
                "start_ms": segment.start.as_millis() as u64,
                "end_ms": segment.end.as_millis() as u64,
                "speech_ms": segment.speech_duration.as_millis() as u64,
                "audio_ms": segment.audio_duration().as_millis() as u64,
                "samples": segment.samples.len(),
                "confidence": segment.confidence,
            });
            println!("{}", line);
        } else {
            println!(
                "#{} {:>8.2}s - {:>8.2}s  speech {:.2}s  confidence {:.2}",
                segment.sequence,
                segment.start.as_secs_f64(),
                segment.end.as_secs_f64(),
                segment.speech_duration.as_secs_f64(),
                segment.confidence,
            );
        }
    }

    let stats = segmenter.stats();
    tracing::info!(
        emitted = stats.segments_emitted,
        discarded = stats.segments_discarded,
        forced = stats.forced_closes,
        stream_ms = segmenter.position().as_millis() as u64,
        backend = segmenter.classifier().backend_name(),
        "segmentation finished"
    );
    Ok(())
}

async fn listen(config: Config) -> Result<()> {
    let pipeline = AudioPipeline::new(
        config.pipeline_config(),
        discovery()?,
        voxbridge::audio::driver::default_driver(),
    )?;

    if !pipeline.initialize_devices() {
        anyhow::bail!("no usable audio devices found (see `voxbridge devices`)");
    }

    let (sink, segments) = ChannelSink::bounded(defaults::SEGMENT_CHANNEL_CAPACITY);
    pipeline.set_segment_sink(Box::new(sink));

    let detector = if config.barge_in.enabled {
        let energy: Arc<dyn EnergySource> = pipeline.energy_meter();
        let detector = Arc::new(BargeInDetector::new(config.barge_in_config(), energy)?);
        pipeline.attach_barge_in(&detector);
        detector.on_interruption(|event| {
            println!(
                "barge-in: energy {:.2}, latency {:.0}ms",
                event.energy, event.latency_ms
            );
        });
        Some(detector)
    } else {
        None
    };
    let barge_in = detector.as_ref().map(|d| d.spawn());

    if !pipeline.start_capture() {
        anyhow::bail!("failed to start audio capture");
    }
    if !pipeline.start_playback() {
        tracing::warn!("playback unavailable, continuing capture-only");
    }
    pipeline.start_listening();

    let printer = tokio::task::spawn_blocking(move || {
        for segment in segments {
            println!(
                "#{} {:.2}s of speech at {:.2}s ({} samples)",
                segment.sequence,
                segment.speech_duration.as_secs_f64(),
                segment.start.as_secs_f64(),
                segment.samples.len()
            );
        }
    });

    eprintln!("Listening, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;

    if let Some(handle) = barge_in {
        handle.join().await;
    }
    pipeline.stop_capture();
    pipeline.stop_playback();
    pipeline.go_idle();

    let stats = pipeline.stats();
    // Replacing the sink drops the sender, which ends the printer loop.
    pipeline.set_segment_sink(Box::new(voxbridge::pipeline::NullSink));
    if let Err(e) = printer.await {
        tracing::error!("segment printer failed: {}", e);
    }

    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
