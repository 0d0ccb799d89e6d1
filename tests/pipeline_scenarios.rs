//! End-to-end conversation turns through the public pipeline API, driven by
//! the in-memory audio driver.

use std::sync::Arc;
use voxbridge::audio::devices::{DeviceDiscovery, DeviceSelector, MockDiscovery};
use voxbridge::audio::driver::MockDriver;
use voxbridge::audio::vad::VadBackendKind;
use voxbridge::pipeline::{AudioPipeline, ChannelSink, PipelineConfig, PipelineState};

const FRAME: usize = 480;

fn discovery() -> Arc<dyn DeviceDiscovery> {
    Arc::new(
        MockDiscovery::new()
            .with_inputs(&["Built-in Microphone", "USB Headset"])
            .with_outputs(&["Built-in Speakers", "HDMI Output"]),
    )
}

fn config() -> PipelineConfig {
    PipelineConfig {
        vad_backend: VadBackendKind::Energy,
        capture_buffer_frames: 500,
        playback_buffer_frames: 50,
        ..PipelineConfig::default()
    }
}

fn running(config: PipelineConfig) -> (AudioPipeline, MockDriver) {
    let driver = MockDriver::new();
    let pipeline = AudioPipeline::new(config, discovery(), Box::new(driver.clone())).unwrap();
    assert!(pipeline.initialize_devices());
    assert!(pipeline.start_capture());
    assert!(pipeline.start_playback());
    (pipeline, driver)
}

fn speak(driver: &MockDriver, frames: usize) {
    for _ in 0..frames {
        assert!(driver.push_input(&vec![8000i16; FRAME]));
    }
}

fn pause(driver: &MockDriver, frames: usize) {
    for _ in 0..frames {
        assert!(driver.push_input(&vec![0i16; FRAME]));
    }
}

#[test]
fn full_turn_listen_process_speak_listen() {
    let (pipeline, driver) = running(config());
    let (sink, segments) = ChannelSink::bounded(4);
    pipeline.set_segment_sink(Box::new(sink));

    // User asks a question
    assert!(pipeline.start_listening());
    speak(&driver, 20);
    pause(&driver, 20);

    let question = segments.try_recv().expect("question should be segmented");
    assert_eq!(question.sequence, 0);
    assert_eq!(question.sample_rate, 16000);
    assert!(question.speech_duration.as_millis() >= 500);
    assert!(question.samples.len() >= FRAME * 20);
    assert!(segments.try_recv().is_err());

    // Thinking: speech is ignored
    assert!(pipeline.start_processing());
    speak(&driver, 20);
    pause(&driver, 20);
    assert!(segments.try_recv().is_err());

    // Answer is played out completely
    assert!(pipeline.play_audio(&vec![1200i16; FRAME * 3]));
    assert_eq!(pipeline.state(), PipelineState::Speaking);
    let played = driver.pull_output(FRAME * 3).unwrap();
    assert!(played.iter().all(|&s| s == 1200));
    assert!(pipeline.is_speaking());
    let tail = driver.pull_output(FRAME).unwrap();
    assert!(tail.iter().all(|&s| s == 0));
    assert!(!pipeline.is_speaking());

    // Back to listening for the follow-up
    assert!(pipeline.start_listening());
    speak(&driver, 15);
    pause(&driver, 20);
    let follow_up = segments.try_recv().expect("follow-up should be segmented");
    assert!(follow_up.speech_duration.as_millis() >= 250);

    let stats = pipeline.stats();
    assert_eq!(stats.segments_delivered, 2);
    assert_eq!(stats.frames_played, 3);
    assert_eq!(stats.underruns, 1);
    assert_eq!(stats.utterances_played, 1);
    assert_eq!(stats.barge_ins, 0);
    assert_eq!(stats.frames_captured, 115);
    assert_eq!(stats.state, PipelineState::Listening);
}

#[test]
fn short_noises_are_not_segmented() {
    let (pipeline, driver) = running(config());
    let (sink, segments) = ChannelSink::bounded(4);
    pipeline.set_segment_sink(Box::new(sink));
    pipeline.start_listening();

    // 90ms clicks separated by long pauses
    for _ in 0..3 {
        speak(&driver, 3);
        pause(&driver, 20);
    }
    assert!(segments.try_recv().is_err());
    assert_eq!(pipeline.stats().segmenter.segments_discarded, 3);
}

#[test]
fn full_consumer_channel_drops_segments_without_blocking() {
    let (pipeline, driver) = running(config());
    let (sink, segments) = ChannelSink::bounded(1);
    pipeline.set_segment_sink(Box::new(sink));
    pipeline.start_listening();

    for _ in 0..3 {
        speak(&driver, 12);
        pause(&driver, 20);
    }

    let stats = pipeline.stats();
    assert_eq!(stats.segments_delivered, 1);
    assert_eq!(stats.segments_dropped, 2);
    assert_eq!(segments.len(), 1);
}

#[test]
fn leaving_listening_discards_half_utterance() {
    let (pipeline, driver) = running(config());
    let (sink, segments) = ChannelSink::bounded(4);
    pipeline.set_segment_sink(Box::new(sink));

    pipeline.start_listening();
    speak(&driver, 20);
    pipeline.start_processing();
    pause(&driver, 5);
    pipeline.start_listening();
    pause(&driver, 30);

    assert!(segments.try_recv().is_err());
}

#[test]
fn devices_resolve_by_name_and_index() {
    let config = PipelineConfig {
        input_device: DeviceSelector::parse(Some("usb")),
        output_device: DeviceSelector::parse(Some("1")),
        ..config()
    };
    let driver = MockDriver::new();
    let pipeline = AudioPipeline::new(config, discovery(), Box::new(driver.clone())).unwrap();

    assert!(pipeline.initialize_devices());
    assert_eq!(pipeline.input_device().unwrap().name, "USB Headset");
    assert_eq!(pipeline.output_device().unwrap().name, "HDMI Output");

    assert!(pipeline.start_capture());
    let spec = driver.input_spec().unwrap();
    assert_eq!(spec.sample_rate, 16000);
    assert_eq!(spec.channels, 1);
}

#[test]
fn unknown_device_leaves_pipeline_unstarted() {
    let config = PipelineConfig {
        input_device: DeviceSelector::parse(Some("Nonexistent Mic")),
        ..config()
    };
    let driver = MockDriver::new();
    let pipeline = AudioPipeline::new(config, discovery(), Box::new(driver.clone())).unwrap();

    assert!(!pipeline.initialize_devices());
    assert!(pipeline.input_device().is_none());
    assert!(!pipeline.start_capture());
    assert!(!driver.is_input_open());
    // Playback side still resolved
    assert!(pipeline.start_playback());
}

#[test]
fn driver_failure_is_reported_as_false() {
    let driver = MockDriver::new().with_open_failure();
    let pipeline = AudioPipeline::new(config(), discovery(), Box::new(driver)).unwrap();
    assert!(pipeline.initialize_devices());
    assert!(!pipeline.start_capture());
    assert!(!pipeline.is_capturing());
}

#[test]
fn error_state_blocks_playback_until_recovered() {
    let (pipeline, driver) = running(config());
    assert!(pipeline.set_error("output device lost"));
    assert!(!pipeline.play_audio(&vec![100i16; FRAME]));
    assert!(driver.pull_output(FRAME).unwrap().iter().all(|&s| s == 0));

    assert!(pipeline.go_idle());
    assert!(pipeline.play_audio(&vec![100i16; FRAME]));
    assert_eq!(pipeline.state(), PipelineState::Speaking);
}

#[test]
fn stats_serialize_for_reporting() {
    let (pipeline, _driver) = running(config());
    let json = serde_json::to_value(pipeline.stats()).unwrap();
    assert_eq!(json["state"], "Idle");
    assert_eq!(json["capture_running"], true);
    assert!(json["classifier"].is_object());
}
