//! WAV decoding for offline replay.

use crate::audio::frame::downmix_into;
use crate::audio::segmenter::{SpeechSegment, SpeechSegmenter};
use crate::error::{Result, VoxbridgeError};
use std::io::Read;

/// Decodes 16-bit WAV data, mixes it to mono and resamples to `target_rate`.
pub fn read_wav_mono<R: Read>(reader: R, target_rate: u32) -> Result<Vec<i16>> {
    let mut wav_reader = hound::WavReader::new(reader).map_err(|e| VoxbridgeError::AudioStream {
        message: format!("Failed to parse WAV data: {}", e),
    })?;

    let spec = wav_reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(VoxbridgeError::AudioStream {
            message: format!(
                "Unsupported WAV format: {}-bit {:?} (expected 16-bit PCM)",
                spec.bits_per_sample, spec.sample_format
            ),
        });
    }

    let raw_samples: Vec<i16> = wav_reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| VoxbridgeError::AudioStream {
            message: format!("Failed to read WAV samples: {}", e),
        })?;

    let mut mono = Vec::with_capacity(raw_samples.len() / spec.channels.max(1) as usize);
    downmix_into(&raw_samples, spec.channels as usize, &mut mono);

    Ok(resample(&mono, spec.sample_rate, target_rate))
}

/// Runs a whole buffer through `segmenter`, flushing at the end.
///
/// A trailing partial frame is zero-padded so the end of the buffer still
/// counts.
pub fn segment_samples(segmenter: &mut SpeechSegmenter, samples: &[i16]) -> Vec<SpeechSegment> {
    let frame_len = segmenter.classifier().format().samples_per_frame();
    let mut segments = Vec::new();
    let mut padded = Vec::with_capacity(frame_len);

    for chunk in samples.chunks(frame_len) {
        let frame = if chunk.len() == frame_len {
            chunk
        } else {
            padded.clear();
            padded.extend_from_slice(chunk);
            padded.resize(frame_len, 0);
            &padded
        };
        if let Some(segment) = segmenter.process_frame(frame) {
            segments.push(segment);
        }
    }

    segments.extend(segmenter.flush());
    segments
}

/// Simple linear interpolation resampling.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::FrameFormat;
    use crate::audio::segmenter::SegmenterConfig;
    use crate::audio::vad::{SpeechClassifier, VadMode};
    use std::io::Cursor;

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_16khz_mono_passes_through() {
        let input = vec![100i16, 200, 300, 400, 500];
        let wav = make_wav_data(16000, 1, &input);
        assert_eq!(read_wav_mono(Cursor::new(wav), 16000).unwrap(), input);
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let stereo = vec![100i16, 200, 300, 400, 500, 600];
        let wav = make_wav_data(16000, 2, &stereo);
        assert_eq!(
            read_wav_mono(Cursor::new(wav), 16000).unwrap(),
            vec![150, 350, 550]
        );
    }

    #[test]
    fn test_44100hz_is_resampled() {
        let wav = make_wav_data(44100, 1, &vec![1000i16; 44100]);
        let samples = read_wav_mono(Cursor::new(wav), 16000).unwrap();
        assert!(samples.len() >= 15900 && samples.len() <= 16100);
        assert!(samples.iter().all(|&s| (900..=1100).contains(&s)));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = read_wav_mono(Cursor::new(b"not a wav file".to_vec()), 16000);
        assert!(matches!(result, Err(VoxbridgeError::AudioStream { .. })));
    }

    #[test]
    fn test_resample_upsample_interpolates() {
        let out = resample(&[0, 100], 8000, 16000);
        assert_eq!(out, vec![0, 50, 100, 100]);
    }

    #[test]
    fn test_resample_empty() {
        assert!(resample(&[], 48000, 16000).is_empty());
    }

    #[test]
    fn test_segment_samples_finds_utterance_and_flushes_tail() {
        let format = FrameFormat::default();
        let frame_len = format.samples_per_frame();
        let classifier = SpeechClassifier::energy(format, VadMode::Aggressive).unwrap();
        let mut segmenter =
            SpeechSegmenter::new(classifier, SegmenterConfig::default()).unwrap();

        // 0.3s silence, 0.6s loud, 0.9s silence, 0.45s loud (left open at EOF)
        let mut samples = vec![0i16; frame_len * 10];
        samples.extend(std::iter::repeat_n(8000i16, frame_len * 20));
        samples.extend(std::iter::repeat_n(0i16, frame_len * 30));
        samples.extend(std::iter::repeat_n(8000i16, frame_len * 15 + frame_len / 2));

        let segments = segment_samples(&mut segmenter, &samples);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].sequence, 0);
        assert_eq!(segments[1].sequence, 1);
        assert!(segments[1].speech_duration.as_millis() >= 450);
    }
}
