//! Fixed-length WAV capture for checking the capture path without a client

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::audio::capture::FrameSource;
use crate::constants::STOP_POLL_INTERVAL;
use crate::error::AudioError;

/// Give up when the source delivers nothing for this long
const NO_AUDIO_LIMIT: Duration = Duration::from_secs(5);

/// Outcome of a test recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub frames: usize,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Record `seconds` of audio from `source` into a 16-bit WAV file at `path`
pub fn record_test(source: &mut dyn FrameSource, seconds: u32, path: &Path) -> Result<RecordingSummary, AudioError> {
    let format = source.format();
    let spec = hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let target_bytes = format.sample_rate as usize * seconds as usize * format.frame_bytes();

    let mut writer = hound::WavWriter::create(path, spec).map_err(|e| AudioError::Recording(e.to_string()))?;

    tracing::info!("Recording {}s test capture to {}", seconds, path.display());
    source.begin_session()?;
    let copied = copy_frames(source, &mut writer, target_bytes);
    source.end_session();
    let written = copied?;

    writer
        .finalize()
        .map_err(|e| AudioError::Recording(e.to_string()))?;

    Ok(RecordingSummary {
        path: path.to_path_buf(),
        frames: written / format.frame_bytes().max(1),
        sample_rate: format.sample_rate,
        channels: format.channels,
    })
}

fn copy_frames(
    source: &mut dyn FrameSource,
    writer: &mut hound::WavWriter<BufWriter<File>>,
    target_bytes: usize,
) -> Result<usize, AudioError> {
    let mut written = 0;
    let mut last_audio = Instant::now();

    while written < target_bytes {
        let Some(frame) = source.next_frame(STOP_POLL_INTERVAL)? else {
            if last_audio.elapsed() > NO_AUDIO_LIMIT {
                return Err(AudioError::Recording("capture delivered no audio".to_string()));
            }
            continue;
        };
        last_audio = Instant::now();

        let take = (target_bytes - written).min(frame.len());
        for bytes in frame.as_bytes()[..take].chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([bytes[0], bytes[1]]))
                .map_err(|e| AudioError::Recording(e.to_string()))?;
        }
        written += take;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::FrameBuffer;
    use crate::protocol::AudioFormat;

    /// Endless ramp of 10 ms stereo blocks
    struct RampSource {
        format: AudioFormat,
        next: i16,
        sessions: usize,
    }

    impl FrameSource for RampSource {
        fn format(&self) -> AudioFormat {
            self.format
        }

        fn begin_session(&mut self) -> Result<(), AudioError> {
            self.sessions += 1;
            Ok(())
        }

        fn next_frame(&mut self, _timeout: Duration) -> Result<Option<FrameBuffer>, AudioError> {
            let samples: Vec<i16> = (0..self.format.block_frames as usize * 2)
                .map(|_| {
                    self.next = self.next.wrapping_add(1);
                    self.next
                })
                .collect();
            Ok(Some(FrameBuffer::from_i16(&samples, 2, 0)))
        }
    }

    #[test]
    fn test_record_writes_exact_length() {
        let dir = std::env::temp_dir().join(format!("pcm-bridge-rec-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("capture_test.wav");

        let mut source = RampSource {
            format: AudioFormat::pcm16(8000, 2, 80),
            next: 0,
            sessions: 0,
        };
        let summary = record_test(&mut source, 1, &path).unwrap();
        assert_eq!(summary.frames, 8000);
        assert_eq!(source.sessions, 1);

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 8000);
        assert_eq!(spec.bits_per_sample, 16);

        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 16000);
        assert_eq!(&samples[..3], &[1, 2, 3]);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
