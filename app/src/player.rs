use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use hound::{SampleFormat, WavIntoSamples, WavReader};
use thiserror::Error;

use crate::engine::{AudioSink, MediaError};
use crate::sync::Rendezvous;

/// Output format handed to sinks: 8 kHz mono.
pub const OUTPUT_RATE: u32 = rtp_audio::SAMPLE_RATE;
pub const FRAME_SAMPLES: usize = rtp_audio::SAMPLES_PER_FRAME;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },
    #[error("unsupported WAV format: {0}")]
    UnsupportedFormat(String),
    #[error("playback already in progress")]
    Busy,
    #[error("cannot start transmission: {0}")]
    Transmit(#[from] MediaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// The whole clip was consumed.
    Finished,
    /// The sink let go of the source early.
    Interrupted,
}

#[derive(Debug)]
struct PlayState {
    status: PlaybackStatus,
    cycle: u64,
    outcome: Option<PlaybackOutcome>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    state: Mutex<PlayState>,
    done: Rendezvous,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PlayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// End of stream for `cycle`. Only the first report per cycle counts.
    fn finish(&self, cycle: u64, outcome: PlaybackOutcome) {
        {
            let mut st = self.lock();
            if st.status != PlaybackStatus::Playing || st.cycle != cycle {
                return;
            }
            st.status = PlaybackStatus::Finished;
            st.outcome = Some(outcome);
        }
        self.done.signal();
    }
}

/// Single-shot WAV player whose `start_and_wait` blocks until the clip ends.
#[derive(Debug)]
pub struct Player {
    shared: Arc<Shared>,
}

fn open_wav(path: &Path) -> Result<WavReader<BufReader<File>>, PlayerError> {
    let reader = WavReader::open(path).map_err(|source| PlayerError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(PlayerError::UnsupportedFormat(format!(
            "{}-bit {:?}, need 16-bit PCM",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    if spec.channels == 0 || spec.sample_rate == 0 {
        return Err(PlayerError::UnsupportedFormat("empty format header".into()));
    }
    Ok(reader)
}

impl Player {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, PlayerError> {
        let path = path.as_ref();
        log::info!("Checking wav file '{}'", path.display());
        let reader = open_wav(path)?;
        let spec = reader.spec();
        log::debug!(
            "{}: {} Hz, {} channel(s), {} frames",
            path.display(),
            spec.sample_rate,
            spec.channels,
            reader.duration()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                path: path.to_path_buf(),
                state: Mutex::new(PlayState {
                    status: PlaybackStatus::Idle,
                    cycle: 0,
                    outcome: None,
                }),
                done: Rendezvous::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared.lock().status
    }

    /// Attach the clip to `sink` and block until it has been played out or
    /// the sink dropped it.
    pub fn start_and_wait(&self, sink: &dyn AudioSink) -> Result<PlaybackOutcome, PlayerError> {
        let cycle = {
            let mut st = self.shared.lock();
            if st.status == PlaybackStatus::Playing {
                return Err(PlayerError::Busy);
            }
            st.status = PlaybackStatus::Playing;
            st.cycle += 1;
            st.outcome = None;
            st.cycle
        };

        let source = match PlaybackSource::open(self.shared.clone(), cycle) {
            Ok(source) => source,
            Err(e) => {
                self.shared.lock().status = PlaybackStatus::Idle;
                return Err(e);
            }
        };

        if let Err(e) = sink.start_transmit(source) {
            // The rejected source already reported end of stream.
            self.wait_cycle(cycle);
            return Err(e.into());
        }
        log::info!("*** Started audio playback");

        let outcome = self.wait_cycle(cycle);
        match outcome {
            PlaybackOutcome::Finished => log::info!("*** Audio has finished"),
            PlaybackOutcome::Interrupted => log::info!("*** Audio playback interrupted"),
        }
        Ok(outcome)
    }

    fn wait_cycle(&self, cycle: u64) -> PlaybackOutcome {
        loop {
            {
                let st = self.shared.lock();
                if st.cycle != cycle || st.status != PlaybackStatus::Playing {
                    return st.outcome.unwrap_or(PlaybackOutcome::Interrupted);
                }
            }
            self.shared.done.wait();
        }
    }

    /// End-of-stream notification for the current cycle.
    pub fn on_end_of_stream(&self) {
        let cycle = self.shared.lock().cycle;
        self.shared.finish(cycle, PlaybackOutcome::Finished);
    }
}

/// The clip, decoded on demand as 8 kHz mono frames. Dropping it reports end
/// of stream to the player that created it.
pub struct PlaybackSource {
    samples: WavIntoSamples<BufReader<File>, i16>,
    channels: u16,
    /// Input frames per output sample.
    step: f64,
    frac: f64,
    current: Option<i16>,
    next: Option<i16>,
    exhausted: bool,
    shared: Arc<Shared>,
    cycle: u64,
}

impl std::fmt::Debug for PlaybackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSource")
            .field("channels", &self.channels)
            .field("step", &self.step)
            .field("exhausted", &self.exhausted)
            .field("cycle", &self.cycle)
            .finish()
    }
}

impl PlaybackSource {
    fn open(shared: Arc<Shared>, cycle: u64) -> Result<Self, PlayerError> {
        let reader = open_wav(&shared.path)?;
        let spec = reader.spec();
        let mut source = Self {
            samples: reader.into_samples::<i16>(),
            channels: spec.channels,
            step: spec.sample_rate as f64 / OUTPUT_RATE as f64,
            frac: 0.0,
            current: None,
            next: None,
            exhausted: false,
            shared,
            cycle,
        };
        source.current = source.read_input_frame();
        source.next = source.read_input_frame();
        Ok(source)
    }

    /// One input frame, downmixed to mono.
    fn read_input_frame(&mut self) -> Option<i16> {
        let mut acc: i32 = 0;
        for _ in 0..self.channels {
            match self.samples.next()? {
                Ok(s) => acc += s as i32,
                Err(e) => {
                    log::warn!("WAV decode error: {e}");
                    return None;
                }
            }
        }
        Some((acc / self.channels as i32) as i16)
    }

    fn next_sample(&mut self) -> Option<i16> {
        let Some(cur) = self.current else {
            self.exhausted = true;
            return None;
        };
        let out = match self.next {
            Some(next) => cur as f64 + (next as f64 - cur as f64) * self.frac,
            None => cur as f64,
        };

        self.frac += self.step;
        while self.frac >= 1.0 && self.current.is_some() {
            self.frac -= 1.0;
            self.current = self.next;
            self.next = match self.current {
                Some(_) => self.read_input_frame(),
                None => None,
            };
        }
        Some(out.round() as i16)
    }

    /// Fill `out` with the next samples; returns how many were written.
    /// Zero means the clip is over.
    pub fn read_frame(&mut self, out: &mut [i16]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.next_sample() {
                Some(s) => {
                    out[n] = s;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

impl Drop for PlaybackSource {
    fn drop(&mut self) {
        let outcome = if self.exhausted {
            PlaybackOutcome::Finished
        } else {
            PlaybackOutcome::Interrupted
        };
        self.shared.finish(self.cycle, outcome);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::mock::MockSink;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) fn write_wav(dir: &TempDir, name: &str, rate: u32, channels: u16, frames: usize) -> PathBuf {
        let path = dir.path().join(name);
        let spec = hound::WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..frames {
            for c in 0..channels {
                writer.write_sample((i as i16).wrapping_mul(3) + c as i16 * 100).unwrap();
            }
        }
        writer.finalize().unwrap();
        path
    }

    #[test]
    fn rejects_missing_and_non_pcm16_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Player::create(dir.path().join("nope.wav")),
            Err(PlayerError::Open { .. })
        ));

        let path = dir.path().join("float.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0.5f32).unwrap();
        writer.finalize().unwrap();
        assert!(matches!(Player::create(&path), Err(PlayerError::UnsupportedFormat(_))));
    }

    #[test]
    fn plays_to_the_end_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(&dir, "a.wav", 8000, 1, 400);
        let player = Player::create(&path).unwrap();
        assert_eq!(player.path(), path.as_path());
        let sink = MockSink::consuming();
        assert_eq!(player.start_and_wait(&sink).unwrap(), PlaybackOutcome::Finished);
        assert_eq!(sink.samples(), 400);
        assert_eq!(player.status(), PlaybackStatus::Finished);

        // Late or repeated notifications are ignored.
        player.on_end_of_stream();
        player.on_end_of_stream();
        assert_eq!(player.start_and_wait(&sink).unwrap(), PlaybackOutcome::Finished);
        assert_eq!(sink.samples(), 800);
    }

    #[test]
    fn repeated_end_of_stream_leaves_next_cycle_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(Player::create(write_wav(&dir, "e.wav", 8000, 1, 8000)).unwrap());

        let first_sink = Arc::new(MockSink::holding());
        let first = {
            let (player, sink) = (player.clone(), first_sink.clone());
            thread::spawn(move || player.start_and_wait(&*sink))
        };
        while first_sink.starts() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        player.on_end_of_stream();
        player.on_end_of_stream();
        assert_eq!(first.join().unwrap().unwrap(), PlaybackOutcome::Finished);

        let second_sink = Arc::new(MockSink::holding());
        let second = {
            let (player, sink) = (player.clone(), second_sink.clone());
            thread::spawn(move || player.start_and_wait(&*sink))
        };
        while second_sink.starts() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        assert!(!second.is_finished());
        assert_eq!(player.status(), PlaybackStatus::Playing);

        // The first cycle's source going away does not end the second.
        first_sink.stop_transmit();
        thread::sleep(Duration::from_millis(20));
        assert!(!second.is_finished());

        second_sink.stop_transmit();
        assert_eq!(second.join().unwrap().unwrap(), PlaybackOutcome::Interrupted);
    }

    #[test]
    fn stopped_sink_interrupts_and_concurrent_start_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(Player::create(write_wav(&dir, "b.wav", 8000, 1, 8000)).unwrap());
        let sink = Arc::new(MockSink::holding());

        let waiter = {
            let (player, sink) = (player.clone(), sink.clone());
            thread::spawn(move || player.start_and_wait(&*sink))
        };
        while sink.starts() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(player.status(), PlaybackStatus::Playing);
        assert!(matches!(player.start_and_wait(&*sink), Err(PlayerError::Busy)));

        sink.stop_transmit();
        assert_eq!(waiter.join().unwrap().unwrap(), PlaybackOutcome::Interrupted);
    }

    #[test]
    fn failing_sink_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let player = Player::create(write_wav(&dir, "c.wav", 8000, 1, 10)).unwrap();
        let sink = MockSink::failing();
        assert!(matches!(player.start_and_wait(&sink), Err(PlayerError::Transmit(_))));
        assert_ne!(player.status(), PlaybackStatus::Playing);
    }

    #[test]
    fn source_downmixes_and_resamples() {
        let dir = tempfile::tempdir().unwrap();
        let player = Player::create(write_wav(&dir, "d.wav", 16000, 2, 3200)).unwrap();
        let mut source = PlaybackSource::open(player.shared.clone(), 0).unwrap();
        let mut frame = [0i16; FRAME_SAMPLES];
        let mut total = 0;
        let mut first = None;
        loop {
            let n = source.read_frame(&mut frame);
            if n == 0 {
                break;
            }
            first.get_or_insert(frame[1]);
            total += n;
        }
        assert!(source.is_exhausted());
        // 3200 frames at 16 kHz is 200 ms: 1600 samples at 8 kHz.
        assert_eq!(total, 1600);
        // Second output sample is input frame 2: (6 + 106) / 2.
        assert_eq!(first, Some(56));
    }
}
