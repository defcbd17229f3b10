//! Session-level audio state shared with the audio output collaborator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Host audio output collaborator.
pub trait SoundStream: Send {
    /// Starts playback.
    fn start(&mut self);

    /// Stops playback.
    fn stop(&mut self);

    /// Queues interleaved stereo samples.
    fn write_samples(&mut self, samples: &[i16]);
}

/// Attached sound stream plus running and dump flags.
///
/// Flags are atomics so collaborators on other threads read consistent
/// values without taking the stream lock.
#[derive(Default)]
pub struct AudioState {
    stream: Mutex<Option<Box<dyn SoundStream>>>,
    running: AtomicBool,
    dump_started: AtomicBool,
}

impl std::fmt::Debug for AudioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioState")
            .field("attached", &self.has_stream())
            .field("running", &self.is_running())
            .field("dump_started", &self.is_dump_started())
            .finish()
    }
}

impl AudioState {
    /// Creates state with no stream attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the attached stream, returning the previous one.
    ///
    /// A running stream being replaced is stopped first.
    pub fn set_stream(&self, stream: Option<Box<dyn SoundStream>>) -> Option<Box<dyn SoundStream>> {
        let mut slot = self.lock();
        let mut previous = std::mem::replace(&mut *slot, stream);
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(old) = previous.as_mut() {
                old.stop();
            }
        }
        previous
    }

    /// Returns `true` when a stream is attached.
    #[must_use]
    pub fn has_stream(&self) -> bool {
        self.lock().is_some()
    }

    /// Starts or stops the attached stream and records the new state.
    pub fn set_running(&self, running: bool) {
        let mut slot = self.lock();
        if self.running.swap(running, Ordering::AcqRel) == running {
            return;
        }
        if let Some(stream) = slot.as_mut() {
            if running {
                stream.start();
            } else {
                stream.stop();
            }
        }
    }

    /// Returns `true` while the stream is marked running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Records whether an audio dump is in progress.
    pub fn set_dump_started(&self, started: bool) {
        self.dump_started.store(started, Ordering::Release);
    }

    /// Returns `true` while an audio dump is in progress.
    #[must_use]
    pub fn is_dump_started(&self) -> bool {
        self.dump_started.load(Ordering::Acquire)
    }

    /// Forwards samples to a running stream. Returns `false` when dropped.
    pub fn push_samples(&self, samples: &[i16]) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.lock().as_mut() {
            Some(stream) => {
                stream.write_samples(samples);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn SoundStream>>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{AudioState, SoundStream};

    #[derive(Clone, Default)]
    struct Recording {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl SoundStream for Recording {
        fn start(&mut self) {
            self.events.lock().expect("events").push("start".into());
        }

        fn stop(&mut self) {
            self.events.lock().expect("events").push("stop".into());
        }

        fn write_samples(&mut self, samples: &[i16]) {
            self.events
                .lock()
                .expect("events")
                .push(format!("samples:{}", samples.len()));
        }
    }

    #[test]
    fn samples_reach_only_a_running_stream() {
        let audio = AudioState::new();
        let stream = Recording::default();
        assert!(audio.set_stream(Some(Box::new(stream.clone()))).is_none());

        assert!(!audio.push_samples(&[0; 4]));
        audio.set_running(true);
        audio.set_running(true);
        assert!(audio.push_samples(&[0; 4]));
        audio.set_running(false);

        assert_eq!(
            *stream.events.lock().expect("events"),
            vec!["start", "samples:4", "stop"]
        );
    }

    #[test]
    fn replacing_a_running_stream_stops_it() {
        let audio = AudioState::new();
        let stream = Recording::default();
        audio.set_stream(Some(Box::new(stream.clone())));
        audio.set_running(true);

        assert!(audio.set_stream(None).is_some());
        assert!(!audio.is_running());
        assert!(!audio.has_stream());
        assert_eq!(stream.events.lock().expect("events").last().map(String::as_str), Some("stop"));
    }

    #[test]
    fn dump_flag_is_independent_of_stream() {
        let audio = Arc::new(AudioState::new());
        let other = Arc::clone(&audio);
        std::thread::spawn(move || other.set_dump_started(true))
            .join()
            .expect("setter thread");
        assert!(audio.is_dump_started());
        assert!(!audio.has_stream());
    }
}
