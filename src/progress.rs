//! Progress reporting for long-running writes.
//!
//! The streamer calls the observer from its own thread on every completed
//! write; implementations must not call back into the streamer. The CLI
//! renders with indicatif; `Silent` is for tests and `--quiet` use.

use indicatif::{ProgressBar, ProgressStyle};

/// Observer notified with the cumulative number of bytes written.
pub trait Progress {
    /// Called after every write with the total bytes written so far.
    fn update(&mut self, bytes_written: u64);

    /// Called once when the transfer completes successfully.
    fn finish(&mut self) {}
}

/// No-op observer.
pub struct Silent;

impl Progress for Silent {
    fn update(&mut self, _bytes_written: u64) {}
}

/// Terminal progress bar showing bytes, throughput and ETA.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(total_bytes: u64, label: &str) -> Self {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{bar:36}] {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
            )
            .expect("progress template is valid")
            .progress_chars("=> "),
        );
        bar.set_message(label.to_string());
        Self { bar }
    }
}

impl Progress for BarProgress {
    fn update(&mut self, bytes_written: u64) {
        self.bar.set_position(bytes_written);
    }

    fn finish(&mut self) {
        self.bar.finish();
    }
}

/// Records the last reported position; used by tests to assert the
/// streamer reports monotonically and ends at the source length.
#[derive(Default)]
pub struct Recorder {
    pub last: u64,
    pub updates: usize,
    pub monotonic: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            last: 0,
            updates: 0,
            monotonic: true,
        }
    }
}

impl Progress for Recorder {
    fn update(&mut self, bytes_written: u64) {
        if bytes_written < self.last {
            self.monotonic = false;
        }
        self.last = bytes_written;
        self.updates += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_tracks_monotonic_updates() {
        let mut rec = Recorder::new();
        rec.update(10);
        rec.update(20);
        assert_eq!(rec.last, 20);
        assert_eq!(rec.updates, 2);
        assert!(rec.monotonic);

        rec.update(5);
        assert!(!rec.monotonic);
    }
}
