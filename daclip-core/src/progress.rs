use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use tracing::{Level, event};

pub const PROGRESS_TRACE_TARGET: &str = "daclip::progress";

static PROGRESS_BAR: Lazy<MultiProgress> = Lazy::new(MultiProgress::new);

pub fn progress_bar(filename: &str) -> ProgressBar {
    let pb = PROGRESS_BAR.add(ProgressBar::new_spinner());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(
        ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})",
        )
        .expect("set progress bar style"),
    );
    pb.set_message(filename.to_string());
    pb
}

/// Download progress for one file: a terminal bar plus trace events that
/// subscribers can pick up on [`PROGRESS_TRACE_TARGET`].
#[derive(Clone)]
pub struct Emitter {
    name: String,
    pb: ProgressBar,
    total: u64,
    current: u64,
}

impl Emitter {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            pb: progress_bar(&name),
            name,
            total: 0,
            current: 0,
        }
    }

    pub fn begin(&mut self, total: u64) {
        self.total = total;
        self.current = 0;
        self.pb.set_length(total);
        self.pb.set_position(0);
        event!(
            target: PROGRESS_TRACE_TARGET,
            Level::TRACE,
            kind = "started",
            name = %self.name,
            total
        );
    }

    pub fn advance(&mut self, delta: u64) {
        if delta == 0 {
            return;
        }

        self.current = self.current.saturating_add(delta);
        self.pb.inc(delta);
        event!(
            target: PROGRESS_TRACE_TARGET,
            Level::TRACE,
            kind = "progress",
            name = %self.name,
            current = self.current,
            total = self.total
        );
    }

    pub fn complete(&mut self) {
        self.pb.finish_and_clear();
        event!(
            target: PROGRESS_TRACE_TARGET,
            Level::TRACE,
            kind = "finished",
            name = %self.name
        );
    }

    pub fn current(&self) -> u64 {
        self.current
    }
}

impl hf_hub::api::tokio::Progress for Emitter {
    async fn init(&mut self, size: usize, _filename: &str) {
        self.begin(size as u64);
    }

    async fn update(&mut self, size: usize) {
        self.advance(size as u64);
    }

    async fn finish(&mut self) {
        self.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitter_accumulates_progress() {
        let mut emitter = Emitter::new("weights.safetensors");
        emitter.begin(100);
        emitter.advance(40);
        emitter.advance(0);
        emitter.advance(60);
        assert_eq!(emitter.current(), 100);
        emitter.complete();
    }
}
