use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use crate::sink::ProgressSink;
use crate::train::{EpochStats, TrainingSummary};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
    disable_pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool, disable_pretty: bool) -> Self {
        Self {
            mode,
            is_tty,
            disable_pretty,
        }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool, disable_pretty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty, disable_pretty)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty
            && match self.mode {
                UiMode::Pretty => true,
                UiMode::Auto => !self.disable_pretty,
                UiMode::Plain => false,
            }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.use_pretty() {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Per-epoch progress for a training run of `epochs` epochs.
    pub fn training(&self, epochs: usize) -> TrainingProgress {
        if self.use_pretty() {
            let bar = ProgressBar::new(epochs as u64);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template("{bar:30} {pos}/{len} epochs {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            TrainingProgress { bar: Some(bar) }
        } else {
            TrainingProgress { bar: None }
        }
    }
}

/// Training progress sink: a bar in pretty mode, one line per epoch otherwise.
pub struct TrainingProgress {
    bar: Option<ProgressBar>,
}

impl TrainingProgress {
    pub fn finish(&self, summary: &TrainingSummary) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message(epoch_message(summary.final_loss, summary.final_accuracy));
        }
    }
}

fn epoch_message(loss: f32, accuracy: f32) -> String {
    format!("loss {:.4}  acc {:.1}%", loss, accuracy * 100.0)
}

impl ProgressSink for TrainingProgress {
    fn on_epoch(&self, epoch: usize, loss: f32) {
        match &self.bar {
            Some(bar) => {
                bar.set_message(format!("loss {:.4}", loss));
                bar.inc(1);
            }
            None => eprintln!("    epoch {:>3}  loss {:.4}", epoch + 1, loss),
        }
    }

    fn on_epoch_stats(&self, stats: &EpochStats) {
        let message = epoch_message(stats.loss, stats.accuracy);
        match &self.bar {
            Some(bar) => {
                bar.set_message(message);
                bar.inc(1);
            }
            None => eprintln!("    epoch {:>3}  {}", stats.epoch + 1, message),
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_output_needs_a_terminal() {
        assert!(!Ui::from_args(Some("pretty"), false, false).use_pretty());
        assert!(Ui::from_args(Some("pretty"), true, true).use_pretty());
        assert!(!Ui::from_args(Some("plain"), true, false).use_pretty());
        assert!(!Ui::from_args(None, true, true).use_pretty());
        assert_eq!(Ui::from_args(Some("bogus"), true, false).mode, UiMode::Auto);
    }

    #[test]
    fn epoch_lines_show_loss_and_accuracy() {
        assert_eq!(epoch_message(0.25, 0.875), "loss 0.2500  acc 87.5%");
    }

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
