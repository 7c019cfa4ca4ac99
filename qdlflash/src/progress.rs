//! Terminal rendering of flash session events.
//!
//! Interactive terminals get an indicatif bar; anything else gets one line
//! per step and per whole percent, which is easier to log or parse.

use indicatif::{ProgressBar, ProgressStyle};
use qdlflash_lib::{FlashEvent, FlashObserver, FlashObserverArc, FlashSnapshot, Step, no_op_observer};
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BAR_LENGTH: u64 = 1000;

/// Prints step names and percentages to stdout.
pub struct PercentObserver {
    last_percent: Mutex<Option<u64>>,
}

impl PercentObserver {
    pub fn new() -> Self {
        Self {
            last_percent: Mutex::new(None),
        }
    }

    fn print_line(&self, line: &str) {
        let mut stdout = io::stdout();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }

    fn percent(progress: f64) -> u64 {
        ((progress * 100.0).floor() as u64).min(100)
    }
}

impl FlashObserver for PercentObserver {
    fn on_event(&self, event: &FlashEvent, snapshot: &FlashSnapshot) {
        match event {
            FlashEvent::StepChanged(step) => {
                *self.last_percent.lock().unwrap_or_else(|e| e.into_inner()) = None;
                self.print_line(&format!("[{}] {}", step, step.status()));
            }
            FlashEvent::ProgressChanged(progress) if *progress >= 0.0 => {
                let percent = Self::percent(*progress);
                let changed = {
                    let mut last = self.last_percent.lock().unwrap_or_else(|e| e.into_inner());
                    let changed = *last != Some(percent);
                    *last = Some(percent);
                    changed
                };
                if changed {
                    self.print_line(&format!("{}%", percent));
                }
            }
            FlashEvent::ErrorChanged(Some(condition)) => {
                self.print_line(&format!(
                    "[{}] {}: {}",
                    snapshot.step,
                    condition.status(),
                    condition.description()
                ));
            }
            FlashEvent::SerialChanged(Some(serial)) => {
                self.print_line(&format!("Device serial: {}", serial));
            }
            _ => {}
        }
    }
}

/// One bar for the whole session; the prefix names the current step.
pub struct IndicatifObserver {
    bar: ProgressBar,
}

impl IndicatifObserver {
    pub fn new() -> Self {
        let bar = ProgressBar::new(BAR_LENGTH);
        bar.set_style(
            ProgressStyle::with_template("[{prefix}] {msg} {wide_bar} {percent}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl Default for IndicatifObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashObserver for IndicatifObserver {
    fn on_event(&self, event: &FlashEvent, _snapshot: &FlashSnapshot) {
        match event {
            FlashEvent::StepChanged(Step::Done) => {
                self.bar.set_prefix(Step::Done.to_string());
                self.bar.set_position(BAR_LENGTH);
                self.bar.finish_with_message(Step::Done.status());
            }
            FlashEvent::StepChanged(step) => {
                self.bar.set_prefix(step.to_string());
                self.bar.set_position(0);
                self.bar.set_message(step.status());
            }
            FlashEvent::MessageChanged(message) if !message.is_empty() => {
                self.bar.set_message(message.clone());
            }
            FlashEvent::ProgressChanged(progress) if *progress >= 0.0 => {
                self.bar
                    .set_position((progress * BAR_LENGTH as f64).round() as u64);
            }
            FlashEvent::ErrorChanged(Some(condition)) => {
                self.bar.abandon_with_message(condition.status());
            }
            FlashEvent::ConnectionChanged(connected) => {
                self.bar.println(if *connected {
                    "Device connected"
                } else {
                    "Device disconnected"
                });
            }
            FlashEvent::SerialChanged(Some(serial)) => {
                self.bar.println(format!("Device serial: {}", serial));
            }
            _ => {}
        }
    }
}

pub fn create_observer(quiet: bool) -> FlashObserverArc {
    if quiet {
        no_op_observer()
    } else if io::stdout().is_terminal() {
        Arc::new(IndicatifObserver::new())
    } else {
        Arc::new(PercentObserver::new())
    }
}
