use std::{
    borrow::Cow,
    fmt::Display,
};

use colored::Colorize;
use indicatif::{
    ProgressBar,
    ProgressStyle,
};

const ANIMATION: &[&str; 2] = &["...", ""];

/// Terminal logger used by the CLI driver. Log lines are routed through the
/// progress bar so they don't tear an active spinner line.
pub struct Logger {
    bar: ProgressBar,
    running: bool,
}

impl Logger {
    pub fn spinner() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template("{prefix:.magenta} {msg} {spinner}").unwrap().tick_strings(ANIMATION));
        bar.set_prefix("[lyn]");

        Self {
            bar,
            running: false,
        }
    }

    pub fn set_title(&mut self, title: impl Into<Cow<'static, str>>) {
        self.running = true;
        self.bar.set_message(title.into());
    }

    fn stop(&mut self) {
        if self.running {
            self.running = false;
            self.bar.finish_and_clear();
        }
    }

    fn emit<L: Display, S: AsRef<str>>(&self, level: L, msg: S) {
        self.bar.println(format!("{} {}", level, msg.as_ref()));
    }

    pub fn info<S: AsRef<str>>(&self, msg: S) {
        self.emit("[lyn::INFO]".blue().bold(), msg);
    }

    pub fn warning<S: AsRef<str>>(&self, msg: S) {
        self.emit("[lyn::WARN]".yellow().bold(), msg);
    }

    pub fn debug<S: AsRef<str>>(&self, _msg: S) {
        #[cfg(debug_assertions)]
        {
            self.emit("[lyn::DEBUG]".black().on_white(), _msg);
        }
    }

    pub fn error<S: AsRef<str>>(&self, msg: S) {
        self.emit("[lyn::ERROR]".red().bold(), msg);
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.stop();
    }
}
