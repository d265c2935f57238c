use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Stage reporting on stderr. Spinners only when stderr is a terminal.
#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode) -> Self {
        let stderr_tty = std::io::stderr().is_terminal();
        // Auto stays plain when stdout is piped so JSON output is not interleaved.
        let stdout_tty = std::io::stdout().is_terminal();
        let pretty = stderr_tty
            && match mode {
                UiMode::Pretty => true,
                UiMode::Auto => stdout_tty,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        let spinner = if self.pretty {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg} {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            Some(spinner)
        } else {
            eprintln!("==> {}", name);
            None
        };
        StageGuard {
            name: name.to_string(),
            start: Instant::now(),
            spinner,
            done: false,
        }
    }
}

/// Reports a stage as finished when dropped. A stage dropped without
/// [`StageGuard::done`] (an early `?` return) is reported as failed.
pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    done: bool,
}

impl StageGuard {
    pub fn detail(&self, detail: &str) {
        if let Some(spinner) = &self.spinner {
            spinner.set_message(format!("{}: {}", self.name, detail));
        } else {
            eprintln!("    {}", detail);
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let mark = if self.done { "✔" } else { "✘" };
        let message = format!(
            "{} {} ({})",
            mark,
            self.name,
            format_duration(self.start.elapsed())
        );
        match &self.spinner {
            Some(spinner) if self.done => spinner.finish_with_message(message),
            Some(spinner) => spinner.abandon_with_message(message),
            None => eprintln!("{message}"),
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
