use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::pipeline::{RunSummary, TaskState};

/// How a run reports per-task progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Progress {
    /// Progress bar with markers printed above it.
    Bar,
    /// Markers only, one line each on stderr.
    Lines,
    #[default]
    Silent,
}

enum Sink {
    Bar,
    Lines(Mutex<Box<dyn Write + Send>>),
    Silent,
}

/// Live per-task progress for one run.
///
/// Markers are printed above the progress bar so they survive redraws. A
/// hidden reporter swallows everything.
pub struct RunReporter {
    bar: ProgressBar,
    sink: Sink,
}

impl RunReporter {
    pub fn for_progress(progress: Progress, total: usize) -> Self {
        match progress {
            Progress::Bar => Self::new(total),
            Progress::Lines => Self::lines(),
            Progress::Silent => Self::hidden(),
        }
    }

    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        if let Ok(style) = ProgressStyle::default_bar()
            .template("⟦{spinner:.bright_magenta}⟧ [{elapsed_precise}] ⟨{bar:30.bright_green/bright_black}⟩ {pos}/{len} tasks {msg}")
        {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏ "));
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar, sink: Sink::Bar }
    }

    /// Markers without a bar.
    pub fn lines() -> Self {
        Self::with_writer(Box::new(std::io::stderr()))
    }

    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            sink: Sink::Lines(Mutex::new(writer)),
        }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
            sink: Sink::Silent,
        }
    }

    fn emit(&self, line: String) {
        match &self.sink {
            Sink::Bar => self.bar.println(line),
            Sink::Lines(writer) => {
                let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = writeln!(writer, "{}", line);
            }
            Sink::Silent => {}
        }
    }

    pub fn set_total(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    pub fn task_started(&self, name: &str) {
        self.bar.set_message(format!("running {}", name));
        self.emit(format!(
            "{} {}",
            "[*]".truecolor(0, 212, 255).bold(),
            format!("{} started", name).truecolor(200, 200, 200)
        ));
    }

    pub fn task_done(&self, name: &str, elapsed: Duration) {
        self.bar.inc(1);
        self.emit(format!(
            "{} {} {}",
            "[✓]".truecolor(0, 255, 65).bold(),
            name.truecolor(255, 255, 255).bold(),
            format!("done in {}", format_elapsed(elapsed)).truecolor(128, 128, 128)
        ));
    }

    pub fn task_not_applicable(&self, name: &str) {
        self.bar.inc(1);
        self.emit(format!(
            "{} {}",
            "[~]".truecolor(255, 140, 0).bold(),
            format!("{} not applicable to this target", name).truecolor(128, 128, 128)
        ));
    }

    pub fn task_failed(&self, name: &str, error: &str) {
        self.bar.inc(1);
        self.emit(format!(
            "{} {} {}",
            "[!]".truecolor(255, 0, 81).bold(),
            name.truecolor(255, 255, 255).bold(),
            error.truecolor(255, 0, 81)
        ));
    }

    pub fn task_skipped(&self, name: &str, reason: &str) {
        self.bar.inc(1);
        self.emit(format!(
            "{} {}",
            "[-]".truecolor(128, 128, 128).bold(),
            format!("{} skipped: {}", name, reason).truecolor(128, 128, 128)
        ));
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    pub fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 60 {
        format!("{}m{:02}s", elapsed.as_secs() / 60, elapsed.as_secs() % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}

fn state_label(state: TaskState) -> ColoredString {
    match state {
        TaskState::Done => "DONE".truecolor(0, 255, 65).bold(),
        TaskState::Failed => "FAILED".truecolor(255, 0, 81).bold(),
        TaskState::Skipped => "SKIPPED".truecolor(128, 128, 128).bold(),
        TaskState::Pending | TaskState::Running => state.to_string().to_uppercase().yellow(),
    }
}

/// Render the end-of-run table.
pub fn render_summary(summary: &RunSummary, results: &Path) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "\n{} {}\n",
        "⟦TARGET⟧".truecolor(255, 0, 81).bold(),
        summary.target.truecolor(255, 255, 255).bold()
    ));
    output.push_str(&format!(
        "{} {}\n\n",
        "⟦DURATION⟧".truecolor(0, 212, 255).bold(),
        format_elapsed(summary.elapsed).truecolor(255, 255, 255)
    ));

    output.push_str(&format!(
        "  {:<12} {:<9} {:<9} {}\n",
        "TOOL".truecolor(191, 64, 191).bold(),
        "STATE".truecolor(191, 64, 191).bold(),
        "TIME".truecolor(191, 64, 191).bold(),
        "DETAIL".truecolor(191, 64, 191).bold()
    ));

    for task in &summary.tasks {
        let time = task
            .elapsed
            .map(format_elapsed)
            .unwrap_or_else(|| "-".to_string());
        output.push_str(&format!(
            "  {:<12} {:<9} {:<9} {}\n",
            task.name.truecolor(255, 255, 255),
            state_label(task.state),
            time.truecolor(128, 128, 128),
            task.detail.as_deref().unwrap_or("").truecolor(128, 128, 128)
        ));
    }

    output.push_str(&format!(
        "\n{} {} done, {} failed, {} skipped\n",
        "⟦RESULT⟧".truecolor(0, 255, 65).bold(),
        summary.count(TaskState::Done).to_string().truecolor(0, 255, 65),
        summary.count(TaskState::Failed).to_string().truecolor(255, 0, 81),
        summary.count(TaskState::Skipped).to_string().truecolor(128, 128, 128)
    ));
    output.push_str(&format!(
        "{} {}\n",
        "⟦OUTPUT⟧".truecolor(255, 140, 0).bold(),
        results.display().to_string().truecolor(255, 255, 255)
    ));

    output
}

pub fn print_summary(summary: &RunSummary, results: &Path) {
    print!("{}", render_summary(summary, results));
}
