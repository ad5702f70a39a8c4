//! Terminal output for applied files, failures and timings

use console::style;
use elif_migrate::{ApplyError, Direction, MigrationFile};
use std::time::{Duration, Instant};

/// `> name` for up files, `< name` for down files
pub fn applied_line(file: &MigrationFile) -> String {
    let arrow = match file.direction() {
        Direction::Up => style(">").cyan(),
        Direction::Down => style("<").magenta(),
    };
    format!("{} {}", arrow, file.file_name())
}

pub fn print_applied(file: &MigrationFile) {
    println!("{}", applied_line(file));
}

pub fn print_failure(error: &ApplyError) {
    eprintln!("{}\n", style(error).red());
}

pub fn print_error(error: &anyhow::Error) {
    eprintln!("{} {:#}", style("error:").red().bold(), error);
}

/// Measures an apply command
pub struct Timer {
    started: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn print(&self) {
        println!("\n{}", format_elapsed(self.started.elapsed()));
    }
}

/// Seconds with four decimals, switching to minutes past one minute
pub fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64();
    if seconds > 60.0 {
        format!("{:.4} minutes", seconds / 60.0)
    } else {
        format!("{:.4} seconds", seconds)
    }
}
