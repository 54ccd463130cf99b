//! Small terminal output helpers shared by the command handlers.

use colored::Colorize;

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow().bold(), message.yellow());
}

pub fn print_info(label: &str, value: &str) {
    println!("  {} {}", format!("{label}:").bright_cyan().bold(), value.bright_white());
}
