use colored::Colorize;

pub fn print_success(msg: &str) {
    println!("{} {msg}", "✓".green());
}

pub fn print_warning(msg: &str) {
    eprintln!("{} {msg}", "!".yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {msg}", "✗".red());
}
