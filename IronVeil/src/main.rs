mod logger;
mod settings;
mod shell;

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::style::{Color, Stylize};
use crossterm::terminal::{Clear, ClearType};
use log::info;
use nexis_sim::Kernel;

use crate::settings::Overrides;
use crate::shell::Shell;

/// Interactive shell for the Nexis kernel simulator.
#[derive(Parser, Debug)]
#[command(name = "ironveil", version)]
struct Args {
    /// JSON config file (default: <config dir>/ironveil/config.json)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Arena size in bytes, a multiple of 4096
    #[arg(long)]
    arena_size: Option<usize>,
    /// Scheduler tick interval in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,
    /// error, warn, info, debug or trace
    #[arg(long)]
    log_level: Option<String>,
    /// Use best-fit instead of first-fit allocation
    #[arg(long)]
    best_fit: bool,
    /// Skip the startup banner
    #[arg(long)]
    no_banner: bool,
}

fn main() {
    if let Err(e) = run(Args::parse()) {
        eprintln!("{}", format!("ironveil: {:#}", e).with(Color::Red));
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut settings = settings::load(args.config.as_deref())?;
    settings.apply(Overrides {
        arena_size: args.arena_size,
        tick_ms: args.tick_ms,
        log_level: args.log_level,
        best_fit: args.best_fit,
    });
    logger::init(settings.level()?).context("failed to install logger")?;

    let kernel = Kernel::boot(settings.kernel).context("kernel boot failed")?;
    kernel.start().context("kernel boot failed")?;
    info!(target: "app", "IronVeil attached to Nexis");

    if !args.no_banner {
        banner()?;
    }
    let stdin = io::stdin();
    Shell::new(&kernel).run(stdin.lock(), &mut io::stdout())?;
    kernel.shutdown();
    Ok(())
}

fn banner() -> io::Result<()> {
    let banner_lines = [
        "██╗██████╗  ██████╗ ███╗   ██╗██╗   ██╗███████╗██╗██╗     ",
        "██║██╔══██╗██╔═══██╗████╗  ██║██║   ██║██╔════╝██║██║     ",
        "██║██████╔╝██║   ██║██╔██╗ ██║██║   ██║█████╗  ██║██║     ",
        "██║██╔══██╗██║   ██║██║╚██╗██║╚██╗ ██╔╝██╔══╝  ██║██║     ",
        "██║██║  ██║╚██████╔╝██║ ╚████║ ╚████╔╝ ███████╗██║███████╗",
        "╚═╝╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═══╝  ╚═══╝  ╚══════╝╚═╝╚══════╝",
    ];
    let mut out = io::stdout();
    execute!(out, Clear(ClearType::All), MoveTo(0, 0))?;
    for line in &banner_lines {
        for c in line.chars() {
            write!(out, "{}", c.with(Color::AnsiValue(208)))?;
            out.flush()?;
            sleep(Duration::from_millis(2));
        }
        writeln!(out)?;
    }
    writeln!(out)?;
    writeln!(out, "Nexis simulator ready. Type 'help'.")?;
    Ok(())
}
