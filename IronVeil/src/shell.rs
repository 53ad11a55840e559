use std::io::{self, BufRead, Write};

use anyhow::{anyhow, bail, Context, Result};
use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::style::{Color, Stylize};
use crossterm::terminal::{Clear, ClearType};
use log::debug;
use nexis_sim::fs::FileType;
use nexis_sim::scheduler::SIGKILL;
use nexis_sim::{Kernel, PhysAddr, Pid, SyscallParams, VirtAddr};

const ORANGE: Color = Color::AnsiValue(208);

#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Shell<'k> {
    kernel: &'k Kernel,
}

fn parse_number(text: &str) -> Result<u64> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.with_context(|| format!("not a number: {}", text))
}

fn parse_pid(arg: Option<&str>) -> Result<Pid> {
    let arg = arg.ok_or_else(|| anyhow!("missing pid"))?;
    arg.parse().with_context(|| format!("not a pid: {}", arg))
}

fn required<'a>(arg: Option<&'a str>, what: &str) -> Result<&'a str> {
    arg.ok_or_else(|| anyhow!("missing {}", what))
}

impl<'k> Shell<'k> {
    pub fn new(kernel: &'k Kernel) -> Self {
        Self { kernel }
    }

    /// Read commands from `input` until `exit` or end of input.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, out: &mut W) -> Result<()> {
        let mut lines = input.lines();
        loop {
            write!(out, "{} ", "ironveil>".with(ORANGE))?;
            out.flush()?;
            let line = match lines.next() {
                Some(line) => line?,
                None => break,
            };
            match self.execute(&line, out) {
                Ok(Flow::Exit) => break,
                Ok(Flow::Continue) => {}
                Err(e) => writeln!(out, "{}", format!("error: {:#}", e).with(Color::Red))?,
            }
        }
        writeln!(out, "{}", "Exiting IronVeil CLI...".with(ORANGE))?;
        Ok(())
    }

    pub fn execute<W: Write>(&mut self, line: &str, out: &mut W) -> Result<Flow> {
        let mut words = line.split_whitespace();
        let cmd = match words.next() {
            Some(cmd) => cmd,
            None => return Ok(Flow::Continue),
        };
        debug!(target: "app", "command {:?}", line);
        let k = self.kernel;

        match cmd {
            "help" => self.help(out)?,
            "clear" | "cls" => {
                queue!(out, Clear(ClearType::All), MoveTo(0, 0))?;
            }
            "ps" => self.ps(out)?,
            "run" => {
                let path = required(words.next(), "path")?;
                match k.create_process(path) {
                    Some(pid) => writeln!(out, "started {} as pid {}", path, pid)?,
                    None => bail!("could not start {}", path),
                }
            }
            "kill" => {
                let pid = parse_pid(words.next())?;
                let signal = match words.next() {
                    Some(s) => s.parse().with_context(|| format!("not a signal: {}", s))?,
                    None => SIGKILL,
                };
                if !k.scheduler().send_signal(pid, signal) {
                    bail!("no such process: {}", pid);
                }
            }
            "stop" => {
                let pid = parse_pid(words.next())?;
                if !k.scheduler().suspend_process(pid) {
                    bail!("cannot stop process {}", pid);
                }
            }
            "cont" => {
                let pid = parse_pid(words.next())?;
                if !k.scheduler().resume_process(pid) {
                    bail!("cannot continue process {}", pid);
                }
            }
            "nice" => {
                let pid = parse_pid(words.next())?;
                let prio = required(words.next(), "priority")?;
                let prio: i32 = prio.parse().with_context(|| format!("not a priority: {}", prio))?;
                if !k.scheduler().set_process_priority(pid, prio) {
                    bail!("no such process: {}", pid);
                }
            }
            "wait" => {
                let pid = parse_pid(words.next())?;
                if !k.scheduler().wait_for_process(pid) {
                    bail!("no such process: {}", pid);
                }
                writeln!(out, "process {} finished", pid)?;
            }
            "mem" => self.mem(out)?,
            "alloc" => {
                let size = parse_number(required(words.next(), "size")?)? as usize;
                match k.allocate_memory(size) {
                    Some(addr) => writeln!(out, "{}", addr)?,
                    None => bail!("out of memory"),
                }
            }
            "free" => {
                let addr = parse_number(required(words.next(), "address")?)? as usize;
                if !k.free_memory(PhysAddr(addr)) {
                    bail!("{:#x} is not an allocation", addr);
                }
            }
            "vpage" => self.vpage(words.next(), words.next(), out)?,
            "ls" => self.ls(words.next().unwrap_or("/"), out)?,
            "cat" => {
                let path = required(words.next(), "file")?;
                match k.read_file(path) {
                    Some(text) => write!(out, "{}", text)?,
                    None => bail!("cannot read {}", path),
                }
            }
            "write" => {
                let path = required(words.next(), "file")?;
                let text = words.collect::<Vec<_>>().join(" ");
                if !k.write_file(path, &format!("{}\n", text)) {
                    bail!("cannot write {}", path);
                }
            }
            "rm" => {
                let path = required(words.next(), "file")?;
                if !k.delete_file(path) {
                    bail!("cannot remove {}", path);
                }
            }
            "syscall" => {
                let number = parse_number(required(words.next(), "syscall number")?)?;
                let params = syscall_params(words)?;
                writeln!(out, "{}", k.system_call(number, &params))?;
            }
            "exit" | "quit" => return Ok(Flow::Exit),
            other => writeln!(out, "{}", format!("Unknown command: {}", other).with(Color::Red))?,
        }
        Ok(Flow::Continue)
    }

    fn help<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{}", "Available commands:".with(ORANGE))?;
        for (usage, what) in [
            ("help", "Show this help message"),
            ("clear", "Clear the screen"),
            ("ps", "List processes"),
            ("run <path>", "Start a process"),
            ("kill <pid> [signal]", "Send a signal (default 9)"),
            ("stop <pid> | cont <pid>", "Suspend or resume a process"),
            ("nice <pid> <prio>", "Change scheduling priority"),
            ("wait <pid>", "Wait for a process to finish"),
            ("mem", "Show the memory map"),
            ("alloc <size> | free <addr>", "Allocate or free arena memory"),
            ("vpage new|free|xlate [vaddr]", "Manage virtual pages"),
            ("ls [dir] | cat <file>", "Browse the file system"),
            ("write <file> <text>", "Replace a file's contents"),
            ("rm <file>", "Delete a file"),
            ("syscall <num> [args..]", "Invoke a system call"),
            ("exit", "Quit IronVeil CLI"),
        ] {
            writeln!(out, "  {:<30} - {}", usage, what)?;
        }
        Ok(())
    }

    fn ps<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(
            out,
            "{:>5} {:>5} {:<10} {:>4} {:>9} {:>7} {:<8} PATH",
            "PID", "PPID", "STATE", "PRIO", "CPU", "MEM", "START"
        )?;
        for p in self.kernel.scheduler().processes() {
            writeln!(
                out,
                "{:>5} {:>5} {:<10} {:>4} {:>8.2}s {:>6}K {:<8} {}",
                p.pid,
                p.parent,
                p.state.to_string(),
                p.priority,
                p.cpu_time.as_secs_f64(),
                p.memory_size / 1024,
                p.start_time.format("%H:%M:%S"),
                p.path
            )?;
        }
        Ok(())
    }

    fn mem<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mm = self.kernel.memory();
        writeln!(
            out,
            "total {}K  used {}K  free {}K  allocations {}  pages mapped {}",
            mm.total_memory() / 1024,
            mm.used_memory() / 1024,
            mm.free_memory() / 1024,
            mm.allocation_count(),
            self.kernel.pager().mapped_pages()
        )?;
        for block in mm.blocks() {
            let owner = match (block.is_free, block.owner) {
                (true, _) => "free".to_string(),
                (false, Some(pid)) => format!("pid {}", pid),
                (false, None) => "kernel".to_string(),
            };
            writeln!(out, "  {} {:>10} {}", block.address(), block.size, owner)?;
        }
        Ok(())
    }

    fn vpage<W: Write>(&self, action: Option<&str>, arg: Option<&str>, out: &mut W) -> Result<()> {
        let pager = self.kernel.pager();
        match action {
            Some("new") => match pager.allocate_virtual_page() {
                Some(vaddr) => writeln!(out, "{} -> {}", vaddr, pager.virtual_to_physical(vaddr))?,
                None => bail!("no virtual page available"),
            },
            Some("free") => {
                let vaddr = VirtAddr(parse_number(required(arg, "virtual address")?)? as usize);
                if !pager.free_virtual_page(vaddr) {
                    bail!("{} is not mapped", vaddr);
                }
            }
            Some("xlate") => {
                let vaddr = VirtAddr(parse_number(required(arg, "virtual address")?)? as usize);
                writeln!(out, "{} -> {}", vaddr, pager.virtual_to_physical(vaddr))?;
            }
            _ => bail!("usage: vpage new|free|xlate [vaddr]"),
        }
        Ok(())
    }

    fn ls<W: Write>(&self, dir: &str, out: &mut W) -> Result<()> {
        let entries = self
            .kernel
            .fs()
            .list_directory(dir)
            .ok_or_else(|| anyhow!("not a directory: {}", dir))?;
        for entry in entries {
            let attrs = &entry.attributes;
            match attrs.kind {
                FileType::Directory => writeln!(out, "{}/", entry.name.as_str().with(ORANGE))?,
                FileType::Regular => writeln!(
                    out,
                    "{:<24} {:>6}  {}",
                    entry.name,
                    attrs.size,
                    attrs.modified.format("%Y-%m-%d %H:%M")
                )?,
            }
        }
        Ok(())
    }
}

/// Numbers fill `arg1..arg4` in order, `ptr=ADDR` sets the pointer, and the
/// first other word starts the string argument.
fn syscall_params<'a>(words: impl Iterator<Item = &'a str>) -> Result<SyscallParams> {
    let mut params = SyscallParams::default();
    let mut numbers = Vec::new();
    let mut rest = Vec::new();
    for word in words {
        if !rest.is_empty() {
            rest.push(word);
        } else if let Some(ptr) = word.strip_prefix("ptr=") {
            params.pointer = parse_number(ptr)?;
        } else if let Ok(n) = parse_number(word) {
            numbers.push(n);
        } else {
            rest.push(word);
        }
    }
    if numbers.len() > 4 {
        bail!("at most four numeric arguments");
    }
    let mut slots = [&mut params.arg1, &mut params.arg2, &mut params.arg3, &mut params.arg4];
    for (slot, n) in slots.iter_mut().zip(numbers) {
        **slot = n;
    }
    if !rest.is_empty() {
        params.string = Some(rest.join(" "));
    }
    Ok(params)
}
