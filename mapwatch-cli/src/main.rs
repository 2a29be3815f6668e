//! mapwatch CLI - コマンドラインインターフェース
//!
//! トレース対象プロセスのメモリマップを追跡する mapwatch のREPLインターフェース

use anyhow::Result;
use clap::{Parser, Subcommand};
use mapwatch_core::parse::parse_address;
use mapwatch_core::{is_error, Command, Progress, Session, SessionOptions, StopReason, TrackerConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// mapwatch - ptrace memory map tracker
#[derive(Parser)]
#[command(name = "mapwatch")]
#[command(version = "0.1.0")]
#[command(about = "Tracks mmap/munmap/mprotect/mremap/brk of a traced process", long_about = None)]
struct Cli {
    /// Run to completion, printing every tracked call, instead of opening the REPL
    #[arg(long, global = true)]
    trace: bool,

    /// Regex matching the C library path in /proc/<pid>/maps
    #[arg(long, global = true)]
    libc: Option<String>,

    /// Page size used to split mappings into regions (defaults to the host page size)
    #[arg(long, global = true)]
    page_size: Option<u64>,

    #[command(subcommand)]
    command: TraceCommand,
}

#[derive(Subcommand)]
enum TraceCommand {
    /// Launch and trace an executable
    Run {
        /// Path to the executable binary
        binary: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let options = session_options(&cli)?;
    let mut session = init_session(cli.command, &options)?;

    if cli.trace {
        run_trace(&mut session)
    } else {
        println!("mapwatch - memory map tracker");
        println!("Version 0.1.0");
        println!();
        run_repl(&mut session)
    }
}

/// RUST_LOG が無ければ mapwatch のクレートだけ info で出す
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mapwatch_core=info,mapwatch_target=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn session_options(cli: &Cli) -> Result<SessionOptions> {
    let mut options = SessionOptions::default();
    if let Some(pattern) = &cli.libc {
        options.library_pattern = pattern.clone();
    }
    if let Some(page_size) = cli.page_size {
        options.config = TrackerConfig::new(page_size)?;
    }
    Ok(options)
}

/// プロセスにアタッチまたは起動し、システムコールサイトを設定する
fn init_session(command: TraceCommand, options: &SessionOptions) -> Result<Session> {
    let session = match command {
        TraceCommand::Run { binary, args } => {
            let session = Session::launch(&binary, &args, options)?;
            println!("Launched {} (pid {})", binary, session.pid());
            session
        }
        TraceCommand::Attach { pid } => {
            let session = Session::attach(pid, options)?;
            println!("Attached to process {}", pid);
            session
        }
    };

    let module = session.module();
    println!(
        "Found {} at 0x{:x}, {} syscall sites armed",
        module.path,
        module.base,
        session.sites().count()
    );
    println!();
    Ok(session)
}

/// 非対話モード: 終了まで実行し、各イベントを表示する
fn run_trace(session: &mut Session) -> Result<()> {
    session.run_to_end(|progress, tracker| {
        print_progress(progress);
        if matches!(progress, Progress::Reconciled { event, .. } if event.syscall.is_tracked()) {
            print!("{}", tracker);
        }
    })?;
    Ok(())
}

/// REPLループを実行する
fn run_repl(session: &mut Session) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(mapwatch) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(session, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// コマンドを処理する。false なら REPL を抜ける
fn handle_command(session: &mut Session, line: &str) -> Result<bool> {
    match Command::parse(line) {
        Some(Command::Help) => print_help(),
        Some(Command::Quit) => {
            println!("Goodbye!");
            return Ok(false);
        }
        Some(Command::Continue) => handle_continue(session)?,
        Some(Command::Run) => handle_run(session)?,
        Some(Command::Maps) => print!("{}", session.tracker()),
        Some(Command::Region(addr)) => handle_region(session, &addr)?,
        Some(Command::Sites) => handle_sites(session),
        Some(Command::Verify) => handle_verify(session)?,
        None => {
            println!("Unknown command: {}", line);
            println!("Type 'help' for available commands.");
        }
    }
    Ok(true)
}

/// Continueコマンドを処理する
fn handle_continue(session: &mut Session) -> Result<()> {
    let progress = session.run_until_event()?;
    print_progress(&progress);
    Ok(())
}

/// Runコマンドを処理する
fn handle_run(session: &mut Session) -> Result<()> {
    session.run_to_end(|progress, _| print_progress(progress))?;
    Ok(())
}

fn handle_region(session: &Session, addr: &str) -> Result<()> {
    let addr = parse_address(addr)?;
    match session.tracker().find(addr) {
        Some(region) => println!("{}", region),
        None => println!("No tracked region contains 0x{:x}", addr),
    }
    Ok(())
}

fn handle_sites(session: &Session) {
    let module = session.module();
    println!("Syscall sites in {}:", module.path);
    for site in session.sites() {
        let wrapper = module.symbolize(site.address).unwrap_or_else(|| "?".to_string());
        println!("  0x{:x}  {:<10} {}", site.address, site.syscall.to_string(), wrapper);
    }
}

fn handle_verify(session: &Session) -> Result<()> {
    let drift = session.verify()?;
    if drift.is_empty() {
        println!("Model matches /proc/{}/maps ({} regions)", session.pid(), session.tracker().region_count());
    } else {
        println!("{} regions drifted:", drift.len());
        for d in &drift {
            println!("  {}", d);
        }
    }
    Ok(())
}

fn print_progress(progress: &Progress) {
    match progress {
        Progress::Reconciled { event, retval } if is_error(*retval) => {
            println!("{} = {} (errno {})", event, retval, -retval);
        }
        Progress::Reconciled { event, retval } => println!("{} = 0x{:x}", event, retval),
        Progress::Fault { event, error } => println!("{}: model drift: {}", event, error),
        Progress::Exited(reason) => print_exit(reason),
    }
}

fn print_exit(reason: &StopReason) {
    match reason {
        StopReason::Exited(code) => println!("Process exited with code {}", code),
        StopReason::Killed(signal) => println!("Process killed by {:?}", signal),
        other => println!("Process stopped: {:?}", other),
    }
}

fn print_help() {
    println!("Available commands:");
    println!();
    println!("  help (h, ?)       - Show this help message");
    println!("  quit/exit/q       - Detach and exit");
    println!();
    println!("Trace commands:");
    println!("  continue (c)      - Run to the next tracked syscall");
    println!("  run (r)           - Run until the process exits");
    println!();
    println!("Inspect commands:");
    println!("  maps (m)          - Show program break and tracked regions");
    println!("  region (x) <addr> - Show the region containing an address");
    println!("  sites             - List armed syscall instructions");
    println!("  verify (v)        - Compare the model with /proc/<pid>/maps");
    println!();
    println!("Examples:");
    println!("  c");
    println!("  x 0x7ffff7fb0000");
    println!("  verify");
}
