//! sprig - interactive shell for the Sprig runtime
//!
//! The worker thread evaluates; this thread reads lines and drives
//! the runtime through its control surface. Plain input is loaded
//! under the pause-and-resume discipline (exclusive heap access),
//! exactly like the `:load` command; results are printed by the done
//! callback as contexts finish.
//!
//! Commands:
//!   :info                heap and memory statistics
//!   :env                 global environment bindings
//!   :state               worker state
//!   :ctxs                live contexts
//!   :pause / :continue   stop and resume the worker
//!   :send CID N          send an integer to a context
//!   :load FILE           load and run a source file
//!   :save FILE           write an image snapshot
//!   :inspect SYM         look a symbol up globally and per context
//!   :undef SYM           drop a global binding
//!   :heap N              recreate the runtime with N heap cells
//!   :reset               recreate the runtime
//!   :symbols             interned symbol listing
//!   :quit                exit

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sprig_runtime::{Config, EvalState, Runtime, RuntimeError, WorkerHandle, image, launch};

const PAUSE_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Parser)]
#[command(name = "sprig")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Interactive shell for the Sprig language", long_about = None)]
struct Args {
    /// Source file to load on startup
    file: Option<PathBuf>,

    /// Cons heap size in cells
    #[arg(long)]
    heap: Option<usize>,

    /// Boot from an image snapshot
    #[arg(long)]
    image: Option<PathBuf>,
}

fn build_config(heap: Option<usize>) -> Config {
    let mut config = Config::from_env();
    if let Some(cells) = heap {
        config.heap_cells = cells.max(16);
    }
    config
}

fn make_runtime(config: Config, image_path: Option<&PathBuf>) -> Result<Runtime, String> {
    let mut rt = match image_path {
        Some(path) => {
            let bytes = std::fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
            image::boot(config, &bytes).map_err(|e| e.to_string())?
        }
        None => Runtime::new(config).map_err(|e| e.to_string())?,
    };
    rt.set_done_callback(Box::new(|ev| {
        println!("> {}", ev.printed);
    }));
    Ok(rt)
}

fn start(config: Config, image_path: Option<&PathBuf>) -> Result<WorkerHandle, String> {
    Ok(launch(make_runtime(config, image_path)?))
}

/// Run `f` with exclusive runtime access under pause-and-resume.
fn with_paused<R>(handle: &WorkerHandle, f: impl FnOnce(&mut Runtime) -> R) -> Result<R, String> {
    handle.pause(PAUSE_TIMEOUT).map_err(|e| e.to_string())?;
    let out = handle.with_paused_runtime(f).map_err(|e| e.to_string());
    handle.continue_eval();
    out
}

fn load_source(handle: &WorkerHandle, src: &str) {
    let loaded = with_paused(handle, |rt| rt.load_str(src).map(|_| ()));
    match loaded {
        Ok(Ok(())) => {}
        Ok(Err(RuntimeError::Read(e))) => println!("read error: {e}"),
        Ok(Err(e)) => println!("error: {e}"),
        Err(e) => println!("error: {e}"),
    }
}

fn print_info(handle: &WorkerHandle) {
    let info = with_paused(handle, |rt| {
        let stats = rt.store.heap_stats();
        (
            rt.store.num_cells(),
            rt.store.num_free_cells(),
            stats,
            rt.store.mem_words(),
            rt.store.mem_free_words(),
            rt.symbols.all_symbols().len(),
        )
    });
    let Ok((cells, free, stats, mem, mem_free, nsyms)) = info else {
        println!("runtime unavailable");
        return;
    };
    println!("--(cons heap)-----------------------------------");
    println!("Heap size:        {} cells", cells);
    println!("Free cons cells:  {}", free);
    println!("Used cons cells:  {}", cells - free);
    println!("GC counter:       {}", stats.gc_count);
    println!("Recovered:        {}", stats.recovered);
    println!("Recovered arrays: {}", stats.recovered_arrays);
    println!("Marked (last gc): {}", stats.marked_last);
    println!("GC stack HWM:     {}", stats.gc_stack_hwm);
    println!("--(byte memory)---------------------------------");
    println!("Memory size:      {} words", mem);
    println!("Memory free:      {} words", mem_free);
    println!("--(symbols)-------------------------------------");
    println!("Interned symbols: {}", nsyms);
}

fn print_state(handle: &WorkerHandle) {
    match handle.state() {
        EvalState::None => println!("NO STATE"),
        EvalState::Running => println!("RUNNING"),
        EvalState::Paused => println!("PAUSED"),
        EvalState::Dead => println!("DEAD"),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut heap_override = args.heap;
    let mut handle = match start(build_config(heap_override), args.image.as_ref()) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("Failed to initialize: {e}");
            std::process::exit(1);
        }
    };

    println!(
        "Sprig REPL started (version {})",
        env!("CARGO_PKG_VERSION")
    );
    println!("Type :quit to exit, :info for statistics, :load FILE for source files.");

    if let Some(path) = &args.file {
        match std::fs::read_to_string(path) {
            Ok(src) => load_source(&handle, &src),
            Err(e) => eprintln!("{}: {e}", path.display()),
        }
    }

    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Failed to initialize line editor: {e}");
            std::process::exit(1);
        }
    };

    loop {
        let line = match rl.readline("# ") {
            Ok(line) => line,
            Err(_) => break,
        };
        let _ = rl.add_history_entry(&line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix(':') {
            let (cmd, arg) = match rest.split_once(' ') {
                Some((c, a)) => (c, a.trim()),
                None => (rest, ""),
            };
            match cmd {
                "quit" => break,
                "info" => print_info(&handle),
                "state" => print_state(&handle),
                "env" => {
                    if let Ok(bindings) = with_paused(&handle, |rt| rt.global_bindings()) {
                        for (slot, entries) in bindings {
                            println!("Environment [{slot}]:");
                            for e in entries {
                                println!("  {e}");
                            }
                        }
                    }
                }
                "ctxs" => {
                    if let Ok(infos) = with_paused(&handle, |rt| rt.ctx_infos()) {
                        println!("****** Contexts ******");
                        for i in infos {
                            println!("--------------------------------");
                            println!("ContextID: {}", i.cid);
                            println!("State: {:?}", i.state);
                            println!("Stack SP: {}", i.sp);
                            println!("Stack SP max: {}", i.max_sp);
                            println!("Value: {}", i.result);
                        }
                    }
                }
                "pause" => match handle.pause_with_gc(PAUSE_TIMEOUT) {
                    Ok(()) => println!("Evaluator paused"),
                    Err(e) => println!("error: {e}"),
                },
                "continue" => handle.continue_eval(),
                "send" => {
                    let mut parts = arg.split_whitespace();
                    match (
                        parts.next().and_then(|s| s.parse::<u32>().ok()),
                        parts.next().and_then(|s| s.parse::<i64>().ok()),
                    ) {
                        (Some(cid), Some(v)) => handle.send(cid, v),
                        _ => println!("Incorrect arguments to send"),
                    }
                }
                "load" => match std::fs::read_to_string(arg) {
                    Ok(src) => load_source(&handle, &src),
                    Err(e) => println!("{arg}: {e}"),
                },
                "save" => {
                    let saved = with_paused(&handle, image::save);
                    match saved {
                        Ok(Ok(bytes)) => match std::fs::write(arg, &bytes) {
                            Ok(()) => println!("Image written: {arg} ({} bytes)", bytes.len()),
                            Err(e) => println!("{arg}: {e}"),
                        },
                        Ok(Err(e)) => println!("image error: {e}"),
                        Err(e) => println!("error: {e}"),
                    }
                }
                "inspect" => {
                    let found = with_paused(&handle, |rt| {
                        let global = rt.inspect(arg);
                        let locals = rt
                            .symbols
                            .lookup(arg)
                            .map(|id| rt.inspect_locals(id))
                            .unwrap_or_default();
                        (global, locals)
                    });
                    match found {
                        Ok((global, locals)) => {
                            match global {
                                Some(v) => println!("global: {arg} = {v}"),
                                None => println!("no global binding"),
                            }
                            for (cid, v) in locals {
                                println!("CTX {cid}: {arg} = {v}");
                            }
                        }
                        Err(e) => println!("error: {e}"),
                    }
                }
                "undef" => {
                    match with_paused(&handle, |rt| rt.undefine(arg)) {
                        Ok(true) => println!("Cleared bindings"),
                        Ok(false) => println!("No definition found"),
                        Err(e) => println!("error: {e}"),
                    }
                }
                "heap" => match arg.parse::<usize>() {
                    Ok(cells) if cells > 0 => {
                        heap_override = Some(cells);
                        handle.shutdown();
                        match start(build_config(heap_override), None) {
                            Ok(h) => handle = h,
                            Err(e) => {
                                eprintln!("Failed to reinitialize: {e}");
                                std::process::exit(1);
                            }
                        }
                        debug!(cells, "runtime recreated");
                    }
                    _ => println!("Incorrect argument to heap"),
                },
                "reset" => {
                    handle.shutdown();
                    match start(build_config(heap_override), None) {
                        Ok(h) => handle = h,
                        Err(e) => {
                            eprintln!("Failed to reinitialize: {e}");
                            std::process::exit(1);
                        }
                    }
                }
                "symbols" => {
                    if let Ok(syms) = with_paused(&handle, |rt| {
                        rt.symbols
                            .all_symbols()
                            .into_iter()
                            .map(|(id, name)| (id, name.to_string()))
                            .collect::<Vec<_>>()
                    }) {
                        for (id, name) in syms {
                            println!("{id:#06x}  {name}");
                        }
                    }
                }
                _ => println!("Unknown command :{cmd}"),
            }
            continue;
        }

        // Plain input: load it as a program.
        load_source(&handle, line);
        // Give the worker a moment so the result usually prints
        // before the next prompt.
        std::thread::sleep(Duration::from_millis(20));
    }

    handle.shutdown();
}
