//! Command-line driver for the Skiff scripting language.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use skiff_vm_bytecode::disassemble;
use skiff_vm_core::{ErrorKind, Vm, VmParams};
use skiff_vm_runtime::{exec_in_module, load_std_io};
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "skiff", version, about = "Skiff scripting language runtime")]
struct Cli {
    /// Script file to run.
    script: PathBuf,

    /// Print the compiled bytecode of the module initializer before running.
    #[arg(long)]
    dump_bytecode: bool,

    /// Print heap statistics after the run.
    #[arg(long)]
    mem_stats: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let source = std::fs::read_to_string(&cli.script)
        .with_context(|| format!("failed to read '{}'", cli.script.display()))?;
    let script_dir = cli
        .script
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut vm = Vm::new(VmParams {
        print_fn: Some(Box::new(|message| println!("{message}"))),
        error_fn: Some(Box::new(|kind, line, message| match kind {
            ErrorKind::StackTraceBegin => eprintln!("stack trace:"),
            ErrorKind::StackTrace => eprintln!("  {message}"),
            ErrorKind::StackTraceEnd => {}
            _ => {
                if line >= 0 {
                    eprintln!("{kind:?} error (line {line}): {message}");
                } else {
                    eprintln!("{kind:?} error: {message}");
                }
            }
        })),
        module_fn: Some(Box::new(move |_from, name| resolve_module(&script_dir, name))),
        ..VmParams::default()
    });

    vm.stack_resize(1);
    load_std_io(&mut vm, 0).expect("std:io installs into a fresh vm");

    let module_name = cli
        .script
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("main")
        .to_string();
    let result = exec_in_module(&mut vm, Some(&module_name), &source);

    if cli.dump_bytecode {
        if let Some(module) = vm.find_module(&module_name) {
            if let Some(init) = vm.heap().module(module).init {
                let f = vm.heap().function(init);
                eprintln!("-- {} --", f.name);
                eprint!("{}", disassemble(&f.code, Some(&f.lines)));
            }
        }
    }

    if cli.mem_stats {
        eprintln!("heap: {} bytes live, {} objects", vm.bytes_allocated(), vm.heap().live_count());
    }

    if let Err(err) = result {
        anyhow::bail!("{err}");
    }
    Ok(())
}

/// Resolve an import against the script's directory: `name` as given, then
/// with the `.sk` extension.
fn resolve_module(script_dir: &Path, name: &str) -> Option<String> {
    let direct = script_dir.join(name);
    if let Ok(source) = std::fs::read_to_string(&direct) {
        return Some(source);
    }
    let with_ext = script_dir.join(format!("{name}.sk"));
    std::fs::read_to_string(with_ext).ok()
}
