use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

use clap::Parser as ClapParser;

use garnet::ast::Program;
use garnet::diagnostic::{Diagnostic, ansi::AnsiRenderer, json, registry};
use garnet::{Config, Core, Error};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serialized AST of the program to run
    #[arg(required_unless_present = "explain", help = "The program .json file")]
    program: Option<PathBuf>,

    /// Interpret every function instead of generating native code
    #[arg(long)]
    no_jit: bool,

    /// Send every operator through full dispatch
    #[arg(long)]
    no_inline: bool,

    /// Dispatch recursive calls like any other call
    #[arg(long)]
    no_self_call: bool,

    /// Print the IR of every function instead of running
    #[arg(long)]
    dump_ir: bool,

    /// Report errors as one line of JSON on stderr
    #[arg(long)]
    json_errors: bool,

    /// JSON file with configuration defaults
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Explain a diagnostic code, e.g. C001
    #[arg(long, value_name = "CODE", conflicts_with = "program")]
    explain: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    if let Some(code) = &cli.explain {
        match registry::lookup(code) {
            Some(entry) => {
                print!("{}", entry.long);
                return;
            }
            None => {
                eprintln!("unknown error code '{code}'");
                process::exit(2);
            }
        }
    }

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => report(&e, cli.json_errors),
    };
    garnet::config::init_logging(config.log.as_deref());

    if let Err(e) = run(&cli, config) {
        report(&e, cli.json_errors);
    }
}

/// Defaults, then the config file, then `GARNET_*`, then flags.
fn load_config(cli: &Cli) -> garnet::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if cli.no_jit {
        config.jit = false;
    }
    if cli.no_inline {
        config.inline_operators = false;
    }
    if cli.no_self_call {
        config.self_call = false;
    }
    Ok(config)
}

fn run(cli: &Cli, config: Config) -> garnet::Result<()> {
    let Some(path) = &cli.program else {
        return Ok(());
    };
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))?;
    let program = Program::from_json(&text)?;
    tracing::debug!(file = %program.file, jit = config.jit, "loaded program");

    let core = Core::new(config);
    if cli.dump_ir {
        core.load(&program)?;
        println!("{}", core.functions.dump());
        return Ok(());
    }
    core.run(&program)?;
    let (compiled, fallbacks) = core.jit.stats();
    tracing::debug!(compiled, fallbacks, "finished");
    Ok(())
}

fn report(e: &Error, as_json: bool) -> ! {
    let diagnostic = Diagnostic::from(e);
    if as_json {
        eprintln!("{}", json::render(&diagnostic));
    } else {
        let renderer = AnsiRenderer { use_color: std::io::stderr().is_terminal() };
        eprint!("{}", renderer.render(&diagnostic));
    }
    process::exit(e.exit_code());
}
