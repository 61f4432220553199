//! Command-line handling for the `vmhook` binary

use std::path::PathBuf;

/// Overrides taken from the command line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,

    /// One of debug, verbose, notice, warning
    pub loglevel: Option<String>,
}

/// What the command line asked for
#[derive(Debug, Clone, PartialEq)]
pub enum CliAction {
    Run(CliArgs),
    Help,
    Version,
}

const USAGE: &str = "\
Usage: vmhook [OPTIONS] [FILE.conf]

Options:
  -c, --config <FILE>      Read settings from FILE
      --loglevel <LEVEL>   debug | verbose | notice | warning
  -h, --help               Print this message
  -v, --version            Print the version";

/// Parse arguments (without the program name)
pub fn parse_args(args: &[String]) -> Result<CliAction, String> {
    let mut parsed = CliArgs::default();
    let mut rest = args.iter();

    while let Some(flag) = rest.next() {
        let mut value = |name: &str| {
            rest.next()
                .cloned()
                .ok_or_else(|| format!("{} expects a value", name))
        };
        match flag.as_str() {
            "-h" | "--help" => return Ok(CliAction::Help),
            "-v" | "--version" => return Ok(CliAction::Version),
            "-c" | "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--loglevel" => parsed.loglevel = Some(value("--loglevel")?),
            path if path.ends_with(".conf") => parsed.config = Some(PathBuf::from(path)),
            other => return Err(format!("unrecognised argument '{}'", other)),
        }
    }

    Ok(CliAction::Run(parsed))
}

/// Parse the process arguments, exiting on `--help`, `--version` or errors
pub fn parse_cli_args() -> CliArgs {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args) {
        Ok(CliAction::Run(parsed)) => parsed,
        Ok(CliAction::Help) => {
            print_help();
            std::process::exit(0);
        }
        Ok(CliAction::Version) => {
            println!("vmhook {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Err(msg) => {
            eprintln!("vmhook: {}", msg);
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
    }
}

pub fn print_help() {
    println!("{}", USAGE);
}
