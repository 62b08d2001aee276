//! Command-line interface for the controller binary.
//!
//! Built with `clap`'s builder API. Flags that override the configuration
//! file are global, so they work both before and after a subcommand.

use clap::error::ErrorKind;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;
use std::path::PathBuf;

/// What the binary was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    /// Serve hosts and controls until a shutdown signal arrives
    Run,
    /// Print an authentication token for a host
    GenerateHostToken { id: u32 },
    /// Print an authentication token for a user
    GenerateUserToken { name: String },
}

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for bind address
    pub bind_address: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    pub command: CliCommand,
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        match Self::try_parse_from(std::env::args_os()) {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = command().try_get_matches_from(args)?;
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self, clap::Error> {
        let command = match matches.subcommand() {
            None | Some(("run", _)) => CliCommand::Run,
            Some(("generate-host-token", sub)) => CliCommand::GenerateHostToken {
                id: sub
                    .get_one::<u32>("id")
                    .copied()
                    .ok_or_else(|| missing("--id"))?,
            },
            Some(("generate-user-token", sub)) => CliCommand::GenerateUserToken {
                name: sub
                    .get_one::<String>("name")
                    .cloned()
                    .ok_or_else(|| missing("--name"))?,
            },
            Some((other, _)) => {
                return Err(clap::Error::raw(
                    ErrorKind::InvalidSubcommand,
                    format!("unknown command {other}\n"),
                ))
            }
        };

        Ok(Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("controller.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            command,
        })
    }
}

fn missing(argument: &str) -> clap::Error {
    clap::Error::raw(
        ErrorKind::MissingRequiredArgument,
        format!("{argument} is required\n"),
    )
}

fn command() -> Command {
    Command::new("controller")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Cluster controller for game server hosts and control clients")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("controller.toml")
                .global(true),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address (e.g., 0.0.0.0:8080)")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .global(true),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(Command::new("run").about("Run the controller (default)"))
        .subcommand(
            Command::new("generate-host-token")
                .about("Print an authentication token for a host")
                .arg(
                    Arg::new("id")
                        .long("id")
                        .value_name("ID")
                        .help("Host id the token is valid for")
                        .value_parser(value_parser!(u32))
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("generate-user-token")
                .about("Print an authentication token for a user")
                .arg(
                    Arg::new("name")
                        .long("name")
                        .value_name("NAME")
                        .help("User the token is valid for")
                        .required(true),
                ),
        )
}
