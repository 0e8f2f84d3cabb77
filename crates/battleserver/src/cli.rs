//! Command-line interface handling for the battle server.
//!
//! Every flag overrides the matching configuration file setting.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    pub port: Option<u16>,
    /// Optional override for the listening interface
    pub bind_address: Option<String>,
    /// `native` or `reactor`
    pub transport: Option<String>,
    /// Backing store selected at startup
    pub store: Option<String>,
    /// Optional override for plugin directory
    pub plugin_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Keep battles running (awaiting a rejoin) when a player disconnects
    pub keep_battles: bool,
}

impl CliArgs {
    /// Parses the process arguments.
    pub fn parse() -> Self {
        Self::from_matches(command().get_matches())
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("battleserver.toml")),
            port: matches.get_one::<u16>("port").copied(),
            bind_address: matches.get_one::<String>("bind").cloned(),
            transport: matches.get_one::<String>("transport").cloned(),
            store: matches.get_one::<String>("store").cloned(),
            plugin_dir: matches.get_one::<String>("plugins").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            keep_battles: matches.get_flag("keep-battles-on-disconnect"),
        }
    }
}

fn command() -> Command {
    Command::new("Battle Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Connection and battle session server with runtime-loaded plugins")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("battleserver.toml"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Interface to listen on (e.g., 0.0.0.0)"),
        )
        .arg(
            Arg::new("transport")
                .short('t')
                .long("transport")
                .value_name("BACKEND")
                .help("Socket backend (native, reactor)"),
        )
        .arg(
            Arg::new("store")
                .short('s')
                .long("store")
                .value_name("NAME")
                .help("Backing store selected at startup"),
        )
        .arg(
            Arg::new("plugins")
                .short('p')
                .long("plugins")
                .value_name("DIR")
                .help("Plugin directory path"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("keep-battles-on-disconnect")
                .long("keep-battles-on-disconnect")
                .help("Let battles wait for a disconnected player to rejoin")
                .action(ArgAction::SetTrue),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::from_matches(command().get_matches_from(args))
    }

    #[test]
    fn defaults_without_flags() {
        let args = parse(&["battleserver"]);
        assert_eq!(args.config_path, PathBuf::from("battleserver.toml"));
        assert_eq!(args.port, None);
        assert!(!args.json_logs);
        assert!(!args.keep_battles);
    }

    #[test]
    fn overrides_are_captured() {
        let args = parse(&[
            "battleserver",
            "--config",
            "alt.toml",
            "--port",
            "6000",
            "--transport",
            "reactor",
            "--store",
            "postgresql",
            "--plugins",
            "/srv/plugins",
            "--json-logs",
            "--keep-battles-on-disconnect",
        ]);
        assert_eq!(args.config_path, PathBuf::from("alt.toml"));
        assert_eq!(args.port, Some(6000));
        assert_eq!(args.transport.as_deref(), Some("reactor"));
        assert_eq!(args.store.as_deref(), Some("postgresql"));
        assert_eq!(args.plugin_dir, Some(PathBuf::from("/srv/plugins")));
        assert!(args.json_logs);
        assert!(args.keep_battles);
    }

    #[test]
    fn port_must_be_numeric() {
        assert!(command()
            .try_get_matches_from(["battleserver", "--port", "sixty"])
            .is_err());
    }
}
