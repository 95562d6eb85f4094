use clap::{value_parser, Arg, ArgAction, Command};
use ferrite::{Server, ServerConfig};
use flux::logging;
use ftpd::auth::StaticAuthenticator;
use ftpd::config::FtpdConfig;
use ftpd::host::SignalHost;
use ftpd::vfs::DiskVfs;
use std::process;

fn main() {
    let matches = Command::new("ftpd")
        .about("FTP server exposing a local directory tree")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_parser(value_parser!(u16))
                .help("Listening port override"),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .value_name("DIR")
                .help("Served directory override"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Raise log verbosity"),
        )
        .get_matches();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => FtpdConfig::load(path),
        None => FtpdConfig::default(),
    };

    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }

    if let Some(root) = matches.get_one::<String>("root") {
        config.server.root = root.clone();
    }

    let severity = match matches.get_count("verbose") {
        0 => logging::Severity::Info,
        1 => logging::Severity::Debug,
        _ => logging::Severity::Trace,
    };
    let log = logging::terminal(severity);

    let vfs = match DiskVfs::new(&config.server.root) {
        Ok(vfs) => vfs,
        Err(err) => {
            logging::error!(log, "cannot serve root directory";
                            "root" => config.server.root.as_str(),
                            "error" => err.to_string());
            process::exit(1);
        }
    };

    let auth = StaticAuthenticator::new(&config.auth);
    let host = SignalHost::install().expect("Failed to install signal handlers");

    let server_config = ServerConfig {
        port: config.server.port,
        max_sessions: config.server.max_sessions,
    };

    let mut server = match Server::new(
        server_config,
        Box::new(vfs),
        Box::new(auth),
        host,
        &log,
    ) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "startup failed"; "error" => err.to_string());
            process::exit(err.exit_code());
        }
    };

    if let Err(err) = server.run() {
        process::exit(err.exit_code());
    }
}
