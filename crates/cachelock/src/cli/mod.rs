pub mod handlers;

use clap::{Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("cachelock")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Caching distributed lock service")
        .subcommand_required(true)
        .subcommand(cmd_serve())
        .subcommand(cmd_stat())
        .subcommand(cmd_inspect())
        .subcommand(cmd_hold())
}

fn server_arg() -> Arg {
    Arg::new("server")
        .short('s')
        .long("server")
        .value_name("ADDR")
        .default_value("127.0.0.1:7400")
        .help("Lock server address")
}

fn lock_arg() -> Arg {
    Arg::new("lock")
        .required(true)
        .value_name("LOCK")
        .value_parser(clap::value_parser!(u64))
        .help("Numeric lock ID")
}

fn cmd_serve() -> Command {
    Command::new("serve")
        .about("Run the lock server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Config file (overrides ~/.config/cachelock/config.toml)"),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .help("Listen address, overriding config and CACHELOCK_LISTEN"),
        )
}

fn cmd_stat() -> Command {
    Command::new("stat")
        .about("Show the server's grant counter")
        .arg(server_arg())
        .arg(lock_arg())
}

fn cmd_inspect() -> Command {
    Command::new("inspect")
        .about("Show the server-side record of a lock")
        .arg(server_arg())
        .arg(lock_arg())
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Output as JSON for machine parsing"),
        )
}

fn cmd_hold() -> Command {
    Command::new("hold")
        .about("Acquire a lock, hold it for a while, then release it")
        .arg(server_arg())
        .arg(lock_arg())
        .arg(
            Arg::new("callback")
                .long("callback")
                .value_name("ADDR")
                .default_value("127.0.0.1:0")
                .help("Address for this client's callback listener"),
        )
        .arg(
            Arg::new("secs")
                .long("secs")
                .value_name("SECONDS")
                .default_value("1")
                .value_parser(clap::value_parser!(u64))
                .help("How long to hold the lock"),
        )
}
