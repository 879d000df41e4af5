use clap::Parser;
use fleetbench_core::logging;

mod cli;

/// Synchronous main: service mode daemonises (fork) before any runtime or
/// worker thread exists, so nothing async may run up here.
fn main() {
    let args = cli::Cli::parse();

    // Initialize logging as early as possible. A foreground service with an
    // explicit log file gets a file sink; everyone else logs to stderr
    // (daemonisation later redirects stderr to the log file).
    if args.service && args.foreground {
        if let Some(log_file) = args.log_file.clone() {
            if let Err(err) = logging::init_file(&log_file) {
                eprintln!("fleetbench: falling back to stderr logging: {:#}", err);
                logging::init_stderr();
            }
        } else {
            logging::init_stderr();
        }
    } else {
        logging::init_stderr();
    }

    std::process::exit(cli::run(args));
}
