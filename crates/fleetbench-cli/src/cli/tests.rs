//! CLI parse tests.

use super::Cli;
use clap::Parser;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).unwrap()
}

#[test]
fn cli_parse_defaults() {
    let cli = parse(&["fleetbench", "/mnt/bench"]);
    assert_eq!(cli.paths, vec![std::path::PathBuf::from("/mnt/bench")]);
    assert!(cli.hosts.is_empty());
    assert_eq!(cli.port, 1611);
    assert_eq!(cli.iterations, 1);
    assert_eq!(cli.threads, 1);
    assert_eq!(cli.time_limit_secs, 0);
    assert!(!cli.service);
    assert!(!cli.write);
}

#[test]
fn cli_parse_write_read_run() {
    let cli = parse(&[
        "fleetbench",
        "/mnt/bench",
        "-t",
        "4",
        "--files",
        "100",
        "-s",
        "1024",
        "-d",
        "-w",
        "-r",
    ]);
    assert_eq!(cli.threads, 4);
    assert_eq!(cli.num_files, 100);
    assert_eq!(cli.file_size, 1024);
    assert!(cli.mkdirs && cli.write && cli.read);
    assert!(!cli.del && !cli.rmdirs);
}

#[test]
fn cli_parse_hosts_list() {
    let cli = parse(&[
        "fleetbench",
        "/mnt/bench",
        "--hosts",
        "h1,h2,h3",
        "--rotate-hosts",
        "1",
        "--port",
        "1700",
    ]);
    assert_eq!(cli.hosts, vec!["h1", "h2", "h3"]);
    assert_eq!(cli.rotate_hosts, 1);
    assert_eq!(cli.port, 1700);
}

#[test]
fn cli_parse_service_mode() {
    let cli = parse(&[
        "fleetbench",
        "--service",
        "--foreground",
        "--port",
        "1612",
        "--log-file",
        "/tmp/svc.log",
    ]);
    assert!(cli.service && cli.foreground);
    assert_eq!(cli.port, 1612);
    assert_eq!(cli.log_file.as_deref(), Some(std::path::Path::new("/tmp/svc.log")));
}

#[test]
fn cli_parse_s3_flags() {
    let cli = parse(&[
        "fleetbench",
        "/mnt/bench",
        "-w",
        "--buckets",
        "b1,b2",
        "--s3-endpoint",
        "http://127.0.0.1:9000",
        "--s3-key",
        "ak",
        "--s3-secret",
        "sk",
        "--multidel",
    ]);
    assert_eq!(cli.buckets, vec!["b1", "b2"]);
    assert_eq!(cli.s3_endpoint.as_deref(), Some("http://127.0.0.1:9000"));
    assert!(cli.multidel);
}

#[test]
fn config_requires_paths_for_bench_runs() {
    let cli = parse(&["fleetbench", "-w"]);
    assert!(cli.to_config().is_err());
}

#[test]
fn config_interrupt_requires_hosts() {
    let cli = parse(&["fleetbench", "--interrupt"]);
    assert!(cli.to_config().is_err());

    let cli = parse(&["fleetbench", "--interrupt", "--hosts", "h1"]);
    let cfg = cli.to_config().unwrap();
    assert_eq!(cfg.hosts, vec!["h1"]);
}

#[test]
fn config_s3_phases_require_buckets() {
    let cli = parse(&["fleetbench", "/mnt/bench", "--listobj"]);
    assert!(cli.to_config().is_err());
}

#[test]
fn config_carries_phase_selection() {
    let cli = parse(&["fleetbench", "/mnt/bench", "-d", "-w", "-r", "--sync"]);
    let cfg = cli.to_config().unwrap();
    assert!(cfg.phases.create_dirs && cfg.phases.create_files && cfg.phases.read_files);
    assert!(cfg.phases.sync);
    assert!(!cfg.phases.delete_files);
    assert_eq!(cfg.bench_paths.len(), 1);
}
