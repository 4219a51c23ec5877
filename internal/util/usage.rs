pub const DAEMON_USAGE: &str = "\
bdr - backup and disaster recovery orchestrator

USAGE:
    bdr [OPTIONS]

OPTIONS:
    -h, --help           Print this help message and exit
    -v, --version        Print version and exit
        --once           Run every cycle once, then exit (non-zero on a failed cycle)

REQUIRED ENVIRONMENT VARIABLES:
    BDR_BASE_DIR                      Local artifact root
    BDR_TOPOLOGY_FILE                 JSON services/categories/regions/drill file

PATHS:
    BDR_STATE_DIR                     Replication cursors        [{base}/.state]
    BDR_REPORTS_DIR                   Cycle reports              [{base}/.reports]
    BDR_METRICS_LISTEN                Prometheus metrics         [:9108]

SCHEDULERS (seconds):
    BDR_BACKUP_INTERVAL_SECONDS       Backup tick                [3600]
    BDR_MONITOR_INTERVAL_SECONDS      Health-check tick          [300]
    BDR_REPLICATION_INTERVAL_SECONDS  Replication tick           [300]
    BDR_RETENTION_INTERVAL_SECONDS    Retention tick             [86400]

BOUNDS:
    BDR_TOOL_TIMEOUT_SECONDS          External tool timeout      [3600]
    BDR_POLL_INTERVAL_MS              Completion poll interval   [1000]
    BDR_POLL_MAX_WAIT_SECONDS         Completion poll deadline   [300]
    BDR_KEYSPACE_EXPORT_MAX_KEYS      Key-value export cap       [10000]

THRESHOLDS:
    BDR_MAX_AGE_HOURS                 Freshness threshold        [24]
    BDR_INTEGRITY_PASS_RATE           Rolling pass rate, percent [85]
    BDR_ALERT_COOLDOWN_SECONDS        Alert dedupe window        [3600]

ALERT SINKS:
    BDR_ALERT_WEBHOOK_URL             Chat webhook
    BDR_RABBIT_URL                    Pub/sub broker (exchange bdr.alerts)

OTHER:
    BDR_LOG_LEVEL                     Log level                  [info]
";

pub const DRILL_USAGE: &str = "\
bdr-drill - run one disaster recovery drill

USAGE:
    bdr-drill <backup|restore|failover|full_dr>

OPTIONS:
    -h, --help           Print this help message and exit
    -v, --version        Print version and exit

Reads the same BDR_* environment as bdr. Prints the run as JSON and exits
non-zero unless the drill passed.
";

pub fn print_usage(usage: &str) {
    print!("{usage}");
}

pub fn print_version(binary: &str, version: &str) {
    println!("{binary} {version}");
}

fn handle_cli_flags_from_args(args: &[String], usage: &str, binary: &str, version: &str) -> bool {
    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage(usage);
                return true;
            }
            "-v" | "--version" => {
                print_version(binary, version);
                return true;
            }
            _ => {}
        }
    }
    false
}

/// Check CLI args for --help/-h or --version/-v.
/// Returns `true` if a flag was handled (caller should exit).
pub fn handle_cli_flags(usage: &str, binary: &str, version: &str) -> bool {
    let args: Vec<String> = std::env::args().skip(1).collect();
    handle_cli_flags_from_args(&args, usage, binary, version)
}

pub fn has_flag(flag: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == flag)
}

/// First argument that is not a flag.
pub fn positional() -> Option<String> {
    std::env::args().skip(1).find(|arg| !arg.starts_with('-'))
}
