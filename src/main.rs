mod classify;
mod compare;
mod cpu;
mod error;
mod patterns;
mod report;
mod stats;
mod stuck;
mod traits;
mod word;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use clap::Parser;
use classify::ClassifierConfig;
use compare::StrategyKind;
use cpu::{CpuTester, CpuTesterConfig, EXIT_FAIL_NONSTARTER};
use error::MemtwinError;
use log::{info, warn};
use patterns::TestPattern;
use report::{FileSink, MultiSink, StderrSink};
use stats::TestStats;
use stuck::StuckAddressTest;

#[derive(Parser, Debug)]
#[command(author, version, about = "Twin-buffer memory tester", long_about = None)]
struct Args {
    /// Memory to test, split into two buffers (e.g. '256MiB', '1G'; plain numbers are MiB)
    #[arg(required_unless_present = "list_tests")]
    size: Option<String>,

    /// Number of loops (0 or absent: run until interrupted)
    loops: Option<u64>,

    /// Report physical addresses, taking this as the address of the first word
    #[arg(long, value_parser = parse_hex)]
    phys_base: Option<u64>,

    /// Exit with status 4 after the first comparison fault
    #[arg(long, default_value_t = false)]
    early_exit: bool,

    /// Bit n enables catalog entry n (see --list-tests); 0 runs all
    #[arg(long, value_parser = parse_hex)]
    test_mask: Option<u64>,

    #[arg(long, default_value_t = false)]
    skip_stuck_address: bool,

    /// Seed for the random patterns
    #[arg(long)]
    seed: Option<u64>,

    #[arg(short, long, help = "Duration to run (e.g., '5m', '1h', 'infinite')")]
    duration: Option<String>,

    #[arg(short, long, help = "Comparator threads (default: CPU count)")]
    threads: Option<usize>,

    /// Region comparison strategy
    #[arg(long, value_enum, default_value_t = StrategyKind::Vectorized)]
    comparator: StrategyKind,

    /// Also append fault reports to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// List the test catalog and exit
    #[arg(long, default_value_t = false)]
    list_tests: bool,
}

fn parse_duration(s: &str) -> Option<Duration> {
    if s.to_lowercase() == "infinite" {
        return None;
    }
    humantime::parse_duration(s).ok()
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{}': {}", s, e))
}

fn parse_size(s: &str) -> Result<u64, MemtwinError> {
    let s = s.trim();
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) {
        let mib: u64 = s
            .parse()
            .map_err(|e| MemtwinError::Config(format!("invalid size '{}': {}", s, e)))?;
        return mib
            .checked_mul(1024 * 1024)
            .ok_or_else(|| MemtwinError::Config(format!("size '{}' MiB is too large", s)));
    }
    s.parse::<ByteSize>()
        .map(|size| size.as_u64())
        .map_err(|e| MemtwinError::Config(format!("invalid size '{}': {}", s, e)))
}

fn build_config(args: &Args) -> Result<CpuTesterConfig, MemtwinError> {
    let size = args
        .size
        .as_deref()
        .ok_or_else(|| MemtwinError::Config("no size given".to_string()))?;
    let memory_bytes = parse_size(size)?;

    let timeout = match &args.duration {
        Some(s) if s.to_lowercase() != "infinite" => Some(
            parse_duration(s)
                .ok_or_else(|| MemtwinError::Config(format!("invalid duration '{}'", s)))?,
        ),
        _ => None,
    };

    Ok(CpuTesterConfig {
        memory_bytes,
        loops: args.loops.filter(|&n| n > 0),
        timeout,
        patterns: TestPattern::from_mask(args.test_mask.unwrap_or(0)),
        stuck_address: !args.skip_stuck_address,
        seed: args.seed,
        comparator: args.comparator,
        threads: args.threads,
        classifier: ClassifierConfig {
            use_physical_addresses: args.phys_base.is_some(),
            physical_base: args.phys_base.unwrap_or(0),
            early_exit_on_fault: args.early_exit,
        },
        show_progress: true,
    })
}

fn build_sink(args: &Args) -> Result<MultiSink, MemtwinError> {
    let mut sink = MultiSink::new();
    sink.push(Box::new(StderrSink));
    if let Some(path) = &args.log_file {
        sink.push(Box::new(FileSink::open(path)?));
    }
    Ok(sink)
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn print_tests() {
    println!("Available tests:");
    println!("  {:>10}  {}", "always", StuckAddressTest::DISPLAY_NAME);
    for pattern in TestPattern::all_patterns() {
        println!("  0x{:08x}  {}", pattern.mask_bit(), pattern.name());
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.list_tests {
        print_tests();
        std::process::exit(0);
    }

    let (config, sink) = match build_config(&args).and_then(|c| Ok((c, build_sink(&args)?))) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_FAIL_NONSTARTER);
        }
    };

    let should_stop = Arc::new(AtomicBool::new(false));
    {
        let should_stop = Arc::clone(&should_stop);
        if let Err(e) = ctrlc::set_handler(move || should_stop.store(true, Ordering::Relaxed)) {
            warn!("Could not install Ctrl-C handler: {}", e);
        }
    }

    info!("Reporting faults to {} sink(s)", sink.sink_count());
    let tester = CpuTester::new(config);
    info!(
        "memtwin {}: {} tester, {}",
        env!("CARGO_PKG_VERSION"),
        tester.name(),
        tester.device_info()
    );
    let stats = Arc::new(TestStats::new());
    let start_time = Instant::now();

    let summary = match tester.run(Box::new(sink), Arc::clone(&stats), should_stop) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(EXIT_FAIL_NONSTARTER);
        }
    };

    println!();
    println!("Test Complete");
    println!("=============");
    println!("Loops completed: {}", summary.loops_completed);
    println!("Total bytes compared: {}", ByteSize::b(stats.get_bytes()));
    println!("Region comparisons: {}", stats.get_comparisons());
    println!("Total tests completed: {}", stats.get_tests());
    println!("Faults found: {}", summary.reports.len());
    println!(
        "Duration: {}",
        humantime::format_duration(Duration::from_millis(
            start_time.elapsed().as_millis() as u64
        ))
    );

    if args.verbose {
        println!();
        for result in &summary.results {
            println!(
                "  {:<20} {:<6} {} ms",
                result.test_name,
                if result.outcome.is_passed() { "ok" } else { "FAILED" },
                result.duration_ms
            );
        }
    }

    if !summary.failed {
        println!();
        println!("SUCCESS: No memory errors detected!");
    } else {
        println!();
        println!("MEMORY ERRORS DETECTED:");
        println!("=======================");
        for (i, report) in summary.reports.iter().enumerate() {
            println!("Fault {}: {}", i + 1, report);
        }
    }
    std::process::exit(summary.exit_code());
}
