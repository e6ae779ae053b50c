use std::path::PathBuf;
use std::process::ExitCode;

use arrow::util::pretty::pretty_format_batches;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use xpu::cache::{CacheIdent, Ctid, GpuCache, LogRecord, TxLogReader, TxLogWriter};
use xpu::expr::{AggKind, BuildOptions, ExprProgram, FuncOpcode, ProgramBuilder};
use xpu::kds::Kds;
use xpu::types::{ColumnDef, Datum, TypeOpcode};
use xpu::{EngineConfig, KernSession, Result, ScanExecutor};

const DEMO_IDENT: CacheIdent = CacheIdent {
    database_oid: 1,
    table_oid: 16_400,
    signature: 0x0DE1_0000_0000_0001,
};

struct Options {
    rows: usize,
    dest_nrooms: Option<u32>,
    host_only: bool,
    log_path: Option<PathBuf>,
    seed: u64,
}

#[allow(clippy::print_stdout)]
fn print_banner() {
    const NAME: &str = env!("CARGO_PKG_NAME");
    const VER: &str = env!("CARGO_PKG_VERSION");
    println!("{} version {}", NAME, VER);
}

#[allow(clippy::print_stdout)]
fn print_help() {
    println!("Loads a generated table into a cache, replays a transaction log against it,");
    println!("and runs a grouped scan over the committed snapshot.");
    println!();
    println!("Command-line options:");
    println!("  --rows N          Rows in the base table (default 10000)");
    println!("  --dest-rooms N    Destination rows per launch (overrides XPU_DEST_NROOMS)");
    println!("  --log FILE        Write the transaction log to FILE and replay it from there");
    println!("  --seed N          Seed for the generated data (default 42)");
    println!("  --host            Run the scan on the host only");
    println!("  --help            Show this usage information");
    println!();
    println!("Engine settings are read from XPU_* environment variables.");
}

fn parse_args() -> std::result::Result<Option<Options>, String> {
    let mut opts = Options {
        rows: 10_000,
        dest_nrooms: None,
        host_only: false,
        log_path: None,
        seed: 42,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--rows" => {
                let v = value("--rows")?;
                opts.rows = v.parse().map_err(|_| format!("bad --rows value {v}"))?;
            }
            "--dest-rooms" => {
                let v = value("--dest-rooms")?;
                let n = v
                    .parse()
                    .map_err(|_| format!("bad --dest-rooms value {v}"))?;
                opts.dest_nrooms = Some(n);
            }
            "--seed" => {
                let v = value("--seed")?;
                opts.seed = v.parse().map_err(|_| format!("bad --seed value {v}"))?;
            }
            "--log" => opts.log_path = Some(PathBuf::from(value("--log")?)),
            "--host" => opts.host_only = true,
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("Unrecognized argument: {other}")),
        }
    }
    Ok(Some(opts))
}

fn table_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef::new("id", TypeOpcode::Int8).not_null(),
        ColumnDef::new("region", TypeOpcode::Int4),
        ColumnDef::new("amount", TypeOpcode::Float8),
        ColumnDef::new("note", TypeOpcode::Text),
    ]
}

fn table_row(id: i64, rng: &mut SmallRng) -> Vec<Datum> {
    let region = if rng.random_ratio(1, 20) {
        Datum::Null
    } else {
        Datum::Int4(rng.random_range(0..6))
    };
    vec![
        Datum::Int8(id),
        region,
        Datum::Float8(rng.random_range(-50.0..500.0)),
        Datum::Text(format!("order-{id}")),
    ]
}

/// Inserts past the end of the table (a fifth of them rolled back) and deletes of
/// existing rows (a third of them rolled back).
fn demo_log(base_rows: usize, rng: &mut SmallRng) -> Vec<LogRecord> {
    let mut log = Vec::new();
    let extra = (base_rows / 10).max(1);
    for i in 0..extra {
        let rowid = (base_rows + i) as u32;
        log.push(LogRecord::Insert {
            rowid,
            values: table_row(rowid as i64, rng),
        });
        log.push(if rng.random_ratio(1, 5) {
            LogRecord::AbortIns { rowid }
        } else {
            LogRecord::CommitIns { rowid }
        });
    }
    for xid in 0..extra as u32 {
        let rowid = rng.random_range(0..base_rows as u32);
        log.push(LogRecord::Delete {
            xid: 10_000 + xid,
            rowid,
            ctid: Ctid::new(rowid / 100, (rowid % 100) as u16),
        });
        log.push(if rng.random_ratio(1, 3) {
            LogRecord::AbortDel { rowid }
        } else {
            LogRecord::CommitDel { rowid }
        });
    }
    log
}

/// `SELECT region, count(*), sum(amount), max(id) WHERE amount > 0 GROUP BY region`
fn region_totals() -> Result<ExprProgram> {
    let mut b = ProgramBuilder::new(0);
    b.load_vars(
        0,
        &[
            (0, 0, TypeOpcode::Int8),
            (1, 1, TypeOpcode::Int4),
            (2, 2, TypeOpcode::Float8),
        ],
    );
    let id = b.var(0);
    let region = b.var(1);
    let amount = b.var(2);
    let zero = b.constant(Datum::Float8(0.0));
    let positive = b.func(FuncOpcode::Float8Gt, &[amount, zero]);
    b.scan_quals(positive);
    b.preagg(
        &[("region", region)],
        &[
            ("orders", AggKind::CountStar, None),
            ("total", AggKind::Sum, Some(amount)),
            ("last_id", AggKind::Max, Some(id)),
        ],
    );
    b.build(&BuildOptions::default())
}

fn replay_log(cache: &mut GpuCache, log: &[LogRecord], path: Option<&PathBuf>) -> Result<()> {
    let stats = match path {
        Some(path) => {
            let mut writer = TxLogWriter::create(path, DEMO_IDENT)?;
            writer.append_all(log)?;
            writer.flush()?;
            cache.replay_log(TxLogReader::open(path)?)?
        }
        None => {
            let mut writer = TxLogWriter::new(Vec::new(), DEMO_IDENT)?;
            writer.append_all(log)?;
            let bytes = writer.into_inner()?;
            cache.replay_log(TxLogReader::new(bytes.as_slice())?)?
        }
    };
    tracing::info!(
        "[DEMO] replayed {} records: {} inserts, {} deletes, {} commits, {} aborts, {} skipped",
        stats.records(),
        stats.inserts,
        stats.deletes,
        stats.commits,
        stats.aborts,
        stats.skipped
    );
    Ok(())
}

/// ROW chunk holding `rows`, with column types taken from the first non-null value.
fn result_chunk(names: &[ColumnDef], rows: &[Vec<Datum>]) -> Result<Kds> {
    let columns: Vec<ColumnDef> = names
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let ty = rows
                .iter()
                .find_map(|r| r.get(i).and_then(Datum::type_opcode))
                .unwrap_or(c.type_op);
            ColumnDef::new(c.name.clone(), ty)
        })
        .collect();
    let nrooms = rows.len().max(1) as u32;
    let mut kds = Kds::new_row(columns, nrooms, nrooms as usize * 256)?;
    for r in rows {
        kds.push_row(r)?;
    }
    Ok(kds)
}

#[allow(clippy::print_stdout)]
fn run(opts: &Options) -> Result<()> {
    let mut config = EngineConfig::from_env()?;
    if let Some(n) = opts.dest_nrooms {
        config.dest_nrooms = n;
    }
    if opts.host_only {
        config.enabled = false;
    }
    config.validate()?;

    let mut rng = SmallRng::seed_from_u64(opts.seed);
    let base: Vec<(u32, Vec<Datum>)> = (0..opts.rows)
        .map(|i| (i as u32, table_row(i as i64, &mut rng)))
        .collect();
    let mut cache = GpuCache::load(DEMO_IDENT, table_columns(), base)?;
    let log = demo_log(opts.rows, &mut rng);
    replay_log(&mut cache, &log, opts.log_path.as_ref())?;

    let snapshot = cache.snapshot()?;
    println!(
        "cache {}: {} committed rows ({} bytes)",
        cache.ident(),
        snapshot.nitems(),
        snapshot.length()
    );

    let program = region_totals()?;
    let session = KernSession::scan(&config, &program, &[], &snapshot)?;
    let output = ScanExecutor::new(session).run()?;
    println!(
        "scan: {} ({} partial chunks)",
        output.stats.describe(config.regression_test_mode),
        output.chunks.len()
    );

    let mut totals = output.finalize(&program)?;
    totals.sort_by(|a, b| format!("{:?}", a[0]).cmp(&format!("{:?}", b[0])));
    let table = result_chunk(&program.output_columns(), &totals)?;
    let batch = table.to_record_batch()?;
    println!("{}", pretty_format_batches(&[batch])?);
    Ok(())
}

#[allow(clippy::print_stderr)]
fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let opts = match parse_args() {
        Ok(Some(opts)) => opts,
        Ok(None) => {
            print_banner();
            print_help();
            return ExitCode::SUCCESS;
        }
        Err(msg) => {
            eprintln!("{msg}");
            print_help();
            return ExitCode::FAILURE;
        }
    };

    print_banner();
    if let Err(e) = run(&opts) {
        eprintln!("Execution failed: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
