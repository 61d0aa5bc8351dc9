use tracing_subscriber::EnvFilter;

use tracevault::server::{self, ApiState};
use tracevault::{Profile, TraceConfig, TraceStore};

fn main() -> anyhow::Result<()> {
    // Load .env from the working directory or parents, if present.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str);

    match command {
        Some("--version") | Some("-V") => {
            println!("tracevault {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | Some("-h") | None => {
            print_help();
            return Ok(());
        }
        _ => {}
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let exit = runtime.block_on(dispatch(&args))?;
    if exit != 0 {
        std::process::exit(exit);
    }
    Ok(())
}

fn print_help() {
    println!("tracevault {}", env!("CARGO_PKG_VERSION"));
    println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
    println!("Usage: tracevault <COMMAND> [OPTIONS]\n");
    println!("Commands:");
    println!("  init [--profile <p>]             Create the database and show the configuration");
    println!("  server [--host H] [--port P]     Start the HTTP API server");
    println!("  stats                            Show storage statistics");
    println!("  prune [--retention-days N] [--vacuum]");
    println!("                                   Delete runs past the retention window");
    println!("  vacuum                           Reclaim free space in the database");
    println!("  backup <path>                    Write an atomic snapshot copy");
    println!("  export <run_id> | --all [--limit N] [--output <file>]");
    println!("                                   Dump run(s) with decoded payloads as JSON");
    println!("  config [--show] [--profile <p>]  Show the effective configuration");
    println!("\nOptions:");
    println!("  -h, --help       Print help");
    println!("  -V, --version    Print version");
    println!("\nConfiguration comes from TRACE_* environment variables (see docs).");
}

async fn dispatch(args: &[String]) -> anyhow::Result<i32> {
    let command = args[0].as_str();
    let rest = &args[1..];

    match command {
        "init" => cmd_init(rest).await,
        "server" => cmd_server(rest).await,
        "stats" => cmd_stats().await,
        "prune" => cmd_prune(rest).await,
        "vacuum" => cmd_vacuum().await,
        "backup" => cmd_backup(rest).await,
        "export" => cmd_export(rest).await,
        "config" => cmd_config(rest),
        other => {
            eprintln!("Unknown command '{other}'. See 'tracevault --help'.");
            Ok(2)
        }
    }
}

/// Value of `--flag <value>` if present.
fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn load_config(args: &[String]) -> anyhow::Result<TraceConfig> {
    let mut config = TraceConfig::load()?;
    if let Some(profile) = flag_value(args, "--profile") {
        config.apply_profile(Profile::parse(&profile)?);
        config.validate()?;
    }
    Ok(config)
}

async fn cmd_init(args: &[String]) -> anyhow::Result<i32> {
    let config = load_config(args)?;
    let store = TraceStore::open(&config).await?;
    store.ping().await?;

    println!("Initialized tracevault");
    println!("  database:    {}", config.db_path);
    println!("  sample rate: {:.1}%", config.sample_rate * 100.0);
    println!(
        "  compression: {}",
        if config.compression_enabled { "on" } else { "off" }
    );
    println!(
        "  encryption:  {}",
        if config.encryption_enabled { "on" } else { "off" }
    );
    println!("\nNext: start the API server with 'tracevault server'");
    Ok(0)
}

async fn cmd_server(args: &[String]) -> anyhow::Result<i32> {
    let mut config = load_config(args)?;
    if let Some(host) = flag_value(args, "--host") {
        config.api_host = host;
    }
    if let Some(port) = flag_value(args, "--port") {
        config.api_port = port.parse()?;
    }

    let store = TraceStore::open(&config).await?;
    println!(
        "Serving trace API on http://{}:{}",
        config.api_host, config.api_port
    );
    server::serve(ApiState::new(store, config)).await?;
    Ok(0)
}

async fn cmd_stats() -> anyhow::Result<i32> {
    let config = TraceConfig::load()?;
    let store = TraceStore::open(&config).await?;
    let stats = store.stats().await?;

    println!("tracevault statistics\n");
    println!("Total runs: {}", stats.total_runs);
    for (status, count) in &stats.runs_by_status {
        println!("  - {status}: {count}");
    }
    println!("\nTotal steps: {}", stats.total_steps);
    for (event_type, count) in &stats.steps_by_type {
        println!("  - {event_type}: {count}");
    }
    println!("\nDatabase size: {} bytes", stats.db_size_bytes);
    Ok(0)
}

async fn cmd_prune(args: &[String]) -> anyhow::Result<i32> {
    let mut config = TraceConfig::load()?;
    if let Some(days) = flag_value(args, "--retention-days") {
        config.retention_days = days.parse()?;
    }

    let store = TraceStore::open(&config).await?;
    let deleted = store.prune(config.retention_days).await?;
    if deleted > 0 {
        println!("Pruned {deleted} runs older than {} days", config.retention_days);
        if has_flag(args, "--vacuum") {
            store.vacuum().await?;
            println!("VACUUM completed");
        }
    } else {
        println!("No runs older than {} days", config.retention_days);
    }
    Ok(0)
}

async fn cmd_vacuum() -> anyhow::Result<i32> {
    let config = TraceConfig::load()?;
    let store = TraceStore::open(&config).await?;
    store.vacuum().await?;
    println!("VACUUM completed");
    Ok(0)
}

async fn cmd_backup(args: &[String]) -> anyhow::Result<i32> {
    let Some(path) = args.first().filter(|a| !a.starts_with("--")) else {
        eprintln!("Usage: tracevault backup <path>");
        return Ok(2);
    };
    let config = TraceConfig::load()?;
    let store = TraceStore::open(&config).await?;
    store.backup(path).await?;
    println!("Backup written to {path}");
    Ok(0)
}

async fn cmd_export(args: &[String]) -> anyhow::Result<i32> {
    let config = TraceConfig::load()?;
    let store = TraceStore::open(&config).await?;

    let payload = if has_flag(args, "--all") {
        let limit = flag_value(args, "--limit")
            .map(|v| v.parse::<usize>())
            .transpose()?
            .unwrap_or(1000);
        let (runs, _total) = store
            .list_runs(&tracevault::ListRunsFilter {
                limit,
                ..Default::default()
            })
            .await?;
        let mut exports = Vec::with_capacity(runs.len());
        for run in &runs {
            exports.push(store.export_run(&run.id).await?);
        }
        serde_json::json!({"total": exports.len(), "runs": exports})
    } else {
        let Some(run_id) = args.first().filter(|a| !a.starts_with("--")) else {
            eprintln!("Usage: tracevault export <run_id> | --all");
            return Ok(2);
        };
        match store.export_run(run_id).await {
            Ok(export) => serde_json::to_value(export)?,
            Err(tracevault::TraceError::NotFound(what)) => {
                eprintln!("{what} not found");
                return Ok(1);
            }
            Err(e) => return Err(e.into()),
        }
    };

    let rendered = serde_json::to_string_pretty(&payload)?;
    match flag_value(args, "--output") {
        Some(path) => {
            std::fs::write(&path, rendered)?;
            println!("Exported to {path}");
        }
        None => println!("{rendered}"),
    }
    Ok(0)
}

fn cmd_config(args: &[String]) -> anyhow::Result<i32> {
    let config = load_config(args)?;

    if has_flag(args, "--show") {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(0);
    }

    println!("tracevault configuration\n");
    println!("Sample rate: {:.1}%", config.sample_rate * 100.0);
    println!("Only on error: {}", config.only_on_error);
    println!(
        "Compression: {}",
        if config.compression_enabled { "enabled" } else { "disabled" }
    );
    println!(
        "Encryption: {}",
        if config.encryption_enabled { "enabled" } else { "disabled" }
    );
    println!("API: {}:{}", config.api_host, config.api_port);
    println!("Database: {}", config.db_path);
    println!("Retention: {} days", config.retention_days);
    Ok(0)
}
