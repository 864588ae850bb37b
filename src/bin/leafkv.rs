use leafkv::config::{HashedPasswordConfig, ServerConfig, StorageConfig};
use leafkv::security::PasswordAlgorithm;
use leafkv::security::password::DEFAULT_KEY_BITS;
use leafkv::storage::{self, DatabaseKind};
use std::collections::BTreeMap;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "check-config" => cmd_check_config(&args[2..]),
        "migrate" => cmd_migrate(&args[2..]),
        "dump" => cmd_dump(&args[2..]),
        "create-password" => cmd_create_password(&args[2..]),
        "version" => {
            println!("leafkv {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

fn cmd_check_config(args: &[String]) -> Result<(), String> {
    let file = parse_flag_value(args, "--file").ok_or("--file is required")?;
    let config = ServerConfig::load(Path::new(&file)).map_err(|e| e.to_string())?;
    let context = config.to_security_context().map_err(|e| e.to_string())?;
    let kind = config.database_kind().map_err(|e| e.to_string())?;
    println!(
        "ok\t{}\t{}\t{} roles\t{} users",
        config.database_file.display(),
        kind,
        context.roles().len(),
        context.users().len()
    );
    Ok(())
}

fn cmd_migrate(args: &[String]) -> Result<(), String> {
    let source = parse_flag_value(args, "--source").ok_or("--source is required")?;
    let source_kind = parse_kind(args, "--source-kind")?;
    let target = parse_flag_value(args, "--target").ok_or("--target is required")?;
    let target_kind = parse_kind(args, "--target-kind")?;
    let config = StorageConfig::default();

    let source_db = storage::open_database(source_kind, Path::new(&source), &config)
        .map_err(|e| format!("open source: {e}"))?;
    let target_db = storage::open_database(target_kind, Path::new(&target), &config)
        .map_err(|e| format!("open target: {e}"))?;
    let copied = storage::copy_all(source_db.as_ref(), target_db.as_ref())
        .map_err(|e| format!("migrate: {e}"))?;
    source_db.close().map_err(|e| format!("close source: {e}"))?;
    target_db.close().map_err(|e| format!("close target: {e}"))?;
    println!("ok\t{copied}");
    Ok(())
}

fn cmd_dump(args: &[String]) -> Result<(), String> {
    let file = parse_flag_value(args, "--file").ok_or("--file is required")?;
    let kind = parse_kind(args, "--kind")?;
    let db = storage::open_database(kind, Path::new(&file), &StorageConfig::default())
        .map_err(|e| format!("open: {e}"))?;
    let all: BTreeMap<String, String> = db
        .get_all()
        .map_err(|e| format!("read: {e}"))?
        .into_iter()
        .map(|(key, value)| (String::from(key), value))
        .collect();
    db.close().map_err(|e| format!("close: {e}"))?;
    let text = serde_json::to_string_pretty(&all).map_err(|e| format!("encode: {e}"))?;
    println!("{text}");
    Ok(())
}

fn cmd_create_password(args: &[String]) -> Result<(), String> {
    let password = parse_flag_value(args, "--password").ok_or("--password is required")?;
    let algorithm = match parse_flag_value(args, "--iterations") {
        Some(iterations) => {
            let iterations = iterations
                .parse::<u32>()
                .map_err(|e| format!("invalid --iterations: {e}"))?;
            PasswordAlgorithm::new(iterations, DEFAULT_KEY_BITS).map_err(|e| e.to_string())?
        }
        None => PasswordAlgorithm::default(),
    };
    let hashed = algorithm
        .create_hashed(&password)
        .map_err(|e| e.to_string())?;
    let text = serde_json::to_string_pretty(&HashedPasswordConfig::from(&hashed))
        .map_err(|e| format!("encode: {e}"))?;
    println!("{text}");
    Ok(())
}

fn parse_kind(args: &[String], flag: &str) -> Result<DatabaseKind, String> {
    match parse_flag_value(args, flag) {
        Some(kind) => kind.parse().map_err(|e: leafkv::LeafError| e.to_string()),
        None => Ok(DatabaseKind::default()),
    }
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  leafkv check-config --file <config.json>");
    eprintln!(
        "  leafkv migrate --source <file> [--source-kind <kind>] --target <file> [--target-kind <kind>]"
    );
    eprintln!("  leafkv dump --file <file> [--kind <kind>]");
    eprintln!("  leafkv create-password --password <text> [--iterations <n>]");
    eprintln!("  leafkv version");
    eprintln!("kinds: MVSTORE (default), SQLITE");
}
