use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use footfall::config::Config;
use footfall::db::Database;
use footfall::export::{self, ExportFormat};
use footfall::identity::{Resolver, ResolverSettings};
use footfall::logging::{self, LogTarget};
use footfall::pipeline::feed::{self, FeedExtractor, FeedReader};
use footfall::pipeline::onnx::OnnxFaceEmbedder;
use footfall::pipeline::{PipelineSettings, PipelineStats, StreamPipeline};

#[derive(Debug, PartialEq)]
enum ExportKind {
    Daily,
    People,
}

#[derive(Debug, PartialEq)]
enum Command {
    Init,
    Replay { feeds: Vec<PathBuf>, embedder: bool },
    Stats { from: Option<NaiveDate>, to: Option<NaiveDate> },
    People,
    Visits(i64),
    Label(i64, String),
    Export {
        kind: ExportKind,
        path: PathBuf,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    Repair,
}

#[derive(Debug, PartialEq)]
struct Cli {
    config_path: Option<PathBuf>,
    stderr: bool,
    command: Command,
}

#[derive(Debug, PartialEq)]
enum Parsed {
    Run(Cli),
    Help,
    Version,
}

fn parse_args(args: &[String]) -> Result<Parsed> {
    let mut config_path = None;
    let mut stderr = false;
    let mut embedder = false;
    let mut from = None;
    let mut to = None;
    let mut positional: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Ok(Parsed::Help),
            "--version" | "-V" => return Ok(Parsed::Version),
            "--stderr" => stderr = true,
            "--embedder" => embedder = true,
            flag @ ("--config" | "-c" | "--from" | "--to") => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow!("{flag} requires an argument"))?;
                match flag {
                    "--from" => from = Some(parse_day(value)?),
                    "--to" => to = Some(parse_day(value)?),
                    _ => config_path = Some(PathBuf::from(value)),
                }
                i += 1;
            }
            arg if arg.starts_with('-') => bail!("unknown option: {arg}"),
            arg => positional.push(arg),
        }
        i += 1;
    }

    let Some((&name, rest)) = positional.split_first() else {
        bail!("missing command");
    };
    let command = match (name, rest) {
        ("init", []) => Command::Init,
        ("replay", feeds) if !feeds.is_empty() => Command::Replay {
            feeds: feeds.iter().map(PathBuf::from).collect(),
            embedder,
        },
        ("stats", []) => Command::Stats { from, to },
        ("people", []) => Command::People,
        ("visits", [id]) => Command::Visits(parse_id(id)?),
        ("label", [id, label]) => Command::Label(parse_id(id)?, label.to_string()),
        ("export", [kind, path]) => Command::Export {
            kind: match *kind {
                "daily" => ExportKind::Daily,
                "people" => ExportKind::People,
                other => bail!("unknown export kind: {other} (expected daily or people)"),
            },
            path: PathBuf::from(path),
            from,
            to,
        },
        ("repair", []) => Command::Repair,
        _ => bail!("invalid arguments for command: {name}"),
    };

    Ok(Parsed::Run(Cli {
        config_path,
        stderr,
        command,
    }))
}

fn parse_day(value: &str) -> Result<NaiveDate> {
    value
        .parse()
        .with_context(|| format!("invalid day {value:?}, expected YYYY-MM-DD"))
}

fn parse_id(value: &str) -> Result<i64> {
    value
        .parse()
        .with_context(|| format!("invalid identity id {value:?}"))
}

fn print_help() {
    println!(
        r#"footfall - visitor identity resolution and footfall analytics

USAGE:
    footfall [OPTIONS] <COMMAND>

COMMANDS:
    init                        Create the database schema
    replay FEED...              Resolve recorded feeds (JSON lines), one stream per file
    stats                       Show daily flow and unique visitors
    people                      List identities
    visits ID                   List the visits of an identity
    label ID NAME               Name an identity
    export daily|people PATH    Write CSV or JSON (chosen by extension)
    repair                      Rebuild identity counters from visit history

OPTIONS:
    --config, -c PATH   Path to config file
    --from DAY          First day for stats/export (YYYY-MM-DD)
    --to DAY            Last day for stats/export (YYYY-MM-DD)
    --embedder          Load the ONNX face models for feeds with image crops
    --stderr            Log to stderr instead of journald/log file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FOOTFALL_CONFIG     Path to config file (overrides default location)
    FOOTFALL_LOG        Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/footfall/config.toml"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(Parsed::Run(cli)) => cli,
        Ok(Parsed::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Parsed::Version) => {
            println!("footfall {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            eprintln!("Run `footfall --help` for usage.");
            std::process::exit(2);
        }
    };

    let target = if cli.stderr { LogTarget::Stderr } else { LogTarget::System };
    if let Err(err) = logging::init(target) {
        eprintln!("Warning: logging disabled: {err:#}");
    }

    let config = Config::load(cli.config_path.as_deref())?;
    config.validate().context("invalid configuration")?;

    let db = Arc::new(Database::open(&config.database).context("opening database")?);
    db.initialize()?;

    match cli.command {
        Command::Init => {
            println!("Database ready ({} identities)", db.count_identities()?);
        }
        Command::Replay { feeds, embedder } => replay(&config, db, feeds, embedder).await?,
        Command::Stats { from, to } => {
            let days = db.get_daily_analytics(from, to)?;
            println!("{:<12} {:>10} {:>10}", "DAY", "FLOW", "UNIQUE");
            for day in &days {
                println!("{:<12} {:>10} {:>10}", day.day, day.total_flow, day.unique_count);
            }
        }
        Command::People => {
            println!(
                "{:>6}  {:<16} {:<25} {:<25} {:>6} {:>6}  LAST DAY",
                "ID", "LABEL", "FIRST SEEN", "LAST SEEN", "VISITS", "TODAY"
            );
            for person in db.list_identities()? {
                println!(
                    "{:>6}  {:<16} {:<25} {:<25} {:>6} {:>6}  {}",
                    person.id,
                    person.label,
                    person.first_seen.to_rfc3339(),
                    person.last_seen.to_rfc3339(),
                    person.visit_count,
                    person.daily_visit_count,
                    person.last_visit_date
                );
            }
        }
        Command::Visits(id) => {
            if db.get_identity(id)?.is_none() {
                bail!("no identity with id {id}");
            }
            for visit in db.get_visits_for_identity(id)? {
                let minutes = (visit.end_time - visit.start_time).num_minutes();
                println!(
                    "{:>6}  {}  {}  {} min",
                    visit.id,
                    visit.start_time.to_rfc3339(),
                    visit.end_time.to_rfc3339(),
                    minutes
                );
            }
        }
        Command::Label(id, label) => {
            if !db.set_identity_label(id, &label)? {
                bail!("no identity with id {id}");
            }
            info!(identity_id = id, label = %label, "Labelled identity");
            println!("Identity {id} labelled {label:?}");
        }
        Command::Export { kind, path, from, to } => {
            let format = ExportFormat::from_path(&path)?;
            let rows = match kind {
                ExportKind::Daily => export::export_daily(&db, from, to, &path, format)?,
                ExportKind::People => export::export_people(&db, &path, format)?,
            };
            println!("Exported {rows} rows to {} ({})", path.display(), format.extension());
        }
        Command::Repair => {
            let repaired = db.repair_counters()?;
            info!(repaired, "Repaired identity counters");
            println!("Repaired {repaired} identities");
        }
    }

    Ok(())
}

async fn replay(config: &Config, db: Arc<Database>, feeds: Vec<PathBuf>, use_embedder: bool) -> Result<()> {
    let embedder = if use_embedder {
        Some(OnnxFaceEmbedder::open(&config.embedder)?)
    } else {
        None
    };
    let extractor = Arc::new(FeedExtractor::new(embedder));
    let resolver = Arc::new(Resolver::new(db, ResolverSettings::from_config(&config.identity)));
    let settings = PipelineSettings::from_config(config);

    let mut streams = tokio::task::JoinSet::new();
    for path in feeds {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let reader = FeedReader::open(&path)?;
        let mut pipeline = StreamPipeline::new(
            name.clone(),
            Arc::clone(&extractor),
            Arc::clone(&resolver),
            settings,
        );
        streams.spawn(async move {
            let stats = feed::replay(reader, &mut pipeline)
                .await
                .with_context(|| format!("replaying stream {name}"))?;
            Ok::<_, anyhow::Error>((name, stats))
        });
    }

    let mut total = PipelineStats::default();
    let mut failed = 0;
    while let Some(joined) = streams.join_next().await {
        match joined? {
            Ok((name, stats)) => {
                println!(
                    "{name}: {} frames, {} resolved ({} unique), {} dropped",
                    stats.frames, stats.resolved, stats.unique, stats.dropped
                );
                total.merge(&stats);
            }
            Err(err) => {
                failed += 1;
                eprintln!("Error: {err:#}");
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&total)?);
    let violations = resolver.sessions().invariant_violations();
    if violations > 0 {
        warn!(violations, "Matched identities without visits during replay");
    }
    if failed > 0 {
        bail!("{failed} stream(s) failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    fn command(line: &str) -> Command {
        match parse_args(&args(line)).unwrap() {
            Parsed::Run(cli) => cli.command,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(command("init"), Command::Init);
        assert_eq!(command("visits 12"), Command::Visits(12));
        assert_eq!(command("label 3 Ram"), Command::Label(3, "Ram".to_string()));
        assert_eq!(
            command("replay --embedder a.jsonl b.jsonl"),
            Command::Replay {
                feeds: vec![PathBuf::from("a.jsonl"), PathBuf::from("b.jsonl")],
                embedder: true,
            }
        );
        assert_eq!(
            command("export daily out.csv --from 2026-03-01"),
            Command::Export {
                kind: ExportKind::Daily,
                path: PathBuf::from("out.csv"),
                from: NaiveDate::from_ymd_opt(2026, 3, 1),
                to: None,
            }
        );
    }

    #[test]
    fn test_parse_options() {
        let Parsed::Run(cli) = parse_args(&args("--stderr -c /tmp/f.toml stats")).unwrap() else {
            panic!("expected a command");
        };
        assert!(cli.stderr);
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/f.toml")));
        assert_eq!(parse_args(&args("stats --help")).unwrap(), Parsed::Help);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args("")).is_err());
        assert!(parse_args(&args("replay")).is_err());
        assert!(parse_args(&args("visits abc")).is_err());
        assert!(parse_args(&args("export weekly out.csv")).is_err());
        assert!(parse_args(&args("stats --from 03/01/2026")).is_err());
        assert!(parse_args(&args("stats --bogus")).is_err());
    }
}
