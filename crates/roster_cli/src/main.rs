//! CLI entry point.
//!
//! # Responsibility
//! - Verify `roster_core` linkage (`ping`).
//! - Drive the roster end to end against a configured store (`demo`),
//!   playing the display layer: issue operations, print result sets.
//!
//! Usage:
//!   roster_cli [ping]
//!   roster_cli demo [--config <file.json>] [--log-dir <abs dir>] [--log-level <level>]

use log::info;
use roster_core::{
    CompanyService, ContextRepository, EntityRepository, ExecutionDomain, Snapshot, StoreConfig,
};
use roster_core::{Company, Entity};
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use uuid::Uuid;

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Debug, Default)]
struct DemoArgs {
    config: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        None | Some("ping") => {
            println!("roster_core ping={}", roster_core::ping());
            println!("roster_core version={}", roster_core::core_version());
            Ok(())
        }
        Some("demo") => parse_demo_args(&args[1..]).and_then(run_demo),
        Some(other) => Err(format!("unknown command `{other}`; expected ping|demo").into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn parse_demo_args(args: &[String]) -> CliResult<DemoArgs> {
    let mut parsed = DemoArgs::default();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("missing value for `{flag}`"))
        };
        match flag.as_str() {
            "--config" => parsed.config = Some(PathBuf::from(value()?)),
            "--log-dir" => parsed.log_dir = Some(PathBuf::from(value()?)),
            "--log-level" => parsed.log_level = Some(value()?),
            other => return Err(format!("unknown flag `{other}`").into()),
        }
    }
    Ok(parsed)
}

fn load_config(path: Option<&PathBuf>) -> CliResult<StoreConfig> {
    let Some(path) = path else {
        return Ok(StoreConfig::in_memory());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read config `{}`: {err}", path.display()))?;
    let config: StoreConfig = serde_json::from_str(&raw)?;
    if let Some(directory) = config.directory.as_ref() {
        std::fs::create_dir_all(directory)?;
    }
    Ok(config)
}

fn run_demo(args: DemoArgs) -> CliResult<()> {
    if let Some(log_dir) = args.log_dir.as_ref() {
        let level = args
            .log_level
            .as_deref()
            .unwrap_or(roster_core::default_log_level());
        roster_core::init_logging(level, log_dir)?;
    }

    let config = load_config(args.config.as_ref())?;
    let repo = ContextRepository::open(&config)?;
    info!(
        "event=cli_demo module=cli status=start in_memory={}",
        config.directory.is_none()
    );

    // Insert on the isolated domain, observe on the coordinating one.
    let acme_id = Uuid::new_v4();
    let acme = repo.new_entity_with_id::<Company>(acme_id, ExecutionDomain::Isolated)?;
    repo.modify(acme, |company| {
        company.name = Some("Acme".to_string());
        company.location = Some("Tokyo".to_string());
    })?;
    repo.insert(acme, ExecutionDomain::Isolated)?;
    print_companies("after insert", &repo.fetch_all::<Company>(ExecutionDomain::Coordinating)?)?;

    // Rename through the usual fetch/modify/update flow.
    let service = CompanyService::new(repo.fork());
    service.rename_company_at(0, "Acme2")?;
    print_companies("after rename", &service.list_companies()?)?;

    // Two independent background inserts.
    let (done, finished) = mpsc::channel();
    for name in ["Globex", "Initech"] {
        let done = done.clone();
        repo.manager().perform_background_task(move |scope| {
            let result = scope.create::<Company>().and_then(|handle| {
                scope.get_mut(handle)?.name = Some(name.to_string());
                scope.save()
            });
            let _ = done.send(result.map(|_| ()));
        })?;
    }
    drop(done);
    for result in finished {
        result?;
    }
    print_companies("after background inserts", &service.list_companies()?)?;

    if let Some(person) = service.add_person(acme_id, "Ada")? {
        info!("event=cli_demo module=cli status=ok person_added={person}");
    }
    let persons = service.list_persons(acme_id)?;
    println!(
        "persons of {acme_id}: {}",
        serde_json::to_string(&persons.iter().map(Snapshot::value).collect::<Vec<_>>())?
    );

    service.remove_company(acme_id)?;
    print_companies("after delete", &service.list_companies()?)?;

    let stats = repo.manager().store().stats();
    println!("store commits={} fetches={}", stats.commits, stats.fetches);
    info!(
        "event=cli_demo module=cli status=ok commits={} fetches={}",
        stats.commits, stats.fetches
    );
    Ok(())
}

fn print_companies(label: &str, companies: &[Snapshot<Company>]) -> CliResult<()> {
    println!("{label}: {} companies", companies.len());
    for company in companies {
        println!("  {} {}", company.id(), serde_json::to_string(company.value())?);
    }
    Ok(())
}
