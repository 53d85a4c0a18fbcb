use std::{sync::Arc, time::Duration};

use archivist::{
    artifacts::ArtifactStore,
    cli::{self, AskArgs, Cli, Command, ConfigAction, SearchArgs, ServeArgs},
    config_db::ConfigDb,
    data_dir::DataDir,
    error,
    generation::Generator,
    http::{self, ServeConfig},
    mcp,
    pipeline::QueryPipeline,
    search::VectorSearchEngine,
    settings::{self, SettingEntry, Settings},
};
use clap::Parser;
use serde::Serialize;

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    cli::init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Command::Ask(args) => {
            let settings = resolve_settings(&data_dir)?;
            let generator = settings.build_generator()?;
            let pipeline = load_pipeline(&data_dir, &settings, generator)?;
            cmd_ask(&pipeline, &args)?;
        }
        Command::Search(args) => {
            let settings = resolve_settings(&data_dir)?;
            let generator = settings.build_generator_or_unconfigured()?;
            let pipeline = load_pipeline(&data_dir, &settings, generator)?;
            cmd_search(&pipeline, &args, settings.search_top_k)?;
        }
        Command::Status(args) => {
            cmd_status(&data_dir, args.json)?;
        }
        Command::Config { action } => {
            let config_db = ConfigDb::open(&data_dir.config_db())?;
            match action {
                ConfigAction::Show { json } => config_show(&config_db, json)?,
                ConfigAction::Set { key, value } => config_set(&config_db, &key, &value)?,
                ConfigAction::Clear { key } => config_clear(&config_db, &key)?,
            }
        }
        Command::Serve(args) => {
            let settings = resolve_settings(&data_dir)?;
            let generator = settings.build_generator_or_unconfigured()?;
            let pipeline = load_pipeline(&data_dir, &settings, generator)?;
            cmd_serve(pipeline, &args, settings.search_top_k)?;
        }
        Command::Mcp => {
            let settings = resolve_settings(&data_dir)?;
            let generator = settings.build_generator_or_unconfigured()?;
            let pipeline = load_pipeline(&data_dir, &settings, generator)?;
            mcp::run_mcp(Arc::new(pipeline), settings.search_top_k)?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

/// Resolve settings and release `config.redb` before returning.
///
/// redb holds an exclusive lock for as long as the database is open, so a
/// long-running `serve` or `mcp` must not keep it.
fn resolve_settings(data_dir: &DataDir) -> error::Result<Settings> {
    let config_db = ConfigDb::open(&data_dir.config_db())?;
    Settings::resolve(Some(&config_db))
}

/// Load the published index once and wire the capabilities around it.
///
/// Any problem with the index is fatal: the process never serves a
/// partially loaded pair.
fn load_pipeline(
    data_dir: &DataDir,
    settings: &Settings,
    generator: Arc<dyn Generator>,
) -> error::Result<QueryPipeline> {
    let store = ArtifactStore::new(data_dir.index_dir()?);
    let paths = store.current()?;
    let engine = Arc::new(VectorSearchEngine::load_published(&paths)?);

    QueryPipeline::new(
        engine,
        settings.build_embedder()?,
        settings.build_scorer(),
        generator,
        settings.templates()?,
        settings.pipeline_options(),
    )
}

fn cmd_ask(pipeline: &QueryPipeline, args: &AskArgs) -> error::Result<()> {
    let answer = pipeline.ask(&args.question)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    println!("{}", answer.text);
    if args.sources {
        println!();
        println!("Sources ({} context):", answer.template);
        for source in &answer.sources {
            println!(
                "  {} (relevance {:.3}, similarity {:.3})",
                source.chunk.label(),
                source.relevance,
                source.score
            );
        }
    }
    Ok(())
}

fn cmd_search(
    pipeline: &QueryPipeline,
    args: &SearchArgs,
    default_top_k: usize,
) -> error::Result<()> {
    let top_k = args.count.unwrap_or(default_top_k);
    let results = pipeline.search(&args.question, top_k)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No passages found.");
        return Ok(());
    }
    for (rank, result) in results.iter().enumerate() {
        let header = result
            .chunk
            .header
            .as_deref()
            .map(|h| format!(" [{h}]"))
            .unwrap_or_default();
        println!(
            "{}. {}{header} {:.3}",
            rank + 1,
            result.chunk.label(),
            result.relevance
        );
        println!("   {}", result.chunk.text.trim());
    }
    Ok(())
}

fn cmd_serve(
    pipeline: QueryPipeline,
    args: &ServeArgs,
    default_top_k: usize,
) -> error::Result<()> {
    if args.timeout_secs == 0 {
        return Err(error::Error::InvalidArgument(
            "--timeout-secs must be greater than zero".to_string(),
        ));
    }
    http::run_server(
        Arc::new(pipeline),
        ServeConfig {
            bind: args.bind,
            timeout: Duration::from_secs(args.timeout_secs),
            default_top_k,
            allow_origins: args.allow_origins.clone(),
        },
    )
}

#[derive(Serialize)]
struct StatusReport {
    data_dir: String,
    index: Option<IndexStatus>,
    generations: Vec<String>,
    settings: Vec<SettingEntry>,
}

#[derive(Serialize)]
struct IndexStatus {
    generation: String,
    vectors: usize,
    dimension: usize,
}

fn cmd_status(data_dir: &DataDir, json: bool) -> error::Result<()> {
    let settings = {
        let config_db = ConfigDb::open(&data_dir.config_db())?;
        Settings::resolve(Some(&config_db))?.explain(Some(&config_db))?
    };

    let store = ArtifactStore::new(data_dir.index_dir()?);
    let index = if store.has_published() {
        let paths = store.current()?;
        let engine = VectorSearchEngine::load_published(&paths)?;
        Some(IndexStatus {
            generation: paths.generation,
            vectors: engine.len(),
            dimension: engine.dimension(),
        })
    } else {
        None
    };

    let report = StatusReport {
        data_dir: data_dir.root().display().to_string(),
        index,
        generations: store.generations()?,
        settings,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Data directory: {}", report.data_dir);
    match &report.index {
        Some(index) => {
            println!("Index: {}", index.generation);
            println!("  Vectors: {}", index.vectors);
            println!("  Dimension: {}", index.dimension);
        }
        None => println!("Index: none published"),
    }
    println!("Generations on disk: {}", report.generations.len());
    for entry in report.settings.iter().filter(|e| !e.key.ends_with("_template")) {
        println!("{}: {} ({})", entry.key, entry.value, entry.source);
    }
    Ok(())
}

fn config_show(config_db: &ConfigDb, json: bool) -> error::Result<()> {
    let settings = Settings::resolve(Some(config_db))?;
    let entries = settings.explain(Some(config_db))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        println!(
            "{}\t{}\t{}",
            entry.key,
            entry.value.escape_debug(),
            entry.source
        );
    }
    Ok(())
}

fn config_set(config_db: &ConfigDb, key: &str, value: &str) -> error::Result<()> {
    Settings::validate_value(key, value)?;
    config_db.set_setting(key, value)?;
    println!("Set {key} = {}", value.escape_debug());
    warn_if_overridden(key);
    Ok(())
}

fn config_clear(config_db: &ConfigDb, key: &str) -> error::Result<()> {
    settings::ensure_known(key)?;
    if config_db.remove_setting(key)? {
        println!("Cleared {key}");
    } else {
        println!("{key} was not set");
    }
    warn_if_overridden(key);
    Ok(())
}

fn warn_if_overridden(key: &str) {
    let var = settings::env_var_name(key);
    if std::env::var_os(&var).is_some() {
        eprintln!("Note: {var} is set and takes precedence over config.redb");
    }
}
