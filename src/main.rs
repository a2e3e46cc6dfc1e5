use std::{path::Path, sync::Arc};

use chapterindex::{
    Chapter,
    ChapterMatch,
    ChapterSearch,
    DataDir,
    HealthReport,
    IndexManager,
    Question,
    TextbookId,
    cli::{Cli, Command},
    error::{self, Error},
    mcp,
};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "CHAPTERINDEX_LOG";

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var(LOG_ENV_VAR) {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let manager = Arc::new(IndexManager::open(data_dir)?);
    let service = ChapterSearch::new(manager, cli.build_embedder());

    match cli.command {
        Command::Build(args) => {
            let id = TextbookId::new(args.textbook)?;
            let chapters: Vec<Chapter> = read_json(&args.chapters)?;
            let summary = service.build(&id, &chapters)?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "Indexed {} chapters of textbook '{}' ({} dimensions, {})",
                    summary.chapter_count,
                    summary.textbook_id,
                    summary.dimension,
                    summary.generation
                );
            }
        }
        Command::Search(args) => {
            let id = TextbookId::new(args.textbook)?;
            let matches =
                service.search_chapters(&id, &args.query, args.count)?;

            if args.json {
                let out = json!({
                    "textbook_id": id.as_str(),
                    "query": args.query,
                    "results": matches,
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                print_matches(&matches, "");
            }
        }
        Command::Map(args) => {
            let id = TextbookId::new(args.textbook)?;
            let questions: Vec<Question> = read_json(&args.questions)?;
            let mappings =
                service.map_questions_to_chapters(&id, &questions, args.count)?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&mappings)?);
            } else {
                for mapping in &mappings {
                    println!("Question {}: {}", mapping.question_id, mapping.question);
                    print_matches(&mapping.chapters, "  ");
                }
            }
        }
        Command::Health(args) => {
            let id = TextbookId::new(args.textbook)?;
            let report = service.manager().health_check(&id);

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_health(&report);
            }
            if !report.ok {
                std::process::exit(1);
            }
        }
        Command::Delete(args) => {
            let id = TextbookId::new(args.textbook)?;
            if service.delete(&id)? {
                println!("Deleted index for textbook '{id}'");
            } else {
                println!("No index for textbook '{id}'");
            }
        }
        Command::Status(args) => {
            cmd_status(&service, args.json)?;
        }
        Command::Mcp => {
            mcp::run_mcp(service)?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> error::Result<T> {
    let bytes = std::fs::read(path).map_err(|e| {
        Error::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    serde_json::from_slice(&bytes).map_err(|e| {
        Error::Config(format!("invalid JSON in {}: {e}", path.display()))
    })
}

fn print_matches(matches: &[ChapterMatch], indent: &str) {
    if matches.is_empty() {
        println!("{indent}No chapters found.");
        return;
    }
    for m in matches {
        println!(
            "{indent}{}. Chapter {}: {} ({})",
            m.rank,
            m.chapter.number,
            m.chapter.title,
            m.page_range()
        );
        println!(
            "{indent}   Similarity: {:.1} ({})",
            m.similarity_score,
            m.relevance().label()
        );
        let preview = m.preview();
        if !preview.is_empty() {
            println!("{indent}   {preview}");
        }
    }
}

fn print_health(report: &HealthReport) {
    println!("Textbook: {}", report.textbook_id);
    println!("Status: {}", if report.ok { "ok" } else { "unhealthy" });
    if let Some(generation) = &report.generation {
        println!("Generation: {generation}");
    }
    println!("Vectors: {}", report.vector_count);
    println!("Chapters: {}", report.chapter_count);
    if let Some(dimension) = report.dimension {
        println!("Dimension: {dimension}");
    }
    if let Some(backup) = report.backup_count {
        println!("Backup embeddings: {backup}");
    }
    if let Some(problem) = &report.problem {
        println!("Problem: {problem}");
    }
}

fn cmd_status(service: &ChapterSearch, json: bool) -> error::Result<()> {
    let manager = service.manager();
    let textbooks = manager.list()?;
    let model = service.embedder().model_name();

    if json {
        let ids: Vec<&str> = textbooks.iter().map(TextbookId::as_str).collect();
        let out = json!({
            "data_dir": manager.data_dir().root().display().to_string(),
            "model": model,
            "textbooks": ids,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Data directory: {}", manager.data_dir().root().display());
        println!("Model: {model}");
        println!("Textbooks: {}", textbooks.len());
        for id in &textbooks {
            match manager.current_generation(id) {
                Ok(generation) => println!("  {id}: {generation}"),
                Err(e) => println!("  {id}: {e}"),
            }
        }
    }
    Ok(())
}
