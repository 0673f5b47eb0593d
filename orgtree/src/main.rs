use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use orgtree::config::ParserConfig;
use orgtree::export::document_to_json;
use orgtree::storage::save_file;
use orgtree::{Document, DocumentLoader, OrgIndex, OrgParser, format_document};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Parse, format and restructure Org outlines",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON parser configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// TODO keyword line used when a file has none, e.g. "TODO NEXT | DONE".
    #[arg(long, global = true)]
    todo: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print their structure.
    Parse(ParseArgs),

    /// Print the canonical rendering of Org files.
    Format(FormatArgs),

    /// Move a subsection from one top-level section to another.
    MoveSubsection(MoveSubsectionArgs),

    /// Move a child node between two sections addressed by index (e.g. 0.1).
    MoveContent(MoveContentArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct MoveSubsectionArgs {
    file: PathBuf,
    /// Exact title of the subsection to move.
    #[arg(long)]
    title: String,
    /// Top-level position of the current parent.
    #[arg(long)]
    from: usize,
    /// Top-level position of the new parent.
    #[arg(long)]
    to: usize,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct MoveContentArgs {
    file: PathBuf,
    /// Index of the source section.
    #[arg(long)]
    from: OrgIndex,
    /// Index of the target section.
    #[arg(long)]
    to: OrgIndex,
    /// Position of the node inside the source section.
    #[arg(long)]
    at: usize,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let parser = OrgParser::new(load_config(cli.config.as_deref(), cli.todo.as_deref())?);
    match cli.command {
        Commands::Parse(args) => handle_parse(&parser, args),
        Commands::Format(args) => handle_format(&parser, args),
        Commands::MoveSubsection(args) => handle_move_subsection(&parser, args),
        Commands::MoveContent(args) => handle_move_content(&parser, args),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>, todo: Option<&str>) -> Result<ParserConfig> {
    let config = match path {
        Some(path) => ParserConfig::from_json_file(path)?,
        None => ParserConfig::default(),
    };
    Ok(match todo {
        Some(line) => config.with_todo_line(line),
        None => config,
    })
}

fn handle_parse(parser: &OrgParser, args: ParseArgs) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut parsed = Vec::new();
    for path in expanded {
        debug!(path = %path.display(), "parsing");
        let doc = parser
            .load_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        parsed.push((path, doc));
    }

    if json {
        let payload: Vec<serde_json::Value> = parsed
            .iter()
            .map(|(path, doc)| {
                serde_json::json!({
                    "path": path.display().to_string(),
                    "org": document_to_json(doc),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, doc)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", doc);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_format(parser: &OrgParser, args: FormatArgs) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut first = true;
    for path in expanded {
        debug!(path = %path.display(), "formatting");
        let doc = parser
            .load_file(&path)
            .with_context(|| format!("parsing {:?}", path))?;

        if in_place {
            save_file(&doc, &path)?;
        } else {
            if !first {
                println!();
                println!("== {} ==", path.display());
            } else if inputs.len() > 1 {
                println!("== {} ==", path.display());
            }
            first = false;
            print!("{}", format_document(&doc));
        }
    }

    Ok(())
}

fn handle_move_subsection(parser: &OrgParser, args: MoveSubsectionArgs) -> Result<()> {
    let MoveSubsectionArgs {
        file,
        title,
        from,
        to,
        in_place,
    } = args;
    let mut doc = parser.load_file(&file)?;
    doc.move_subsection_titled(&title, from, to)
        .with_context(|| format!("moving {:?} in {:?}", title, file))?;
    info!(%title, from, to, "moved subsection");
    emit(&doc, &file, in_place)
}

fn handle_move_content(parser: &OrgParser, args: MoveContentArgs) -> Result<()> {
    let MoveContentArgs {
        file,
        from,
        to,
        at,
        in_place,
    } = args;
    let mut doc = parser.load_file(&file)?;
    doc.move_content(&from, &to, at)
        .with_context(|| format!("moving node {at} of {from} to {to} in {:?}", file))?;
    info!(%from, %to, at, "moved content");
    emit(&doc, &file, in_place)
}

fn emit(doc: &Document, path: &Path, in_place: bool) -> Result<()> {
    if in_place {
        save_file(doc, path)
    } else {
        print!("{}", format_document(doc));
        Ok(())
    }
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!(dir = %canonical.display(), "scanning directory");
            for file in collect_org_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_org_file(&canonical) {
                anyhow::bail!("{:?} is not an .org file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn is_org_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "org")
}

fn collect_org_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_org_file(&canonical) {
        debug!(file = %canonical.display(), "found org file");
        out.push(canonical);
    }
    Ok(())
}
