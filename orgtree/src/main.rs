use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use orgtree::{Limits, ParseOptions, Parsed, format_document, parse_document_with};

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Parse Org-style outlines into a document tree",
    version
)]
struct Cli {
    /// Enable debug logging (RUST_LOG still takes precedence).
    #[arg(long, global = true)]
    verbose: bool,
    #[command(flatten)]
    limits: LimitArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct LimitArgs {
    /// Reject inputs larger than this many bytes.
    #[arg(long, global = true)]
    max_input_size: Option<usize>,
    /// Truncate parsing at the first line longer than this many characters.
    #[arg(long, global = true)]
    max_line_length: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print their document trees.
    Parse(ParseArgs),

    /// Re-render Org files in normalized form.
    Format(FormatArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
    /// Exit with an error if any file produced diagnostics.
    #[arg(long)]
    strict: bool,
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let options = build_options(&cli.limits);
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &options),
        Commands::Format(args) => handle_format(args, &options),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn build_options(args: &LimitArgs) -> ParseOptions {
    let defaults = Limits::default();
    ParseOptions::default().with_limits(Limits {
        max_input_size: args.max_input_size.unwrap_or(defaults.max_input_size),
        max_line_length: args.max_line_length.unwrap_or(defaults.max_line_length),
    })
}

fn parse_path(path: &Path, options: &ParseOptions) -> Result<Parsed> {
    log::debug!("parsing {}", path.display());
    let text = load_input(path)?;
    let parsed = parse_document_with(&text, options);
    for diagnostic in &parsed.diagnostics {
        eprintln!("{}: {diagnostic}", path.display());
    }
    Ok(parsed)
}

fn load_input(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {:?}", path))
}

fn handle_parse(args: ParseArgs, options: &ParseOptions) -> Result<()> {
    let ParseArgs {
        inputs,
        json,
        strict,
    } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut parsed = Vec::new();
    for path in expanded {
        let result = parse_path(&path, options)?;
        parsed.push((path, result));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            #[serde(flatten)]
            parsed: &'a Parsed,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, result)| JsonOutput {
                path: path.display().to_string(),
                parsed: result,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, result)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            println!("{:#?}", result.document);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }

    let failing = parsed.iter().filter(|(_, r)| !r.is_clean()).count();
    if strict && failing > 0 {
        anyhow::bail!("{failing} file(s) produced diagnostics");
    }
    Ok(())
}

fn handle_format(args: FormatArgs, options: &ParseOptions) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let many = expanded.len() > 1;
    for (idx, path) in expanded.iter().enumerate() {
        let parsed = parse_path(path, options)?;
        let formatted = format_document(&parsed.document);

        if in_place {
            fs::write(path, formatted.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
            log::info!("formatted {}", path.display());
        } else {
            if many {
                if idx > 0 {
                    println!();
                }
                println!("== {} ==", path.display());
            }
            print!("{formatted}");
        }
    }
    Ok(())
}

/// Resolves files and directories to a de-duplicated list of `.org` files.
/// Symlinked entries inside a directory are skipped.
fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            log::debug!("scanning directory {}", canonical.display());
            let mut found = Vec::new();
            collect_org_files(&canonical, &mut found, &mut visited)?;
            found.sort();
            out.extend(found);
        } else if is_org_file(&canonical) {
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        } else {
            anyhow::bail!("{:?} is not an .org file", canonical);
        }
    }
    Ok(out)
}

fn collect_org_files(
    path: &Path,
    out: &mut Vec<PathBuf>,
    visited: &mut BTreeSet<PathBuf>,
) -> Result<()> {
    let canonical =
        fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let meta = fs::metadata(&canonical)
        .with_context(|| format!("reading metadata for {:?}", canonical))?;
    if meta.is_dir() {
        let entries =
            fs::read_dir(&canonical).with_context(|| format!("listing {:?}", canonical))?;
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                log::debug!("skipping symlink {}", entry.path().display());
                continue;
            }
            collect_org_files(&entry.path(), out, visited)?;
        }
    } else if is_org_file(&canonical) {
        log::debug!("found {}", canonical.display());
        out.push(canonical);
    }
    Ok(())
}

fn is_org_file(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "org")
}
