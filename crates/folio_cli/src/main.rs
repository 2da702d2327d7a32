//! Folio CLI - annotated-text tools and a notebook sync session
//!
//! Usage: folio <command> [options]

mod connect;

use anyhow::Context;
use clap::{Parser, Subcommand};
use folio_common::EXIT_ERROR;
use folio_text::{AnnotationNode, InitialSchema};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "folio",
    version = "0.1.0",
    about = "Folio shared-page sync for notebooks"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a .folio workspace
    Init {
        /// Notebook workspace name (defaults to the directory name)
        #[arg(long)]
        workspace: Option<String>,

        /// Application id of the notebook
        #[arg(long, default_value = "1")]
        app: u16,
    },

    /// Render an annotated-text JSON file to rich-text markup
    Render {
        /// Path to an InitialSchema JSON file
        file: PathBuf,
    },

    /// Parse rich-text markup into annotated-text JSON
    Parse {
        /// Path to a markup file
        file: PathBuf,
    },

    /// Parse inline plain text (**bold**, [link](href), ...)
    Inline {
        text: String,
    },

    /// Print the annotation containment tree of a schema file
    Tree {
        file: PathBuf,
    },

    /// Run a sync session for this workspace until Ctrl-C
    Connect {
        /// Local pages to share: JSON schema files, the file stem is the page id
        #[arg(long = "share")]
        shares: Vec<PathBuf>,

        /// Notebooks to open direct channels to (`<app>/<workspace>`)
        #[arg(long = "peer")]
        peers: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    folio_common::telemetry::init_tracing(cli.verbose, cli.json_logs);
    tracing::debug!("Folio CLI started");

    let result = match cli.command {
        Commands::Init { workspace, app } => cmd_init(workspace, app),
        Commands::Render { file } => cmd_render(&file),
        Commands::Parse { file } => cmd_parse(&file),
        Commands::Inline { text } => cmd_inline(&text),
        Commands::Tree { file } => cmd_tree(&file),
        Commands::Connect { shares, peers } => connect::cmd_connect(shares, peers).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(EXIT_ERROR);
    }
}

/// Workspace root: `FOLIO_WORKSPACE` if set, else the current directory
pub(crate) fn workspace_root() -> anyhow::Result<PathBuf> {
    match std::env::var_os("FOLIO_WORKSPACE") {
        Some(root) => Ok(PathBuf::from(root)),
        None => std::env::current_dir().context("Cannot determine current directory"),
    }
}

pub(crate) fn read_schema(path: &Path) -> anyhow::Result<InitialSchema> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let schema: InitialSchema = serde_json::from_str(&text)
        .with_context(|| format!("{} is not an annotated-text document", path.display()))?;
    schema
        .validate()
        .with_context(|| format!("{} failed validation", path.display()))?;
    Ok(schema)
}

fn cmd_init(workspace: Option<String>, app: u16) -> anyhow::Result<()> {
    use std::fs;

    let root = workspace_root()?;
    let folio_dir = root.join(".folio");

    if !folio_dir.exists() {
        fs::create_dir(&folio_dir)?;
        eprintln!("✓ Created .folio/");
    } else {
        eprintln!("✓ .folio/ already exists");
    }

    let pages_dir = folio_dir.join("pages");
    if !pages_dir.exists() {
        fs::create_dir(&pages_dir)?;
        eprintln!("✓ Created .folio/pages/");
    }

    let config_path = folio_dir.join("config.toml");
    if config_path.exists() {
        eprintln!("✓ .folio/config.toml already exists");
        return Ok(());
    }

    let workspace = match workspace {
        Some(name) => name,
        None => root
            .canonicalize()?
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "notebook".to_string()),
    };

    let default_config = format!(
        r#"# Folio Configuration

[notebook]
app = {app}
workspace = "{workspace}"

[relay]
url = "ws://localhost:3003"
frame_limit = 32000

[peer]
enabled = true
bind = "127.0.0.1:0"
negotiation_timeout_ms = 30000

[framing]
chunk_ttl_secs = 300
max_chunks = 4096

[directory]
endpoint = "http://localhost:3003"

[storage]
dir = ".folio/pages"
"#
    );
    fs::write(&config_path, default_config)?;
    eprintln!("✓ Created .folio/config.toml");
    eprintln!("\n✅ Workspace initialized as {}/{}", app, workspace);
    Ok(())
}

fn cmd_render(file: &Path) -> anyhow::Result<()> {
    let schema = read_schema(file)?;
    println!("{}", folio_text::to_rich_text(&schema));
    Ok(())
}

fn cmd_parse(file: &Path) -> anyhow::Result<()> {
    let markup = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let schema = folio_text::from_rich_text(&markup)?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn cmd_inline(text: &str) -> anyhow::Result<()> {
    let schema = folio_text::parse_inline(text)?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

fn cmd_tree(file: &Path) -> anyhow::Result<()> {
    let schema = read_schema(file)?.normalized();
    let forest = folio_text::build_tree(&schema.annotations);
    if forest.is_empty() {
        eprintln!("No annotations");
        return Ok(());
    }

    let mut out = String::new();
    for node in &forest {
        print_node(node, &schema, 0, &mut out);
    }
    print!("{}", out);
    Ok(())
}

fn print_node(node: &AnnotationNode, schema: &InitialSchema, depth: usize, out: &mut String) {
    let annotation = &node.annotation;
    out.push_str(&format!(
        "{}{} [{}, {}) {:?}\n",
        "  ".repeat(depth),
        annotation.kind.type_name(),
        annotation.start,
        annotation.end,
        schema.slice(annotation.start, annotation.end),
    ));
    for child in &node.children {
        print_node(child, schema, depth + 1, out);
    }
}
