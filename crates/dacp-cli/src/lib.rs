//! Shared CLI definitions for dacp.
//!
//! Used by the server binary, by the build script (manpage) and by the
//! gen_docs binary (command-line-options markdown).

use clap::{CommandFactory, Parser, ValueEnum};
use std::path::{Path, PathBuf};

/// File format understood by the parser table.
/// When no format is given, it is detected from the file extension.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Hash)]
pub enum FileFormat {
    /// Comma-separated values
    Csv,
    /// Arrow IPC / Feather
    Arrow,
    /// Parquet columnar format
    Parquet,
    /// JSON array format
    Json,
    /// JSON Lines / NDJSON (one JSON object per line)
    Jsonl,
}

impl FileFormat {
    /// Every format, in the order used for error messages.
    pub const ALL: [FileFormat; 5] = [
        FileFormat::Csv,
        FileFormat::Arrow,
        FileFormat::Parquet,
        FileFormat::Json,
        FileFormat::Jsonl,
    ];

    /// Detect file format from path extension. Returns None when extension is missing or unknown.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    /// Parse format from extension string (e.g. "parquet", "csv").
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "arrow" | "ipc" | "feather" => Some(Self::Arrow),
            "parquet" => Some(Self::Parquet),
            "json" => Some(Self::Json),
            "jsonl" | "ndjson" => Some(Self::Jsonl),
            _ => None,
        }
    }

    /// Canonical extension, also used as the name of the per-format cache directory.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Arrow => "arrow",
            Self::Parquet => "parquet",
            Self::Json => "json",
            Self::Jsonl => "jsonl",
        }
    }

    /// Comma-separated list of accepted extensions, for error messages.
    pub fn supported_list() -> String {
        "csv, arrow, ipc, feather, parquet, json, jsonl, ndjson".to_string()
    }
}

/// Command-line arguments for the dacp server
#[derive(Clone, Parser, Debug)]
#[command(
    name = "dacp-server",
    version,
    about = "Serve dataframes over Arrow Flight",
    long_about = "Serve files under a storage root as remote dataframes.\n\n\
Clients connect with a principal, open dataframes by dacp:// identity and \
replay lazy action pipelines (limit, slice, select, filter, map, sort, sql) \
on the server."
)]
pub struct ServerArgs {
    /// Path to a configuration file (default: ~/.config/dacp/config.toml)
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address to bind (overrides config [server] host)
    #[arg(long = "host", value_name = "HOST")]
    pub host: Option<String>,

    /// Port to listen on (overrides config [server] port)
    #[arg(long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Local storage root holding one directory per dataset (overrides config [storage] local_path)
    #[arg(long = "storage-root", value_name = "DIR")]
    pub storage_root: Option<PathBuf>,

    /// Log level filter, e.g. info or dacp=debug (overrides config [logging] level; RUST_LOG wins over both)
    #[arg(long = "log-level", value_name = "FILTER")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long = "log-json", action)]
    pub log_json: bool,

    /// Clear the parse cache and exit
    #[arg(long = "clear-cache", action)]
    pub clear_cache: bool,

    /// Generate default configuration file at ~/.config/dacp/config.toml
    #[arg(long = "generate-config", action)]
    pub generate_config: bool,

    /// Force overwrite existing config file when using --generate-config
    #[arg(long = "force", requires = "generate_config", action)]
    pub force: bool,
}

/// Escape `|` and newlines for use in markdown table cells.
fn escape_table_cell(s: &str) -> String {
    s.replace('|', "\\|").replace(['\n', '\r'], " ")
}

/// Render command-line options as markdown.
pub fn render_options_markdown() -> String {
    let mut cmd = ServerArgs::command();
    cmd.build();

    let mut out = String::from("# Command Line Options\n\n");

    out.push_str("## Usage\n\n```\n");
    out.push_str(&cmd.render_usage().to_string());
    out.push_str("\n```\n\n");

    out.push_str("## Options\n\n");
    out.push_str("| Option | Description |\n");
    out.push_str("|--------|-------------|\n");

    for arg in cmd.get_arguments() {
        let id = arg.get_id().as_ref().to_string();
        if id == "help" || id == "version" {
            continue;
        }

        let mut parts = Vec::new();
        if let Some(s) = arg.get_short() {
            parts.push(format!("-{s}"));
        }
        if let Some(l) = arg.get_long() {
            parts.push(format!("--{l}"));
        }
        let op = parts.join(", ");
        let placeholder: String = if arg.get_action().takes_values() {
            arg.get_value_names()
                .map(|names| {
                    names
                        .iter()
                        .map(|n: &clap::builder::Str| format!("<{}>", n.as_ref() as &str))
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .unwrap_or_default()
        } else {
            String::new()
        };
        let option_str = if placeholder.is_empty() {
            op
        } else {
            format!("{op} {placeholder}")
        };

        let help = arg
            .get_help()
            .map(|h| escape_table_cell(&h.to_string()))
            .unwrap_or_else(|| "-".to_string());

        out.push_str(&format!("| `{option_str}` | {help} |\n"));
    }

    out
}
