use clap::{Parser, Subcommand};
use ragserve::Result;
use ragserve::commands::{
    ingest_paths, retire_doc, run_query, serve_http, show_config, show_status,
};
use ragserve::config::Config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ragserve")]
#[command(about = "Retrieval-augmented-generation serving core")]
#[command(version)]
struct Cli {
    /// Data directory holding the config, catalog, and vector store
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration
    Config,
    /// Ingest documents into the index
    Ingest {
        /// Files to ingest
        paths: Vec<PathBuf>,
        /// Force a modality (text, pdf, image, scan) instead of guessing
        /// from the file extension
        #[arg(long)]
        modality: Option<String>,
        /// Explicit document id (single file only); defaults to the file
        /// stem
        #[arg(long)]
        doc_id: Option<String>,
    },
    /// Retire a document so its chunks stop being searchable
    Retire {
        /// Document id to retire
        doc_id: String,
    },
    /// Run a retrieval-only query against the index
    Query {
        /// Query text
        query: String,
        /// Number of chunks to return
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Start the HTTP serving layer
    Serve,
    /// Show catalog and index status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.data_dir {
        Some(dir) => Config::load(dir)?,
        None => Config::load_default()?,
    };

    match cli.command {
        Commands::Config => {
            show_config(&config)?;
        }
        Commands::Ingest {
            paths,
            modality,
            doc_id,
        } => {
            ingest_paths(config, paths, modality, doc_id).await?;
        }
        Commands::Retire { doc_id } => {
            retire_doc(config, &doc_id).await?;
        }
        Commands::Query { query, top_k } => {
            run_query(config, &query, top_k).await?;
        }
        Commands::Serve => {
            serve_http(config).await?;
        }
        Commands::Status => {
            show_status(config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn cli_parsing() {
        let cli = Cli::try_parse_from(["ragserve", "status"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            matches!(parsed.command, Commands::Status);
        }
    }

    #[test]
    fn ingest_command_with_paths() {
        let cli = Cli::try_parse_from(["ragserve", "ingest", "a.txt", "b.pdf"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ingest { paths, modality, .. } = parsed.command {
                assert_eq!(paths.len(), 2);
                assert_eq!(modality, None);
            }
        }
    }

    #[test]
    fn ingest_command_with_modality() {
        let cli = Cli::try_parse_from(["ragserve", "ingest", "page.bin", "--modality", "scan"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Ingest { modality, .. } = parsed.command {
                assert_eq!(modality, Some("scan".to_string()));
            }
        }
    }

    #[test]
    fn query_command() {
        let cli = Cli::try_parse_from(["ragserve", "query", "warranty period", "--top-k", "3"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            if let Commands::Query { query, top_k } = parsed.command {
                assert_eq!(query, "warranty period");
                assert_eq!(top_k, Some(3));
            }
        }
    }

    #[test]
    fn data_dir_is_global() {
        let cli = Cli::try_parse_from(["ragserve", "status", "--data-dir", "/tmp/rag"]);
        assert!(cli.is_ok());

        if let Ok(parsed) = cli {
            assert_eq!(parsed.data_dir, Some(PathBuf::from("/tmp/rag")));
        }
    }

    #[test]
    fn invalid_command() {
        let cli = Cli::try_parse_from(["ragserve", "invalid"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
        }
    }

    #[test]
    fn help_message() {
        let cli = Cli::try_parse_from(["ragserve", "--help"]);
        assert!(cli.is_err());

        if let Err(err) = cli {
            assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        }
    }
}
