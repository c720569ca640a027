//! Command-line interfaces for the gateway and the function runner

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::runner::Language;

/// Tool gateway: OpenAPI tools, credential injection and an OAuth 2.1 proxy
#[derive(Parser, Debug)]
#[command(name = "gram-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "GRAM_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "GRAM_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "GRAM_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "GRAM_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "GRAM_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Extract tool definitions from an OpenAPI document and print them as JSON
    Extract {
        /// Path to the document (YAML or JSON)
        #[arg(required = true)]
        file: PathBuf,

        /// Document slug, used for tool names and env-var prefixes
        #[arg(short, long)]
        slug: String,

        /// Project the tools belong to
        #[arg(long, default_value = "local")]
        project_id: String,
    },

    /// Print a new base64 32-byte key
    Keygen,
}

/// Function runner
#[derive(Parser, Debug)]
#[command(name = "gram-runner")]
#[command(version, about, long_about = None)]
pub struct RunnerCli {
    /// Language of the code package
    #[arg(long, value_enum, default_value = "javascript")]
    pub language: Language,

    /// Zip file with the user code
    #[arg(long = "codePath", default_value = "/data/code.zip")]
    pub code_path: PathBuf,

    /// Directory the package is unpacked into
    #[arg(long = "workDir", default_value = "/var/task")]
    pub work_dir: PathBuf,

    /// Unpack the package, write the entrypoint and exit
    #[arg(long)]
    pub init: bool,

    /// Address to listen on (`:8888` binds every interface)
    #[arg(long, default_value = ":8888", value_parser = parse_listen)]
    pub listen: SocketAddr,
}

/// Parse `host:port`, or `:port` for every interface.
///
/// # Errors
///
/// Returns a message when the address is malformed.
pub fn parse_listen(value: &str) -> Result<SocketAddr, String> {
    let full = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };
    full.parse()
        .map_err(|e| format!("invalid listen address {value:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_flags_use_camel_case() {
        let cli = RunnerCli::parse_from([
            "gram-runner",
            "--language",
            "python",
            "--codePath",
            "/tmp/code.zip",
            "--workDir",
            "/srv/app",
            "--init",
        ]);
        assert_eq!(cli.language, Language::Python);
        assert_eq!(cli.code_path, PathBuf::from("/tmp/code.zip"));
        assert_eq!(cli.work_dir, PathBuf::from("/srv/app"));
        assert!(cli.init);
        assert_eq!(cli.listen.port(), 8888);
    }

    #[test]
    fn listen_accepts_bare_port() {
        assert_eq!(parse_listen(":9000").unwrap(), "0.0.0.0:9000".parse().unwrap());
        assert_eq!(parse_listen("127.0.0.1:1").unwrap().port(), 1);
        assert!(parse_listen("nope").is_err());
    }

    #[test]
    fn gateway_extract_subcommand() {
        let cli = Cli::parse_from(["gram-gateway", "extract", "petstore.yaml", "--slug", "pets"]);
        match cli.command {
            Some(Command::Extract { file, slug, project_id }) => {
                assert_eq!(file, PathBuf::from("petstore.yaml"));
                assert_eq!(slug, "pets");
                assert_eq!(project_id, "local");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
