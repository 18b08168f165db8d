use std::path::PathBuf;

use clap::Parser;
use tranche::ProxyType;

#[derive(Parser, Debug)]
#[command(
    name = "tranche",
    author,
    version,
    about = "Resumable multi-connection HTTP downloader",
    long_about = None
)]
pub struct Args {
    /// URL of the resource to download
    pub url: String,

    /// Destination directory
    #[arg(short = 'o', long = "output-dir", default_value = ".")]
    pub output_dir: PathBuf,

    /// File name, taken from the URL when omitted
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,

    /// Number of concurrent pieces (1-16)
    #[arg(short = 'p', long = "pieces", default_value_t = 4)]
    pub pieces: u32,

    /// Attempts allowed for retryable failures
    #[arg(long = "retries", default_value_t = 5)]
    pub retries: u32,

    /// Proxy URL (http://, https:// or socks5://)
    #[arg(long = "proxy")]
    pub proxy: Option<String>,

    /// Override the detected proxy type
    #[arg(long = "proxy-type", value_enum, requires = "proxy")]
    pub proxy_type: Option<ProxyType>,

    #[arg(long = "proxy-username", requires = "proxy")]
    pub proxy_username: Option<String>,

    #[arg(long = "proxy-password", requires = "proxy_username")]
    pub proxy_password: Option<String>,

    /// User-Agent sent with every request
    #[arg(long = "user-agent")]
    pub user_agent: Option<String>,

    /// Expected SHA-256 of the finished file (hex)
    #[arg(long = "sha256")]
    pub sha256: Option<String>,

    /// Delete the partial file when the download fails
    #[arg(long = "delete-on-error")]
    pub delete_on_error: bool,

    /// Overwrite an existing destination file
    #[arg(long = "force")]
    pub force: bool,

    /// Print the final download record as JSON
    #[arg(long = "json")]
    pub json: bool,

    /// Enable debug logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}
