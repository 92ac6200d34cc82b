use clap::Parser;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    author = "hua0512 <https://github.com/hua0512>",
    version,
    about = "Coalescing background downloader",
    long_about = "Downloads files through a shared on-disk cache.\n\
                  \n\
                  Every URL is fetched at most once at a time: repeated URLs share one\n\
                  transfer, and URLs already in the cache finish without touching the\n\
                  network. Finished files can optionally be copied to an output directory."
)]
pub struct CliArgs {
    /// URL(s) to download
    #[arg(required = true, help = "One or more URLs to download")]
    pub urls: Vec<String>,

    /// Cache directory
    #[arg(
        short,
        long,
        help = "Directory holding cached downloads (default: a directory under the system temp dir)"
    )]
    pub cache_dir: Option<PathBuf>,

    /// Output directory for finished files
    #[arg(
        short,
        long,
        help = "Copy finished files into this directory, named after the last URL path segment"
    )]
    pub output_dir: Option<PathBuf>,

    /// Keep cached files from earlier runs
    #[arg(
        long,
        help = "Do not purge the cache directory on startup, so earlier downloads count as cache hits"
    )]
    pub keep_cache: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Overall timeout in seconds
    #[arg(
        long,
        default_value = "0",
        help = "Overall timeout in seconds for a whole transfer. Use 0 for unlimited."
    )]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(
        long,
        default_value = "10",
        help = "Connection timeout in seconds (time to establish initial connection)"
    )]
    pub connect_timeout: u64,

    /// Read timeout in seconds
    #[arg(
        long,
        default_value = "30",
        help = "Read timeout in seconds (maximum time between receiving data chunks)"
    )]
    pub read_timeout: u64,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Show progress bars
    #[arg(
        short = 'P',
        long = "progress",
        default_value = "false",
        help = "Show a progress bar per download"
    )]
    pub show_progress: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let args = CliArgs::try_parse_from(["bgfetch", "https://example.com/a.bin"]).unwrap();
        assert_eq!(args.urls, vec!["https://example.com/a.bin"]);
        assert_eq!(args.connect_timeout, 10);
        assert!(!args.keep_cache);
        assert!(args.headers.is_empty());
    }

    #[test]
    fn test_parse_repeated_headers() {
        let args = CliArgs::try_parse_from([
            "bgfetch",
            "-H",
            "Referer: https://example.com",
            "-H",
            "X-Token: abc",
            "--keep-cache",
            "https://example.com/a.bin",
            "https://example.com/b.bin",
        ])
        .unwrap();
        assert_eq!(args.headers.len(), 2);
        assert_eq!(args.urls.len(), 2);
        assert!(args.keep_cache);
    }

    #[test]
    fn test_requires_url() {
        assert!(CliArgs::try_parse_from(["bgfetch"]).is_err());
    }
}
