//! sdrive: chunked encrypted transfer client
//!
//! Commands:
//!   config show                      - display current configuration
//!   roundtrip <file> [--output <p>]  - upload then download a file through
//!                                      the in-process loopback drive

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::info;

use sdrive_core::config::SdriveConfig;
use sdrive_core::{FileSample, SampleKind, VerificationStatus};
use sdrive_storage::{build_operator, check_health, OperatorBlobStore, S3Credentials};
use sdrive_transfer::loopback::LoopbackDrive;
use sdrive_transfer::{ProgressFn, UploadRequest};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sdrive",
    version,
    about = "sdrive encrypted transfer client",
    long_about = "sdrive: upload and download files as signed, encrypted blocks"
)]
struct Cli {
    /// Path to sdrive.toml configuration file
    #[arg(long, short = 'c', env = "SDRIVE_CONFIG", default_value = "/etc/sdrive/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides logging.level
    #[arg(long, env = "SDRIVE_LOG")]
    log: Option<String>,

    /// Log format; overrides logging.format
    #[arg(long, env = "SDRIVE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Upload a file, download it again, and compare
    ///
    /// Metadata lives in memory for the duration of the command; block
    /// ciphertext goes to the configured storage backend. S3 credentials are
    /// read from AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY.
    Roundtrip {
        /// Local file to upload
        file: PathBuf,
        /// Write the downloaded content here
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        /// Attach this file as the revision's thumbnail sample
        #[arg(long)]
        thumbnail: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.unwrap_or(match config.logging.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, format);

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
        Commands::Roundtrip {
            file,
            output,
            thumbnail,
        } => cmd_roundtrip(&config, &file, output.as_deref(), thumbnail.as_deref()).await,
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<SdriveConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        SdriveConfig::from_toml(&content).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(SdriveConfig::default())
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// S3 access keys from the standard environment variables, when set.
fn credentials_from_env() -> Option<S3Credentials> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("SDRIVE_ACCESS_KEY_ID"))
        .ok()?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("SDRIVE_SECRET_ACCESS_KEY"))
        .ok()?;
    Some(S3Credentials {
        access_key_id,
        secret_access_key,
    })
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_prefix("~/")) {
        Some(rest) => PathBuf::from(std::env::var("HOME").unwrap_or_default()).join(rest),
        None => path.to_path_buf(),
    }
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=>-");
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_callback(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Arc::new(move |done, _total| pb.set_position(done))
}

// ── `sdrive config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &SdriveConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `sdrive roundtrip` ────────────────────────────────────────────────────────

async fn cmd_roundtrip(
    config: &SdriveConfig,
    file: &Path,
    output: Option<&Path>,
    thumbnail: Option<&Path>,
) -> Result<()> {
    let mut storage = config.storage.clone();
    storage.root = expand_tilde(&storage.root);
    let op = build_operator(&storage, credentials_from_env().as_ref())?;
    check_health(&op).await?;

    let drive = Arc::new(LoopbackDrive::new(Arc::new(OperatorBlobStore::new(op))));
    let client = drive.client(config.transfer.clone());
    let node = drive.create_file("cli")?;
    let cancel = CancellationToken::new();

    let metadata = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let size = metadata.len();
    let modification_time = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs());

    let mut samples = Vec::new();
    if let Some(path) = thumbnail {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading thumbnail {}", path.display()))?;
        samples.push(FileSample {
            kind: SampleKind::Thumbnail,
            content,
        });
    }

    // ── Upload
    let started = Instant::now();
    let input = tokio::fs::File::open(file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;
    let pb = make_progress_bar(size, "upload");
    let uploader = client
        .wait_for_file_uploader(size, samples.len(), &cancel)
        .await?;
    let request = UploadRequest {
        file: node.clone(),
        current_revision_id: None,
    };
    let revision = uploader
        .upload(
            &request,
            input,
            samples,
            modification_time,
            Some(progress_callback(&pb)),
            &cancel,
        )
        .await
        .context("upload failed")?;
    pb.finish_with_message("done");
    info!(
        revision = %revision.id,
        bytes = revision.size,
        stored = revision.quota_consumption,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "upload complete"
    );

    // ── Download
    let started = Instant::now();
    let pb = make_progress_bar(revision.size, "download");
    let downloader = client.wait_for_file_downloader(&cancel).await?;
    let mut content = Vec::with_capacity(usize::try_from(revision.size).unwrap_or(0));
    let status = downloader
        .download(&node, &revision, &mut content, Some(progress_callback(&pb)), &cancel)
        .await
        .context("download failed")?;
    pb.finish_with_message("done");
    info!(
        revision = %revision.id,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "download complete"
    );

    if let Some(path) = output {
        tokio::fs::write(path, &content)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
    }

    let original = tokio::fs::read(file)
        .await
        .with_context(|| format!("re-reading {}", file.display()))?;
    let original_digest = sdrive_crypto::sha256(&original);
    let downloaded_digest = sdrive_crypto::sha256(&content);

    println!("revision:     {}", revision.id);
    println!("size:         {} bytes ({} stored)", revision.size, revision.quota_consumption);
    println!("signature:    {}", describe(status));
    println!("sha256 in:    {}", hex::encode(original_digest));
    println!("sha256 out:   {}", hex::encode(downloaded_digest));

    if original_digest != downloaded_digest {
        anyhow::bail!("downloaded content differs from {}", file.display());
    }
    if status != VerificationStatus::Ok {
        anyhow::bail!("manifest signature did not verify: {}", describe(status));
    }
    Ok(())
}

fn describe(status: VerificationStatus) -> &'static str {
    match status {
        VerificationStatus::Ok => "verified",
        VerificationStatus::NotSigned => "not signed",
        VerificationStatus::NoVerifier => "no verification key",
        VerificationStatus::Failed => "FAILED",
        VerificationStatus::BadContext => "signature could not be opened",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_roundtrip() {
        let cli = Cli::try_parse_from([
            "sdrive",
            "--log-format",
            "json",
            "roundtrip",
            "data.bin",
            "-o",
            "copy.bin",
        ])
        .unwrap();
        assert!(matches!(cli.log_format, Some(LogFormat::Json)));
        match cli.command {
            Commands::Roundtrip { file, output, thumbnail } => {
                assert_eq!(file, PathBuf::from("data.bin"));
                assert_eq!(output, Some(PathBuf::from("copy.bin")));
                assert!(thumbnail.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde(Path::new("/var/lib/x")), PathBuf::from("/var/lib/x"));
        assert!(!expand_tilde(Path::new("~/blobs")).starts_with("~"));
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.storage.backend, "memory");
    }

    #[tokio::test]
    async fn test_roundtrip_through_memory_backend() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let output = dir.path().join("output.bin");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&input, &data).unwrap();

        let mut config = SdriveConfig::default();
        config.transfer.block_size = 1024;
        config.transfer.max_block_transfers = 2;

        cmd_roundtrip(&config, &input, Some(&output), None).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), data);
    }
}
