//! c4gh: Crypt4GH folder encryption CLI
//!
//! Commands:
//!   keygen                         - create the local keypair under keys/
//!   encrypt-folder [--ephemeral]   - encrypt data/ in place for every key in keys/recv_keys/
//!   decrypt <file> [-o <out>]      - decrypt one file with the local private key
//!   clean --yes                    - delete on-disk key material
//!   config show                    - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use c4gh_core::config::C4ghConfig;
use c4gh_crypto::{encode_private_key, encode_public_key, KdfParams, KeyPair};
use c4gh_session::{host, FolderEncryptor, OpenMode, OsFs, ProgressFn};

const PASSPHRASE_ENV: &str = "C4GH_PASSPHRASE";

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "c4gh",
    version,
    about = "Crypt4GH folder encryption",
    long_about = "c4gh: encrypt files in place for a set of recipients before upload, and decrypt them after download"
)]
struct Cli {
    /// Path to c4gh.toml configuration file
    #[arg(long, short = 'c', env = "C4GH_CONFIG", default_value = "c4gh.toml")]
    config: PathBuf,

    /// Directory the keys/ and data/ layout is resolved against (overrides config)
    #[arg(long, env = "C4GH_ROOT")]
    root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "C4GH_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "C4GH_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate the local keypair (private key sealed with a passphrase)
    Keygen {
        /// Store the private key unencrypted
        #[arg(long)]
        no_passphrase: bool,
        /// Where to write the public key (default: <keys_dir>/pk.pub)
        #[arg(long)]
        public: Option<PathBuf>,
        /// Overwrite an existing private key
        #[arg(long)]
        force: bool,
    },

    /// Encrypt every file under the data directory in place
    ///
    /// The passphrase is read from C4GH_PASSPHRASE or prompted for.
    #[command(name = "encrypt-folder")]
    EncryptFolder {
        /// Use a throwaway keypair instead of the private key file
        #[arg(long)]
        ephemeral: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Decrypt one file with the local private key
    Decrypt {
        /// Encrypted input file
        input: PathBuf,
        /// Output path (default: input without the encrypted suffix)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Delete all key files under the keys directory
    Clean {
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = C4ghConfig::load(&cli.config)
        .with_context(|| format!("loading config: {}", cli.config.display()))?;
    if let Some(root) = &cli.root {
        config.layout.root = root.clone();
    }

    let level = cli.log.as_deref().unwrap_or(&config.logging.log_level);
    let format = cli.log_format.clone().unwrap_or_else(|| {
        if config.logging.log_format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    });
    init_logging(level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        root = %config.layout.root.display(),
        "c4gh starting"
    );

    match cli.command {
        Commands::Keygen { no_passphrase, public, force } => {
            cmd_keygen(&config, no_passphrase, public.as_deref(), force)
        }
        Commands::EncryptFolder { ephemeral, json } => cmd_encrypt_folder(&config, ephemeral, json),
        Commands::Decrypt { input, output } => cmd_decrypt(&config, &input, output.as_deref()),
        Commands::Clean { yes } => cmd_clean(&config, yes),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
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

// ── Passphrase input ──────────────────────────────────────────────────────────

fn read_passphrase(confirm: bool) -> Result<SecretString> {
    if let Ok(value) = std::env::var(PASSPHRASE_ENV) {
        return Ok(SecretString::from(value));
    }
    let first = rpassword::prompt_password("Passphrase: ").context("reading passphrase")?;
    if confirm {
        let second =
            rpassword::prompt_password("Repeat passphrase: ").context("reading passphrase")?;
        if first != second {
            anyhow::bail!("passphrases do not match");
        }
    }
    Ok(SecretString::from(first))
}

// ── `c4gh keygen` ─────────────────────────────────────────────────────────────

fn cmd_keygen(
    config: &C4ghConfig,
    no_passphrase: bool,
    public: Option<&Path>,
    force: bool,
) -> Result<()> {
    let private_path = config.layout.private_key_path();
    if private_path.exists() && !force {
        anyhow::bail!(
            "private key already exists: {} (use --force to overwrite)",
            private_path.display()
        );
    }
    let public_path = public
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.layout.keys_dir().join("pk.pub"));

    let passphrase = if no_passphrase {
        None
    } else {
        Some(read_passphrase(true)?)
    };

    let keypair = KeyPair::generate();
    let sealed = encode_private_key(&keypair, passphrase.as_ref(), &KdfParams::from(&config.crypto))
        .context("encoding private key")?;

    for path in [&private_path, &public_path] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory: {}", parent.display()))?;
        }
    }
    write_private(&private_path, sealed.as_bytes())?;
    std::fs::write(&public_path, encode_public_key(&keypair.public_bytes()))
        .with_context(|| format!("writing public key: {}", public_path.display()))?;

    println!("Keypair created:");
    println!("  private: {}", private_path.display());
    println!("  public:  {}", public_path.display());
    Ok(())
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("writing private key: {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("writing private key: {}", path.display()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents)
        .with_context(|| format!("writing private key: {}", path.display()))
}

// ── `c4gh encrypt-folder` ─────────────────────────────────────────────────────

fn cmd_encrypt_folder(config: &C4ghConfig, ephemeral: bool, json: bool) -> Result<()> {
    let mode = if ephemeral {
        OpenMode::Ephemeral
    } else {
        OpenMode::PassphraseUnlocked(read_passphrase(false)?)
    };

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("building progress style")?
            .progress_chars("=>-"),
    );
    pb.set_prefix("encrypt");
    pb.enable_steady_tick(Duration::from_millis(100));

    let pb_clone = pb.clone();
    let progress: ProgressFn = Box::new(move |done, total, msg| {
        pb_clone.set_length(total);
        pb_clone.set_position(done);
        pb_clone.set_message(msg.to_string());
    });

    let result = FolderEncryptor::new(config)
        .with_progress(&progress)
        .run(mode);

    let report = match result {
        Ok(report) => {
            pb.finish_with_message("done".to_string());
            report
        }
        Err(e) => {
            pb.abandon_with_message("failed".to_string());
            anyhow::bail!("encrypt-folder failed (status {}): {e}", e.status_code());
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing report")?
        );
    } else {
        println!();
        println!("Encryption complete:");
        println!("  encrypted: {} files ({})", report.files, fmt_bytes(report.plaintext_bytes));
        println!("  skipped:   {} files (already encrypted)", report.skipped);
        println!("  written:   {}", fmt_bytes(report.ciphertext_bytes));
    }
    Ok(())
}

// ── `c4gh decrypt` ────────────────────────────────────────────────────────────

fn cmd_decrypt(config: &C4ghConfig, input: &Path, output: Option<&Path>) -> Result<()> {
    let output = match output {
        Some(p) => p.to_path_buf(),
        None => default_output(input, &config.layout.encrypted_suffix)?,
    };
    if output.exists() {
        anyhow::bail!("output already exists: {}", output.display());
    }

    let passphrase = read_passphrase(false)?;
    let mut session = host::open_decrypt_session(OpenMode::PassphraseUnlocked(passphrase), config)
        .context("opening session")?;

    let mut part = output.clone().into_os_string();
    part.push(".part");
    let part = PathBuf::from(part);

    let mut reader = std::io::BufReader::new(
        std::fs::File::open(input).with_context(|| format!("opening {}", input.display()))?,
    );
    let mut writer = std::io::BufWriter::new(
        std::fs::File::create(&part).with_context(|| format!("creating {}", part.display()))?,
    );

    let result = c4gh_session::decrypt_stream(&mut session, &mut reader, &mut writer);
    drop(writer);
    session.close();

    let stats = match result {
        Ok(stats) => stats,
        Err(e) => {
            let _ = std::fs::remove_file(&part);
            return Err(e).with_context(|| format!("decrypting {}", input.display()));
        }
    };
    std::fs::rename(&part, &output)
        .with_context(|| format!("renaming {} -> {}", part.display(), output.display()))?;

    println!("Decrypted:");
    println!("  output:   {}", output.display());
    println!("  segments: {}", stats.segments);
    println!("  bytes:    {}", fmt_bytes(stats.plaintext_bytes));
    Ok(())
}

fn default_output(input: &Path, suffix: &str) -> Result<PathBuf> {
    let name = input.to_string_lossy();
    match name.strip_suffix(suffix) {
        Some(stem) if !stem.is_empty() => Ok(PathBuf::from(stem)),
        _ => anyhow::bail!(
            "{} does not end in {suffix}; pass --output",
            input.display()
        ),
    }
}

// ── `c4gh clean` ──────────────────────────────────────────────────────────────

fn cmd_clean(config: &C4ghConfig, yes: bool) -> Result<()> {
    let keys_dir = config.layout.keys_dir();
    if !yes {
        anyhow::bail!(
            "this deletes every file under {} (pass --yes to confirm)",
            keys_dir.display()
        );
    }
    let removed = host::wipe_key_material(&OsFs, config)
        .with_context(|| format!("cleaning {}", keys_dir.display()))?;
    println!("Removed {removed} key files from {}", keys_dir.display());
    Ok(())
}

// ── `c4gh config show` ────────────────────────────────────────────────────────

fn cmd_config_show(config: &C4ghConfig, config_path: &Path) -> Result<()> {
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

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
