//! bar CLI — create, list, compare, test, restore and convert BAR archives.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::{Arc, Mutex};

use clap::{Args, Parser, Subcommand};
use log::warn;
use rsa::{RsaPrivateKey, RsaPublicKey};

use bar::archive::{
    open_payload, verify_signatures, ArchiveDeltaSources, ArchiveOptions, ArchiveReader,
    ArchiveWriter, CreateKeys, EntrySpec, OpenKeys,
};
use bar::compress::ByteAlgorithm;
use bar::configvalues::{
    self, ConfigDescriptor, DeprecationWarnings, ValueKind, BYTE_UNITS,
};
use bar::crypt::CryptAlgorithm;
use bar::delta::{DeltaSourceProvider, NoDeltaSources};
use bar::entries::{EntryExt, EntryKind, SpecialKind};
use bar::errors::{Error, Result};
use bar::fragments::{format_ranges, FragmentRegistry};
use bar::fsio::{self, FsOptions};
use bar::signature::{self, SignatureState};
use bar::storage::{
    BandwidthLimiter, FileStorage, NumberedVolumes, ReadViewFactory, VolumeProvider,
};
use bar::workers::{
    run_entry_workers, spawn_create_reader, CreatePayload, EntryJob, DEFAULT_QUEUE_CAPACITY,
};

#[derive(Parser)]
#[command(
    name = "bar",
    version = "1.0.0",
    about = "BAR backup archiver — chunked archives with compression, encryption and signatures"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct CommonOpts {
    /// Byte compression: none, zip[0-9], bzip2[1-9], lzma[1-9], zstd[1-19]
    #[arg(long, default_value = "none")]
    compress_algorithm: String,
    /// Cipher: none, aes128-ctr, aes256-ctr, twofish256-ctr, camellia256-ctr
    #[arg(long, default_value = "none")]
    crypt_algorithm: String,
    /// Password for the session key (or BAR_PASSWORD, or interactive prompt)
    #[arg(long, env = "BAR_PASSWORD")]
    crypt_password: Option<String>,
    /// RSA public key (PEM) wrapping a random session key on create
    #[arg(long)]
    crypt_public_key: Option<PathBuf>,
    /// RSA private key (PEM) unwrapping the session key on read
    #[arg(long)]
    crypt_private_key: Option<PathBuf>,
    /// ed25519 signing key file (hex) appending SIGN chunks
    #[arg(long)]
    sign_private_key: Option<PathBuf>,
    /// ed25519 public key file (hex) for signature verification
    #[arg(long)]
    verify_public_key: Option<PathBuf>,
    /// Split archives into volumes of this size (e.g. 3M, 1G)
    #[arg(long)]
    archive_part_size: Option<String>,
    /// Only process entry names matching these patterns (* and ?)
    #[arg(long)]
    include: Vec<String>,
    /// Skip entry names matching these patterns
    #[arg(long)]
    exclude: Vec<String>,
    /// Previous archives serving as delta sources
    #[arg(long)]
    delta_source: Vec<PathBuf>,
    /// Store entries without delta when no source matches
    #[arg(long)]
    allow_missing_delta_source: bool,
    #[arg(long)]
    skip_verify_signatures: bool,
    #[arg(long)]
    force_verify_signatures: bool,
    /// Archive block devices raw, block by block
    #[arg(long)]
    raw_images: bool,
    /// Skip the completeness check over entry fragments
    #[arg(long)]
    no_fragments_check: bool,
    /// Record per-entry errors and keep going
    #[arg(long)]
    no_stop_on_error: bool,
    /// Drop OS read-ahead caches while streaming
    #[arg(long)]
    no_cache: bool,
    /// Preserve access times of read files
    #[arg(long)]
    no_atime: bool,
    #[arg(long)]
    max_threads: Option<usize>,
    /// Directory for temporary spool files (default TMPDIR)
    #[arg(long)]
    tmp_directory: Option<PathBuf>,
    /// Config file applied before command-line flags
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Create an archive from filesystem trees
    Create {
        archive: PathBuf,
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[command(flatten)]
        common: CommonOpts,
    },
    /// List archive entries
    List {
        archive: PathBuf,
        #[command(flatten)]
        common: CommonOpts,
    },
    /// Compare archive entries byte-for-byte against the filesystem
    Compare {
        archive: PathBuf,
        #[command(flatten)]
        common: CommonOpts,
    },
    /// Decode every entry without writing anything
    Test {
        archive: PathBuf,
        #[command(flatten)]
        common: CommonOpts,
    },
    /// Restore archive entries into a destination directory
    Restore {
        archive: PathBuf,
        #[arg(default_value = ".")]
        destination: PathBuf,
        #[command(flatten)]
        common: CommonOpts,
    },
    /// Re-encode an archive with different compression/encryption
    Convert {
        archive: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        common: CommonOpts,
    },
    /// Generate an ed25519 signature keypair
    Keygen {
        /// Output prefix; writes <prefix>.key and <prefix>.pub
        prefix: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("bar: {e}");
            exit(e.exit_code());
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Create { archive, inputs, common } => cmd_create(&archive, &inputs, &common),
        Command::List { archive, common } => cmd_list(&archive, &common),
        Command::Compare { archive, common } => {
            cmd_process(&archive, &common, ReadAction::Compare)
        }
        Command::Test { archive, common } => cmd_process(&archive, &common, ReadAction::Test),
        Command::Restore { archive, destination, common } => {
            cmd_process(&archive, &common, ReadAction::Restore(destination))
        }
        Command::Convert { archive, output, common } => cmd_convert(&archive, &output, &common),
        Command::Keygen { prefix } => cmd_keygen(&prefix),
    }
}

fn usage_error(message: &str) -> ! {
    eprintln!("bar: {message}");
    exit(2);
}

// ── Config file ──────────────────────────────────────────────────────────────

/// Defaults loadable from a config file; command-line flags win.
#[derive(Default)]
struct FileConfig {
    compress_algorithm: String,
    crypt_algorithm: String,
    part_size: i64,
    max_threads: i64,
    no_cache: bool,
    no_atime: bool,
    tmp_directory: String,
    delta_sources: Vec<PathBuf>,
    /// [storage] section; absent until the section is configured.
    storage: Option<StorageConfig>,
}

#[derive(Default)]
struct StorageConfig {
    bandwidth: i64,
}

fn config_table() -> Vec<ConfigDescriptor<FileConfig>> {
    vec![
        ConfigDescriptor {
            name: "compress-algorithm",
            kind: ValueKind::String {
                set: |c, v| c.compress_algorithm = v,
                get: |c| c.compress_algorithm.clone(),
            },
        },
        ConfigDescriptor {
            name: "crypt-algorithm",
            kind: ValueKind::String {
                set: |c, v| c.crypt_algorithm = v,
                get: |c| c.crypt_algorithm.clone(),
            },
        },
        ConfigDescriptor {
            name: "archive-part-size",
            kind: ValueKind::Int64 {
                set: |c, v| c.part_size = v,
                get: |c| c.part_size,
                min: 0,
                max: i64::MAX,
                units: BYTE_UNITS,
            },
        },
        ConfigDescriptor {
            name: "max-threads",
            kind: ValueKind::Integer {
                set: |c, v| c.max_threads = v,
                get: |c| c.max_threads,
                min: 0,
                max: 1024,
                units: &[],
            },
        },
        ConfigDescriptor {
            name: "no-cache",
            kind: ValueKind::Bool { set: |c, v| c.no_cache = v, get: |c| c.no_cache },
        },
        ConfigDescriptor {
            name: "no-atime",
            kind: ValueKind::Bool { set: |c, v| c.no_atime = v, get: |c| c.no_atime },
        },
        ConfigDescriptor {
            name: "tmp-directory",
            kind: ValueKind::String {
                set: |c, v| c.tmp_directory = v,
                get: |c| c.tmp_directory.clone(),
            },
        },
        ConfigDescriptor {
            name: "delta-source",
            kind: ValueKind::Special {
                parse: |c, value, _scratch| {
                    c.delta_sources.push(PathBuf::from(value.trim()));
                    true
                },
                format: Some(|c| {
                    c.delta_sources.iter().map(|p| p.display().to_string()).collect()
                }),
            },
        },
        ConfigDescriptor { name: "storage", kind: ValueKind::BeginSection },
        ConfigDescriptor {
            name: "bandwidth",
            kind: ValueKind::Int64 {
                set: |c, v| {
                    if let Some(storage) = c.storage.as_mut() {
                        storage.bandwidth = v;
                    }
                },
                get: |c| c.storage.as_ref().map_or(0, |s| s.bandwidth),
                min: 0,
                max: i64::MAX,
                units: BYTE_UNITS,
            },
        },
        ConfigDescriptor { name: "storage", kind: ValueKind::EndSection },
        ConfigDescriptor {
            name: "compress",
            kind: ValueKind::Deprecated { replacement: Some("compress-algorithm") },
        },
    ]
}

fn load_file_config(common: &CommonOpts) -> Result<FileConfig> {
    let mut config = FileConfig { storage: Some(StorageConfig::default()), ..FileConfig::default() };
    if let Some(path) = &common.config {
        let text = fs::read_to_string(path)
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        let mut deprecations = DeprecationWarnings::default();
        configvalues::parse_config_text(&config_table(), &mut config, &text, &mut deprecations)?;
    }
    Ok(config)
}

// ── Option resolution ────────────────────────────────────────────────────────

struct Resolved {
    options: ArchiveOptions,
    fs_options: FsOptions,
    threads: usize,
    tmp_directory: Option<PathBuf>,
    delta_archives: Vec<PathBuf>,
    bandwidth: Option<Arc<BandwidthLimiter>>,
}

fn resolve(common: &CommonOpts) -> Result<Resolved> {
    let file_config = load_file_config(common)?;

    let compress_name = if common.compress_algorithm == "none"
        && !file_config.compress_algorithm.is_empty()
    {
        file_config.compress_algorithm.clone()
    } else {
        common.compress_algorithm.clone()
    };
    let compression = ByteAlgorithm::from_name(&compress_name)
        .unwrap_or_else(|| usage_error(&format!("unknown compress algorithm '{compress_name}'")));

    let crypt_name =
        if common.crypt_algorithm == "none" && !file_config.crypt_algorithm.is_empty() {
            file_config.crypt_algorithm.clone()
        } else {
            common.crypt_algorithm.clone()
        };
    let crypt = CryptAlgorithm::from_name(&crypt_name)
        .unwrap_or_else(|| usage_error(&format!("unknown crypt algorithm '{crypt_name}'")));

    let part_size = match &common.archive_part_size {
        Some(text) => {
            let parsed = configvalues::parse_scaled("archive-part-size", text, BYTE_UNITS)?;
            if parsed <= 0 {
                usage_error("archive-part-size must be positive");
            }
            Some(parsed as u64)
        }
        None if file_config.part_size > 0 => Some(file_config.part_size as u64),
        None => None,
    };

    let threads = common
        .max_threads
        .or((file_config.max_threads > 0).then_some(file_config.max_threads as usize))
        .unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        });

    let mut delta_archives = file_config.delta_sources.clone();
    delta_archives.extend(common.delta_source.iter().cloned());

    let tmp_directory = common
        .tmp_directory
        .clone()
        .or((!file_config.tmp_directory.is_empty())
            .then(|| PathBuf::from(&file_config.tmp_directory)));

    let bandwidth = file_config
        .storage
        .as_ref()
        .filter(|s| s.bandwidth > 0)
        .map(|s| Arc::new(BandwidthLimiter::new(s.bandwidth as u64)));

    Ok(Resolved {
        options: ArchiveOptions {
            compression,
            crypt,
            part_size,
            skip_unknown_chunks: true,
            delta_enabled: !delta_archives.is_empty(),
            allow_missing_delta_source: common.allow_missing_delta_source,
            cancel: None,
        },
        fs_options: FsOptions {
            no_atime: common.no_atime || file_config.no_atime,
            no_cache: common.no_cache || file_config.no_cache,
        },
        threads,
        tmp_directory,
        delta_archives,
        bandwidth,
    })
}

// ── Keys ─────────────────────────────────────────────────────────────────────

/// Password resolver: flag/env first, otherwise one interactive prompt.
struct PasswordSource {
    provided: Option<String>,
    prompted: Mutex<Option<Option<String>>>,
}

impl PasswordSource {
    fn new(provided: Option<String>) -> Arc<Self> {
        Arc::new(Self { provided, prompted: Mutex::new(None) })
    }

    fn get(&self, purpose: &str) -> Option<String> {
        if let Some(password) = &self.provided {
            return Some(password.clone());
        }
        let mut prompted = self.prompted.lock().unwrap();
        if prompted.is_none() {
            *prompted = Some(rpassword::prompt_password(format!("{purpose}: ")).ok());
        }
        prompted.clone().unwrap()
    }
}

fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    use rsa::pkcs8::DecodePublicKey;
    let pem = fs::read_to_string(path)
        .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
    RsaPublicKey::from_public_key_pem(&pem)
        .map_err(|e| Error::CorruptData(format!("public key {}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    use rsa::pkcs8::DecodePrivateKey;
    let pem = fs::read_to_string(path)
        .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .map_err(|e| Error::CorruptData(format!("private key {}: {e}", path.display())))
}

fn open_keys(common: &CommonOpts, passwords: &Arc<PasswordSource>) -> Result<OpenKeys> {
    let private_key = match &common.crypt_private_key {
        Some(path) => Some(load_private_key(path)?),
        None => None,
    };
    let passwords = Arc::clone(passwords);
    Ok(OpenKeys {
        password: Some(Box::new(move |purpose, _retry| passwords.get(purpose))),
        private_key,
    })
}

fn create_keys(common: &CommonOpts, crypt: CryptAlgorithm) -> Result<CreateKeys> {
    let signing_key = match &common.sign_private_key {
        Some(path) => Some(signature::load_signing_key(path)?),
        None => None,
    };
    if crypt.is_none() {
        return Ok(CreateKeys { signing_key, ..CreateKeys::default() });
    }
    if let Some(path) = &common.crypt_public_key {
        return Ok(CreateKeys {
            public_key: Some(load_public_key(path)?),
            signing_key,
            ..CreateKeys::default()
        });
    }
    let password = match &common.crypt_password {
        Some(password) => password.clone(),
        None => {
            let first = rpassword::prompt_password("archive password: ")
                .map_err(|e| Error::Io(e))?;
            let second = rpassword::prompt_password("repeat password: ")
                .map_err(|e| Error::Io(e))?;
            if first != second {
                usage_error("passwords do not match");
            }
            first
        }
    };
    Ok(CreateKeys { password: Some(password), signing_key, ..CreateKeys::default() })
}

// ── Signature policy ─────────────────────────────────────────────────────────

fn check_signatures(
    factory: &dyn ReadViewFactory,
    common: &CommonOpts,
) -> Result<SignatureState> {
    if common.skip_verify_signatures {
        return Ok(SignatureState::Skipped);
    }
    let key = match &common.verify_public_key {
        Some(path) => Some(signature::load_verifying_key(path)?),
        None => None,
    };
    let state = verify_signatures(factory, key.as_ref())?;
    match state {
        SignatureState::Invalid => Err(Error::InvalidSignature),
        SignatureState::NoKey => Err(Error::NoPublicSignatureKey),
        SignatureState::Skipped if common.force_verify_signatures => Err(Error::InvalidSignature),
        state => Ok(state),
    }
}

// ── Piece discovery ──────────────────────────────────────────────────────────

const MAX_VOLUMES: u32 = 999;

/// Resolve an archive name to its storage pieces: the file itself, or the
/// numbered volumes of a split archive.  Gaps are tolerated and logged.
fn archive_pieces(path: &Path) -> Result<Vec<(u32, PathBuf)>> {
    if path.exists() {
        return Ok(vec![(1, path.to_owned())]);
    }
    let mut pieces = Vec::new();
    let mut missing = Vec::new();
    for volume in 1..=MAX_VOLUMES {
        let candidate = NumberedVolumes::volume_path(path, volume);
        if candidate.exists() {
            pieces.push((volume, candidate));
        } else {
            missing.push(volume);
        }
    }
    if pieces.is_empty() {
        return Err(Error::FileNotFound(path.display().to_string()));
    }
    let last = pieces.last().unwrap().0;
    for volume in missing.into_iter().filter(|v| *v < last) {
        warn!("volume {volume} of {} is missing", path.display());
    }
    Ok(pieces)
}

// ── Pattern selection ────────────────────────────────────────────────────────

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut mark) = (usize::MAX, 0usize);
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = pi;
            mark = ti;
            pi += 1;
        } else if star != usize::MAX {
            pi = star + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

fn name_selected(common: &CommonOpts, name: &str) -> bool {
    if !common.include.is_empty()
        && !common.include.iter().any(|pattern| wildcard_match(pattern, name))
    {
        return false;
    }
    !common.exclude.iter().any(|pattern| wildcard_match(pattern, name))
}

// ── Delta provider ───────────────────────────────────────────────────────────

fn delta_provider(
    resolved: &Resolved,
    common: &CommonOpts,
) -> Result<Arc<dyn DeltaSourceProvider>> {
    if resolved.delta_archives.is_empty() {
        return Ok(Arc::new(NoDeltaSources));
    }
    let mut pieces: Vec<Arc<dyn ReadViewFactory>> = Vec::new();
    for path in &resolved.delta_archives {
        for (_, piece) in archive_pieces(path)? {
            pieces.push(Arc::new(piece));
        }
    }
    let private_key = match &common.crypt_private_key {
        Some(path) => Some(load_private_key(path)?),
        None => None,
    };
    Ok(Arc::new(ArchiveDeltaSources::new(
        pieces,
        common.crypt_password.clone(),
        private_key,
        resolved.tmp_directory.clone(),
    )))
}

// ── create ───────────────────────────────────────────────────────────────────

fn cmd_create(archive: &Path, inputs: &[PathBuf], common: &CommonOpts) -> Result<i32> {
    let resolved = resolve(common)?;
    let keys = create_keys(common, resolved.options.crypt)?;
    let provider = delta_provider(&resolved, common)?;

    // Block devices become image entries in raw mode; everything else is
    // planned by the tree walker.
    let mut plans = Vec::new();
    let mut tree_roots = Vec::new();
    for input in inputs {
        if common.raw_images {
            if let Ok((EntryKind::Special, mut info, EntryExt::Special { kind: SpecialKind::BlockDevice, .. })) =
                fsio::stat_entry(input)
            {
                let (size, block_size, _reader) = fsio::open_image(
                    input,
                    Box::new(fsio::AllBlocksUsed),
                    resolved.fs_options,
                )?;
                info.size = size;
                plans.push(bar::workers::CreatePlan {
                    spec: EntrySpec {
                        kind: EntryKind::Image,
                        name: fsio::archive_name(input),
                        info,
                        ext: EntryExt::Image { block_size, filesystem_aware: false },
                        hardlink_names: Vec::new(),
                    },
                    source: Some(input.clone()),
                });
                continue;
            }
        }
        tree_roots.push(input.clone());
    }
    plans.extend(fsio::plan_tree(&tree_roots)?);
    plans.retain(|plan| name_selected(common, &plan.spec.name));

    let part_size = resolved.options.part_size;
    let base = archive.to_owned();
    let bandwidth = resolved.bandwidth.clone();
    let sink_factory: Box<dyn FnMut(u32) -> Result<FileStorage> + Send> =
        Box::new(move |volume| {
            let path = match part_size {
                Some(_) => NumberedVolumes::new(&base).request(volume)?,
                None => base.clone(),
            };
            let storage = FileStorage::create(&path)?;
            Ok(match &bandwidth {
                Some(limiter) => storage.with_limiter(Arc::clone(limiter)),
                None => storage,
            })
        });

    let mut writer = ArchiveWriter::create(sink_factory, resolved.options.clone(), keys, provider)?;

    let fs_options = resolved.fs_options;
    let (rx, reader_thread) = spawn_create_reader(plans, None);
    let mut entries = 0u64;
    let mut plain_total = 0u64;
    let mut stored_total = 0u64;
    while let Ok(job) = rx.recv() {
        let stats = match job.payload {
            CreatePayload::None => writer.write_entry(&job.spec, None)?,
            CreatePayload::Inline(bytes) => {
                let mut source = std::io::Cursor::new(bytes);
                writer.write_entry(&job.spec, Some(&mut source))?
            }
            CreatePayload::Stream(path) => {
                if job.spec.kind == EntryKind::Image {
                    let (_, _, mut reader) =
                        fsio::open_image(&path, Box::new(fsio::AllBlocksUsed), fs_options)?;
                    writer.write_entry(&job.spec, Some(&mut reader))?
                } else {
                    let mut source = fsio::FileSource::open(&path, fs_options)?;
                    writer.write_entry(&job.spec, Some(&mut source))?
                }
            }
        };
        entries += 1;
        plain_total += stats.plain_bytes;
        stored_total += stats.stored_bytes;
    }
    reader_thread.join().map_err(|_| Error::Internal("source reader panicked".into()))??;

    let volumes = writer.current_volume();
    writer.close(true)?;

    let ratio = if plain_total > 0 {
        100.0 * stored_total as f64 / plain_total as f64
    } else {
        100.0
    };
    println!(
        "Created {}: {entries} entries, {plain_total} bytes ({ratio:.1}% stored, {volumes} volume{})",
        archive.display(),
        if volumes == 1 { "" } else { "s" },
    );
    Ok(0)
}

// ── list ─────────────────────────────────────────────────────────────────────

fn cmd_list(archive: &Path, common: &CommonOpts) -> Result<i32> {
    let resolved = resolve(common)?;
    let passwords = PasswordSource::new(common.crypt_password.clone());
    let pieces = archive_pieces(archive)?;
    let registry = FragmentRegistry::new();

    println!(
        "{:<10} {:>12} {:>12} {:>7}  {:<19}  Name",
        "Type", "Size", "Stored", "Ratio", "Modified"
    );
    let mut signature_state = SignatureState::Skipped;
    for (_, piece) in &pieces {
        let factory: Arc<dyn ReadViewFactory> = Arc::new(piece.clone());
        signature_state = signature_state.merge(check_signatures(factory.as_ref(), common)?);

        let mut reader =
            ArchiveReader::open(Arc::clone(&factory), resolved.options.clone(), open_keys(common, &passwords)?)?;
        while let Some(entry) = reader.next_entry()? {
            let header = &entry.header;
            if !name_selected(common, &header.name) {
                continue;
            }
            if header.kind.has_payload() {
                let node = registry.find_or_create(&header.name, header.info.size)?;
                node.lock().unwrap().add_range(header.fragment_offset, header.fragment_size);
            }
            // Only the first fragment of an entry is listed.
            if header.fragment_offset != 0 {
                continue;
            }
            let stored = entry.data.map_or(0, |d| d.body_len);
            let ratio = if header.info.size > 0 && header.is_whole() {
                format!("{:.1}%", 100.0 * stored as f64 / header.info.size as f64)
            } else {
                "-".into()
            };
            let modified = chrono::DateTime::from_timestamp(header.info.mtime as i64, 0)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "{:<10} {:>12} {:>12} {:>7}  {:<19}  {}",
                header.kind.name(),
                header.info.size,
                stored,
                ratio,
                modified,
                header.name,
            );
        }
    }
    println!("Signatures: {signature_state}");

    if !common.no_fragments_check {
        let incomplete = registry.incomplete();
        if !incomplete.is_empty() {
            for (name, ranges) in &incomplete {
                eprintln!("bar: entry incomplete: {name}, uncovered {}", format_ranges(ranges));
            }
            return Ok(1);
        }
    }
    Ok(0)
}

// ── compare / test / restore ─────────────────────────────────────────────────

enum ReadAction {
    Compare,
    Test,
    Restore(PathBuf),
}

fn cmd_process(archive: &Path, common: &CommonOpts, action: ReadAction) -> Result<i32> {
    let resolved = resolve(common)?;
    let passwords = PasswordSource::new(common.crypt_password.clone());
    let pieces = archive_pieces(archive)?;
    let provider = delta_provider(&resolved, common)?;
    let registry = FragmentRegistry::new();

    for (_, piece) in &pieces {
        let factory: Arc<dyn ReadViewFactory> = Arc::new(piece.clone());
        check_signatures(factory.as_ref(), common)?;
    }

    let fs_options = resolved.fs_options;
    let action_ref = &action;
    let registry_ref = &registry;
    let provider_ref = provider.as_ref();

    let errors = run_entry_workers(
        resolved.threads,
        DEFAULT_QUEUE_CAPACITY,
        !common.no_stop_on_error,
        None,
        |tx, cancel| {
            for (volume, piece) in &pieces {
                let factory: Arc<dyn ReadViewFactory> = Arc::new(piece.clone());
                let mut reader = ArchiveReader::open(
                    Arc::clone(&factory),
                    resolved.options.clone(),
                    open_keys(common, &passwords)?,
                )?;
                while let Some(entry) = reader.next_entry()? {
                    if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                        return Ok(());
                    }
                    if !name_selected(common, &entry.header.name) {
                        continue;
                    }
                    tx.send(EntryJob { piece: *volume, factory: Arc::clone(&factory), entry })
                        .map_err(|_| Error::Internal("entry bus closed".into()))?;
                }
            }
            Ok(())
        },
        |job| {
            process_entry(job, action_ref, registry_ref, provider_ref, fs_options)
        },
    )?;

    let mut exit_code = 0;
    for (name, error) in &errors {
        eprintln!("bar: {name}: {error}");
        if matches!(error, Error::EntriesDiffer { .. }) {
            exit_code = 6;
        } else if exit_code == 0 {
            exit_code = error.exit_code();
        }
    }

    if !common.no_fragments_check {
        let incomplete = registry.incomplete();
        for (name, ranges) in &incomplete {
            eprintln!("bar: entry incomplete: {name}, uncovered {}", format_ranges(ranges));
        }
        if !incomplete.is_empty() && exit_code == 0 {
            exit_code = 1;
        }
    }

    let verb = match &action {
        ReadAction::Compare => "compared",
        ReadAction::Test => "tested",
        ReadAction::Restore(_) => "restored",
    };
    println!("{verb} {} entr{} with {} error{}", registry.len(),
        if registry.len() == 1 { "y" } else { "ies" },
        errors.len(),
        if errors.len() == 1 { "" } else { "s" });
    Ok(exit_code)
}

fn process_entry(
    job: &EntryJob,
    action: &ReadAction,
    registry: &FragmentRegistry,
    provider: &dyn DeltaSourceProvider,
    fs_options: FsOptions,
) -> Result<()> {
    let header = &job.entry.header;
    let name = header.name.clone();

    // Fragment bookkeeping for payload kinds; other kinds are registered
    // with size 0 so totals come out right.
    let node = registry.find_or_create(&name, header.info.size)?;

    match action {
        ReadAction::Test => {
            let mut payload = open_payload(job.factory.as_ref(), &job.entry, provider)?;
            let mut sink = std::io::sink();
            let copied = std::io::copy(&mut payload.reader, &mut sink)?;
            if copied != header.fragment_size {
                return Err(Error::CorruptData(format!(
                    "entry {name}: fragment decoded to {copied} bytes, expected {}",
                    header.fragment_size
                )));
            }
        }
        ReadAction::Compare => {
            let live_path = PathBuf::from(&name);
            match header.kind {
                EntryKind::File | EntryKind::Image | EntryKind::Hardlink => {
                    let (kind, live_info, _) = fsio::stat_entry(&live_path)?;
                    if header.kind == EntryKind::File && kind != EntryKind::File {
                        return Err(Error::WrongEntryType { expected: "file" });
                    }
                    if header.kind != EntryKind::Image && live_info.size != header.info.size {
                        return Err(Error::EntriesDiffer {
                            name,
                            offset: live_info.size.min(header.info.size),
                        });
                    }
                    let mut payload = open_payload(job.factory.as_ref(), &job.entry, provider)?;
                    fsio::compare_payload(&live_path, &mut payload, fs_options)?;
                }
                EntryKind::Directory => {
                    let (kind, _, _) = fsio::stat_entry(&live_path)?;
                    if kind != EntryKind::Directory {
                        return Err(Error::WrongEntryType { expected: "directory" });
                    }
                }
                EntryKind::Link => {
                    let (kind, _, ext) = fsio::stat_entry(&live_path)?;
                    if kind != EntryKind::Link || ext != header.ext {
                        return Err(Error::EntriesDiffer { name, offset: 0 });
                    }
                }
                EntryKind::Special => {
                    let (kind, _, ext) = fsio::stat_entry(&live_path)?;
                    if kind != EntryKind::Special || ext != header.ext {
                        return Err(Error::EntriesDiffer { name, offset: 0 });
                    }
                }
            }
        }
        ReadAction::Restore(destination) => {
            let mut payload = if header.kind.has_payload() {
                Some(open_payload(job.factory.as_ref(), &job.entry, provider)?)
            } else {
                None
            };
            fsio::restore_entry(
                destination,
                &name,
                header.kind,
                &header.info,
                &header.ext,
                &job.entry.hardlink_names,
                payload.as_mut(),
            )?;
        }
    }

    if header.kind.has_payload() {
        node.lock().unwrap().add_range(header.fragment_offset, header.fragment_size);
    }
    Ok(())
}

// ── convert ──────────────────────────────────────────────────────────────────

fn cmd_convert(archive: &Path, output: &Path, common: &CommonOpts) -> Result<i32> {
    let resolved = resolve(common)?;
    let passwords = PasswordSource::new(common.crypt_password.clone());
    let pieces = archive_pieces(archive)?;
    let provider = delta_provider(&resolved, common)?;

    // First pass: collect entries in first-seen order, spooling payload
    // fragments into temp files so split sources convert whole.
    struct Collected {
        spec: EntrySpec,
        spool: Option<std::fs::File>,
    }
    let mut order: Vec<String> = Vec::new();
    let mut collected: std::collections::HashMap<String, Collected> =
        std::collections::HashMap::new();
    let tmp_dir = resolved.tmp_directory.clone().unwrap_or_else(std::env::temp_dir);

    for (_, piece) in &pieces {
        let factory: Arc<dyn ReadViewFactory> = Arc::new(piece.clone());
        check_signatures(factory.as_ref(), common)?;
        let mut reader = ArchiveReader::open(
            Arc::clone(&factory),
            resolved.options.clone(),
            open_keys(common, &passwords)?,
        )?;
        while let Some(entry) = reader.next_entry()? {
            let header = &entry.header;
            if !name_selected(common, &header.name) {
                continue;
            }
            let slot = collected.entry(header.name.clone()).or_insert_with(|| {
                order.push(header.name.clone());
                Collected {
                    spec: EntrySpec {
                        kind: header.kind,
                        name: header.name.clone(),
                        info: header.info.clone(),
                        ext: header.ext.clone(),
                        hardlink_names: entry.hardlink_names.clone(),
                    },
                    spool: None,
                }
            });
            if header.kind.has_payload() {
                use std::io::{Seek, SeekFrom};
                let mut payload = open_payload(factory.as_ref(), &entry, provider.as_ref())?;
                if slot.spool.is_none() {
                    slot.spool = Some(tempfile::tempfile_in(&tmp_dir)?);
                }
                let file = slot.spool.as_mut().unwrap();
                file.seek(SeekFrom::Start(payload.fragment_offset))?;
                std::io::copy(&mut payload.reader, file)?;
            }
        }
    }

    let keys = create_keys(common, resolved.options.crypt)?;
    let part_size = resolved.options.part_size;
    let base = output.to_owned();
    let sink_factory: Box<dyn FnMut(u32) -> Result<FileStorage> + Send> =
        Box::new(move |volume| match part_size {
            Some(_) => FileStorage::create(NumberedVolumes::new(&base).request(volume)?),
            None => FileStorage::create(&base),
        });
    // The re-encoded archive stores payloads whole.
    let writer_options = ArchiveOptions { delta_enabled: false, ..resolved.options.clone() };
    let mut writer =
        ArchiveWriter::create(sink_factory, writer_options, keys, Arc::new(NoDeltaSources))?;

    let mut converted = 0u64;
    for name in order {
        let mut item = collected.remove(&name).unwrap();
        match &mut item.spool {
            Some(file) => {
                use std::io::{Seek, SeekFrom};
                file.seek(SeekFrom::Start(0))?;
                writer.write_entry(&item.spec, Some(file))?;
            }
            None => {
                writer.write_entry(&item.spec, None)?;
            }
        }
        converted += 1;
    }
    writer.close(true)?;
    println!("Converted {converted} entries → {}", output.display());
    Ok(0)
}

// ── keygen ───────────────────────────────────────────────────────────────────

fn cmd_keygen(prefix: &Path) -> Result<i32> {
    let (private_hex, public_hex) = signature::generate_keypair_hex();
    let key_path = prefix.with_extension("key");
    let pub_path = prefix.with_extension("pub");
    fs::write(&key_path, format!("{private_hex}\n"))?;
    fs::write(&pub_path, format!("{public_hex}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
    }
    println!("Signature keypair: {} / {}", key_path.display(), pub_path.display());
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        assert!(wildcard_match("*.txt", "/home/u/a.txt"));
        assert!(wildcard_match("/home/*/a.?xt", "/home/u/a.txt"));
        assert!(!wildcard_match("*.bin", "/home/u/a.txt"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("a*b*c", "aXXbYY"));
    }
}
