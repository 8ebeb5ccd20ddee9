//! Command-line driver for the vnode pager.
#![forbid(unsafe_code)]

mod config;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use config::{CliConfig, ProfileUpdate};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use vnpager::{
    Access, Advice, BackingFile, GetFlags, MountId, PageHandle, PageRelease, PagerOps,
    PagerOptions, PagerSnapshot, PagerStatus, PagerSystem, StdBackingFile, SyncReport,
    SystemStats, VnodePager,
};

#[derive(Parser, Debug)]
#[command(
    name = "vnpager",
    version,
    about = "Page files through the vnode pager",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "VNPAGER_CONFIG",
        value_name = "FILE",
        help = "CLI config file holding named profiles"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Profile to take pager options from")]
    profile: Option<String>,

    #[command(flatten)]
    pager: PagerArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct PagerArgs {
    #[arg(long, global = true, help = "Override page size (bytes)")]
    page_size: Option<u32>,

    #[arg(long, global = true, help = "Override the clustering limit (bytes)")]
    cluster_bytes: Option<u64>,

    #[arg(long, global = true, help = "Override the frame pool size (pages)")]
    frames: Option<usize>,

    #[arg(long, global = true, help = "Override the scratch window size (pages)")]
    scratch_pages: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach to a file and report pager state.
    Stat {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Fault pages in and print their bytes.
    Read {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long, default_value_t = 64)]
        len: u64,
    },
    /// Overwrite a byte range through the page cache and sync it out.
    Fill {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        len: u64,
        #[arg(long, default_value_t = 0, value_parser = parse_byte)]
        byte: u8,
    },
    /// Shrink or grow a file, discarding cached pages past the new end.
    Truncate {
        #[arg(value_name = "FILE")]
        path: PathBuf,
        #[arg(long)]
        size: u64,
    },
    /// Attach files for writing and run a sync pass over them.
    Sync {
        #[arg(value_name = "FILE", required = true)]
        paths: Vec<PathBuf>,
    },
    /// Manage named option profiles.
    #[command(subcommand)]
    Profile(ProfileCommand),
}

#[derive(Subcommand, Debug)]
enum ProfileCommand {
    /// List stored profiles.
    List,
    /// Show one profile and the options it resolves to.
    Show { name: String },
    /// Create or update a profile from the pager override flags.
    Save {
        name: String,
        #[arg(long, help = "Also make this the default profile")]
        default: bool,
    },
    /// Remove a profile.
    Delete { name: String },
    /// Set or clear the default profile.
    Default {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        clear: bool,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct StatReport {
    path: String,
    options: PagerOptions,
    pager: PagerSnapshot,
    system: SystemStats,
}

#[derive(Debug, Serialize)]
struct ReadReport {
    path: String,
    offset: u64,
    len: u64,
    pages: usize,
    hex: String,
}

#[derive(Debug, Serialize)]
struct FillReport {
    path: String,
    offset: u64,
    len: u64,
    pages_dirtied: usize,
    sync: SyncReport,
}

#[derive(Debug, Serialize)]
struct TruncateReport {
    path: String,
    old_size: u64,
    new_size: u64,
    resident_before: usize,
    resident_after: usize,
}

#[derive(Debug, Serialize)]
struct SyncCmdReport {
    files: usize,
    sync: SyncReport,
}

#[derive(Debug, Serialize)]
struct ProfileReport {
    name: String,
    default: bool,
    options: PagerOptions,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.clone())?;

    let command = match cli.command {
        Command::Profile(cmd) => return run_profile(cmd, &mut config, &cli.pager, cli.format),
        other => other,
    };

    let options = resolve_options(&config, cli.profile.as_deref(), &cli.pager)?;
    let system = PagerSystem::new(options.clone())?;

    match command {
        Command::Stat { path } => {
            let file = open_file(&path)?;
            let pager = system.attach(file.clone(), Access::Read)?;
            let report = StatReport {
                path: path.display().to_string(),
                options,
                pager: pager.stats(),
                system: system.stats(),
            };
            pager.detach();
            emit(cli.format, &report, || {
                println!(
                    "{}: pager={} phase={} refs={} size={} resident={} dirty={}",
                    report.path,
                    report.pager.id,
                    report.pager.phase.as_str(),
                    report.pager.refs,
                    report.pager.size,
                    report.pager.resident,
                    report.pager.dirty
                );
                println!(
                    "options: page_size={} cluster_bytes={} frames={} scratch_pages={}",
                    report.options.page_size,
                    report.options.cluster_bytes,
                    report.options.frame_pool_pages,
                    report.options.scratch_pages
                );
            })?;
        }
        Command::Read { path, offset, len } => {
            let file = open_file(&path)?;
            let pager = system.attach(file, Access::Read)?;
            let result = read_range(&pager, offset, len);
            pager.detach();
            let (bytes, pages) = result?;
            let report = ReadReport {
                path: path.display().to_string(),
                offset,
                len: bytes.len() as u64,
                pages,
                hex: hex::encode(&bytes),
            };
            emit(cli.format, &report, || {
                for (row, chunk) in bytes.chunks(16).enumerate() {
                    println!(
                        "{:08x}  {}",
                        offset + row as u64 * 16,
                        hex::encode(chunk)
                    );
                }
            })?;
        }
        Command::Fill {
            path,
            offset,
            len,
            byte,
        } => {
            let file = Arc::new(StdBackingFile::open(&path, MountId(0))?);
            let end = offset.saturating_add(len);
            if file.query_size()? < end {
                file.set_len(end)?;
            }
            let pager = system.attach(file.clone(), Access::ReadWrite)?;
            let dirtied = fill_range(&pager, offset, len, byte);
            let sync = system.sync(None);
            pager.detach();
            let pages_dirtied = dirtied?;
            file.sync_all()?;
            let report = FillReport {
                path: path.display().to_string(),
                offset,
                len,
                pages_dirtied,
                sync,
            };
            emit(cli.format, &report, || {
                println!(
                    "filled {} bytes at {} ({} pages, {} flushed, {} failed)",
                    report.len,
                    report.offset,
                    report.pages_dirtied,
                    report.sync.flushed,
                    report.sync.failed
                );
            })?;
        }
        Command::Truncate { path, size } => {
            let file = Arc::new(StdBackingFile::open(&path, MountId(0))?);
            let pager = system.attach(file.clone(), Access::ReadWrite)?;
            let before = pager.stats();
            system.setsize(file.id(), size);
            file.set_len(size)?;
            let after = pager.stats();
            pager.detach();
            let report = TruncateReport {
                path: path.display().to_string(),
                old_size: before.size,
                new_size: after.size,
                resident_before: before.resident,
                resident_after: after.resident,
            };
            emit(cli.format, &report, || {
                println!(
                    "{}: {} -> {} bytes",
                    report.path, report.old_size, report.new_size
                );
            })?;
        }
        Command::Sync { paths } => {
            let mut pagers = Vec::with_capacity(paths.len());
            for path in &paths {
                pagers.push(system.attach(open_file(path)?, Access::ReadWrite)?);
            }
            let sync = system.sync(None);
            for pager in &pagers {
                pager.detach();
            }
            let report = SyncCmdReport {
                files: paths.len(),
                sync,
            };
            emit(cli.format, &report, || {
                println!(
                    "synced {} files (scanned={} flushed={} failed={})",
                    report.files, report.sync.scanned, report.sync.flushed, report.sync.failed
                );
            })?;
        }
        Command::Profile(_) => unreachable!("profile commands return early"),
    }
    Ok(())
}

fn run_profile(
    cmd: ProfileCommand,
    config: &mut CliConfig,
    overrides: &PagerArgs,
    format: OutputFormat,
) -> Result<(), Box<dyn Error>> {
    match cmd {
        ProfileCommand::List => {
            let default = config.default_profile_name().map(str::to_string);
            let reports = config
                .profiles()
                .map(|profile| {
                    let mut options = PagerOptions::default();
                    profile.apply(&mut options);
                    ProfileReport {
                        name: profile.name.clone(),
                        default: default.as_deref() == Some(profile.name.as_str()),
                        options,
                    }
                })
                .collect::<Vec<_>>();
            emit(format, &reports, || {
                if reports.is_empty() {
                    println!("no profiles");
                }
                for report in &reports {
                    let marker = if report.default { "*" } else { " " };
                    println!(
                        "{marker} {} page_size={} cluster_bytes={} frames={} scratch_pages={}",
                        report.name,
                        report.options.page_size,
                        report.options.cluster_bytes,
                        report.options.frame_pool_pages,
                        report.options.scratch_pages
                    );
                }
            })?;
        }
        ProfileCommand::Show { name } => {
            let options = resolve_options(config, Some(&name), &PagerArgs::default())?;
            let report = ProfileReport {
                default: config.default_profile_name() == Some(name.as_str()),
                name,
                options,
            };
            emit(format, &report, || {
                print!("{}", report.options.to_toml_string().unwrap_or_default());
            })?;
        }
        ProfileCommand::Save { name, default } => {
            config.upsert_profile(
                &name,
                ProfileUpdate {
                    page_size: overrides.page_size,
                    cluster_bytes: overrides.cluster_bytes,
                    frame_pool_pages: overrides.frames,
                    scratch_pages: overrides.scratch_pages,
                },
            )?;
            if default {
                config.set_default_profile(Some(&name))?;
            }
            let path = config.persist()?;
            println!("saved profile '{name}' to {}", path.display());
        }
        ProfileCommand::Delete { name } => {
            config.delete_profile(&name)?;
            let path = config.persist()?;
            println!("deleted profile '{name}' from {}", path.display());
        }
        ProfileCommand::Default { name, clear } => {
            let target = if clear { None } else { name.as_deref() };
            config.set_default_profile(target)?;
            config.persist()?;
            match target {
                Some(name) => println!("default profile set to '{name}'"),
                None => println!("default profile cleared"),
            }
        }
    }
    Ok(())
}

fn resolve_options(
    config: &CliConfig,
    profile: Option<&str>,
    overrides: &PagerArgs,
) -> Result<PagerOptions, Box<dyn Error>> {
    let mut options = PagerOptions::default();
    let name = profile.or_else(|| config.default_profile_name());
    if let Some(name) = name {
        let profile = config
            .profile(name)
            .ok_or_else(|| config::ConfigError::ProfileNotFound {
                name: name.to_string(),
            })?;
        profile.apply(&mut options);
    }
    if let Some(page_size) = overrides.page_size {
        options.page_size = page_size;
    }
    if let Some(cluster_bytes) = overrides.cluster_bytes {
        options.cluster_bytes = cluster_bytes;
    }
    if let Some(frames) = overrides.frames {
        options.frame_pool_pages = frames;
    }
    if let Some(scratch) = overrides.scratch_pages {
        options.scratch_pages = scratch;
    }
    options.validate()?;
    Ok(options)
}

fn open_file(path: &Path) -> Result<Arc<dyn BackingFile>, Box<dyn Error>> {
    Ok(Arc::new(StdBackingFile::open(path, MountId(0))?))
}

fn fault_in(pager: &VnodePager, page_offset: u64, access: Access) -> Result<PageHandle, Box<dyn Error>> {
    let mut slots = [None];
    let status = pager.get(
        page_offset,
        &mut slots,
        0,
        access,
        Advice::Sequential,
        GetFlags::CENTER,
    );
    if status != PagerStatus::Ok {
        return Err(format!("page-in at {page_offset} failed: {status}").into());
    }
    let [slot] = slots;
    slot.ok_or_else(|| "page-in returned no page".into())
}

fn read_range(pager: &VnodePager, offset: u64, len: u64) -> Result<(Vec<u8>, usize), Box<dyn Error>> {
    let page_size = pager.page_size() as u64;
    let end = offset.saturating_add(len).min(pager.size());
    let mut out = Vec::with_capacity(end.saturating_sub(offset) as usize);
    let mut pages = 0;
    let mut cursor = offset;
    while cursor < end {
        let page_offset = cursor - cursor % page_size;
        let page = fault_in(pager, page_offset, Access::Read)?;
        let from = (cursor - page_offset) as usize;
        let to = ((end - page_offset).min(page_size)) as usize;
        out.extend_from_slice(&page.data()[from..to]);
        pager.release_pages(std::slice::from_ref(&page), PageRelease::CLEAN);
        pages += 1;
        cursor = page_offset + to as u64;
    }
    Ok((out, pages))
}

fn fill_range(pager: &VnodePager, offset: u64, len: u64, byte: u8) -> Result<usize, Box<dyn Error>> {
    let page_size = pager.page_size() as u64;
    let end = offset.saturating_add(len);
    let mut pages = 0;
    let mut cursor = offset;
    while cursor < end {
        let page_offset = cursor - cursor % page_size;
        let page = fault_in(pager, page_offset, Access::ReadWrite)?;
        let from = (cursor - page_offset) as usize;
        let to = ((end - page_offset).min(page_size)) as usize;
        page.data_mut()[from..to].fill(byte);
        pager.release_pages(std::slice::from_ref(&page), PageRelease::DIRTY);
        pages += 1;
        cursor = page_offset + to as u64;
    }
    Ok(pages)
}

fn parse_byte(raw: &str) -> Result<u8, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => raw.parse::<u8>(),
    };
    parsed.map_err(|err| format!("invalid byte '{raw}': {err}"))
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}
