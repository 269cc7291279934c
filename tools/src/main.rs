use std::path::{Path, PathBuf};
use std::sync::Arc;

use asset_cache::logging::{self, LogLevel};
use asset_cache::observability;
use asset_cache::{
    AssetCacheManager, CacheConfig, CacheError, ConverterRegistry, CopyConverter, LayeredStorage,
    Loadable, Storage,
};
use clap::{Parser, Subcommand};
use tracing::{error, warn};

const EXIT_SUCCESS: i32 = 0;
const EXIT_USAGE: i32 = 2;
const EXIT_NOT_FOUND: i32 = 10;
const EXIT_CONVERSION: i32 = 11;
const EXIT_STORAGE: i32 = 12;

#[derive(Parser)]
#[command(name = "asset_tools", version, about = "Asset cache tools CLI")]
struct Cli {
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the source identity and cache key for every matching kind.
    Key { source: String },
    /// Show how a source resolves for one kind.
    Explain {
        source: String,
        #[arg(long)]
        kind: String,
    },
    /// Produce a loadable artifact, converting with the pass-through converter.
    Cook {
        stem: String,
        #[arg(long)]
        kind: String,
    },
    /// List the mount layers that can supply a path.
    Mounts { path: String },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_level);
    observability::install_panic_hook();
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(code) => std::process::exit(code),
    };
    let exit_code = match cli.command {
        Commands::Key { source } => run_key(&config, &source),
        Commands::Explain { source, kind } => run_explain(&config, &source, &kind),
        Commands::Cook { stem, kind } => run_cook(&config, &stem, &kind),
        Commands::Mounts { path } => run_mounts(&config, &path),
    };
    std::process::exit(exit_code);
}

fn load_config(path: &Path) -> Result<CacheConfig, i32> {
    let config = match CacheConfig::load(path) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %path.display(), "config load failed: {}", err);
            return Err(EXIT_USAGE);
        }
    };
    let validation = config.validate();
    for warning in &validation.warnings {
        warn!(path = %path.display(), "{}", warning);
    }
    if !validation.is_ok() {
        for problem in &validation.errors {
            error!(path = %path.display(), "{}", problem);
        }
        return Err(EXIT_USAGE);
    }
    Ok(config)
}

fn build_storage(config: &CacheConfig) -> Result<LayeredStorage, i32> {
    config.build_storage().map_err(|err| {
        error!("mount failed: {}", err);
        EXIT_STORAGE
    })
}

fn build_manager(config: &CacheConfig) -> Result<AssetCacheManager, i32> {
    let storage: Arc<dyn Storage> = Arc::new(build_storage(config)?);
    let mut registry = ConverterRegistry::new();
    for kind in &config.kinds {
        if let Err(err) = registry.register(kind.clone(), Arc::new(CopyConverter)) {
            error!(kind = %kind.name, "{}", err);
            return Err(EXIT_USAGE);
        }
    }
    AssetCacheManager::new(storage, config, registry).map_err(|err| {
        error!("manager setup failed: {}", err);
        exit_code_for(&err)
    })
}

fn run_key(config: &CacheConfig, source: &str) -> i32 {
    let mut manager = match build_manager(config) {
        Ok(manager) => manager,
        Err(code) => return code,
    };
    let matching: Vec<(String, String)> = config
        .kinds
        .iter()
        .filter_map(|kind| {
            strip_extension(source, &kind.source_extension)
                .map(|stem| (kind.name.clone(), stem.to_string()))
        })
        .collect();
    if matching.is_empty() {
        error!(source, "no asset kind converts this source");
        return EXIT_USAGE;
    }
    for (kind, stem) in matching {
        match manager.key_for(&stem, &kind) {
            Ok(key) => println!("{} {} {}", kind, source, key),
            Err(err) => {
                error!(%kind, source, "key failed: {}", err);
                return exit_code_for(&err);
            }
        }
    }
    EXIT_SUCCESS
}

fn run_explain(config: &CacheConfig, source: &str, kind: &str) -> i32 {
    let Some(asset_kind) = config.kind(kind) else {
        error!(kind, "unknown asset kind");
        return EXIT_USAGE;
    };
    let stem = strip_extension(source, &asset_kind.source_extension).unwrap_or(source);
    let mut manager = match build_manager(config) {
        Ok(manager) => manager,
        Err(code) => return code,
    };
    match manager.explain(stem, kind) {
        Ok(report) => {
            println!("{}", report.describe());
            if report.location.is_some() {
                EXIT_SUCCESS
            } else {
                EXIT_NOT_FOUND
            }
        }
        Err(err) => {
            error!(kind, source, "explain failed: {}", err);
            exit_code_for(&err)
        }
    }
}

fn run_cook(config: &CacheConfig, stem: &str, kind: &str) -> i32 {
    let mut manager = match build_manager(config) {
        Ok(manager) => manager,
        Err(code) => return code,
    };
    let result = manager.get_loadable_path(stem, kind);
    manager.shutdown();
    match result {
        Ok(loadable) => {
            println!("{}", describe_loadable(&loadable));
            EXIT_SUCCESS
        }
        Err(err) => {
            error!(kind, stem, "cook failed: {}", err);
            exit_code_for(&err)
        }
    }
}

fn run_mounts(config: &CacheConfig, path: &str) -> i32 {
    let storage = match build_storage(config) {
        Ok(storage) => storage,
        Err(code) => return code,
    };
    let candidates = match storage.explain_mounts(path) {
        Ok(candidates) => candidates,
        Err(err) => {
            error!(path, "mount lookup failed: {}", err);
            return EXIT_USAGE;
        }
    };
    if candidates.is_empty() {
        println!("no mount covers {}", path);
        return EXIT_NOT_FOUND;
    }
    for candidate in &candidates {
        let hit = if candidate.exists { " [hit]" } else { "" };
        println!(
            "{}: {} {} at '{}' (priority {}){}",
            candidate.order,
            candidate.kind,
            candidate.source.display(),
            candidate.mount_point,
            candidate.priority,
            hit
        );
    }
    if candidates.iter().any(|candidate| candidate.exists) {
        EXIT_SUCCESS
    } else {
        EXIT_NOT_FOUND
    }
}

fn describe_loadable(loadable: &Loadable) -> String {
    match loadable {
        Loadable::Archive(path) => format!("archive {}", path),
        Loadable::Loose(path) => format!("loose {}", path),
        Loadable::Converted { path, bytes } => format!("converted {} ({} bytes)", path, bytes.len()),
        Loadable::Unpersisted { path, bytes, error } => {
            format!("unpersisted {} ({} bytes): {}", path, bytes.len(), error)
        }
        Loadable::Uncached {
            path,
            conversion_error: Some(err),
        } => format!("uncached {} (conversion failed: {})", path, err),
        Loadable::Uncached {
            path,
            conversion_error: None,
        } => format!("uncached {}", path),
    }
}

fn exit_code_for(err: &CacheError) -> i32 {
    match err {
        CacheError::NoSource { .. } | CacheError::NoSourceNoCache { .. } => EXIT_NOT_FOUND,
        CacheError::ConversionFailed { .. } | CacheError::EmptyOutput { .. } => EXIT_CONVERSION,
        CacheError::UnknownKind(_) | CacheError::Config(_) => EXIT_USAGE,
        CacheError::SourceUnavailable { .. }
        | CacheError::CacheWriteFailed { .. }
        | CacheError::WorkerSpawn { .. } => EXIT_STORAGE,
    }
}

fn strip_extension<'a>(path: &'a str, extension: &str) -> Option<&'a str> {
    let (stem, ext) = path.rsplit_once('.')?;
    if !stem.is_empty() && ext.eq_ignore_ascii_case(extension) {
        Some(stem)
    } else {
        None
    }
}
