mod file_store;

use anyhow::Context;
use clap::{Parser, Subcommand};
use file_store::{FileKvStore, FileRegion};
use nvpref_common::{BackendKind, PreferencesConfig, RestoreMode};
use nvpref_globals::RestoringGlobal;
use nvpref_persist::{MemoryKvStore, MemoryRegion, Preferences};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nvpref-cli", about = "Host simulator for nvpref preference storage")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the simulated device storage
    #[arg(short, long, default_value = "nvpref-state")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print configuration and allocation summary
    Info,
    /// Run the save/load/corruption walkthrough against in-memory storage
    Demo,
    /// Print a global's restored value
    Get {
        /// Global id as declared in the configuration
        id: String,
    },
    /// Set a global and persist it
    Set {
        id: String,
        value: u32,
        /// Simulate a firmware update in progress
        #[arg(long)]
        guard: bool,
    },
    /// List the raw contents of the simulated storage
    Dump,
}

/// CLI configuration: store settings plus the declared globals.
///
/// Globals are allocated in declaration order, so the order must stay stable
/// across runs for stored values to be found again.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct CliConfig {
    preferences: PreferencesConfig,
    globals: Vec<String>,
    restore_mode: RestoreMode,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            preferences: PreferencesConfig::default(),
            globals: vec!["boot_count".into()],
            restore_mode: RestoreMode::DefaultBackend,
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<CliConfig> {
    let config = match path {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("opening config {}", path.display()))?;
            serde_json::from_reader(file)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => CliConfig::default(),
    };
    config.preferences.validate()?;
    Ok(config)
}

fn open_preferences(config: &CliConfig, state_dir: &Path) -> anyhow::Result<Preferences> {
    let prefs_config = &config.preferences;
    let prefs = match prefs_config.backend {
        BackendKind::KeyValue => {
            Preferences::key_value(FileKvStore::new(state_dir.join("kv.json")), prefs_config)
        }
        BackendKind::RawMemory => {
            // RTC memory does not survive the process; flash does.
            let rtc = MemoryRegion::new(prefs_config.rtc_words);
            let flash = FileRegion::open(state_dir.join("flash.json"), prefs_config.flash_words)?;
            Preferences::raw_memory(rtc, flash, prefs_config)
        }
    };
    prefs.begin().context("attaching preference storage")?;
    Ok(prefs)
}

/// Open storage and install it as the process-wide manager.
fn install_preferences(
    config: &CliConfig,
    state_dir: &Path,
) -> anyhow::Result<&'static Preferences> {
    let prefs = open_preferences(config, state_dir)?;
    Ok(nvpref_persist::global::install(prefs)?)
}

fn setup_globals(config: &CliConfig, prefs: &Preferences) -> Vec<RestoringGlobal<u32>> {
    config
        .globals
        .iter()
        .map(|id| {
            let mut global =
                RestoringGlobal::new(id.as_str(), 0u32).with_restore_mode(config.restore_mode);
            global.setup(prefs);
            global
        })
        .collect()
}

fn find_global<'a>(
    globals: &'a mut [RestoringGlobal<u32>],
    id: &str,
) -> anyhow::Result<&'a mut RestoringGlobal<u32>> {
    globals
        .iter_mut()
        .find(|g| g.id() == id)
        .with_context(|| format!("global {id} is not declared in the configuration"))
}

fn run_demo() -> anyhow::Result<()> {
    let store = MemoryKvStore::new();
    let prefs = Preferences::key_value(store.clone(), &PreferencesConfig::default());
    prefs.begin()?;

    let mut pref = prefs.allocate_typed::<u32>(1u32);
    let mut value = 0u32;
    println!("allocated: {:?}", pref.range());
    println!("load on empty store: {}", pref.load(&mut value));
    println!("save 42: {}", pref.save(&42u32));
    let loaded = pref.load(&mut value);
    println!("load: {loaded} (value={value})");

    let key = pref.offset().context("allocation failed")?.to_string();
    if let Some(mut blob) = store.blob(&key) {
        blob[0] ^= 0xff;
        store.put_blob(&key, blob);
    }
    println!("load after corrupting one byte: {}", pref.load(&mut value));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            let config = load_config(cli.config.as_deref())?;
            let prefs = install_preferences(&config, &cli.state_dir)?;
            let globals = setup_globals(&config, prefs);
            let stats = prefs.stats()?;

            println!("nvpref-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("backend: {:?}", config.preferences.backend);
            println!("restore mode: {}", config.restore_mode);
            println!("default durable: {}", prefs.default_durable());
            println!(
                "fast tier: {}/{:?} words, durable tier: {}/{:?} words, slots: {}",
                stats.fast_used,
                stats.fast_capacity,
                stats.durable_used,
                stats.durable_capacity,
                stats.slots
            );
            for global in &globals {
                println!("  {} (tag {}) = {}", global.id(), global.type_tag(), global.value());
            }
        }
        Commands::Demo => run_demo()?,
        Commands::Get { id } => {
            let config = load_config(cli.config.as_deref())?;
            let prefs = install_preferences(&config, &cli.state_dir)?;
            let mut globals = setup_globals(&config, prefs);
            let global = find_global(&mut globals, &id)?;
            println!("{} = {}", global.id(), global.value());
        }
        Commands::Set { id, value, guard } => {
            let config = load_config(cli.config.as_deref())?;
            let prefs = install_preferences(&config, &cli.state_dir)?;
            let mut globals = setup_globals(&config, prefs);
            prefs.set_write_guard(guard);

            let global = find_global(&mut globals, &id)?;
            global.set(value);
            if global.is_dirty() && !global.loop_once() {
                anyhow::bail!("write of {id} rejected; try again later");
            }
            println!("{id} = {value}");
        }
        Commands::Dump => {
            let kv = FileKvStore::read_entries(&cli.state_dir.join("kv.json"))?;
            for (key, bytes) in &kv {
                println!("kv[{key}] = {bytes:02x?}");
            }
            let flash_path = cli.state_dir.join("flash.json");
            if flash_path.exists() {
                let config = load_config(cli.config.as_deref())?;
                let flash = FileRegion::open(&flash_path, config.preferences.flash_words)?;
                for (i, word) in flash.words().iter().enumerate() {
                    if *word != u32::MAX {
                        println!("flash[{i}] = {word:#010x}");
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_declares_boot_count() {
        let config = CliConfig::default();
        assert_eq!(config.globals, vec!["boot_count".to_string()]);
        assert!(config.preferences.validate().is_ok());
    }

    #[test]
    fn set_then_get_across_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CliConfig {
            globals: vec!["a".into(), "b".into()],
            ..CliConfig::default()
        };

        {
            let prefs = open_preferences(&config, tmp.path()).unwrap();
            let mut globals = setup_globals(&config, &prefs);
            let b = find_global(&mut globals, "b").unwrap();
            b.set(12);
            assert!(b.loop_once());
        }

        let prefs = open_preferences(&config, tmp.path()).unwrap();
        let mut globals = setup_globals(&config, &prefs);
        assert_eq!(*find_global(&mut globals, "a").unwrap().value(), 0);
        assert_eq!(*find_global(&mut globals, "b").unwrap().value(), 12);
        assert!(find_global(&mut globals, "c").is_err());
    }

    #[test]
    fn config_file_selects_raw_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"preferences":{"backend":"raw_memory"},"restore_mode":"always_from_durable"}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.preferences.backend, BackendKind::RawMemory);
        let prefs = open_preferences(&config, tmp.path()).unwrap();
        let mut globals = setup_globals(&config, &prefs);
        let counter = find_global(&mut globals, "boot_count").unwrap();
        counter.set(2);
        assert!(counter.loop_once());
        assert!(tmp.path().join("flash.json").is_file());
    }
}
