//! sdpack CLI
//!
//! Command-line interface for bundling Stream Deck plugins and serving them
//! during development.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdpack_core::{
    bundle, sanitize_filename, LibraryConfig, LibraryType, ManifestStatus, Mode, PackConfig,
    PackageLayout, ResolvedConfig, DEFAULT_CONFIG_FILE, PACKAGE_DIR_SUFFIX,
};
use sdpack_server::run_server;

#[derive(Parser)]
#[command(name = "sdpack")]
#[command(about = "Bundle a JavaScript entry module into a Stream Deck plugin package")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an sdpack.json and the package directory
    Init {
        /// Plugin package id, e.g. com.example.myplugin
        #[arg(long)]
        package_id: Option<String>,

        /// Path to the compiled entry module
        #[arg(short, long)]
        entry: Option<PathBuf>,

        /// Directory to initialize (default: current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Bundle the entry module into the package directory
    Build {
        /// Config file (default: sdpack.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured mode (development, production)
        #[arg(short, long)]
        mode: Option<Mode>,
    },

    /// Build, serve the package directory and rebuild on changes
    Serve {
        /// Config file (default: sdpack.json)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (default: from config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Serve only; do not rebuild when sources change
        #[arg(long)]
        no_watch: bool,
    },

    /// Check the package directory's manifest and bundle
    Check {
        /// Config file (default: sdpack.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sdpack=info".parse()?)
                .add_directive("sdpack_core=info".parse()?)
                .add_directive("sdpack_server=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            package_id,
            entry,
            path,
        } => {
            cmd_init(package_id, entry, path)?;
        }
        Commands::Build { config, mode } => {
            cmd_build(config, mode)?;
        }
        Commands::Serve {
            config,
            port,
            no_watch,
        } => {
            cmd_serve(config, port, !no_watch).await?;
        }
        Commands::Check { config } => {
            cmd_check(config)?;
        }
    }

    Ok(())
}

/// Load and resolve the config file, applying a mode override
fn load_config(path: Option<PathBuf>, mode: Option<Mode>) -> Result<ResolvedConfig> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = PackConfig::load(&path)?;
    if let Some(mode) = mode {
        config.mode = mode;
    }
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    config
        .resolve(base)
        .with_context(|| format!("Invalid configuration in {}", path.display()))
}

/// Initialize a new project
fn cmd_init(package_id: Option<String>, entry: Option<PathBuf>, path: Option<PathBuf>) -> Result<()> {
    let project_dir = match path {
        Some(path) => path,
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let package_id = package_id.unwrap_or_else(|| {
        let name = project_dir
            .file_name()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "plugin".to_string());
        format!("com.example.{}", name)
    });

    let config_path = project_dir.join(DEFAULT_CONFIG_FILE);
    if config_path.exists() {
        anyhow::bail!("{} already exists", config_path.display());
    }

    tracing::info!("Initializing sdpack project: {}", package_id);

    let package_dir = PathBuf::from("./bin").join(format!(
        "{}{}",
        sanitize_filename(&package_id),
        PACKAGE_DIR_SUFFIX
    ));

    let mut config = PackConfig::default();
    if let Some(entry) = entry {
        config.entry = entry;
    }
    config.output.path = package_dir.clone();
    config.output.library = Some(LibraryConfig {
        name: "SDPlugin".to_string(),
        kind: LibraryType::Var,
    });
    config.dev_server.content_base = Some(package_dir.clone());

    std::fs::create_dir_all(project_dir.join(&package_dir))
        .context("Failed to create package directory")?;

    let config_json = serde_json::to_string_pretty(&config)?;
    std::fs::write(&config_path, config_json)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("Initialized sdpack project '{}' at {}", package_id, project_dir.display());
    println!("\nProject structure:");
    println!("  {}          - Bundler configuration", DEFAULT_CONFIG_FILE);
    println!("  {}/ - Plugin package", package_dir.display());
    println!("\nNext steps:");
    println!("  1. Add manifest.json and assets to the package directory");
    println!("  2. Compile your plugin to {}", config.entry.display());
    println!("  3. Run: sdpack build");

    Ok(())
}

/// Build once
fn cmd_build(config: Option<PathBuf>, mode: Option<Mode>) -> Result<()> {
    let config = load_config(config, mode)?;

    println!("Building {}...", config.entry.display());
    let output = bundle(&config).context("Build failed")?;

    println!(
        "Bundled {} modules into {} ({} bytes)",
        output.stats.modules,
        output.artifact.bundle_path.display(),
        output.stats.bundle_bytes
    );
    if let Some(map) = &output.artifact.source_map_path {
        println!("Source map: {}", map.display());
    }

    Ok(())
}

/// Start the development server
async fn cmd_serve(config: Option<PathBuf>, port: Option<u16>, watch: bool) -> Result<()> {
    let mut config = load_config(config, None)?;
    if let Some(port) = port {
        config.dev_server.port = port;
    }

    println!(
        "Serving {} on http://{}:{}{}",
        config.dev_server.root.display(),
        config.dev_server.host,
        config.dev_server.port,
        config.dev_server.public_path
    );
    println!("Stop with Ctrl-C");

    run_server(config, watch).await?;
    Ok(())
}

/// Inspect the package directory
fn cmd_check(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config, None)?;
    let layout = PackageLayout::new(&config.output.dir);
    let report = layout.inspect(&config.output.filename);

    println!("Package: {}", report.root.display());
    match &report.package_id {
        Some(id) => println!("  id:          {}", id),
        None => println!("  id:          (directory does not end in {})", PACKAGE_DIR_SUFFIX),
    }
    match &report.manifest {
        ManifestStatus::Missing => println!("  manifest:    missing"),
        ManifestStatus::Invalid(message) => println!("  manifest:    invalid ({})", message),
        ManifestStatus::Present => println!("  manifest:    ok"),
    }
    if let Some(name) = &report.plugin_name {
        println!("  name:        {}", name);
    }
    for uuid in &report.action_uuids {
        println!("  action:      {}", uuid);
    }
    for path in &report.code_paths {
        println!("  code:        {}", path);
    }
    for path in &report.property_inspectors {
        println!("  inspector:   {}", path);
    }
    println!(
        "  bundle:      {} ({})",
        config.output.filename,
        if report.bundle_present { "present" } else { "not built" }
    );
    if config.source_map {
        println!(
            "  source map:  {}",
            if report.source_map_present { "present" } else { "not built" }
        );
    }
    for missing in &report.missing_files {
        println!("  missing:     {}", missing);
    }

    if !report.is_loadable() {
        if report.manifest != ManifestStatus::Present {
            anyhow::bail!("Package has no usable manifest.json");
        }
        if !report.bundle_present {
            anyhow::bail!("{} has not been built; run `sdpack build`", config.output.filename);
        }
        anyhow::bail!("manifest.json does not load {}", config.output.filename);
    }

    println!("\nPackage looks loadable.");
    Ok(())
}
