//! GLB Bridge CLI
//!
//! Export scene bundles to GLB and serve the result to a previewer.

use clap::{Parser, Subcommand};
use glb_bridge::delivery::server::{serve, ServerState};
use glb_bridge::stages::validate::gather_materials;
use glb_bridge::stages::{MaterialValidator, NodeGraphValidator};
use glb_bridge::{load_scene, DeliveryChannel, ExportOptions, Exporter, Host, HttpUploader, ModelStore, SharedState};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "glb-bridge")]
#[command(author, version, about = "Export scene selections to GLB without touching the source scene", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export the selection of a scene bundle
    Export {
        /// Scene bundle (ZIP or directory containing scene.json)
        #[arg(short, long)]
        scene: PathBuf,

        /// Objects to export; defaults to the selection stored in the bundle
        #[arg(long, num_args = 1..)]
        select: Vec<String>,

        /// Export options JSON file
        #[arg(long)]
        options: Option<PathBuf>,

        /// Output file path; defaults to the payload filename
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Push the payload to a running preview server (e.g. http://localhost:8080)
        #[arg(long)]
        upload: Option<String>,
    },

    /// Run the preview server
    Serve {
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },

    /// Show material readiness for a scene's selection
    Analyze {
        /// Scene bundle (ZIP or directory containing scene.json)
        #[arg(short, long)]
        scene: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info,glb_bridge=debug".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Export {
            scene,
            select,
            options,
            output,
            upload,
        } => {
            export_scene(&scene, &select, options.as_ref(), output, upload)?;
        }
        Commands::Serve { port } => {
            let runtime = tokio::runtime::Runtime::new()?;
            let state = ServerState::new(ModelStore::new(), SharedState::new());
            runtime.block_on(serve(SocketAddr::from(([127, 0, 0, 1], port)), state))?;
        }
        Commands::Analyze { scene } => {
            analyze_scene(&scene)?;
        }
    }

    Ok(())
}

fn export_scene(
    scene_path: &PathBuf,
    select: &[String],
    options_path: Option<&PathBuf>,
    output: Option<PathBuf>,
    upload: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading scene from {:?}...", scene_path);
    let mut scene = load_scene(scene_path)?;
    println!(
        "  Found {} objects, {} meshes, {} materials",
        scene.objects.len(),
        scene.meshes.len(),
        scene.materials.len()
    );

    if !select.is_empty() {
        let names: Vec<&str> = select.iter().map(String::as_str).collect();
        scene.select(&names);
    }
    println!("  Selected {} objects", scene.selection.len());

    let options = match options_path {
        Some(path) => ExportOptions::from_path(path)?,
        None => ExportOptions::default(),
    };

    let mut host = Host::new(scene);
    let store = ModelStore::new();
    let uploader = upload.map(|endpoint| {
        Arc::new(HttpUploader::new(
            endpoint,
            Arc::clone(&store),
            host.main_loop.handle(),
            Arc::clone(&host.state),
        ))
    });
    let delivery: Arc<dyn DeliveryChannel> = match &uploader {
        Some(uploader) => uploader.clone(),
        None => store.clone(),
    };

    let exporter = Exporter::new(delivery);
    let outcome = exporter.run(&mut host, &options)?;

    let path = output.unwrap_or_else(|| PathBuf::from(&outcome.metadata.filename));
    fs::write(&path, &outcome.payload)?;
    println!("{}", outcome.message);
    println!("  Written to {:?}", path);
    for warning in outcome.report.warnings() {
        println!("  ! {}", warning);
    }

    if let Some(uploader) = &uploader {
        uploader.flush();
    }
    host.run_until_idle();
    if let Some(delivery) = host.state.snapshot().delivery {
        println!("  {}", delivery);
    }

    Ok(())
}

fn analyze_scene(scene_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading scene from {:?}...", scene_path);
    let scene = load_scene(scene_path)?;
    let selection = scene.selected();
    let names = gather_materials(&scene, &selection);

    println!("\nMaterial readiness ({} materials):", names.len());
    let validator = NodeGraphValidator;
    for name in &names {
        let Some(material) = scene.material(name) else {
            println!("  {:<32} missing", name);
            continue;
        };
        let readiness = validator.analyze(material);
        println!("  {:<32} {}", name, if readiness.is_ready { "ready" } else { "NOT READY" });
        for line in readiness.issues.iter().chain(readiness.warnings.iter()) {
            println!("      {}", line);
        }
    }

    Ok(())
}
