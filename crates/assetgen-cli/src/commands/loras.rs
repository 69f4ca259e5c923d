//! Local model listing

use assetgen_core::{Environment, Layout};
use std::path::{Path, PathBuf};

const WEIGHTS_EXTENSION: &str = "safetensors";

pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let env = Environment::from_process();
    let layout = Layout::discover(&env)?;

    println!("Search Paths:");
    println!("  - {}", layout.loras_dir().display());
    println!("  - {}", layout.checkpoints_dir().display());
    println!();

    list("LoRA", &layout.loras_dir());
    println!();
    list("checkpoint", &layout.checkpoints_dir());
    Ok(())
}

fn list(kind: &str, dir: &Path) {
    let found = scan(dir);
    if found.is_empty() {
        println!("No {}s found.", kind);
        return;
    }

    println!("Found {} {}(s):", found.len(), kind);
    for path in found {
        println!("  - {}", path.display());
    }
}

/// Weight files and diffusers-style directories directly under `dir`, sorted
fn scan(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() || p.extension().is_some_and(|ext| ext == WEIGHTS_EXTENSION))
        .collect();
    found.sort();
    found
}
