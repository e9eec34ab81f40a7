//! Build script for rig asset validation
//!
//! This script runs at compile time and validates all rig JSON files so that
//! skeleton order, IK chain links and blend grids are consistent before any
//! of them is loaded at runtime.

// Include the shared rig limits
#[path = "src/asset_limits.rs"]
mod asset_limits;

use asset_limits::{IK_CHAIN_LINKS, MAX_BLEND_AXES, MAX_BONES, MAX_IK_CHAINS, MAX_IK_TARGETS};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Bone entry from JSON, only the fields the build script checks
#[derive(Debug, Deserialize)]
struct Bone {
    name: String,
    #[serde(default)]
    parent: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct IkChain {
    name: String,
    links: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct Skeleton {
    bones: Vec<Bone>,
    #[serde(default)]
    ik_chains: Vec<IkChain>,
}

#[derive(Debug, Deserialize)]
struct BlendAxis {
    size: usize,
}

#[derive(Debug, Deserialize)]
struct BlendGrid {
    #[serde(default)]
    axes: Vec<BlendAxis>,
    clips: Vec<usize>,
}

#[derive(Debug, Deserialize)]
struct Sequence {
    name: String,
    grid: BlendGrid,
}

#[derive(Debug, Deserialize)]
struct RuleSlot {
    #[serde(default)]
    slot: Option<usize>,
    chain: usize,
}

#[derive(Debug, Deserialize)]
struct Clip {
    name: String,
    frame_count: u32,
    #[serde(default)]
    ik_rules: Vec<RuleSlot>,
}

#[derive(Debug, Deserialize)]
struct RigFile {
    name: String,
    skeleton: Skeleton,
    #[serde(default)]
    clips: Vec<Clip>,
    #[serde(default)]
    sequences: Vec<Sequence>,
}

/// Validate the skeleton hierarchy and chain table
fn validate_skeleton(skeleton: &Skeleton) -> Vec<String> {
    let mut errors = Vec::new();

    if skeleton.bones.is_empty() {
        errors.push("  skeleton has no bones".to_string());
    }
    if skeleton.bones.len() > MAX_BONES {
        errors.push(format!(
            "  {} bones exceeds the limit of {}",
            skeleton.bones.len(),
            MAX_BONES
        ));
    }

    for (i, bone) in skeleton.bones.iter().enumerate() {
        if let Some(parent) = bone.parent {
            if parent >= i {
                errors.push(format!(
                    "  bone '{}' ({}) lists parent {} which does not precede it",
                    bone.name, i, parent
                ));
            }
        }
    }

    if skeleton.ik_chains.len() > MAX_IK_CHAINS {
        errors.push(format!(
            "  {} IK chains exceeds the limit of {}",
            skeleton.ik_chains.len(),
            MAX_IK_CHAINS
        ));
    }

    for chain in &skeleton.ik_chains {
        if chain.links.len() != IK_CHAIN_LINKS {
            errors.push(format!(
                "  chain '{}' has {} links, expected {}",
                chain.name,
                chain.links.len(),
                IK_CHAIN_LINKS
            ));
        }
        for &link in &chain.links {
            if link >= skeleton.bones.len() {
                errors.push(format!(
                    "  chain '{}' references bone {} outside the skeleton",
                    chain.name, link
                ));
            }
        }
    }

    errors
}

/// Validate clips and sequences against the skeleton
fn validate_animation(rig: &RigFile) -> Vec<String> {
    let mut errors = Vec::new();

    for clip in &rig.clips {
        if clip.frame_count == 0 {
            errors.push(format!("  clip '{}' has zero frames", clip.name));
        }
        for rule in &clip.ik_rules {
            if rule.chain >= rig.skeleton.ik_chains.len() {
                errors.push(format!(
                    "  clip '{}' rule references chain {} outside the skeleton",
                    clip.name, rule.chain
                ));
            }
            if rule.slot.is_some_and(|slot| slot >= MAX_IK_TARGETS) {
                errors.push(format!(
                    "  clip '{}' rule uses target slot {:?} (max {})",
                    clip.name,
                    rule.slot,
                    MAX_IK_TARGETS - 1
                ));
            }
        }
    }

    for seq in &rig.sequences {
        if seq.grid.axes.len() > MAX_BLEND_AXES {
            errors.push(format!(
                "  sequence '{}' has {} blend axes (max {})",
                seq.name,
                seq.grid.axes.len(),
                MAX_BLEND_AXES
            ));
        }
        let cells: usize = seq.grid.axes.iter().map(|axis| axis.size.max(1)).product();
        if cells != seq.grid.clips.len() {
            errors.push(format!(
                "  sequence '{}' grid expects {} clips, found {}",
                seq.name,
                cells,
                seq.grid.clips.len()
            ));
        }
        for &clip in &seq.grid.clips {
            if clip >= rig.clips.len() {
                errors.push(format!(
                    "  sequence '{}' references unknown clip {}",
                    seq.name, clip
                ));
            }
        }
    }

    errors
}

/// Validate a rig file
fn validate_rig_file(path: &Path) -> Result<(), String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    let rig: RigFile = serde_json::from_str(&contents)
        .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

    let mut all_errors = validate_skeleton(&rig.skeleton);
    all_errors.extend(validate_animation(&rig));

    if all_errors.is_empty() {
        println!(
            "cargo:warning=✓ {} validated ({} bones, {} sequences)",
            rig.name,
            rig.skeleton.bones.len(),
            rig.sequences.len()
        );
        Ok(())
    } else {
        Err(format!(
            "Rig '{}' is invalid:\n{}",
            rig.name,
            all_errors.join("\n")
        ))
    }
}

fn main() {
    let rig_dir = Path::new("assets/rigs");

    if !rig_dir.exists() {
        println!("cargo:warning=Rig directory not found, skipping validation");
        return;
    }

    // Rerun if shared limits change
    println!("cargo:rerun-if-changed=src/asset_limits.rs");

    let mut has_errors = false;

    if let Ok(entries) = fs::read_dir(rig_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                println!("cargo:rerun-if-changed={}", path.display());

                if let Err(e) = validate_rig_file(&path) {
                    println!("cargo:warning=VALIDATION ERROR: {}", e);
                    has_errors = true;
                }
            }
        }
    }

    if has_errors {
        panic!("Rig validation failed! Fix the rig JSON files.");
    }

    println!("cargo:rerun-if-changed={}", rig_dir.display());
}
