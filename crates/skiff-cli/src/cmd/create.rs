use std::path::Path;

use tracing::warn;

use skiff_core::backup::Creator;
use skiff_core::cancel::CancelFlag;
use skiff_core::error::{Result, SkiffError};

use crate::format::format_bytes;

use super::{connect, parse_tags};

pub fn run(
    tag_args: &[String],
    concurrency: usize,
    excludes: &[String],
    path: &str,
    cancel: &CancelFlag,
) -> Result<()> {
    let tags = parse_tags(tag_args)?;
    if tags.get("name").is_none_or(|v| v.is_empty()) {
        return Err(SkiffError::Config(
            "the 'name' tag is required: use --tag name=<backup-name>".into(),
        ));
    }

    let (client, _cfg) = connect()?;

    println!("Creating backup: {}", tags["name"]);
    println!("Path: {path}");

    // The previous manifest with the same tags drives the incremental skip.
    let prev = match client.get_latest_manifest(&tags) {
        Ok(Some(m)) => {
            println!("Found previous backup: {} (incremental)", m.id);
            Some(m)
        }
        Ok(None) => {
            println!("No previous backup found, creating full backup");
            None
        }
        Err(e) => {
            warn!("could not fetch previous manifest: {e}");
            None
        }
    };
    println!();

    let outcome = Creator::new(&client)
        .with_concurrency(concurrency)
        .with_excludes(excludes)
        .create(Path::new(path), tags, prev.as_ref(), cancel)?;

    client.upload_manifest(&outcome.manifest)?;

    let stats = &outcome.stats;
    println!();
    println!("=== Backup complete ===");
    println!("Manifest ID: {}", outcome.manifest.id);
    println!("Duration: {}s", stats.elapsed.as_secs());
    println!("Files: {} total", stats.total_files);
    if stats.skipped_files > 0 {
        println!("  - {} unchanged (reused from previous backup)", stats.skipped_files);
    }
    if stats.error_files > 0 {
        println!("  - {} skipped (permission denied or unreadable)", stats.error_files);
    }
    println!(
        "Data: {} uploaded, {} deduplicated",
        format_bytes(stats.uploaded_bytes),
        format_bytes(stats.skipped_bytes),
    );
    println!(
        "Blocks: {} uploaded, {} already existed",
        stats.blocks_uploaded, stats.blocks_existing,
    );
    Ok(())
}
