use std::path::Path;

use skiff_core::cancel::CancelFlag;
use skiff_core::error::{Result, SkiffError};
use skiff_core::restore::Restorer;

use crate::format::format_bytes;

use super::{connect, parse_tags};

pub fn run(
    id: Option<&str>,
    tag_args: &[String],
    concurrency: usize,
    output: &str,
    cancel: &CancelFlag,
) -> Result<()> {
    if id.is_none() && tag_args.is_empty() {
        return Err(SkiffError::Config(
            "must specify either --id or --tag".into(),
        ));
    }

    let (client, _cfg) = connect()?;

    let manifest = match id {
        Some(id) => {
            println!("Fetching backup {id}...");
            client.get_manifest(id)?
        }
        None => {
            let tags = parse_tags(tag_args)?;
            println!("Fetching latest backup matching tags...");
            client
                .get_latest_manifest(&tags)?
                .ok_or_else(|| SkiffError::NotFound("matching backup".into()))?
        }
    };

    println!(
        "Restoring {} ({} entries) to {output}",
        manifest.id,
        manifest.entries.len()
    );

    let stats = Restorer::new(&client)
        .with_concurrency(concurrency)
        .restore(&manifest, Path::new(output), cancel)?;

    println!(
        "Restored {} files, {} dirs, {} symlinks ({})",
        stats.files,
        stats.dirs,
        stats.symlinks,
        format_bytes(stats.bytes_written),
    );
    Ok(())
}
