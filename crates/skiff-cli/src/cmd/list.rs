use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::Table;

use skiff_core::error::Result;

use super::{connect, parse_tags};

pub fn run(tag_args: &[String]) -> Result<()> {
    let tags = parse_tags(tag_args)?;
    let (client, _cfg) = connect()?;

    let manifests = client.list_manifests(&tags)?;
    if manifests.is_empty() {
        println!("No backups found");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["ID", "Name", "Created", "Tags"]);

    for info in &manifests {
        let name = info.tags.get("name").cloned().unwrap_or_default();
        let extra: Vec<String> = info
            .tags
            .iter()
            .filter(|(k, _)| k.as_str() != "name")
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        table.add_row(vec![
            info.id.clone(),
            name,
            info.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            extra.join(", "),
        ]);
    }
    println!("{table}");
    Ok(())
}
