use skiff_core::config::{load_client, save_client};
use skiff_core::error::Result;

pub fn run(server_url: &str, token: Option<&str>) -> Result<()> {
    let mut cfg = load_client()?;
    cfg.server_url = server_url.trim_end_matches('/').to_string();
    if let Some(token) = token {
        cfg.token = Some(token.to_string());
    }
    save_client(&cfg)?;

    if cfg.token.is_some() {
        println!("Logged in to {} with authentication token", cfg.server_url);
    } else {
        println!(
            "Logged in to {} (download-only, no token provided)",
            cfg.server_url
        );
    }
    Ok(())
}
