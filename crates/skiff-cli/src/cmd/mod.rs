pub mod create;
pub mod list;
pub mod login;
pub mod restore;

use std::collections::BTreeMap;

use skiff_core::client::ApiClient;
use skiff_core::config::{load_client, ClientConfig};
use skiff_core::error::{Result, SkiffError};

/// Parse repeated `--tag key=value` arguments.
pub fn parse_tags(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            SkiffError::Config(format!("invalid tag format: {pair} (expected key=value)"))
        })?;
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

/// Build an API client from the saved login.
pub fn connect() -> Result<(ApiClient, ClientConfig)> {
    let cfg = load_client()?;
    if cfg.server_url.is_empty() {
        return Err(SkiffError::Config(
            "no server configured; run `skiff login <server-url>` first".into(),
        ));
    }
    let client = ApiClient::new(&cfg.server_url, cfg.token.as_deref());
    Ok((client, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tags_accepts_key_value_pairs() {
        let tags = parse_tags(&["name=app".into(), "env=prod".into()]).unwrap();
        assert_eq!(tags.get("name").map(String::as_str), Some("app"));
        assert_eq!(tags.get("env").map(String::as_str), Some("prod"));
    }

    #[test]
    fn parse_tags_allows_equals_in_value() {
        let tags = parse_tags(&["note=a=b".into()]).unwrap();
        assert_eq!(tags.get("note").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn parse_tags_rejects_bare_words() {
        assert!(parse_tags(&["nokey".into()]).is_err());
    }
}
