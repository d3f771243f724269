use std::error::Error;
use std::path::Path;

use grelay_common::GlobalConfigPatch;

pub(crate) fn load_config_file(
    path: &Path,
) -> Result<GlobalConfigPatch, Box<dyn Error + Send + Sync>> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("read config file {}: {err}", path.display()))?;
    parse_config(&text).map_err(|err| format!("parse config file {}: {err}", path.display()).into())
}

fn parse_config(text: &str) -> Result<GlobalConfigPatch, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_leaves_other_fields_unset() {
        let patch = parse_config(
            r#"{
                "upstream_base_url": "https://generativelanguage.googleapis.com/",
                "recovery": {"max_retries": 3, "give_up_on_content_issue": true}
            }"#,
        )
        .unwrap();
        assert!(patch.host.is_none());
        let recovery = patch.recovery.clone().unwrap();
        assert_eq!(recovery.max_retries, 3);
        assert!(recovery.give_up_on_content_issue);
        assert_eq!(recovery.base_delay_ms, 750);

        let config = patch.into_config().unwrap();
        assert_eq!(
            config.upstream_base_url,
            "https://generativelanguage.googleapis.com"
        );
    }

    #[test]
    fn mistyped_field_is_an_error() {
        assert!(parse_config(r#"{"port": "not a number"}"#).is_err());
    }
}
