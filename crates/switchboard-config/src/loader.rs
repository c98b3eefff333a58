// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};

use crate::Config;

/// Load configuration from an explicit YAML file.
///
/// A missing file is not an error: a commented template is generated at
/// `path` and the default config returned, so a first run leaves behind a
/// file the operator can edit.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.is_file() {
        info!(path = %path.display(), "config file not found, writing template");
        write_template(path)?;
        return Ok(Config::default());
    }

    debug!(path = %path.display(), "loading config");
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: Config =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    if let Err(problems) = config.validate() {
        anyhow::bail!("invalid config {}:\n  {}", path.display(), problems.join("\n  "));
    }
    Ok(config)
}

/// Save the config, keeping the previous version as `<path>.backup`.
///
/// Write order matters: the backup is created from the current file first,
/// then the new content is written via a temp file + rename so a crash
/// mid-save never leaves a truncated config behind.
pub fn save(config: &Config, path: &Path) -> anyhow::Result<()> {
    let text = serde_yaml::to_string(config).context("serializing config")?;

    if path.is_file() {
        let backup = backup_path(path);
        std::fs::copy(path, &backup)
            .with_context(|| format!("writing backup {}", backup.display()))?;
    }

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
    }

    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, &text).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

fn backup_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".backup");
    std::path::PathBuf::from(os)
}

fn write_template(path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
    }
    std::fs::write(path, TEMPLATE).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Commented starter config written on first run.
const TEMPLATE: &str = r#"# switchboard configuration
#
# The proxy accepts Anthropic, OpenAI chat/responses, and Gemini requests
# and routes each to the best healthy endpoint below.  Learned capability
# fields (learned:) are written back into this file automatically.

server:
  bind: "0.0.0.0:8080"

persistence:
  flush_interval_secs: 30
  max_dirty_time_secs: 300

# retry:
#   upstream_errors:
#     - pattern: "503"
#       action: switch_endpoint
#     - pattern: "overloaded"
#       action: retry_endpoint
#       max_retries: 2
#       case_insensitive: true

# tagging:
#   pipeline_timeout_secs: 5
#   taggers:
#     - name: thinking-requests
#       tag: thinking
#       kind: thinking

endpoints: []
# endpoints:
#   - name: anthropic-main
#     url_anthropic: https://api.anthropic.com
#     auth:
#       type: api_key
#       value: sk-ant-...
#     priority: 1
#   - name: openai-fallback
#     url_openai: https://api.openai.com
#     auth:
#       type: auth_token
#       value: sk-...
#     priority: 2
"#;

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_template_and_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let cfg = load(&path).unwrap();
        assert!(cfg.endpoints.is_empty());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("switchboard configuration"));
        // The template itself must load cleanly on the next start.
        let again = load(&path).unwrap();
        assert!(again.endpoints.is_empty());
    }

    #[test]
    fn save_creates_backup_of_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut cfg = Config::default();
        cfg.server.bind = "127.0.0.1:1111".into();
        save(&cfg, &path).unwrap();

        cfg.server.bind = "127.0.0.1:2222".into();
        save(&cfg, &path).unwrap();

        let backup = std::fs::read_to_string(dir.path().join("config.yaml.backup")).unwrap();
        let prev: Config = serde_yaml::from_str(&backup).unwrap();
        assert_eq!(prev.server.bind, "127.0.0.1:1111");

        let live: Config = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(live.server.bind, "127.0.0.1:2222");
    }

    #[test]
    fn invalid_config_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "endpoints:\n  - name: no-urls\n").unwrap();
        let err = load(&path).unwrap_err().to_string();
        assert!(err.contains("no non-empty URL"), "{err}");
    }

    #[test]
    fn round_trip_preserves_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut cfg = Config::default();
        cfg.endpoints.push(
            serde_yaml::from_str("name: e1\nurl_openai: https://api.example.com\npriority: 7\n")
                .unwrap(),
        );
        save(&cfg, &path).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.endpoints.len(), 1);
        assert_eq!(loaded.endpoints[0].name, "e1");
        assert_eq!(loaded.endpoints[0].priority, 7);
    }
}
