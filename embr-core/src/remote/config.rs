//! Remote configuration
//!
//! `.embr/config` holds `[remote "name"]` sections; tokens live in
//! `.embr/config.local` (mode 0600) so the main file can be shared. Sections
//! and keys this module does not know are kept when either file is rewritten.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{EmbrError, Result};
use crate::paths::{RemoteUrl, RepoLayout};
use crate::refs::atomic_write;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FORMAT: &str = "parquet";

/// One configured remote
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub name: String,
    pub url: String,
    pub token: Option<String>,
    /// Per-request timeout, seconds
    pub timeout: u64,
    pub verify_ssl: bool,
    /// Transformer name
    pub format: String,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("verify_ssl", &self.verify_ssl)
            .field("format", &self.format)
            .finish()
    }
}

impl RemoteConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            token: None,
            timeout: DEFAULT_TIMEOUT_SECS,
            verify_ssl: true,
            format: DEFAULT_FORMAT.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────
// INI files
// ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct IniSection {
    /// Text between the brackets, e.g. `remote "origin"`
    header: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct IniFile {
    sections: Vec<IniSection>,
}

impl IniFile {
    fn parse(text: &str) -> Self {
        let mut file = IniFile::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                file.sections.push(IniSection {
                    header: header.trim().to_string(),
                    entries: Vec::new(),
                });
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if let Some(section) = file.sections.last_mut() {
                section.entries.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        file
    }

    fn read(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn to_text(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("[{}]\n", section.header));
            for (k, v) in &section.entries {
                out.push_str(&format!("\t{} = {}\n", k, v));
            }
        }
        out
    }

    fn section(&self, header: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.header == header)
    }

    fn section_mut(&mut self, header: &str) -> &mut IniSection {
        let idx = match self.sections.iter().position(|s| s.header == header) {
            Some(idx) => idx,
            None => {
                self.sections.push(IniSection {
                    header: header.to_string(),
                    entries: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }

    fn remove_section(&mut self, header: &str) -> bool {
        let before = self.sections.len();
        self.sections.retain(|s| s.header != header);
        self.sections.len() != before
    }
}

fn remote_header(name: &str) -> String {
    format!("remote \"{}\"", name)
}

fn remote_name(header: &str) -> Option<&str> {
    header
        .strip_prefix("remote")?
        .trim()
        .strip_prefix('"')?
        .strip_suffix('"')
}

fn parse_bool(value: &str) -> bool {
    !matches!(value.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}

/// Options for [`Remotes::add`]; unset fields take the defaults
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    pub token: Option<String>,
    pub timeout: Option<u64>,
    pub verify_ssl: Option<bool>,
    pub format: Option<String>,
}

/// Remote registry backed by `config` and `config.local`
#[derive(Debug, Clone)]
pub struct Remotes {
    config: PathBuf,
    local: PathBuf,
}

impl Remotes {
    pub fn new(layout: &RepoLayout) -> Self {
        Self {
            config: layout.config(),
            local: layout.config_local(),
        }
    }

    fn missing(name: &str) -> EmbrError {
        EmbrError::NotFound(format!(
            "remote '{}'. Add it with: embr remote add {} <url>",
            name, name
        ))
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains(['"', '[', ']', '\n']) || name.chars().any(char::is_whitespace) {
            return Err(EmbrError::invalid(format!("invalid remote name '{}'", name)));
        }
        Ok(())
    }

    fn write_local(&self, local: &IniFile) -> Result<()> {
        atomic_write(&self.local, local.to_text().as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.local, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn add(&self, name: &str, url: &str, options: RemoteOptions) -> Result<RemoteConfig> {
        Self::validate_name(name)?;
        RemoteUrl::parse(url)?;
        let header = remote_header(name);
        let mut config = IniFile::read(&self.config)?;
        if config.section(&header).is_some() {
            return Err(EmbrError::AlreadyExists(format!("remote '{}'", name)));
        }

        let remote = RemoteConfig {
            name: name.to_string(),
            url: url.to_string(),
            token: options.token.clone(),
            timeout: options.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            verify_ssl: options.verify_ssl.unwrap_or(true),
            format: options.format.unwrap_or_else(|| DEFAULT_FORMAT.to_string()),
        };
        let section = config.section_mut(&header);
        section.set("url", remote.url.as_str());
        section.set("timeout", remote.timeout.to_string());
        section.set("verify_ssl", remote.verify_ssl.to_string());
        section.set("format", remote.format.as_str());
        atomic_write(&self.config, config.to_text().as_bytes())?;

        if let Some(token) = &options.token {
            self.set_token(name, token)?;
        }
        info!("added remote '{}' ({})", name, url);
        Ok(remote)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let header = remote_header(name);
        let mut config = IniFile::read(&self.config)?;
        if !config.remove_section(&header) {
            return Err(Self::missing(name));
        }
        atomic_write(&self.config, config.to_text().as_bytes())?;

        let mut local = IniFile::read(&self.local)?;
        if local.remove_section(&header) {
            self.write_local(&local)?;
        }
        info!("removed remote '{}'", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<RemoteConfig> {
        let header = remote_header(name);
        let config = IniFile::read(&self.config)?;
        let section = config.section(&header).ok_or_else(|| Self::missing(name))?;
        let url = section
            .get("url")
            .ok_or_else(|| EmbrError::InvalidFormat(format!("remote '{}' has no url", name)))?;

        let mut remote = RemoteConfig::new(name, url);
        if let Some(timeout) = section.get("timeout") {
            remote.timeout = timeout
                .parse()
                .map_err(|_| EmbrError::InvalidFormat(format!("remote '{}' timeout '{}'", name, timeout)))?;
        }
        if let Some(verify) = section.get("verify_ssl") {
            remote.verify_ssl = parse_bool(verify);
        }
        if let Some(format) = section.get("format") {
            remote.format = format.to_string();
        }
        let local = IniFile::read(&self.local)?;
        remote.token = local
            .section(&header)
            .and_then(|s| s.get("token"))
            .map(str::to_string);
        Ok(remote)
    }

    /// All remotes in file order
    pub fn list(&self) -> Result<Vec<RemoteConfig>> {
        let config = IniFile::read(&self.config)?;
        config
            .sections
            .iter()
            .filter_map(|s| remote_name(&s.header))
            .map(|name| self.get(name))
            .collect()
    }

    pub fn set_token(&self, name: &str, token: &str) -> Result<()> {
        let header = remote_header(name);
        if IniFile::read(&self.config)?.section(&header).is_none() {
            return Err(Self::missing(name));
        }
        let mut local = IniFile::read(&self.local)?;
        if token.is_empty() {
            local.section_mut(&header).remove("token");
        } else {
            local.section_mut(&header).set("token", token);
        }
        self.write_local(&local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn remotes() -> (TempDir, Remotes) {
        let temp_dir = TempDir::new().unwrap();
        let layout = RepoLayout::new(temp_dir.path());
        std::fs::create_dir_all(layout.dir()).unwrap();
        let remotes = Remotes::new(&layout);
        (temp_dir, remotes)
    }

    #[test]
    fn test_add_get_with_defaults() {
        let (_tmp, remotes) = remotes();
        remotes
            .add("origin", "s3://bucket/prefix?region=r", RemoteOptions::default())
            .unwrap();
        let remote = remotes.get("origin").unwrap();
        assert_eq!(remote.url, "s3://bucket/prefix?region=r");
        assert_eq!(remote.timeout, 30);
        assert!(remote.verify_ssl);
        assert_eq!(remote.format, "parquet");
        assert_eq!(remote.token, None);
    }

    #[test]
    fn test_duplicates_and_bad_urls() {
        let (_tmp, remotes) = remotes();
        remotes.add("origin", "/tmp/x", RemoteOptions::default()).unwrap();
        assert!(matches!(
            remotes.add("origin", "/tmp/y", RemoteOptions::default()).unwrap_err(),
            EmbrError::AlreadyExists(_)
        ));
        assert!(matches!(
            remotes.add("ftp", "ftp://host/x", RemoteOptions::default()).unwrap_err(),
            EmbrError::Unsupported(_)
        ));
        assert!(remotes.add("bad name", "/tmp/x", RemoteOptions::default()).is_err());
    }

    #[test]
    fn test_token_lives_in_local_file() {
        let (tmp, remotes) = remotes();
        let options = RemoteOptions {
            token: Some("secret".into()),
            timeout: Some(5),
            verify_ssl: Some(false),
            ..Default::default()
        };
        remotes.add("web", "https://example.com/e", options).unwrap();

        let config = std::fs::read_to_string(tmp.path().join(".embr/config")).unwrap();
        assert!(!config.contains("secret"));
        let local = std::fs::read_to_string(tmp.path().join(".embr/config.local")).unwrap();
        assert!(local.contains("token = secret"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(tmp.path().join(".embr/config.local"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let remote = remotes.get("web").unwrap();
        assert_eq!(remote.token.as_deref(), Some("secret"));
        assert_eq!(remote.timeout, 5);
        assert!(!remote.verify_ssl);
        assert!(!format!("{:?}", remote).contains("secret"));
    }

    #[test]
    fn test_unknown_sections_survive_rewrite() {
        let (tmp, remotes) = remotes();
        std::fs::write(
            tmp.path().join(".embr/config"),
            "[core]\n\tcompression = 9\n[remote \"old\"]\n\turl = /tmp/old\n\tcolor = blue\n",
        )
        .unwrap();
        remotes.add("new", "/tmp/new", RemoteOptions::default()).unwrap();
        remotes.remove("new").unwrap();

        let text = std::fs::read_to_string(tmp.path().join(".embr/config")).unwrap();
        assert!(text.contains("[core]"));
        assert!(text.contains("compression = 9"));
        assert!(text.contains("color = blue"));
        assert_eq!(
            remotes.list().unwrap().iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["old"]
        );
    }

    #[test]
    fn test_missing_remote_hint() {
        let (_tmp, remotes) = remotes();
        let err = remotes.get("origin").unwrap_err();
        assert!(err.to_string().contains("Add it with: embr remote add origin <url>"));
        assert!(remotes.remove("origin").is_err());
        assert!(remotes.set_token("origin", "t").is_err());
    }
}
