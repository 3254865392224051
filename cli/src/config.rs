//! `cvmboot.conf` key=value parser (§6), a hand-rolled line format like the
//! events-log grammar rather than a config crate, since the original
//! treats both as plain text files under the ESP's `EFI/cvmboot` directory.

use std::path::Path;

use cvmboot_core::{CvmbootError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub cmdline: Option<String>,
    pub roothash: Option<String>,
    pub kernel: Option<String>,
    pub initrd: Option<String>,
}

impl Config {
    pub fn parse(contents: &str) -> Result<Self> {
        let mut config = Config::default();

        for raw_line in contents.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                CvmbootError::CorruptFormat(format!("malformed config line (expected key=value): {line}"))
            })?;
            let key = key.trim();
            let value = value.trim().to_string();

            match key {
                "cmdline" => config.cmdline = Some(value),
                "roothash" => {
                    if value.len() != 64 || !value.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
                        return Err(CvmbootError::CorruptFormat(
                            "roothash must be 64 lowercase hex characters".into(),
                        ));
                    }
                    config.roothash = Some(value);
                }
                "kernel" => config.kernel = Some(value),
                "initrd" => config.initrd = Some(value),
                "timestamp" => {}
                other => {
                    return Err(CvmbootError::CorruptFormat(format!(
                        "unknown config key '{other}'"
                    )))
                }
            }
        }

        Ok(config)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if let Some(cmdline) = &self.cmdline {
            out.push_str(&format!("cmdline={cmdline}\n"));
        }
        if let Some(roothash) = &self.roothash {
            out.push_str(&format!("roothash={roothash}\n"));
        }
        if let Some(kernel) = &self.kernel {
            out.push_str(&format!("kernel={kernel}\n"));
        }
        if let Some(initrd) = &self.initrd {
            out.push_str(&format!("initrd={initrd}\n"));
        }
        out
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_text())?;
        Ok(())
    }

    /// Sets the root hash recorded by `prepare`, replacing any prior value.
    pub fn set_roothash(&mut self, roothash: &str) {
        self.roothash = Some(roothash.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys() {
        let text = "cmdline=console=ttyS0\nroothash=aa".to_string() + &"bb".repeat(31) + "\nkernel=/vmlinuz\n";
        let config = Config::parse(&text).unwrap();
        assert_eq!(config.cmdline.as_deref(), Some("console=ttyS0"));
        assert_eq!(config.kernel.as_deref(), Some("/vmlinuz"));
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let config = Config::parse("# comment\n\ncmdline=quiet\n").unwrap();
        assert_eq!(config.cmdline.as_deref(), Some("quiet"));
    }

    #[test]
    fn rejects_malformed_roothash() {
        assert!(Config::parse("roothash=not-hex\n").is_err());
        assert!(Config::parse("roothash=ABCD\n").is_err());
    }

    #[test]
    fn rejects_unknown_key() {
        assert!(Config::parse("bogus=1\n").is_err());
    }

    #[test]
    fn round_trips_through_text() {
        let mut config = Config::default();
        config.cmdline = Some("console=ttyS0".into());
        config.set_roothash(&"ab".repeat(32));
        let text = config.to_text();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
