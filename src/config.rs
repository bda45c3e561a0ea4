//! Library options and the per-user configuration file.
//!
//! The option vocabulary is shared between the CLI, the `options` line of
//! the configuration file and the string callers pass at initialization.
//! The configuration file is a sectioned text file in the XDG config
//! directory; the `[library]` section's `options` key carries one line in
//! the same vocabulary.

use {
    crate::{
        error::{DdcResult, Error, Status},
        retry::TryPolicy,
        sleep::SLEEP_MULTIPLIER_MAX,
    },
    log::debug,
    std::path::{Path, PathBuf},
};

/// Effective library options.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Per-class retry ceilings: write-only, write-read, multi-part.
    pub max_tries: Option<(u8, u8, u8)>,
    /// User-pinned sleep multiplier, applied to every display.
    pub sleep_multiplier: Option<f64>,
    /// Whether the sleep multiplier adapts to observed outcomes.
    pub dynamic_sleep: bool,
    /// Whether the persisted displays cache is consulted.
    pub displays_cache: bool,
    /// Whether the persisted capabilities cache is consulted.
    pub capabilities_cache: bool,
    /// Whether USB HID monitors are enumerated.
    pub enable_usb: bool,
    /// EDID read size, 128 or 256 bytes.
    pub edid_read_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_tries: None,
            sleep_multiplier: None,
            dynamic_sleep: true,
            displays_cache: true,
            capabilities_cache: true,
            enable_usb: false,
            edid_read_size: 128,
        }
    }
}

impl Options {
    /// Apply one line of options on top of the current values.
    ///
    /// `error_status` selects the status reported for bad input:
    /// `invalid-argument` for caller-supplied strings,
    /// `bad-configuration-file` for file contents.
    pub fn apply_str(&mut self, line: &str, error_status: Status) -> DdcResult<()> {
        const SITE: &str = "config::options";
        let bad = |msg: String| Error::new(error_status, SITE, msg);

        let mut words = line.split_whitespace();
        while let Some(word) = words.next() {
            let (flag, inline_value) = match word.split_once('=') {
                Some((flag, value)) => (flag, Some(value.to_string())),
                None => (word, None),
            };
            let mut value = |name: &str| -> DdcResult<String> {
                match inline_value.clone() {
                    Some(v) => Ok(v),
                    None => words
                        .next()
                        .map(str::to_string)
                        .ok_or_else(|| bad(format!("{} requires a value", name))),
                }
            };
            match flag {
                "--maxtries" => {
                    let v = value(flag)?;
                    let mut parts = v.split(',');
                    let mut part = |name| {
                        parts
                            .next()
                            .and_then(|p| p.trim().parse::<u8>().ok())
                            .filter(|n| (1..=crate::retry::MAX_MAX_TRIES as u8).contains(n))
                            .ok_or_else(|| bad(format!("bad {} count in --maxtries {}", name, v)))
                    };
                    let triple = (part("write")?, part("write-read")?, part("multi-part")?);
                    if parts.next().is_some() {
                        return Err(bad(format!("--maxtries {} has more than three values", v)));
                    }
                    self.max_tries = Some(triple);
                },
                "--sleep-multiplier" => {
                    let v = value(flag)?;
                    let m: f64 = v
                        .parse()
                        .map_err(|_| bad(format!("bad multiplier {}", v)))?;
                    if !(0.0..=SLEEP_MULTIPLIER_MAX).contains(&m) {
                        return Err(bad(format!("multiplier {} outside [0.0, 10.0]", v)));
                    }
                    self.sleep_multiplier = Some(m);
                },
                "--disable-dynamic-sleep" => self.dynamic_sleep = false,
                "--enable-dynamic-sleep" => self.dynamic_sleep = true,
                "--disable-displays-cache" => self.displays_cache = false,
                "--disable-capabilities-cache" => self.capabilities_cache = false,
                "--enable-usb" => self.enable_usb = true,
                "--disable-usb" => self.enable_usb = false,
                "--edid-read-size" => {
                    let v = value(flag)?;
                    match v.as_str() {
                        "128" => self.edid_read_size = 128,
                        "256" => self.edid_read_size = 256,
                        _ => return Err(bad(format!("EDID read size {} is not 128 or 256", v))),
                    }
                },
                other => return Err(bad(format!("unrecognized option {}", other))),
            }
        }
        Ok(())
    }

    /// The retry policy these options select.
    pub fn try_policy(&self) -> TryPolicy {
        let mut policy = TryPolicy::default();
        if let Some((write, write_read, multi)) = self.max_tries {
            // values were validated when parsed
            let _ = policy.set_triple(write, write_read, multi);
        }
        policy
    }
}

/// Default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|base| base.config_dir().join("ddcci").join("ddccirc"))
}

/// Load options from a sectioned configuration file.
///
/// A missing file yields defaults; a file that does not parse, or whose
/// `options` line is invalid, fails with `bad-configuration-file`.
pub fn load_config_file(path: &Path) -> DdcResult<Options> {
    const SITE: &str = "config::file";
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Options::default()),
        Err(e) => {
            return Err(Error::new(
                Status::BadConfiguration,
                SITE,
                format!("read {}: {}", path.display(), e),
            ))
        },
    };

    let mut options = Options::default();
    let mut section = String::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = name.trim().to_ascii_lowercase();
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::new(
                Status::BadConfiguration,
                SITE,
                format!("{}:{}: expected key = value", path.display(), lineno + 1),
            ));
        };
        if section == "library" && key.trim() == "options" {
            options.apply_str(value.trim(), Status::BadConfiguration)?;
        }
        // other sections belong to the CLI and are not interpreted here
    }
    debug!("loaded configuration from {}", path.display());
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> DdcResult<Options> {
        let mut options = Options::default();
        options.apply_str(line, Status::InvalidArgument)?;
        Ok(options)
    }

    #[test]
    fn full_vocabulary() {
        let options = parse(
            "--maxtries 4,6,8 --sleep-multiplier 2.0 --disable-dynamic-sleep \
             --disable-displays-cache --disable-capabilities-cache --enable-usb \
             --edid-read-size 256",
        )
        .unwrap();
        assert_eq!(options.max_tries, Some((4, 6, 8)));
        assert_eq!(options.sleep_multiplier, Some(2.0));
        assert!(!options.dynamic_sleep);
        assert!(!options.displays_cache);
        assert!(!options.capabilities_cache);
        assert!(options.enable_usb);
        assert_eq!(options.edid_read_size, 256);
    }

    #[test]
    fn equals_form_accepted() {
        let options = parse("--maxtries=5,7,9 --sleep-multiplier=0.5").unwrap();
        assert_eq!(options.max_tries, Some((5, 7, 9)));
        assert_eq!(options.sleep_multiplier, Some(0.5));
    }

    #[test]
    fn empty_line_is_defaults() {
        assert_eq!(parse("").unwrap(), Options::default());
    }

    #[test]
    fn rejects_bad_input() {
        for line in [
            "--maxtries 0,6,8",
            "--maxtries 4,6,16",
            "--maxtries 4,6",
            "--maxtries 4,6,8,10",
            "--sleep-multiplier 11",
            "--sleep-multiplier lots",
            "--edid-read-size 192",
            "--frobnicate",
        ] {
            let err = parse(line).unwrap_err();
            assert_eq!(err.status, Status::InvalidArgument, "{}", line);
        }
    }

    #[test]
    fn try_policy_applies_triple() {
        use crate::retry::TryClass;

        let options = parse("--maxtries 2,3,9").unwrap();
        let policy = options.try_policy();
        assert_eq!(policy.max_tries(TryClass::WriteOnly), 2);
        assert_eq!(policy.max_tries(TryClass::WriteRead), 3);
        assert_eq!(policy.max_tries(TryClass::ReadOnly), 3);
        assert_eq!(policy.max_tries(TryClass::MultiPartRead), 9);
        assert_eq!(policy.max_tries(TryClass::MultiPartWrite), 9);
    }

    #[test]
    fn config_file_section_parsing() {
        let dir = std::env::temp_dir().join(format!("ddcci-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ddccirc");
        std::fs::write(
            &path,
            "# comment\n[cli]\noptions = --verbose\n[library]\noptions = --sleep-multiplier 1.5\n",
        )
        .unwrap();
        let options = load_config_file(&path).unwrap();
        assert_eq!(options.sleep_multiplier, Some(1.5));

        std::fs::write(&path, "[library]\noptions = --what-is-this\n").unwrap();
        assert_eq!(
            load_config_file(&path).unwrap_err().status,
            Status::BadConfiguration
        );

        std::fs::write(&path, "[library]\nnot a key value\n").unwrap();
        assert_eq!(
            load_config_file(&path).unwrap_err().status,
            Status::BadConfiguration
        );

        assert_eq!(
            load_config_file(&dir.join("missing")).unwrap(),
            Options::default()
        );
    }
}
