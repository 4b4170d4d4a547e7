#![forbid(unsafe_code)]

//! Archiver configuration.
//!
//! The archive layout, channels and selectors live in a TOML file. The API key
//! and archive root may also come from the process environment or a `.env`
//! file so secrets stay out of the TOML; precedence is CLI override, then
//! environment, then `.env`, then the TOML file.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::api::ChannelIdentity;
use crate::archiver::ChannelTarget;
use crate::selector::{RegexField, Selector};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const CONFIG_SEARCH_PATHS: &[&str] = &[
    "./ytarchive.toml",
    "/etc/ytarchive.toml",
    "/usr/share/ytarchive/ytarchive.toml",
];
pub const DEFAULT_DOWNLOADER: &str = "/usr/bin/yt-dlp";
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INTERVAL_SECS: u64 = 60 * 60;
/// Anything shorter burns through the daily API quota.
pub const MIN_INTERVAL_SECS: u64 = 30;
const API_KEY_PLACEHOLDER: &str = "YOUR_KEY_HERE";
const API_KEY_VAR: &str = "YTARCHIVE_API_KEY";
const ROOT_VAR: &str = "YTARCHIVE_ROOT";

/// How often a failing download is attempted again before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawRetries")]
pub enum RetryPolicy {
    /// Up to this many retries after the first attempt; 0 means a single try.
    Limited(u32),
    /// Never give up. Spelled `max_retries = "forever"` in the config file.
    Forever,
}

impl RetryPolicy {
    /// Whether another attempt is allowed once `attempts` have failed.
    pub fn allows_retry_after(self, attempts: u32) -> bool {
        match self {
            Self::Limited(retries) => attempts <= retries,
            Self::Forever => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Limited(DEFAULT_MAX_RETRIES)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRetries {
    Count(u32),
    Word(String),
}

impl TryFrom<RawRetries> for RetryPolicy {
    type Error = String;

    fn try_from(raw: RawRetries) -> Result<Self, Self::Error> {
        match raw {
            RawRetries::Count(count) => Ok(Self::Limited(count)),
            RawRetries::Word(word) if word.trim().eq_ignore_ascii_case("forever") => {
                Ok(Self::Forever)
            }
            RawRetries::Word(word) => Err(format!(
                "max_retries must be a number or \"forever\", got {word:?}"
            )),
        }
    }
}

/// Runtime settings of the archiving engine itself.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Archive root; each channel gets a subdirectory named after its ID.
    pub root: PathBuf,
    /// Number of concurrent downloads per channel run.
    pub max_parallel: usize,
    /// yt-dlp or a compatible fork.
    pub downloader: PathBuf,
    pub retry: RetryPolicy,
    /// Write `<id>.info.json` next to each video.
    pub dump_video_info: bool,
    /// Write `channel.json` into each channel directory.
    pub dump_channel_info: bool,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            max_parallel: default_parallelism(),
            downloader: PathBuf::from(DEFAULT_DOWNLOADER),
            retry: RetryPolicy::default(),
            dump_video_info: false,
            dump_channel_info: false,
        }
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

/// Raw shape of `ytarchive.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub root: Option<PathBuf>,
    pub api_key: Option<String>,
    pub max_parallel: Option<usize>,
    pub downloader: Option<PathBuf>,
    pub max_retries: Option<RetryPolicy>,
    #[serde(default)]
    pub dump_video_info: bool,
    #[serde(default)]
    pub dump_channel_info: bool,
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub selectors: Vec<SelectorConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub id: Option<String>,
    pub handle: Option<String>,
    pub username: Option<String>,
    #[serde(default)]
    pub selectors: Vec<SelectorConfig>,
}

/// One selector entry. The first populated field wins: regex, then playlist,
/// then explicit video IDs. An entry with nothing set is ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorConfig {
    pub regex: Option<RegexConfig>,
    pub playlist: Option<String>,
    #[serde(default)]
    pub videos: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegexConfig {
    pub field: RegexField,
    pub pattern: String,
}

impl SelectorConfig {
    pub fn to_selector(&self) -> Result<Option<Selector>> {
        if let Some(regex) = &self.regex
            && !regex.pattern.is_empty()
        {
            return Ok(Some(Selector::regex(regex.field, &regex.pattern)?));
        }
        if let Some(playlist) = self.playlist.as_deref().map(str::trim)
            && !playlist.is_empty()
        {
            return Ok(Some(Selector::playlist(playlist)));
        }
        if !self.videos.is_empty() {
            return Ok(Some(Selector::ids(self.videos.iter().cloned())));
        }
        Ok(None)
    }
}

/// Values supplied on the command line; they beat every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
    pub root: Option<PathBuf>,
}

/// Fully validated settings for one archiver instance.
#[derive(Debug)]
pub struct Settings {
    pub archiver: ArchiverConfig,
    pub api_key: String,
    pub interval: Duration,
    pub channels: Vec<ChannelTarget>,
    pub selectors: Vec<Selector>,
    pub source: PathBuf,
}

pub fn load_settings(overrides: ConfigOverrides) -> Result<Settings> {
    let source = find_config_file(overrides.config_path.as_deref())?;
    let file = read_config_file(&source)?;
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    let mut settings = build_settings(file, &file_vars, process_env, &overrides)?;
    settings.source = source;
    Ok(settings)
}

fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.exists() {
            bail!("config file {} does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }

    CONFIG_SEARCH_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
        .ok_or_else(|| {
            anyhow!(
                "no config file found; looked in {}",
                CONFIG_SEARCH_PATHS.join(", ")
            )
        })
}

pub fn read_config_file(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("Parsing {}", path.display()))
}

pub fn parse_config(raw: &str) -> Result<FileConfig> {
    Ok(toml::from_str(raw)?)
}

fn build_settings(
    file: FileConfig,
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: &ConfigOverrides,
) -> Result<Settings> {
    let env = EnvLayers {
        process: env_lookup,
        dotenv: file_vars,
    };
    let root = overrides
        .root
        .clone()
        .or_else(|| env.get(ROOT_VAR).map(PathBuf::from))
        .or(file.root)
        .ok_or_else(|| anyhow!("archive root not set (root in config or {ROOT_VAR})"))?;

    let api_key = env.get(API_KEY_VAR)
        .or(file.api_key)
        .map(|key| key.trim().to_string())
        .unwrap_or_default();
    if api_key.is_empty() || api_key == API_KEY_PLACEHOLDER {
        bail!(
            "blank API key supplied: an API key is required, create one at https://console.cloud.google.com/apis/credentials"
        );
    }

    let interval_secs = file.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS);
    if interval_secs < MIN_INTERVAL_SECS {
        bail!("interval must be at least {MIN_INTERVAL_SECS}s, got {interval_secs}s");
    }

    let max_parallel = file
        .max_parallel
        .filter(|count| *count > 0)
        .unwrap_or_else(default_parallelism);

    let archiver = ArchiverConfig {
        root,
        max_parallel,
        downloader: file
            .downloader
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADER)),
        retry: file.max_retries.unwrap_or_default(),
        dump_video_info: file.dump_video_info,
        dump_channel_info: file.dump_channel_info,
    };

    if file.channels.is_empty() {
        bail!("no channels configured");
    }

    let mut channels = Vec::with_capacity(file.channels.len());
    for (index, channel) in file.channels.iter().enumerate() {
        let identity = ChannelIdentity::from_parts(
            channel.id.as_deref(),
            channel.handle.as_deref(),
            channel.username.as_deref(),
        )
        .with_context(|| format!("channel #{}", index + 1))?;
        let selectors = build_selectors(&channel.selectors)
            .with_context(|| format!("selectors of channel {identity}"))?;
        channels.push(ChannelTarget {
            identity,
            selectors,
        });
    }

    let selectors = build_selectors(&file.selectors).context("global selectors")?;

    Ok(Settings {
        archiver,
        api_key,
        interval: Duration::from_secs(interval_secs),
        channels,
        selectors,
        source: PathBuf::new(),
    })
}

fn build_selectors(configs: &[SelectorConfig]) -> Result<Vec<Selector>> {
    let mut selectors = Vec::new();
    for config in configs {
        if let Some(selector) = config.to_selector()? {
            selectors.push(selector);
        }
    }
    Ok(selectors)
}

/// Sources that may override the TOML file, highest precedence first. Blank
/// values fall through to the next layer.
struct EnvLayers<'a, F> {
    process: F,
    dotenv: &'a HashMap<String, String>,
}

impl<F: Fn(&str) -> Option<String>> EnvLayers<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.process)(key)
            .into_iter()
            .chain(self.dotenv.get(key).cloned())
            .map(|value| value.trim().to_owned())
            .find(|value| !value.is_empty())
    }
}

fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Reads `KEY=value` pairs from a dotenv-style file. A missing file yields no
/// values.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err).with_context(|| format!("Reading {}", path.display())),
    };
    Ok(content.lines().filter_map(parse_env_line).collect())
}

/// Accepts `KEY=value`, `export KEY=value` and single or double quoted
/// values; comments and malformed lines yield nothing.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_owned(), unquote(value.trim()).to_owned()))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::Selector;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
root = "/srv/archive"
api_key = "file-key"
max_parallel = 3
downloader = "/opt/bin/yt-dlp"
max_retries = 5
dump_video_info = true
interval_secs = 900

[[selectors]]
regex = { field = "title", pattern = "(?i)devlog" }

[[channels]]
handle = "GoogleDevelopers"

[[channels]]
id = "UC_x5XG1OV2P6uZZ5FSM9Ttw"

[[channels.selectors]]
playlist = "PLOU2XLYxmsIKC8eODk_RNCWv3fBcLvMMy"

[[channels.selectors]]
videos = ["dQw4w9WgXcQ"]

[[channels.selectors]]
"#;

    fn make_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str, env: &[(&str, &str)]) -> Result<Settings> {
        let file = parse_config(contents)?;
        let env: HashMap<String, String> = env
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        build_settings(
            file,
            &HashMap::new(),
            |key| env.get(key).cloned(),
            &ConfigOverrides::default(),
        )
    }

    #[test]
    fn sample_config_builds_settings() {
        let settings = settings_from(SAMPLE, &[]).unwrap();
        assert_eq!(settings.archiver.root, PathBuf::from("/srv/archive"));
        assert_eq!(settings.archiver.max_parallel, 3);
        assert_eq!(settings.archiver.downloader, PathBuf::from("/opt/bin/yt-dlp"));
        assert_eq!(settings.archiver.retry, RetryPolicy::Limited(5));
        assert!(settings.archiver.dump_video_info);
        assert!(!settings.archiver.dump_channel_info);
        assert_eq!(settings.api_key, "file-key");
        assert_eq!(settings.interval, Duration::from_secs(900));

        assert_eq!(settings.channels.len(), 2);
        assert_eq!(
            settings.channels[0].identity,
            ChannelIdentity::Handle("GoogleDevelopers".into())
        );
        assert!(settings.channels[0].selectors.is_empty());
        let second = &settings.channels[1];
        assert_eq!(
            second.identity,
            ChannelIdentity::Id("UC_x5XG1OV2P6uZZ5FSM9Ttw".into())
        );
        assert_eq!(second.selectors.len(), 2);
        assert!(matches!(second.selectors[0], Selector::Playlist(_)));
        assert!(matches!(second.selectors[1], Selector::Ids(_)));

        assert_eq!(settings.selectors.len(), 1);
        assert!(matches!(settings.selectors[0], Selector::Regex(_)));
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let settings = settings_from(
            "root = \"/a\"\napi_key = \"k\"\nmax_parallel = 0\n[[channels]]\nusername = \"legacy\"\n",
            &[],
        )
        .unwrap();
        assert_eq!(settings.archiver.max_parallel, default_parallelism());
        assert_eq!(
            settings.archiver.downloader,
            PathBuf::from(DEFAULT_DOWNLOADER)
        );
        assert_eq!(
            settings.archiver.retry,
            RetryPolicy::Limited(DEFAULT_MAX_RETRIES)
        );
        assert_eq!(
            settings.interval,
            Duration::from_secs(DEFAULT_INTERVAL_SECS)
        );
    }

    #[test]
    fn environment_beats_dotenv_beats_file() {
        let file = parse_config(SAMPLE).unwrap();
        let mut dotenv = HashMap::new();
        dotenv.insert(API_KEY_VAR.to_string(), "dotenv-key".to_string());
        dotenv.insert(ROOT_VAR.to_string(), "/dotenv-root".to_string());

        let settings = build_settings(
            file,
            &dotenv,
            |key| (key == API_KEY_VAR).then(|| "env-key".to_string()),
            &ConfigOverrides::default(),
        )
        .unwrap();
        assert_eq!(settings.api_key, "env-key");
        assert_eq!(settings.archiver.root, PathBuf::from("/dotenv-root"));

        let settings = build_settings(
            parse_config(SAMPLE).unwrap(),
            &dotenv,
            |_| None,
            &ConfigOverrides {
                root: Some(PathBuf::from("/cli-root")),
                ..ConfigOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.api_key, "dotenv-key");
        assert_eq!(settings.archiver.root, PathBuf::from("/cli-root"));
    }

    #[test]
    fn rejects_short_interval() {
        let err = settings_from(
            "root = \"/a\"\napi_key = \"k\"\ninterval_secs = 10\n[[channels]]\nid = \"UC1\"\n",
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("interval must be at least 30s"));
    }

    #[test]
    fn rejects_blank_or_placeholder_api_key() {
        for key in ["", "YOUR_KEY_HERE"] {
            let raw = format!("root = \"/a\"\napi_key = \"{key}\"\n[[channels]]\nid = \"UC1\"\n");
            let err = settings_from(&raw, &[]).unwrap_err();
            assert!(err.to_string().contains("blank API key"));
        }
    }

    #[test]
    fn rejects_ambiguous_channel_identity() {
        let err = settings_from(
            "root = \"/a\"\napi_key = \"k\"\n[[channels]]\nid = \"UC1\"\nhandle = \"dev\"\n",
            &[],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "channel #1");
        assert!(format!("{err:#}").contains("ambiguous channel identity"));
    }

    #[test]
    fn rejects_missing_channels() {
        let err = settings_from("root = \"/a\"\napi_key = \"k\"\n", &[]).unwrap_err();
        assert!(err.to_string().contains("no channels configured"));
    }

    #[test]
    fn invalid_regex_surfaces_at_load_time() {
        let err = settings_from(
            "root = \"/a\"\napi_key = \"k\"\n[[channels]]\nid = \"UC1\"\n[[selectors]]\nregex = { field = \"title\", pattern = \"(open\" }\n",
            &[],
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("invalid regex pattern"));
    }

    #[test]
    fn unknown_regex_field_is_rejected() {
        let err = parse_config("[[selectors]]\nregex = { field = \"tags\", pattern = \"x\" }\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("unknown variant"));
    }

    #[test]
    fn retry_policy_accepts_number_or_forever() {
        let forever = parse_config("max_retries = \"forever\"\n").unwrap();
        assert_eq!(forever.max_retries, Some(RetryPolicy::Forever));
        let zero = parse_config("max_retries = 0\n").unwrap();
        assert_eq!(zero.max_retries, Some(RetryPolicy::Limited(0)));
        assert!(parse_config("max_retries = \"lots\"\n").is_err());

        assert!(RetryPolicy::Limited(0).allows_retry_after(0));
        assert!(!RetryPolicy::Limited(0).allows_retry_after(1));
        assert!(RetryPolicy::Limited(2).allows_retry_after(2));
        assert!(!RetryPolicy::Limited(2).allows_retry_after(3));
        assert!(RetryPolicy::Forever.allows_retry_after(u32::MAX));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_file(
            r#"
            export YTARCHIVE_API_KEY="abc"
            YTARCHIVE_ROOT='/archive'
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("YTARCHIVE_API_KEY").unwrap(), "abc");
        assert_eq!(vars.get("YTARCHIVE_ROOT").unwrap(), "/archive");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn blank_environment_value_falls_through_to_dotenv() {
        let mut dotenv = HashMap::new();
        dotenv.insert(API_KEY_VAR.to_string(), " dotenv-key ".to_string());
        dotenv.insert(ROOT_VAR.to_string(), "   ".to_string());
        let layers = EnvLayers {
            process: |key: &str| (key == API_KEY_VAR).then(|| "  ".to_string()),
            dotenv: &dotenv,
        };
        assert_eq!(layers.get(API_KEY_VAR).as_deref(), Some("dotenv-key"));
        assert_eq!(layers.get(ROOT_VAR), None);
    }

    #[test]
    fn env_lines_are_unquoted() {
        assert_eq!(
            parse_env_line("KEY = \"a b\""),
            Some(("KEY".to_string(), "a b".to_string()))
        );
        assert_eq!(
            parse_env_line("KEY='x'"),
            Some(("KEY".to_string(), "x".to_string()))
        );
        assert_eq!(
            parse_env_line("KEY=\"unbalanced"),
            Some(("KEY".to_string(), "\"unbalanced".to_string()))
        );
        assert_eq!(parse_env_line("=value"), None);
        assert_eq!(parse_env_line("   "), None);
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn load_settings_reads_explicit_paths() {
        let config = make_file("api_key = \"k\"\n[[channels]]\nid = \"UC1\"\n");
        let dotenv = make_file("YTARCHIVE_ROOT=\"/from-dotenv\"\n");
        let settings = load_settings(ConfigOverrides {
            config_path: Some(config.path().to_path_buf()),
            env_path: Some(dotenv.path().to_path_buf()),
            root: None,
        });
        // The process environment may carry its own root; only assert when it
        // does not.
        let process_root = EnvLayers {
            process: process_env,
            dotenv: &HashMap::new(),
        }
        .get(ROOT_VAR);
        if process_root.is_none() {
            let settings = settings.unwrap();
            assert_eq!(settings.archiver.root, PathBuf::from("/from-dotenv"));
            assert_eq!(settings.source, config.path());
        }
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_config_file(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
