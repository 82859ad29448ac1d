use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub kind: String, // "file" | "kafka"
    /// file: one partition per path
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub brokers: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub auto_offset_reset: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TimeConfig {
    /// e.g. "1m"; defaults to one window length
    #[serde(default)]
    pub allowed_lateness: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WindowConfig {
    #[serde(rename = "type", default = "default_window_kind")]
    pub kind: String, // tumbling|sliding
    #[serde(default = "default_window_size")]
    pub size: String,
    #[serde(default)]
    pub slide: Option<String>,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            kind: default_window_kind(),
            size: default_window_size(),
            slide: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_trigger")]
    pub trigger_interval: String,
    #[serde(default = "default_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Overrides the source's partition count.
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_true")]
    pub emit_empty_windows: bool,
    #[serde(default = "default_max_empty")]
    pub max_empty_windows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trigger_interval: default_trigger(),
            channel_capacity: default_capacity(),
            shards: default_shards(),
            workers: None,
            emit_empty_windows: true,
            max_empty_windows: default_max_empty(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SinkConfig {
    pub kind: String, // "file" | "parquet" | "kafka" | "console" (raw stream only)
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    #[serde(default)]
    pub brokers: Option<String>,
    #[serde(default = "default_raw")]
    pub raw: String,
    #[serde(default = "default_global")]
    pub global: String,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_backoff")]
    pub max_backoff: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CheckpointConfig {
    #[serde(default = "default_cp_kind")]
    pub kind: String, // memory | file | rocksdb
    #[serde(default = "default_cp_path")]
    pub path: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            kind: default_cp_kind(),
            path: default_cp_path(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub time: TimeConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

fn default_window_kind() -> String {
    "tumbling".into()
}
fn default_window_size() -> String {
    "1m".into()
}
fn default_trigger() -> String {
    "1m".into()
}
fn default_capacity() -> usize {
    1024
}
fn default_shards() -> usize {
    16
}
fn default_true() -> bool {
    true
}
fn default_max_empty() -> usize {
    1440
}
fn default_out_dir() -> PathBuf {
    PathBuf::from("out")
}
fn default_raw() -> String {
    "raw".into()
}
fn default_global() -> String {
    "time-kpi".into()
}
fn default_country() -> String {
    "country-time-kpi".into()
}
fn default_backoff() -> String {
    "5s".into()
}
fn default_cp_kind() -> String {
    "file".into()
}
fn default_cp_path() -> PathBuf {
    PathBuf::from("checkpoints")
}

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.source.kind.as_str() {
            "file" => {
                if self.source.paths.is_empty() {
                    anyhow::bail!("source.paths must list at least one file");
                }
            }
            "kafka" => {
                let src = &self.source;
                if src.brokers.is_none() || src.topic.is_none() || src.group_id.is_none() {
                    anyhow::bail!("kafka source needs brokers, topic and group_id");
                }
            }
            other => anyhow::bail!("unsupported source kind: {}", other),
        }
        if !matches!(self.sink.kind.as_str(), "file" | "parquet" | "kafka" | "console") {
            anyhow::bail!("unsupported sink kind: {}", self.sink.kind);
        }
        if self.sink.kind == "kafka" && self.sink.brokers.is_none() {
            anyhow::bail!("kafka sink needs brokers");
        }
        if !matches!(self.checkpoint.kind.as_str(), "memory" | "file" | "rocksdb") {
            anyhow::bail!("unsupported checkpoint kind: {}", self.checkpoint.kind);
        }
        let size = parse_duration_ms(&self.window.size)?;
        if size <= 0 {
            anyhow::bail!("window.size must be positive");
        }
        match self.window.kind.as_str() {
            "tumbling" => {}
            "sliding" => {
                let slide =
                    parse_duration_ms(self.window.slide.as_deref().unwrap_or(&self.window.size))?;
                if slide <= 0 || slide > size || size % slide != 0 {
                    anyhow::bail!("window.slide must be positive, <= size and divide size evenly");
                }
            }
            other => anyhow::bail!("unsupported window type: {}", other),
        }
        if self.allowed_lateness_ms()? < 0 {
            anyhow::bail!("time.allowed_lateness must not be negative");
        }
        if parse_duration_ms(&self.engine.trigger_interval)? <= 0 {
            anyhow::bail!("engine.trigger_interval must be positive");
        }
        if self.engine.channel_capacity == 0 || self.engine.shards == 0 {
            anyhow::bail!("engine.channel_capacity and engine.shards must be positive");
        }
        if self.engine.workers == Some(0) {
            anyhow::bail!("engine.workers must be positive");
        }
        let streams = [&self.sink.raw, &self.sink.global, &self.sink.country];
        if streams[0] == streams[1] || streams[1] == streams[2] || streams[0] == streams[2] {
            anyhow::bail!("sink stream names must be distinct");
        }
        Ok(())
    }

    pub fn window_size_ms(&self) -> anyhow::Result<i64> {
        parse_duration_ms(&self.window.size)
    }

    /// Slide for sliding windows; equals the size for tumbling ones.
    pub fn window_slide_ms(&self) -> anyhow::Result<i64> {
        match (self.window.kind.as_str(), self.window.slide.as_deref()) {
            ("sliding", Some(s)) => parse_duration_ms(s),
            _ => self.window_size_ms(),
        }
    }

    pub fn allowed_lateness_ms(&self) -> anyhow::Result<i64> {
        match self.time.allowed_lateness.as_deref() {
            Some(s) => parse_duration_ms(s),
            None => self.window_size_ms(),
        }
    }
}

pub fn parse_duration_ms(s: &str) -> anyhow::Result<i64> {
    // very small parser for values like "10s", "500ms", "2m"
    let s = s.trim();
    if let Some(num) = s.strip_suffix("ms") {
        return Ok(num.trim().parse::<i64>()?);
    }
    if let Some(num) = s.strip_suffix('s') {
        return Ok(num.trim().parse::<i64>()? * 1_000);
    }
    if let Some(num) = s.strip_suffix('m') {
        return Ok(num.trim().parse::<i64>()? * 60_000);
    }
    if let Some(num) = s.strip_suffix('h') {
        return Ok(num.trim().parse::<i64>()? * 3_600_000);
    }
    // default assume seconds
    Ok(s.parse::<i64>()? * 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [source]
        kind = "file"
        paths = ["events.jsonl"]

        [sink]
        kind = "file"
    "#;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.window_size_ms().unwrap(), 60_000);
        assert_eq!(cfg.window_slide_ms().unwrap(), 60_000);
        // lateness defaults to one window length
        assert_eq!(cfg.allowed_lateness_ms().unwrap(), 60_000);
        assert_eq!(cfg.sink.global, "time-kpi");
        assert_eq!(cfg.sink.country, "country-time-kpi");
        assert_eq!(cfg.checkpoint.kind, "file");
        assert!(cfg.engine.emit_empty_windows);
    }

    #[test]
    fn sliding_window_requires_even_slide() {
        let mut cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.window.kind = "sliding".into();
        cfg.window.size = "5m".into();
        cfg.window.slide = Some("1m".into());
        cfg.validate().unwrap();
        assert_eq!(cfg.window_slide_ms().unwrap(), 60_000);

        cfg.window.slide = Some("2m".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_kinds_and_duplicate_streams() {
        let mut cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.source.kind = "http".into();
        assert!(cfg.validate().is_err());

        let mut cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.sink.country = cfg.sink.global.clone();
        assert!(cfg.validate().is_err());

        let mut cfg: PipelineConfig = toml::from_str(MINIMAL).unwrap();
        cfg.source.paths.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("10s").unwrap(), 10_000);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("7").unwrap(), 7_000);
        assert!(parse_duration_ms("soon").is_err());
    }
}
