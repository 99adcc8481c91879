use std::path::Path;

use serde::{Deserialize, Serialize};

/// Global knobs that tune the background engine.
///
/// All fields carry defaults so hosts can progressively adopt new tuning
/// options without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Task queue capacity and log-buffer settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Filesystem watch debounce, polling, and ignore configuration.
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Soft cap on queued tasks. Beyond this the lowest-priority task is
    /// evicted (marked canceled and skipped at dispatch, not removed from
    /// heap storage).
    #[serde(default = "QueueConfig::default_max_tasks")]
    pub max_tasks: usize,
    /// Number of buffered progress lines before they are flushed through
    /// the log subscriber.
    #[serde(default = "QueueConfig::default_log_flush_threshold")]
    pub log_flush_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_tasks: Self::default_max_tasks(),
            log_flush_threshold: Self::default_log_flush_threshold(),
        }
    }
}

impl QueueConfig {
    const fn default_max_tasks() -> usize {
        1_000_000
    }

    const fn default_log_flush_threshold() -> usize {
        100
    }
}

/// Tuning controls for filesystem watching.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Debounce window in milliseconds for coalescing native event bursts.
    #[serde(default = "WatchConfig::default_debounce_window_ms")]
    pub debounce_window_ms: u64,
    /// Maximum number of events to flush in a single batch.
    #[serde(default = "WatchConfig::default_max_batch_events")]
    pub max_batch_events: usize,
    /// Polling cadence in milliseconds for mounts without reliable native
    /// watchers (network shares).
    #[serde(default = "WatchConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Directory or file names excluded from watching and polling.
    #[serde(default = "WatchConfig::default_ignore_names")]
    pub ignore_names: Vec<String>,
    /// Whether dot-entries are excluded.
    #[serde(default = "WatchConfig::default_ignore_hidden")]
    pub ignore_hidden: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: Self::default_debounce_window_ms(),
            max_batch_events: Self::default_max_batch_events(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            ignore_names: Self::default_ignore_names(),
            ignore_hidden: Self::default_ignore_hidden(),
        }
    }
}

impl WatchConfig {
    const fn default_debounce_window_ms() -> u64 {
        250
    }

    const fn default_max_batch_events() -> usize {
        1024
    }

    const fn default_poll_interval_ms() -> u64 {
        5_000
    }

    fn default_ignore_names() -> Vec<String> {
        vec![
            "node_modules".to_string(),
            ".git".to_string(),
            ".curio".to_string(),
        ]
    }

    const fn default_ignore_hidden() -> bool {
        true
    }

    /// Whether `path` is excluded from watching, judged by the components
    /// below `root` (the watched mount itself is never excluded, even when
    /// its own name would match).
    pub fn is_ignored_within(&self, root: &Path, path: &Path) -> bool {
        let rel = path.strip_prefix(root).unwrap_or(path);
        for component in rel.components() {
            let std::path::Component::Normal(seg) = component else {
                continue;
            };
            let Some(name) = seg.to_str() else {
                continue;
            };
            if self.ignore_hidden && name.starts_with('.') {
                return true;
            }
            if self.ignore_names.iter().any(|ignored| ignored == name) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.queue.max_tasks, 1_000_000);
        assert_eq!(config.watch.poll_interval_ms, 5_000);
        assert!(config.watch.ignore_hidden);
        assert!(
            config
                .watch
                .ignore_names
                .iter()
                .any(|name| name == "node_modules")
        );
    }

    #[test]
    fn partial_payload_fills_missing_fields() {
        let watch: WatchConfig = serde_json::from_str(
            r#"{ "debounce_window_ms": 100, "max_batch_events": 16 }"#,
        )
        .expect("watch config parses");
        assert_eq!(watch.debounce_window_ms, 100);
        assert_eq!(watch.poll_interval_ms, 5_000);
        assert!(!watch.ignore_names.is_empty());
    }

    #[test]
    fn empty_payload_deserializes_to_full_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").expect("engine config parses");
        assert_eq!(config.queue.max_tasks, QueueConfig::default().max_tasks);
        assert_eq!(
            config.watch.debounce_window_ms,
            WatchConfig::default().debounce_window_ms
        );
        assert_eq!(
            config.watch.max_batch_events,
            WatchConfig::default().max_batch_events
        );

        let queue: QueueConfig = serde_json::from_str("{}").expect("queue config parses");
        assert_eq!(queue.max_tasks, 1_000_000);
        let watch: WatchConfig = serde_json::from_str("{}").expect("watch config parses");
        assert_eq!(watch.debounce_window_ms, 250);
        assert_eq!(watch.max_batch_events, 1024);
    }

    #[test]
    fn ignore_rules_apply_below_the_root_only() {
        let config = WatchConfig::default();
        let root = Path::new("/tmp/.tmpabc123");
        // The watched root itself is hidden but never excluded.
        assert!(!config.is_ignored_within(root, &root.join("assets/photo.png")));
        assert!(config.is_ignored_within(root, &root.join(".cache/thumb.png")));
        assert!(config.is_ignored_within(root, &root.join("node_modules/pkg/index.js")));
        assert!(config.is_ignored_within(root, &root.join("a/.git/HEAD")));
    }
}
