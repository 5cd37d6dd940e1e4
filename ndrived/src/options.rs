//! Process-wide configuration with layered setters.
//!
//! Every value carries the layer that wrote it (`default < server < local <
//! cli < manual`); a lower layer can never overwrite a higher one, which
//! lets the server push settings without clobbering user choices. Consumers
//! take a [`OptionsSnapshot`] at the start of a work unit and never re-read
//! mid-operation.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::updater::Channel;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("unknown option: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value}")]
    Rejected { key: String, value: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptionSetter {
    Default,
    Server,
    Local,
    Cli,
    Manual,
}

type Validator = fn(&Value) -> bool;
type Callback = Box<dyn Fn(&Value) + Send + Sync>;

struct Entry {
    value: Value,
    setter: OptionSetter,
}

pub struct Options {
    entries: RwLock<HashMap<&'static str, Entry>>,
    validators: HashMap<&'static str, Validator>,
    callbacks: RwLock<HashMap<String, Vec<Callback>>>,
}

fn positive_int(value: &Value) -> bool {
    value.as_i64().is_some_and(|v| v > 0)
}

fn non_negative_int(value: &Value) -> bool {
    value.as_i64().is_some_and(|v| v >= 0)
}

fn string_list(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|items| items.iter().all(Value::is_string))
}

fn channel_name(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|name| Channel::parse(name).is_ok())
}

fn any(_: &Value) -> bool {
    true
}

impl Default for Options {
    fn default() -> Self {
        let mut entries = HashMap::new();
        let mut validators: HashMap<&'static str, Validator> = HashMap::new();
        let mut add = |key: &'static str, value: Value, validator: Validator| {
            entries.insert(
                key,
                Entry {
                    value,
                    setter: OptionSetter::Default,
                },
            );
            validators.insert(key, validator);
        };

        add("delay", json!(30), positive_int);
        add("timeout", json!(30), positive_int);
        add("max_errors", json!(3), positive_int);
        add("chunk_limit", json!(20), positive_int); // MiB
        add("chunk_size", json!(20), positive_int); // MiB
        add("update_check_delay", json!(3600), positive_int);
        add("channel", json!("release"), channel_name);
        add("client_version", Value::Null, any);
        add(
            "update_site_url",
            json!("https://community.nuxeo.com/static/drive-updates"),
            any,
        );
        add(
            "ignored_prefixes",
            json!([".", "~$", "icon\r"]),
            string_list,
        );
        add(
            "ignored_suffixes",
            json!([
                ".tmp", ".swp", ".lock", ".part", ".partial", ".ndpart", ".crdownload", "~",
                ".dwl", ".dwl2"
            ]),
            string_list,
        );
        add("max_sync_step", json!(10), positive_int);
        add("sync_workers", json!(4), positive_int);
        add("findersync_batch_size", json!(50), non_negative_int);

        Self {
            entries: RwLock::new(entries),
            validators,
            callbacks: RwLock::new(HashMap::new()),
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .expect("options poisoned")
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Writes a value. A layer below the current owner of the key is
    /// ignored silently (the server cannot undo a manual choice).
    pub fn set(&self, key: &str, value: Value, setter: OptionSetter) -> Result<(), OptionsError> {
        let validator = self
            .validators
            .get(key)
            .ok_or_else(|| OptionsError::UnknownKey(key.to_string()))?;
        if !value.is_null() && !validator(&value) {
            return Err(OptionsError::Rejected {
                key: key.to_string(),
                value,
            });
        }

        let changed = {
            let mut entries = self.entries.write().expect("options poisoned");
            let entry = entries.get_mut(key).expect("validated key present");
            if setter < entry.setter {
                debug!(key, ?setter, current = ?entry.setter, "option write shadowed by a higher layer");
                return Ok(());
            }
            let changed = entry.value != value;
            entry.value = value.clone();
            entry.setter = setter;
            changed
        };

        if changed {
            let callbacks = self.callbacks.read().expect("options poisoned");
            if let Some(watchers) = callbacks.get(key) {
                for watcher in watchers {
                    watcher(&value);
                }
            }
        }
        Ok(())
    }

    /// Registers a change callback for one key.
    pub fn on_change(&self, key: &str, callback: impl Fn(&Value) + Send + Sync + 'static) {
        self.callbacks
            .write()
            .expect("options poisoned")
            .entry(key.to_string())
            .or_default()
            .push(Box::new(callback));
    }

    pub fn snapshot(&self) -> OptionsSnapshot {
        let entries = self.entries.read().expect("options poisoned");
        let int = |key: &str, fallback: i64| {
            entries
                .get(key)
                .and_then(|entry| entry.value.as_i64())
                .unwrap_or(fallback)
        };
        let strings = |key: &str| -> Vec<String> {
            entries
                .get(key)
                .and_then(|entry| entry.value.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        OptionsSnapshot {
            delay_secs: int("delay", 30) as u64,
            timeout_secs: int("timeout", 30) as u64,
            max_errors: int("max_errors", 3),
            chunk_limit_bytes: int("chunk_limit", 20) as u64 * 1024 * 1024,
            chunk_size_bytes: int("chunk_size", 20) as u64 * 1024 * 1024,
            update_check_delay_secs: int("update_check_delay", 3600) as u64,
            sync_workers: int("sync_workers", 4) as usize,
            channel: entries
                .get("channel")
                .and_then(|entry| entry.value.as_str())
                .and_then(|name| Channel::parse(name).ok())
                .unwrap_or(Channel::Release),
            client_version: entries
                .get("client_version")
                .and_then(|entry| entry.value.as_str().map(str::to_string)),
            update_site_url: entries
                .get("update_site_url")
                .and_then(|entry| entry.value.as_str().map(str::to_string))
                .unwrap_or_default(),
            ignored_prefixes: strings("ignored_prefixes"),
            ignored_suffixes: strings("ignored_suffixes"),
        }
    }
}

/// Immutable view of the options a work unit runs with.
#[derive(Debug, Clone)]
pub struct OptionsSnapshot {
    pub delay_secs: u64,
    pub timeout_secs: u64,
    pub max_errors: i64,
    pub chunk_limit_bytes: u64,
    pub chunk_size_bytes: u64,
    pub update_check_delay_secs: u64,
    pub sync_workers: usize,
    pub channel: Channel,
    pub client_version: Option<String>,
    pub update_site_url: String,
    pub ignored_prefixes: Vec<String>,
    pub ignored_suffixes: Vec<String>,
}

/// Process-wide flags consulted by workers for graceful-exit semantics.
#[derive(Debug, Default)]
pub struct State {
    about_to_quit: AtomicBool,
    has_crashed: AtomicBool,
}

impl State {
    pub fn set_about_to_quit(&self) {
        self.about_to_quit.store(true, Ordering::SeqCst);
    }

    pub fn about_to_quit(&self) -> bool {
        self.about_to_quit.load(Ordering::SeqCst)
    }

    pub fn set_crashed(&self, crashed: bool) {
        self.has_crashed.store(crashed, Ordering::SeqCst);
    }

    pub fn has_crashed(&self) -> bool {
        self.has_crashed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn defaults_are_available() {
        let options = Options::new();
        assert_eq!(options.get("delay"), Some(json!(30)));
        let snapshot = options.snapshot();
        assert_eq!(snapshot.delay_secs, 30);
        assert_eq!(snapshot.chunk_size_bytes, 20 * 1024 * 1024);
        assert_eq!(snapshot.channel, Channel::Release);
        assert!(snapshot.ignored_prefixes.contains(&".".to_string()));
    }

    #[test]
    fn higher_layers_shadow_lower_ones() {
        let options = Options::new();
        options
            .set("delay", json!(60), OptionSetter::Manual)
            .unwrap();
        // The server push arrives later but loses.
        options
            .set("delay", json!(10), OptionSetter::Server)
            .unwrap();
        assert_eq!(options.get("delay"), Some(json!(60)));

        // Same layer may overwrite itself.
        options
            .set("delay", json!(90), OptionSetter::Manual)
            .unwrap();
        assert_eq!(options.get("delay"), Some(json!(90)));
    }

    #[test]
    fn values_are_validated_on_assignment() {
        let options = Options::new();
        assert!(matches!(
            options.set("delay", json!(-5), OptionSetter::Cli),
            Err(OptionsError::Rejected { .. })
        ));
        assert!(matches!(
            options.set("channel", json!("nightly"), OptionSetter::Cli),
            Err(OptionsError::Rejected { .. })
        ));
        assert!(matches!(
            options.set("no_such_option", json!(1), OptionSetter::Cli),
            Err(OptionsError::UnknownKey(_))
        ));
    }

    #[test]
    fn callbacks_fire_on_effective_change() {
        let options = Options::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&fired);
        options.on_change("channel", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        options
            .set("channel", json!("beta"), OptionSetter::Local)
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Shadowed write: no change, no callback.
        options
            .set("channel", json!("alpha"), OptionSetter::Server)
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn state_flags_round_trip() {
        let state = State::default();
        assert!(!state.about_to_quit());
        state.set_about_to_quit();
        assert!(state.about_to_quit());
        state.set_crashed(true);
        assert!(state.has_crashed());
    }
}
