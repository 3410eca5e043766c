//! Parameter composition.
//!
//! Layers are applied in increasing precedence; later layers overwrite
//! values of earlier ones per key (and per category index):
//!
//! 1. internal per-event flags (session/first-launch markers, timestamp)
//! 2. device/session facts from the host
//! 3. constant global parameters set in code, then auto-tracked custom facts
//! 4. global parameters set in code, remapped against custom facts
//! 5. constant global parameters from configuration
//! 6. global parameters from configuration, remapped
//! 7. explicit call-site parameters
//! 8. per-screen constant parameters from configuration
//! 9. per-screen remapped parameters from configuration
//!
//! Action events skip layers 3-6 and 8-9: they carry the internal flags, a
//! handful of device facts, the auto-tracked action facts and the explicit
//! parameters. Per-screen configuration only contributes its mapping name.

use super::catalog::Param;
use super::set::ParameterSet;
use crate::config::TrackingConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Device facts that action events still carry
const ACTION_DEVICE_FACTS: &[Param] = &[
    Param::ScreenResolution,
    Param::ScreenDepth,
    Param::UserAgent,
    Param::EverId,
    Param::Sampling,
    Param::Timezone,
    Param::Language,
];

/// Custom fact carrying the current queue size
pub const REQUEST_STORE_SIZE_FACT: &str = "requestUrlStoreSize";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Screen view with the full layer stack
    Page,
    /// Reduced-payload action event
    Action,
}

/// Auxiliary facts supplied by the host's collectors.
#[derive(Debug, Clone, Default)]
pub struct Facts {
    /// Device/session defaults (resolution, language, user agent, ...)
    pub defaults: ParameterSet,
    /// Named custom facts used by remapped layers
    pub custom: HashMap<String, String>,
}

/// Session-scoped composer state.
#[derive(Debug, Default)]
pub struct Composer {
    force_new_session: bool,
    first_launch: bool,
    const_global: ParameterSet,
    global: ParameterSet,
    custom_parameters: HashMap<String, String>,
    current_screen: Option<String>,
    custom_page_name: Option<String>,
}

impl Composer {
    /// Start a session; `first_launch` marks the very first session after install.
    pub fn new(first_launch: bool) -> Self {
        Self {
            force_new_session: true,
            first_launch,
            ..Default::default()
        }
    }

    pub fn current_screen(&self) -> Option<&str> {
        self.current_screen.as_deref()
    }

    /// Switch screens; a custom page name only survives for its own screen.
    pub fn set_current_screen(&mut self, screen: &str) {
        if self.current_screen.as_deref() != Some(screen) {
            self.custom_page_name = None;
            self.current_screen = Some(screen.to_string());
        }
    }

    pub fn set_custom_page_name(&mut self, name: Option<String>) {
        self.custom_page_name = name;
    }

    pub fn set_constant_global_parameters(&mut self, parameters: ParameterSet) {
        self.const_global = parameters;
    }

    pub fn set_global_parameters(&mut self, parameters: ParameterSet) {
        self.global = parameters;
    }

    pub fn set_custom_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_parameters.insert(key.into(), value.into());
    }

    pub fn remove_custom_parameter(&mut self, key: &str) {
        self.custom_parameters.remove(key);
    }

    /// Re-arm the new-session marker for the next event.
    pub fn force_new_session(&mut self) {
        self.force_new_session = true;
    }

    /// Clear the one-shot markers once an event was turned into a request.
    pub fn finish_event(&mut self) {
        self.force_new_session = false;
        self.first_launch = false;
    }

    /// Build the canonical parameter set for one event.
    pub fn compose(
        &self,
        kind: EventKind,
        explicit: &ParameterSet,
        config: &TrackingConfig,
        facts: &Facts,
        now: DateTime<Utc>,
    ) -> ParameterSet {
        let dictionary = self.dictionary(facts);
        let screen_config = self
            .current_screen
            .as_deref()
            .and_then(|screen| config.screen(screen));

        let mut set = self.internal_flags(now);

        match kind {
            EventKind::Page => {
                set.merge(&facts.defaults);
                set.merge(&self.const_global);
                set.merge(&config.auto_tracked.parameters.remap(&dictionary));
                set.merge(&self.global.remap(&dictionary));
                set.merge(&config.const_global_parameters);
                set.merge(&config.global_parameters.remap(&dictionary));
                set.merge(explicit);
                if let Some(screen) = screen_config {
                    set.merge(&screen.const_parameters);
                    set.merge(&screen.parameters.remap(&dictionary));
                }
            }
            EventKind::Action => {
                for param in ACTION_DEVICE_FACTS {
                    if let Some(value) = facts.defaults.get(*param) {
                        set.set(*param, value);
                    }
                }
                set.merge(&config.auto_tracked.action_parameters.remap(&dictionary));
                set.merge(explicit);
            }
        }

        if let Some(mapping_name) = screen_config.and_then(|s| s.mapping_name.as_deref()) {
            set.set(Param::ScreenName, mapping_name);
        }
        if let Some(page_name) = &self.custom_page_name {
            set.set(Param::ScreenName, page_name.as_str());
        }

        set
    }

    fn internal_flags(&self, now: DateTime<Utc>) -> ParameterSet {
        let millis = now.timestamp_millis().to_string();
        ParameterSet::new()
            .with(Param::ScreenName, self.current_screen.clone().unwrap_or_default())
            .with(Param::Timestamp, millis.clone())
            .with(Param::CurrentTime, millis)
            .with(Param::ForceNewSession, flag(self.force_new_session))
            .with(Param::AppFirstStart, flag(self.first_launch))
    }

    /// Remapping dictionary: host custom parameters, then collector facts.
    fn dictionary(&self, facts: &Facts) -> HashMap<String, String> {
        let mut dictionary = self.custom_parameters.clone();
        dictionary.extend(facts.custom.iter().map(|(k, v)| (k.clone(), v.clone())));
        dictionary
    }
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}
