//! Deep-merge for `extends` parents and profile overlays.
//!
//! Merging is defined on the serialized form: maps merge recursively,
//! everything else is overlay-wins. That matches how a child config
//! layered over its parent (or a profile over the merged result) is
//! expected to behave regardless of which loader produced it.

use super::data::Config;
use crate::error::{Error, Result};
use serde_json::Value;

/// Merges `overlay` over `base`. Maps merge key-wise and recursively;
/// scalars and arrays are replaced by the overlay.
pub fn merge(base: &Config, overlay: &Config) -> Result<Config> {
    let base = serde_json::to_value(base)?;
    let overlay = serde_json::to_value(overlay)?;
    let merged = merge_value(base, overlay);
    Ok(serde_json::from_value(merged)?)
}

fn merge_value(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => merge_value(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

impl Config {
    /// Applies the named profiles in order, each deep-merged over the
    /// result so far. A name suffixed with `?` is optional and skipped
    /// silently when absent; otherwise a missing profile is an error.
    pub fn apply_profiles(&self, profiles: &[String]) -> Result<Config> {
        let mut current = self.clone();
        for profile in profiles {
            let (name, optional) = match profile.strip_suffix('?') {
                Some(name) => (name, true),
                None => (profile.as_str(), false),
            };
            let Some(overlay) = current.profiles.get(name).cloned() else {
                if optional {
                    continue;
                }
                return Err(Error::semantic(format!("profile {name} not found")));
            };
            current = merge(&current, &overlay)?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> Config {
        serde_json::from_value(value).expect("config")
    }

    #[test]
    fn maps_merge_recursively_scalars_replace() {
        let base = config(json!({
            "agents": {
                "main": {"model": "gpt-4.1", "temperature": 0.2, "tools": ["calc/add"]},
                "other": {"model": "small"},
            },
        }));
        let overlay = config(json!({
            "agents": {
                "main": {"model": "gpt-5", "tools": ["web/search"]},
            },
        }));

        let merged = merge(&base, &overlay).expect("merge");
        let main = &merged.agents["main"];
        assert_eq!(main.model, "gpt-5");
        assert_eq!(main.temperature, Some(0.2));
        // Arrays are overlay-wins, not unioned.
        assert_eq!(main.tools.0, vec!["web/search".to_string()]);
        assert!(merged.agents.contains_key("other"));
    }

    #[test]
    fn profiles_apply_in_order_after_base() {
        let base = config(json!({
            "agents": {"main": {"model": "base"}},
            "profiles": {
                "dev": {"agents": {"main": {"model": "dev"}}},
                "fast": {"agents": {"main": {"temperature": 0.0}}},
            },
        }));

        let merged = base
            .apply_profiles(&["dev".to_string(), "fast".to_string()])
            .expect("profiles");
        assert_eq!(merged.agents["main"].model, "dev");
        assert_eq!(merged.agents["main"].temperature, Some(0.0));
    }

    #[test]
    fn optional_profiles_may_be_absent() {
        let base = config(json!({"agents": {"main": {"model": "base"}}}));
        assert!(base.apply_profiles(&["missing?".to_string()]).is_ok());
        assert!(base.apply_profiles(&["missing".to_string()]).is_err());
    }
}
