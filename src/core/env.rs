//! `${VAR}` substitution over the session environment map.
//!
//! Unknown variables are left verbatim, which makes expansion idempotent:
//! expanding an already-expanded string returns it unchanged.

use std::collections::HashMap;

/// Looks up a key in the env map, falling back to a case-insensitive
/// match with dashes folded to underscores.
pub fn lookup(env: &HashMap<String, String>, key: &str) -> Option<String> {
    if let Some(value) = env.get(key) {
        return Some(value.clone());
    }
    env.iter()
        .find(|(candidate, _)| key.eq_ignore_ascii_case(&candidate.replace('-', "_")))
        .map(|(_, value)| value.clone())
}

/// Expands every `${NAME}` occurrence from the env map, then from the
/// process environment. Anything unresolved stays as written.
pub fn replace_string(env: &HashMap<String, String>, input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match lookup(env, key).or_else(|| std::env::var(key).ok()) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("${");
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn replace_map(
    env: &HashMap<String, String>,
    map: &HashMap<String, String>,
) -> HashMap<String, String> {
    map.iter()
        .map(|(k, v)| (replace_string(env, k), replace_string(env, v)))
        .collect()
}

/// Builds a child-process environment from the session env plus the
/// server's own env block. Keys containing `:` are internal plumbing
/// (`port:<name>`, `http:bearer-token`) and never reach a child.
pub fn replace_env(
    env: &HashMap<String, String>,
    command: &str,
    args: &[String],
    server_env: &HashMap<String, String>,
) -> (String, Vec<String>, Vec<(String, String)>) {
    let mut merged: HashMap<String, String> = env
        .iter()
        .filter(|(k, _)| !k.contains(':'))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged.extend(replace_map(env, server_env));

    let mut pairs: Vec<(String, String)> = merged.into_iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let args = args.iter().map(|arg| replace_string(env, arg)).collect();
    (replace_string(env, command), args, pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn replaces_known_variables() {
        let env = env(&[("TOKEN", "abc"), ("HOST", "example.com")]);
        assert_eq!(
            replace_string(&env, "https://${HOST}/v1?key=${TOKEN}"),
            "https://example.com/v1?key=abc"
        );
    }

    #[test]
    fn unknown_variables_survive_and_expansion_is_idempotent() {
        let env = env(&[("A", "1")]);
        let once = replace_string(&env, "${A}-${MISSING}");
        assert_eq!(once, "1-${MISSING}");
        assert_eq!(replace_string(&env, &once), once);
    }

    #[test]
    fn unterminated_brace_passes_through() {
        let env = env(&[]);
        assert_eq!(replace_string(&env, "tail ${oops"), "tail ${oops");
    }

    #[test]
    fn lookup_folds_case_and_dashes() {
        let env = env(&[("my-token", "t")]);
        assert_eq!(lookup(&env, "MY_TOKEN").as_deref(), Some("t"));
        assert_eq!(lookup(&env, "other"), None);
    }

    #[test]
    fn child_env_drops_internal_keys() {
        let session = env(&[
            ("PATH_X", "/bin"),
            ("port:web", "8080"),
            ("http:bearer-token", "t"),
        ]);
        let server = env(&[("URL", "http://localhost:${port:web}")]);
        let (cmd, args, pairs) =
            replace_env(&session, "run", &["--port=${port:web}".into()], &server);
        assert_eq!(cmd, "run");
        assert_eq!(args, vec!["--port=8080".to_string()]);
        assert!(pairs.iter().all(|(k, _)| !k.contains(':')));
        assert!(pairs
            .iter()
            .any(|(k, v)| k == "URL" && v == "http://localhost:8080"));
        // Sorted for deterministic child environments.
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.clone()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
