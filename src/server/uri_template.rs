//! URI-template compilation.
//!
//! Literals are regex-escaped; `{name}` matches one path segment
//! lazily, `{name*}` matches across segments, and `{/path*}` is an
//! optional slash-prefixed tail. The result is anchored.

use crate::error::{Error, Result};
use regex::Regex;

pub fn compile(template: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(template.len() + 8);
    pattern.push('^');

    let mut rest = template;
    while let Some(start) = rest.find('{') {
        pattern.push_str(&regex::escape(&rest[..start]));
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            return Err(Error::semantic(format!(
                "unclosed template variable in {template:?}"
            )));
        };
        let param = &after[..end];

        if param.starts_with('/') && param.ends_with('*') {
            pattern.push_str("(/.*?)?");
        } else if param.ends_with('*') {
            pattern.push_str("(.*?)");
        } else {
            pattern.push_str("([^/]+?)");
        }
        rest = &after[end + 1..];
    }
    pattern.push_str(&regex::escape(rest));
    pattern.push('$');

    Regex::new(&pattern).map_err(|err| Error::semantic(format!("invalid template regex: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_segments_capture_values() {
        let re = compile("users/{id}/files/{path*}").expect("compile");
        let caps = re.captures("users/42/files/a/b.txt").expect("match");
        assert_eq!(&caps[1], "42");
        assert_eq!(&caps[2], "a/b.txt");
        assert!(!re.is_match("other/42"));
    }

    #[test]
    fn segment_params_stop_at_slashes() {
        let re = compile("users/{id}").expect("compile");
        assert!(re.is_match("users/42"));
        assert!(!re.is_match("users/42/extra"));
    }

    #[test]
    fn optional_path_tail() {
        let re = compile("repo{/path*}").expect("compile");
        assert!(re.is_match("repo"));
        let caps = re.captures("repo/src/main.rs").expect("match");
        assert_eq!(&caps[1], "/src/main.rs");
    }

    #[test]
    fn literals_are_escaped() {
        let re = compile("files/v1.0/{name}").expect("compile");
        assert!(re.is_match("files/v1.0/a"));
        // An unescaped dot would also match this.
        assert!(!re.is_match("files/v1x0/a"));
    }

    #[test]
    fn unclosed_variable_is_rejected() {
        assert!(compile("users/{id").is_err());
    }
}
