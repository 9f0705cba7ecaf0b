//! Keyword argument formatting
//!
//! One-letter keys become short flags (`-k value`), longer keys become long
//! options (`--long-key=value`). `true` emits only the flag and `false` drops
//! the option entirely.

use std::fmt;

/// Value attached to a keyword argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KwValue {
    Flag(bool),
    Value(String),
}

impl fmt::Display for KwValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KwValue::Flag(b) => write!(f, "{}", b),
            KwValue::Value(v) => f.write_str(v),
        }
    }
}

impl From<bool> for KwValue {
    fn from(b: bool) -> Self {
        KwValue::Flag(b)
    }
}

impl From<&str> for KwValue {
    fn from(s: &str) -> Self {
        KwValue::Value(s.to_string())
    }
}

impl From<String> for KwValue {
    fn from(s: String) -> Self {
        KwValue::Value(s)
    }
}

macro_rules! kw_from_number {
    ($($t:ty),*) => {
        $(impl From<$t> for KwValue {
            fn from(n: $t) -> Self {
                KwValue::Value(n.to_string())
            }
        })*
    };
}

kw_from_number!(i32, i64, u32, u64, usize, f64);

/// Format keyword arguments into argv entries, preserving order
///
/// With `raw`, long keys keep their underscores.
pub fn format_kwargs(
    kwargs: &[(String, KwValue)],
    long_prefix: &str,
    long_sep: Option<&str>,
    raw: bool,
) -> Vec<String> {
    let mut processed = Vec::new();

    for (key, value) in kwargs {
        if key.chars().count() == 1 {
            match value {
                KwValue::Flag(false) => {}
                KwValue::Flag(true) => processed.push(format!("-{}", key)),
                KwValue::Value(v) => {
                    processed.push(format!("-{}", key));
                    processed.push(v.clone());
                }
            }
            continue;
        }

        let key = if raw {
            key.clone()
        } else {
            key.replace('_', "-")
        };

        match (value, long_sep) {
            (KwValue::Flag(false), _) => {}
            (KwValue::Flag(true), _) => processed.push(format!("{}{}", long_prefix, key)),
            (KwValue::Value(v), None) => {
                processed.push(format!("{}{}", long_prefix, key));
                processed.push(v.clone());
            }
            (KwValue::Value(v), Some(sep)) => {
                processed.push(format!("{}{}{}{}", long_prefix, key, sep, v));
            }
        }
    }

    processed
}

/// Positional arguments followed by formatted keyword arguments
pub fn compile_args(
    args: &[String],
    kwargs: &[(String, KwValue)],
    long_prefix: &str,
    long_sep: Option<&str>,
) -> Vec<String> {
    let mut processed = args.to_vec();
    processed.extend(format_kwargs(kwargs, long_prefix, long_sep, false));
    processed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(pairs: &[(&str, KwValue)]) -> Vec<(String, KwValue)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn short_options_are_split() {
        let args = format_kwargs(&kw(&[("d", "\t".into())]), "--", Some("="), false);
        assert_eq!(args, vec!["-d", "\t"]);
    }

    #[test]
    fn long_options_use_separator_and_dashes() {
        let args = format_kwargs(&kw(&[("no_color", "auto".into())]), "--", Some("="), false);
        assert_eq!(args, vec!["--no-color=auto"]);
    }

    #[test]
    fn long_options_without_separator_are_split() {
        let args = format_kwargs(&kw(&[("depth", 1.into())]), "--", None, false);
        assert_eq!(args, vec!["--depth", "1"]);
    }

    #[test]
    fn boolean_flags() {
        let args = format_kwargs(
            &kw(&[
                ("l", true.into()),
                ("a", false.into()),
                ("verbose", true.into()),
                ("quiet", false.into()),
            ]),
            "--",
            Some("="),
            false,
        );
        assert_eq!(args, vec!["-l", "--verbose"]);
    }

    #[test]
    fn raw_keys_keep_underscores() {
        let args = format_kwargs(&kw(&[("some_key", "v".into())]), "-", Some("="), true);
        assert_eq!(args, vec!["-some_key=v"]);
    }

    #[test]
    fn compile_keeps_positionals_first() {
        let args = compile_args(
            &["file.txt".to_string()],
            &kw(&[("n", 5.into())]),
            "--",
            Some("="),
        );
        assert_eq!(args, vec!["file.txt", "-n", "5"]);
    }
}
