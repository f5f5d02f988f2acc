use std::ffi::OsString;
use std::fmt;

/// Deterministic identity of an environment, used to pick the session that
/// serves it. Holds `NAME=VALUE` pairs sorted byte-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentKey(Vec<String>);

impl EnvironmentKey {
    /// Canonicalizes a mapping. Entries without a value are dropped.
    ///
    /// When `coverage_var` is set, the host defines it and the caller's mapping
    /// declares it, the variable is kept even if the caller left its value out:
    /// the host's value fills the gap so instrumented children keep reporting.
    pub fn canonicalize<I, K, V>(env: I, coverage_var: Option<&str>) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let host_coverage = coverage_var
            .and_then(|name| std::env::var_os(name).map(|value| (name, lossy(value))));

        let mut pairs = Vec::new();
        for (name, value) in env {
            let name = name.as_ref();
            match value {
                Some(value) => pairs.push(format!("{name}={}", value.as_ref())),
                None => match &host_coverage {
                    Some((coverage_name, host_value)) if *coverage_name == name => {
                        pairs.push(format!("{name}={host_value}"));
                    }
                    _ => {}
                },
            }
        }
        pairs.sort_unstable();
        pairs.dedup();
        Self(pairs)
    }

    /// Key for the host process's own environment.
    pub fn from_host() -> Self {
        let pairs = std::env::vars_os()
            .map(|(name, value)| format!("{}={}", lossy(name), lossy(value)))
            .collect::<Vec<_>>();
        Self::from_sorted(pairs)
    }

    /// Takes pre-built `NAME=VALUE` pairs verbatim, skipping canonicalization.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(pairs.into_iter().map(Into::into).collect())
    }

    fn from_sorted(mut pairs: Vec<String>) -> Self {
        pairs.sort_unstable();
        Self(pairs)
    }

    pub fn pairs(&self) -> &[String] {
        &self.0
    }

    /// Splits each pair at its first `=`. A pair without one is treated as a
    /// name with an empty value.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|pair| pair.split_once('=').unwrap_or((pair.as_str(), "")))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vars", self.0.len())
    }
}

fn lossy(value: OsString) -> String {
    value.to_string_lossy().into_owned()
}
