//! Default `enabled` decision for newly discovered channels

use regex::Regex;
use tracing::debug;
use url::Url;

use crate::config::AdmissionConfig;
use crate::errors::AppError;

/// Compiled form of [`AdmissionConfig`]. Regexes are anchored at the start
/// of the URL.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    allowed_schemes: Vec<String>,
    blocked_path_suffixes: Vec<String>,
    blocked_url_regexes: Vec<Regex>,
}

impl AdmissionPolicy {
    pub fn from_config(config: &AdmissionConfig) -> Result<Self, AppError> {
        let blocked_url_regexes = config
            .blocked_url_regexes
            .iter()
            .map(|pattern| {
                Regex::new(&format!("^(?:{})", pattern.trim())).map_err(|e| {
                    AppError::configuration(format!(
                        "invalid blocked URL regex '{}': {}",
                        pattern, e
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowed_schemes: config.allowed_schemes.clone(),
            blocked_path_suffixes: config.blocked_path_suffixes.clone(),
            blocked_url_regexes,
        })
    }

    pub fn default_enabled(&self, url: &str) -> bool {
        decide_default_enabled(
            url,
            &self.allowed_schemes,
            &self.blocked_path_suffixes,
            &self.blocked_url_regexes,
        )
    }
}

/// A channel starts enabled when its URL scheme is allowed, its path does
/// not end with a blocked suffix and no blocked regex matches it. An
/// unparseable URL has no scheme and an empty path.
pub fn decide_default_enabled(
    url: &str,
    allowed_schemes: &[String],
    blocked_path_suffixes: &[String],
    blocked_url_regexes: &[Regex],
) -> bool {
    let parsed = Url::parse(url).ok();
    let scheme = parsed.as_ref().map(|u| u.scheme()).unwrap_or("");
    let path = parsed.as_ref().map(|u| u.path()).unwrap_or("");

    let scheme_ok = allowed_schemes.iter().any(|s| s == scheme);
    debug!("{}: scheme '{}' allowed: {}", url, scheme, scheme_ok);

    let path_blocked = blocked_path_suffixes
        .iter()
        .any(|suffix| path.ends_with(suffix.as_str()));
    debug!("{}: path '{}' blocked by suffix: {}", url, path, path_blocked);

    let regex_blocked = blocked_url_regexes.iter().any(|re| re.is_match(url));
    debug!("{}: blocked by regex: {}", url, regex_blocked);

    scheme_ok && !path_blocked && !regex_blocked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(regexes: &[&str]) -> AdmissionPolicy {
        AdmissionPolicy::from_config(&AdmissionConfig {
            allowed_schemes: vec!["http".into(), "https".into()],
            blocked_path_suffixes: vec![".mkv".into()],
            blocked_url_regexes: regexes.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_decide_default_enabled_cases() {
        let web = vec!["http".to_string(), "https".to_string()];
        let m3u8 = vec![".m3u8".to_string()];

        assert!(decide_default_enabled("http://x/y.ts", &web, &m3u8, &[]));
        assert!(!decide_default_enabled("ftp://x/y", &web, &[], &[]));
        assert!(!decide_default_enabled("http://x/y.m3u8", &web, &m3u8, &[]));
    }

    #[test]
    fn test_plain_http_stream_is_enabled() {
        assert!(policy(&[]).default_enabled("http://h/a.ts"));
    }

    #[test]
    fn test_blocked_suffix_disables() {
        assert!(!policy(&[]).default_enabled("http://h/a.mkv"));
    }

    #[test]
    fn test_disallowed_scheme_disables() {
        assert!(!policy(&[]).default_enabled("rtmp://h/a"));
        assert!(!policy(&[]).default_enabled("not a url"));
    }

    #[test]
    fn test_regex_is_anchored_at_start() {
        let p = policy(&["http://bad\\."]);
        assert!(!p.default_enabled("http://bad.example/live"));
        assert!(p.default_enabled("http://good.example/?r=http://bad.example"));
    }

    #[test]
    fn test_suffix_checks_path_not_query() {
        assert!(policy(&[]).default_enabled("http://h/play?file=a.mkv"));
    }

    #[test]
    fn test_invalid_regex_is_configuration_error() {
        let result = AdmissionPolicy::from_config(&AdmissionConfig {
            allowed_schemes: vec![],
            blocked_path_suffixes: vec![],
            blocked_url_regexes: vec!["(".into()],
        });
        assert!(matches!(result, Err(AppError::Configuration { .. })));
    }
}
