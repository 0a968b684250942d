//! Include/exclude path filtering applied at enqueue time.

/// Decision for a single candidate path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Allowed,
    Excluded,
}

/// Path prefix filters for a job.
///
/// Patterns match the path component only (query strings are ignored). A bare
/// pattern `/docs` matches `/docs` and everything under `/docs/`; a trailing
/// `*` turns the pattern into a raw prefix match (`/doc*` matches `/docs` and
/// `/doctor`). Exclusion wins over inclusion; an empty include list admits
/// every path not excluded.
#[derive(Debug, Clone, Default)]
pub struct PathFilters {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl PathFilters {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: include.iter().filter_map(|p| normalize(p)).collect(),
            exclude: exclude.iter().filter_map(|p| normalize(p)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn decide(&self, path: &str) -> FilterDecision {
        let path = path.split('?').next().unwrap_or(path);

        if self.exclude.iter().any(|p| matches(p, path)) {
            return FilterDecision::Excluded;
        }
        if self.include.is_empty() || self.include.iter().any(|p| matches(p, path)) {
            FilterDecision::Allowed
        } else {
            FilterDecision::Excluded
        }
    }
}

fn normalize(pattern: &str) -> Option<String> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}

fn matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.starts_with(prefix);
    }
    if path == pattern {
        return true;
    }
    let with_slash = if pattern.ends_with('/') {
        pattern.to_string()
    } else {
        format!("{pattern}/")
    };
    path.starts_with(&with_slash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(include: &[&str], exclude: &[&str]) -> PathFilters {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        PathFilters::new(&include, &exclude)
    }

    #[test]
    fn empty_filters_allow_everything() {
        let f = filters(&[], &[]);
        assert_eq!(f.decide("/"), FilterDecision::Allowed);
        assert_eq!(f.decide("/anything/at/all"), FilterDecision::Allowed);
    }

    #[test]
    fn include_is_a_segment_prefix() {
        let f = filters(&["/docs"], &[]);
        assert_eq!(f.decide("/docs"), FilterDecision::Allowed);
        assert_eq!(f.decide("/docs/intro"), FilterDecision::Allowed);
        assert_eq!(f.decide("/docsy"), FilterDecision::Excluded);
        assert_eq!(f.decide("/blog"), FilterDecision::Excluded);
    }

    #[test]
    fn wildcard_is_a_raw_prefix() {
        let f = filters(&["/doc*"], &[]);
        assert_eq!(f.decide("/docs"), FilterDecision::Allowed);
        assert_eq!(f.decide("/doctor"), FilterDecision::Allowed);
        assert_eq!(f.decide("/api"), FilterDecision::Excluded);
    }

    #[test]
    fn exclude_wins_over_include() {
        let f = filters(&["/docs"], &["/docs/internal"]);
        assert_eq!(f.decide("/docs/intro"), FilterDecision::Allowed);
        assert_eq!(f.decide("/docs/internal"), FilterDecision::Excluded);
        assert_eq!(f.decide("/docs/internal/secrets"), FilterDecision::Excluded);
    }

    #[test]
    fn query_strings_are_ignored_for_matching() {
        let f = filters(&[], &["/search"]);
        assert_eq!(f.decide("/search?q=bees"), FilterDecision::Excluded);
        assert_eq!(f.decide("/page?ref=/search"), FilterDecision::Allowed);
    }

    #[test]
    fn patterns_are_normalized_to_leading_slash() {
        let f = filters(&["blog"], &[]);
        assert_eq!(f.decide("/blog/post-1"), FilterDecision::Allowed);
    }
}
