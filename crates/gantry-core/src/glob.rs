//! Glob matching for branch names and artifact paths.
//!
//! - `*` matches any run of characters within one `/`-separated segment
//! - `**` matches across segments; `**/` may also match nothing
//! - `?` matches one character other than `/`

/// Match `value` against `pattern`. Backslashes in `value` are treated as
/// `/` so Windows-style relative paths match the same patterns.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let v: Vec<char> = value
        .chars()
        .map(|c| if c == '\\' { '/' } else { c })
        .collect();
    Matcher::new(&p, &v).at(0, 0)
}

/// Backtracking matcher memoised on (pattern index, value index), so runs of
/// `**` stay polynomial.
struct Matcher<'a> {
    p: &'a [char],
    v: &'a [char],
    memo: Vec<Option<bool>>,
}

impl<'a> Matcher<'a> {
    fn new(p: &'a [char], v: &'a [char]) -> Self {
        Self {
            p,
            v,
            memo: vec![None; (p.len() + 1) * (v.len() + 1)],
        }
    }

    fn at(&mut self, pi: usize, vi: usize) -> bool {
        let key = pi * (self.v.len() + 1) + vi;
        if let Some(hit) = self.memo[key] {
            return hit;
        }
        let matched = self.step(pi, vi);
        self.memo[key] = Some(matched);
        matched
    }

    fn step(&mut self, pi: usize, vi: usize) -> bool {
        let (p, v) = (self.p, self.v);
        match p.get(pi) {
            None => vi == v.len(),
            Some('*') if p.get(pi + 1) == Some(&'*') => {
                let rest = pi + 2;
                if p.get(rest) == Some(&'/') && self.at(rest + 1, vi) {
                    return true;
                }
                (vi..=v.len()).any(|i| self.at(rest, i))
            }
            Some('*') => {
                for i in vi..=v.len() {
                    if self.at(pi + 1, i) {
                        return true;
                    }
                    if i < v.len() && v[i] == '/' {
                        break;
                    }
                }
                false
            }
            Some('?') => match v.get(vi) {
                Some(c) if *c != '/' => self.at(pi + 1, vi + 1),
                _ => false,
            },
            Some(c) => v.get(vi) == Some(c) && self.at(pi + 1, vi + 1),
        }
    }
}

/// True when the pattern contains no wildcards.
pub fn is_literal(pattern: &str) -> bool {
    !pattern.contains(['*', '?'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_star_stays_in_segment() {
        assert!(glob_match("release/*", "release/1.0"));
        assert!(!glob_match("release/*", "release/1.0/hotfix"));
        assert!(glob_match("*", "main"));
        assert!(!glob_match("*", "feature/x"));
        assert!(glob_match("*.log", "build.log"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        assert!(glob_match("reports/**", "reports/junit.xml"));
        assert!(glob_match("reports/**", "reports/security/bandit.json"));
        assert!(glob_match("feature/**", "feature/x/y"));
        assert!(!glob_match("reports/**", "other/junit.xml"));
    }

    #[test]
    fn test_double_star_slash_matches_zero_segments() {
        assert!(glob_match("**/*.xml", "coverage.xml"));
        assert!(glob_match("**/*.xml", "reports/deep/coverage.xml"));
        assert!(!glob_match("**/*.xml", "reports/coverage.json"));
    }

    #[test]
    fn test_question_mark() {
        assert!(glob_match("v?.txt", "v1.txt"));
        assert!(!glob_match("v?.txt", "v/.txt"));
        assert!(!glob_match("v?.txt", "v12.txt"));
    }

    #[test]
    fn test_many_double_stars_stay_fast() {
        let pattern = "**/".repeat(24) + "needle";
        let value = "a/".repeat(40) + "haystack";
        let started = std::time::Instant::now();
        assert!(!glob_match(&pattern, &value));
        assert!(glob_match(&pattern, &("a/".repeat(40) + "needle")));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[test]
    fn test_literal_and_backslashes() {
        assert!(glob_match("coverage.xml", "coverage.xml"));
        assert!(!glob_match("coverage.xml", "coverage.xml.bak"));
        assert!(glob_match("reports/*.json", "reports\\bandit.json"));
        assert!(is_literal("coverage.xml"));
        assert!(!is_literal("reports/**"));
    }
}
