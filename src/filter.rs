use std::fmt;

/// A single filename rule: either an exact name or a `*suffix` wildcard.
///
/// Patterns are stored lowercased so matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Exact(String),
    Suffix(String),
}

impl Pattern {
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        match lower.strip_prefix('*') {
            Some(suffix) => Pattern::Suffix(suffix.to_string()),
            None => Pattern::Exact(lower),
        }
    }

    /// `lower_name` must already be lowercased.
    fn matches_lower(&self, lower_name: &str) -> bool {
        match self {
            Pattern::Exact(name) => name == lower_name,
            Pattern::Suffix(suffix) => lower_name.ends_with(suffix.as_str()),
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.matches_lower(&file_name.to_lowercase())
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Exact(name) => write!(f, "{}", name),
            Pattern::Suffix(suffix) => write!(f, "*{}", suffix),
        }
    }
}

/// Outcome of running a filename through a [`FileFilter`], with the rule
/// responsible so decisions can be audited from the logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No exclude rule matched.
    Tracked,
    /// An exclude rule matched and nothing overrode it.
    Excluded { rule: String },
    /// An exclude rule matched but an include rule brought the file back.
    Included { rule: String, overrides: String },
}

impl Decision {
    pub fn is_tracked(&self) -> bool {
        !matches!(self, Decision::Excluded { .. })
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Tracked => write!(f, "tracked (no exclude rule matched)"),
            Decision::Excluded { rule } => write!(f, "excluded by '{}'", rule),
            Decision::Included { rule, overrides } => {
                write!(f, "included by '{}' (overrides exclude '{}')", rule, overrides)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    exclude: Vec<Pattern>,
    include: Vec<Pattern>,
}

impl FileFilter {
    pub fn new<S: AsRef<str>>(exclude: &[S], include: &[S]) -> Self {
        Self {
            exclude: exclude.iter().map(|p| Pattern::parse(p.as_ref())).collect(),
            include: include.iter().map(|p| Pattern::parse(p.as_ref())).collect(),
        }
    }

    pub fn decide(&self, file_name: &str) -> Decision {
        let lower = file_name.to_lowercase();

        let Some(excluded_by) = self.exclude.iter().find(|p| p.matches_lower(&lower)) else {
            return Decision::Tracked;
        };

        // Include rules only matter once something excluded the file
        match self.include.iter().find(|p| p.matches_lower(&lower)) {
            Some(included_by) => Decision::Included {
                rule: included_by.to_string(),
                overrides: excluded_by.to_string(),
            },
            None => Decision::Excluded {
                rule: excluded_by.to_string(),
            },
        }
    }

    pub fn should_track(&self, file_name: &str) -> bool {
        self.decide(file_name).is_tracked()
    }
}

/// Decide whether `file_name` should be committed given raw pattern lists.
pub fn should_track<S: AsRef<str>>(file_name: &str, exclude: &[S], include: &[S]) -> bool {
    FileFilter::new(exclude, include).should_track(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: [&str; 0] = [];

    #[test]
    fn test_pattern_parse() {
        assert_eq!(Pattern::parse("*.TMP"), Pattern::Suffix(".tmp".to_string()));
        assert_eq!(Pattern::parse("Notes.md"), Pattern::Exact("notes.md".to_string()));
        assert_eq!(Pattern::parse("*"), Pattern::Suffix(String::new()));
    }

    #[test]
    fn test_tracked_by_default() {
        assert!(should_track("notes.md", &NONE, &NONE));
        assert!(should_track("notes.md", &["*.tmp"], &NONE));
    }

    #[test]
    fn test_suffix_exclude_is_case_insensitive() {
        assert!(!should_track("draft.tmp", &["*.tmp"], &NONE));
        assert!(!should_track("DRAFT.TMP", &["*.tmp"], &NONE));
        assert!(!should_track("draft.tmp", &["*.TmP"], &NONE));
        assert!(should_track("draft.tmpl", &["*.tmp"], &NONE));
    }

    #[test]
    fn test_exact_match_uses_whole_name() {
        assert!(!should_track("Thumbs.db", &["thumbs.db"], &NONE));
        assert!(should_track("my-thumbs.db", &["thumbs.db"], &NONE));
    }

    #[test]
    fn test_include_overrides_exclude() {
        assert!(should_track("keep.tmp", &["*.tmp"], &["keep.tmp"]));
        assert!(!should_track("other.tmp", &["*.tmp"], &["keep.tmp"]));
    }

    #[test]
    fn test_include_alone_does_not_exclude_others() {
        assert!(should_track("anything.txt", &NONE, &["keep.tmp"]));
    }

    #[test]
    fn test_bare_wildcard_matches_everything() {
        assert!(!should_track("a.txt", &["*"], &NONE));
        assert!(should_track("a.txt", &["*"], &["*.txt"]));
    }

    #[test]
    fn test_pattern_order_does_not_matter() {
        let names = ["a.tmp", "B.LOG", "keep.tmp", "readme", "x.swp", "keep.log"];
        let exclude_a = ["*.tmp", "*.log", "*.swp"];
        let exclude_b = ["*.swp", "*.log", "*.tmp"];
        let include_a = ["keep.tmp", "*keep.log"];
        let include_b = ["*keep.log", "keep.tmp"];

        for name in names {
            assert_eq!(
                should_track(name, &exclude_a, &include_a),
                should_track(name, &exclude_b, &include_b),
                "order changed the decision for {}",
                name
            );
        }
    }

    #[test]
    fn test_decision_names_matching_rule() {
        let filter = FileFilter::new(&["*.tmp"], &["keep.tmp"]);

        assert_eq!(
            filter.decide("draft.tmp"),
            Decision::Excluded { rule: "*.tmp".to_string() }
        );
        assert_eq!(
            filter.decide("KEEP.tmp"),
            Decision::Included {
                rule: "keep.tmp".to_string(),
                overrides: "*.tmp".to_string(),
            }
        );
        assert_eq!(filter.decide("notes.md"), Decision::Tracked);
    }

    #[test]
    fn test_scenarios_a_and_b() {
        assert!(!should_track("draft.tmp", &["*.tmp"], &NONE));
        assert!(should_track("keep.tmp", &["*.tmp"], &["keep.tmp"]));
    }
}
