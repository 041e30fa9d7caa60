use crate::error::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Include/exclude glob filter for crawled paths.
///
/// Exclude patterns run against the full path; include patterns run against
/// the basename. An empty include list admits every path that is not
/// excluded. Patterns are validated at construction; `should_include` itself
/// cannot fail.
#[derive(Debug)]
pub struct PatternSet {
    includes: GlobSet,
    include_count: usize,
    excludes: GlobSet,
}

impl PatternSet {
    pub fn new<S: AsRef<str>>(includes: &[S], excludes: &[S]) -> Result<Self> {
        Ok(Self {
            includes: build_set(includes)?,
            include_count: includes.len(),
            excludes: build_set(excludes)?,
        })
    }

    /// Accept everything. Used when no patterns are configured.
    pub fn accept_all() -> Self {
        Self {
            includes: GlobSet::empty(),
            include_count: 0,
            excludes: GlobSet::empty(),
        }
    }

    pub fn should_include(&self, path: &Path) -> bool {
        if self.excludes.is_match(path) {
            return false;
        }

        if self.include_count == 0 {
            return true;
        }

        match path.file_name() {
            Some(name) => self.includes.is_match(Path::new(name)),
            None => false,
        }
    }
}

fn build_set<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern.as_ref())?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn empty_sets_accept_everything() {
        let p = PatternSet::accept_all();
        assert!(p.should_include(Path::new("/data/report.pdf")));
    }

    #[test]
    fn include_matches_basename_only() {
        let p = PatternSet::new(&["*.pdf"], &[]).unwrap();
        assert!(p.should_include(Path::new("/data/deep/report.pdf")));
        assert!(!p.should_include(Path::new("/data/report.txt")));
    }

    #[test]
    fn exclude_matches_full_path() {
        let p = PatternSet::new(&[], &["**/node_modules/**"]).unwrap();
        assert!(!p.should_include(Path::new("/x/node_modules/y/file.txt")));
        assert!(p.should_include(Path::new("/x/src/file.txt")));
    }

    #[test]
    fn exclude_wins_over_include() {
        let p = PatternSet::new(&["*.txt"], &["**/tmp/**"]).unwrap();
        assert!(!p.should_include(Path::new("/a/tmp/b/notes.txt")));
        assert!(p.should_include(Path::new("/a/b/notes.txt")));
    }

    #[test]
    fn character_classes_and_question_mark() {
        let p = PatternSet::new(&["report-[0-9].md", "draft?.md"], &[]).unwrap();
        assert!(p.should_include(Path::new("/d/report-7.md")));
        assert!(!p.should_include(Path::new("/d/report-x.md")));
        assert!(p.should_include(Path::new("/d/draft1.md")));
        assert!(!p.should_include(Path::new("/d/draft12.md")));
    }

    #[test]
    fn invalid_pattern_is_rejected_at_construction() {
        assert!(PatternSet::new(&["[unclosed"], &[]).is_err());
    }
}
