//! Storage layout
//!
//! Every location is a pure function of a base directory, the query ID and
//! the level, so both helpers can compute each other's locations without
//! any side channel.
//!
//! ```text
//! shared_dir/
//!   <query_id>/
//!     level-0.result        partner-visible partial result
//!     level-1.result
//! result_dir/
//!   <query_id>/
//!     level-<final>.result  end-user result, never in shared_dir
//! work_dir/
//!   <query_id>/
//!     level-1.prefixes      prefixes derived for level 1
//!     contexts/
//!       level-0.contexts    evaluation contexts after level 0
//! ```

use std::path::{Path, PathBuf};

pub const RESULT_EXTENSION: &str = "result";
pub const PREFIXES_EXTENSION: &str = "prefixes";
pub const CONTEXTS_EXTENSION: &str = "contexts";

fn level_file(level: u32, extension: &str) -> String {
    format!("level-{}.{}", level, extension)
}

/// Location of one helper's partial result for `(query_id, level)`
pub fn partial_result_path(base_dir: impl AsRef<Path>, query_id: &str, level: u32) -> PathBuf {
    base_dir
        .as_ref()
        .join(query_id)
        .join(level_file(level, RESULT_EXTENSION))
}

/// Location of the prefixes evaluated at `level`
pub fn prefixes_path(work_dir: impl AsRef<Path>, query_id: &str, level: u32) -> PathBuf {
    work_dir
        .as_ref()
        .join(query_id)
        .join(level_file(level, PREFIXES_EXTENSION))
}

/// Directory holding a query's evaluation contexts
pub fn context_dir(work_dir: impl AsRef<Path>, query_id: &str) -> PathBuf {
    work_dir.as_ref().join(query_id).join("contexts")
}

/// Contexts as they stand after evaluating `level`
pub fn contexts_path(context_dir: impl AsRef<Path>, level: u32) -> PathBuf {
    context_dir
        .as_ref()
        .join(level_file(level, CONTEXTS_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_result_path() {
        assert_eq!(
            partial_result_path("/shared", "q-1", 3),
            PathBuf::from("/shared/q-1/level-3.result")
        );
    }

    #[test]
    fn test_paths_are_pure() {
        assert_eq!(
            partial_result_path("/a", "q", 0),
            partial_result_path("/a", "q", 0)
        );
        assert_ne!(
            partial_result_path("/a", "q", 0),
            partial_result_path("/a", "q", 1)
        );
    }

    #[test]
    fn test_work_paths() {
        assert_eq!(
            prefixes_path("/work", "q", 1),
            PathBuf::from("/work/q/level-1.prefixes")
        );
        let dir = context_dir("/work", "q");
        assert_eq!(dir, PathBuf::from("/work/q/contexts"));
        assert_eq!(
            contexts_path(&dir, 0),
            PathBuf::from("/work/q/contexts/level-0.contexts")
        );
    }
}
