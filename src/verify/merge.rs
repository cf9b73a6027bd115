//! Merge-landed verification for the publish phase.
//!
//! The platform saying a merge request is "merged" is not evidence that
//! the commits landed: history rewrites, force-pushes, and racing reverts
//! all produce merge requests that report merged while the target branch
//! tip no longer contains them. This verifier pairs the platform's claim
//! with an independent ancestry walk of the local repository.

use anyhow::{Context, Result};
use git2::{Oid, Repository};
use std::path::Path;

use super::{ReasonCategory, VerificationResult};

/// Verify that `merge_commit` actually landed on `target_branch`.
///
/// Checks, in order:
/// 1. the reported commit resolves to a real commit in the repository;
/// 2. the commit is an ancestor of the target branch's current tip
///    (ancestry, not mere ref membership — a commit can exist on some
///    ref without being reachable from the tip after a rewrite);
/// 3. every path in `expected_paths` is present in the tip tree.
///
/// Verification failures come back as a failed [`VerificationResult`]
/// with category `phantom_merge`; only an unopenable repository is a
/// hard error.
pub fn verify_merge_landed(
    repo_path: &Path,
    merge_commit: &str,
    target_branch: &str,
    expected_paths: &[&Path],
) -> Result<VerificationResult> {
    let repo = Repository::open(repo_path)
        .with_context(|| format!("Failed to open repository at {}", repo_path.display()))?;

    let Some(tip) = branch_tip(&repo, target_branch) else {
        return Ok(VerificationResult::fail(
            ReasonCategory::PhantomMerge,
            format!("target branch '{}' not found in repository", target_branch),
            vec![],
        ));
    };

    let merge_oid = match Oid::from_str(merge_commit) {
        Ok(oid) => oid,
        Err(_) => {
            return Ok(VerificationResult::fail(
                ReasonCategory::PhantomMerge,
                format!("reported merge commit '{}' is not a valid id", merge_commit),
                vec![],
            ));
        }
    };

    if repo.find_commit(merge_oid).is_err() {
        return Ok(VerificationResult::fail(
            ReasonCategory::PhantomMerge,
            format!(
                "reported merge commit {} does not exist in the repository",
                merge_commit
            ),
            vec![format!("target branch tip is {}", tip.id())],
        ));
    }

    let landed = tip.id() == merge_oid || repo.graph_descendant_of(tip.id(), merge_oid)?;
    if !landed {
        return Ok(VerificationResult::fail(
            ReasonCategory::PhantomMerge,
            format!(
                "merge commit {} is not an ancestor of {} tip {}",
                merge_commit,
                target_branch,
                tip.id()
            ),
            vec!["ancestry walk from branch tip did not reach the commit".into()],
        ));
    }

    let mut evidence = vec![format!(
        "merge commit {} is an ancestor of {} tip {}",
        merge_commit,
        target_branch,
        tip.id()
    )];

    let tree = tip.tree()?;
    for path in expected_paths {
        if tree.get_path(path).is_err() {
            return Ok(VerificationResult::fail(
                ReasonCategory::PhantomMerge,
                format!(
                    "expected artifact {} is missing from {} after merge",
                    path.display(),
                    target_branch
                ),
                evidence,
            ));
        }
    }
    if !expected_paths.is_empty() {
        evidence.push(format!(
            "verified {} expected path(s) on {}",
            expected_paths.len(),
            target_branch
        ));
    }

    Ok(VerificationResult::pass(evidence))
}

/// Resolve the tip commit of a branch, trying the local ref first and the
/// origin remote-tracking ref second (publish runs against a fetched
/// workspace clone).
fn branch_tip<'repo>(repo: &'repo Repository, name: &str) -> Option<git2::Commit<'repo>> {
    for refname in [
        format!("refs/heads/{}", name),
        format!("refs/remotes/origin/{}", name),
    ] {
        if let Ok(obj) = repo.revparse_single(&refname)
            && let Ok(commit) = obj.peel_to_commit()
        {
            return Some(commit);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        (dir, repo)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) -> String {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        let commit_id = if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap()
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap()
        };
        commit_id.to_string()
    }

    fn default_branch(repo: &Repository) -> String {
        repo.head().unwrap().shorthand().unwrap().to_string()
    }

    #[test]
    fn test_landed_commit_passes() {
        let (dir, repo) = setup_repo();
        let first = commit_file(dir.path(), "a.txt", "one", "first");
        commit_file(dir.path(), "b.txt", "two", "second");
        let branch = default_branch(&repo);

        let result = verify_merge_landed(dir.path(), &first, &branch, &[]).unwrap();
        assert!(result.passed, "{:?}", result.reason);
        assert!(!result.evidence.is_empty());
    }

    #[test]
    fn test_tip_itself_counts_as_landed() {
        let (dir, repo) = setup_repo();
        let tip = commit_file(dir.path(), "a.txt", "one", "only");
        let branch = default_branch(&repo);

        let result = verify_merge_landed(dir.path(), &tip, &branch, &[]).unwrap();
        assert!(result.passed);
    }

    #[test]
    fn test_nonexistent_commit_is_phantom() {
        let (dir, repo) = setup_repo();
        commit_file(dir.path(), "a.txt", "one", "first");
        let branch = default_branch(&repo);

        let fake = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
        let result = verify_merge_landed(dir.path(), fake, &branch, &[]).unwrap();
        assert!(!result.passed);
        assert_eq!(result.reason.unwrap().category, ReasonCategory::PhantomMerge);
    }

    #[test]
    fn test_invalid_commit_id_is_phantom() {
        let (dir, repo) = setup_repo();
        commit_file(dir.path(), "a.txt", "one", "first");
        let branch = default_branch(&repo);

        let result = verify_merge_landed(dir.path(), "not-a-sha", &branch, &[]).unwrap();
        assert!(!result.passed);
        assert_eq!(result.reason.unwrap().category, ReasonCategory::PhantomMerge);
    }

    #[test]
    fn test_rewritten_history_is_phantom() {
        // The commit exists on a side branch but the target tip no longer
        // descends from it — the platform can still report it as merged.
        let (dir, repo) = setup_repo();
        let base = commit_file(dir.path(), "a.txt", "one", "base");
        let branch = default_branch(&repo);

        // Record a commit on a side branch.
        let base_commit = repo
            .find_commit(Oid::from_str(&base).unwrap())
            .unwrap();
        repo.branch("side", &base_commit, false).unwrap();
        repo.set_head("refs/heads/side").unwrap();
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
            .unwrap();
        let side = commit_file(dir.path(), "side.txt", "side work", "side work");

        // Target branch moves on without the side commit.
        repo.set_head(&format!("refs/heads/{}", branch)).unwrap();
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
            .unwrap();
        commit_file(dir.path(), "b.txt", "two", "unrelated");

        let result = verify_merge_landed(dir.path(), &side, &branch, &[]).unwrap();
        assert!(!result.passed);
        let reason = result.reason.unwrap();
        assert_eq!(reason.category, ReasonCategory::PhantomMerge);
        assert!(reason.detail.contains("not an ancestor"));
    }

    #[test]
    fn test_missing_branch_is_phantom() {
        let (dir, _repo) = setup_repo();
        let sha = commit_file(dir.path(), "a.txt", "one", "first");

        let result = verify_merge_landed(dir.path(), &sha, "release", &[]).unwrap();
        assert!(!result.passed);
        assert!(result.reason.unwrap().detail.contains("release"));
    }

    #[test]
    fn test_expected_path_present_passes() {
        let (dir, repo) = setup_repo();
        let sha = commit_file(dir.path(), "docs.md", "notes", "add docs");
        let branch = default_branch(&repo);

        let result =
            verify_merge_landed(dir.path(), &sha, &branch, &[Path::new("docs.md")]).unwrap();
        assert!(result.passed);
        assert_eq!(result.evidence.len(), 2);
    }

    #[test]
    fn test_expected_path_missing_is_phantom() {
        let (dir, repo) = setup_repo();
        let sha = commit_file(dir.path(), "a.txt", "one", "first");
        let branch = default_branch(&repo);

        let result =
            verify_merge_landed(dir.path(), &sha, &branch, &[Path::new("CHANGELOG.md")]).unwrap();
        assert!(!result.passed);
        assert!(result.reason.unwrap().detail.contains("CHANGELOG.md"));
    }

    #[test]
    fn test_unopenable_repo_is_hard_error() {
        let dir = tempdir().unwrap();
        let result = verify_merge_landed(dir.path(), "abc", "main", &[]);
        assert!(result.is_err());
    }
}
