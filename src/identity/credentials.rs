//! Session artifact lookup.
//!
//! Identities are configured with a session reference that may be a bare
//! name (`interactive_call_session`), a name with or without the `.session`
//! extension, or a full path. Container images mount sessions under `/app`
//! or `/home/bot`, so those directories are searched as a fallback.

use std::path::{Path, PathBuf};

use super::IdentityKind;
use crate::error::CallError;
use crate::transport::Credentials;

const FALLBACK_DIRS: [&str; 2] = ["/app", "/home/bot"];

/// Every path that may hold the session, most specific first.
pub fn candidate_paths(session: &str) -> Vec<PathBuf> {
    let given = PathBuf::from(session.trim());
    let mut local = vec![given.clone()];
    if given.extension().map_or(true, |ext| ext != "session") {
        let mut appended = given.clone().into_os_string();
        appended.push(".session");
        local.push(PathBuf::from(appended));
        local.push(given.with_extension("session"));
    }

    let mut candidates = local.clone();
    for dir in FALLBACK_DIRS {
        for path in &local {
            if let Some(name) = path.file_name() {
                candidates.push(Path::new(dir).join(name));
            }
        }
    }

    let mut seen = Vec::with_capacity(candidates.len());
    for path in candidates {
        if !seen.contains(&path) {
            seen.push(path);
        }
    }
    seen
}

fn usable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Find the session artifact for an identity.
///
/// Missing or empty files are an authentication error: the identity cannot
/// log in without a pre-authenticated session.
pub fn resolve(kind: IdentityKind, session: &str) -> Result<Credentials, CallError> {
    let candidates = candidate_paths(session);
    match candidates.iter().find(|path| usable(path)) {
        Some(path) => Ok(Credentials {
            kind,
            session_path: path.clone(),
        }),
        None => Err(CallError::Auth(format!(
            "no usable {} session found (tried {})",
            kind.as_str(),
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_candidates_for_bare_name() {
        let candidates = candidate_paths("interactive_call_session");
        assert_eq!(candidates[0], PathBuf::from("interactive_call_session"));
        assert_eq!(candidates[1], PathBuf::from("interactive_call_session.session"));
        assert!(candidates.contains(&PathBuf::from("/app/interactive_call_session.session")));
        assert!(candidates.contains(&PathBuf::from("/home/bot/interactive_call_session.session")));
    }

    #[test]
    fn test_candidates_for_dotted_name() {
        // "user.v2" gets both "user.v2.session" and "user.session"
        let candidates = candidate_paths("user.v2");
        assert!(candidates.contains(&PathBuf::from("user.v2.session")));
        assert!(candidates.contains(&PathBuf::from("user.session")));
        let unique: std::collections::HashSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
    }

    #[test]
    fn test_resolves_suffixed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caller.session");
        fs::write(&path, b"session-bytes").unwrap();

        let bare = dir.path().join("caller");
        let credentials = resolve(IdentityKind::User, bare.to_str().unwrap()).unwrap();
        assert_eq!(credentials.session_path, path);
        assert_eq!(credentials.kind, IdentityKind::User);
    }

    #[test]
    fn test_empty_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.session");
        fs::write(&path, b"").unwrap();

        let err = resolve(IdentityKind::Bot, path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, CallError::Auth(_)));
    }
}
