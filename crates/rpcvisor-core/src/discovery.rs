use crate::error::LaunchError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// First candidate path that exists, in the order given.
///
/// Fails with [`LaunchError::NotFound`] listing every path checked.
pub fn find_executable<I, P>(candidates: I) -> Result<PathBuf, LaunchError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut checked = Vec::new();
    for candidate in candidates {
        let candidate = candidate.as_ref();
        if candidate.exists() {
            debug!(path = %candidate.display(), "executable found");
            return Ok(candidate.to_path_buf());
        }
        checked.push(candidate.to_path_buf());
    }
    Err(LaunchError::NotFound {
        candidates: checked,
    })
}

/// Candidate list with an optional override taking precedence, typically
/// read from an environment variable.
pub fn candidates_with_override<P: Into<PathBuf>>(
    override_path: Option<P>,
    defaults: impl IntoIterator<Item = PathBuf>,
) -> Vec<PathBuf> {
    override_path
        .map(Into::into)
        .into_iter()
        .chain(defaults)
        .collect()
}
