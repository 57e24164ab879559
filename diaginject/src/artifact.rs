//! Artifact path discovery in helper output.

use diaginject_shared::constants::helper::{ARTIFACT_PREFIX, ARTIFACT_SUFFIX};

/// Find the artifact path the helper printed on stdout.
///
/// The first line holding [`ARTIFACT_PREFIX`] followed (at or after it) by
/// [`ARTIFACT_SUFFIX`] wins; the returned slice runs from the first prefix
/// occurrence to the end of the first suffix after it. Returns `""` when no
/// line matches.
pub fn find_artifact_path(stdout: &str) -> &str {
    for line in stdout.lines() {
        let Some(start) = line.find(ARTIFACT_PREFIX) else {
            continue;
        };
        if let Some(offset) = line[start..].find(ARTIFACT_SUFFIX) {
            return &line[start..start + offset + ARTIFACT_SUFFIX.len()];
        }
    }
    ""
}
