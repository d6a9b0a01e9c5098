use anyhow::{Result, bail};
use std::fmt;

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const OFFICIAL_NAMESPACE: &str = "library";

/// Normalised image reference.
///
/// `redis`, `redis:latest` and `docker.io/library/redis:latest` all name the
/// same image; the local image list reports the short ("familiar") form while
/// pulls and creates use the canonical one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    registry: String,
    repository: String,
    tag: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            bail!("empty image reference");
        }
        if reference.contains('@') {
            bail!("digest references are not supported: {reference}");
        }
        if reference.chars().any(char::is_whitespace) {
            bail!("invalid image reference: {reference}");
        }

        let (registry, remainder) = match reference.split_once('/') {
            Some((first, rest)) if is_registry(first) => (first.to_string(), rest),
            _ => (DEFAULT_REGISTRY.to_string(), reference),
        };

        // A ':' after the last '/' is a tag, anything before belongs to a registry port.
        let last_slash = remainder.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (path, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], &remainder[split + 1..])
            }
            None => (remainder, DEFAULT_TAG),
        };

        if path.is_empty() || tag.is_empty() || path.split('/').any(str::is_empty) {
            bail!("invalid image reference: {reference}");
        }

        let repository = if registry == DEFAULT_REGISTRY && !path.contains('/') {
            format!("{OFFICIAL_NAMESPACE}/{path}")
        } else {
            path.to_string()
        };

        Ok(Self {
            registry,
            repository,
            tag: tag.to_string(),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Short form as reported in local image tags, e.g. `redis:4`.
    pub fn familiar(&self) -> String {
        if self.registry == DEFAULT_REGISTRY {
            let repo = self
                .repository
                .strip_prefix(&format!("{OFFICIAL_NAMESPACE}/"))
                .unwrap_or(&self.repository);
            format!("{repo}:{}", self.tag)
        } else {
            self.canonical()
        }
    }

    /// Fully qualified form, e.g. `docker.io/library/redis:4`.
    pub fn canonical(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }

    /// Whether a tag from the local image list names this image.
    pub fn matches_tag(&self, repo_tag: &str) -> bool {
        repo_tag == self.familiar() || repo_tag == self.canonical()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.familiar())
    }
}

fn is_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}
