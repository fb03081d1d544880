//! Container image reference and service account name parsing.

use serde::Serialize;

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";
const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// A parsed, normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageReference {
    pub image: String,
    pub registry: String,
    pub repository: String,
    pub identifier: String,
    pub tag: String,
    pub digest: String,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self, String> {
        if reference.is_empty() {
            return Err("image reference is empty".to_string());
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(format!("invalid image reference {:?}: contains whitespace", reference));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(format!("invalid digest in image reference {:?}", reference));
                }
                (name, digest.to_string())
            }
            None => (reference, String::new()),
        };

        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], name[last_slash + i + 1..].to_string()),
            None => (name, String::new()),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };

        if repository.is_empty()
            || repository.split('/').any(str::is_empty)
            || repository.chars().any(|c| c.is_ascii_uppercase())
        {
            return Err(format!("invalid repository in image reference {:?}", reference));
        }

        let tag = if tag.is_empty() && digest.is_empty() {
            DEFAULT_TAG.to_string()
        } else {
            tag
        };
        let identifier = if digest.is_empty() { tag.clone() } else { digest.clone() };

        let mut image = format!("{}/{}", registry, repository);
        if !tag.is_empty() {
            image.push(':');
            image.push_str(&tag);
        }
        if !digest.is_empty() {
            image.push('@');
            image.push_str(&digest);
        }

        Ok(Self {
            image,
            registry,
            repository,
            identifier,
            tag,
            digest,
        })
    }
}

/// Split `system:serviceaccount:<namespace>:<name>` into its parts.
pub fn parse_service_account(username: &str) -> Option<(String, String)> {
    let rest = username.strip_prefix(SERVICE_ACCOUNT_PREFIX)?;
    let (namespace, name) = rest.split_once(':')?;
    if namespace.is_empty() || name.is_empty() || name.contains(':') {
        return None;
    }
    Some((namespace.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_defaults() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.image, "docker.io/library/nginx:latest");
    }

    #[test]
    fn test_registry_with_port_and_digest() {
        let r = ImageReference::parse("localhost:5000/team/app:v1@sha256:abcd").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, "v1");
        assert_eq!(r.digest, "sha256:abcd");
        assert_eq!(r.identifier, "sha256:abcd");
    }

    #[test]
    fn test_invalid_references() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("Nginx").is_err());
        assert!(ImageReference::parse("ghcr.io//app").is_err());
        assert!(ImageReference::parse("app@nodigest").is_err());
    }

    #[test]
    fn test_service_account() {
        assert_eq!(
            parse_service_account("system:serviceaccount:kube-system:deployer"),
            Some(("kube-system".to_string(), "deployer".to_string()))
        );
        assert_eq!(parse_service_account("alice"), None);
        assert_eq!(parse_service_account("system:serviceaccount:ns"), None);
    }
}
