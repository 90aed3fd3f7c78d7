use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_REGISTRY: &str = "registry.ollama.ai";
pub const DEFAULT_NAMESPACE: &str = "library";
pub const DEFAULT_TAG: &str = "latest";

/// A parsed model reference: `[registry/][namespace/]name[:tag]`.
///
/// Missing parts fall back to the defaults above, so `ModelRef::parse`
/// followed by `to_string` is canonical: the full form always round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

impl ModelRef {
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::BadRequest("empty model reference".to_string()));
        }

        // The tag separator is a ':' after the last '/'.
        let (path, tag) = match s.rfind(':') {
            Some(i) if !s[i..].contains('/') => (&s[..i], &s[i + 1..]),
            _ => (s, DEFAULT_TAG),
        };

        let parts: Vec<&str> = path.split('/').collect();
        let (registry, namespace, name) = match parts.as_slice() {
            [name] => (DEFAULT_REGISTRY, DEFAULT_NAMESPACE, *name),
            [namespace, name] => (DEFAULT_REGISTRY, *namespace, *name),
            [registry, namespace, name] => (*registry, *namespace, *name),
            _ => {
                return Err(Error::BadRequest(format!(
                    "invalid model reference: {s:?}"
                )))
            }
        };

        for part in [registry, namespace, name, tag] {
            if part.is_empty() {
                return Err(Error::BadRequest(format!(
                    "invalid model reference: {s:?}"
                )));
            }
        }

        Ok(ModelRef {
            registry: registry.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }

    /// The short display form: defaults are omitted, the tag is kept.
    pub fn short_name(&self) -> String {
        let mut out = String::new();
        if self.registry != DEFAULT_REGISTRY {
            out.push_str(&self.registry);
            out.push('/');
        }
        if self.namespace != DEFAULT_NAMESPACE || self.registry != DEFAULT_REGISTRY {
            out.push_str(&self.namespace);
            out.push('/');
        }
        out.push_str(&self.name);
        out.push(':');
        out.push_str(&self.tag);
        out
    }

    /// Path components under the manifests directory.
    pub fn manifest_components(&self) -> [&str; 4] {
        [&self.registry, &self.namespace, &self.name, &self.tag]
    }

    /// `namespace/name`, the repository part of registry URLs.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.registry, self.namespace, self.name, self.tag
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults() {
        let r = ModelRef::parse("llama2").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.namespace, "library");
        assert_eq!(r.name, "llama2");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn parse_full() {
        let r = ModelRef::parse("example.com/alice/mistral:7b-q4").unwrap();
        assert_eq!(r.registry, "example.com");
        assert_eq!(r.namespace, "alice");
        assert_eq!(r.name, "mistral");
        assert_eq!(r.tag, "7b-q4");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let r = ModelRef::parse("localhost:5000/alice/mistral").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn round_trip_canonical() {
        for s in ["llama2", "alice/llama2:3b", "example.com/alice/m:t"] {
            let r = ModelRef::parse(s).unwrap();
            let again = ModelRef::parse(&r.to_string()).unwrap();
            assert_eq!(r, again);
        }
    }

    #[test]
    fn short_name_omits_defaults() {
        assert_eq!(ModelRef::parse("llama2").unwrap().short_name(), "llama2:latest");
        assert_eq!(
            ModelRef::parse("alice/llama2:3b").unwrap().short_name(),
            "alice/llama2:3b"
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(ModelRef::parse("").is_err());
        assert!(ModelRef::parse("a/b/c/d").is_err());
        assert!(ModelRef::parse("name:").is_err());
    }
}
