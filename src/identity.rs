//! Workload identities in SPIFFE URI form.
//!
//! The CA binds every issued certificate to a URI SAN of the shape
//! `spiffe://<trust-domain>/ns/<namespace>/sa/<service-account>`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const SCHEME_PREFIX: &str = "spiffe://";

const VALID_TRUST_DOMAIN_CHARS: &str = "abcdefghijklmnopqrstuvwxyz0123456789-._";
const VALID_SEGMENT_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._";

/// A SPIFFE ID such as `spiffe://cluster.local/ns/default/sa/bookinfo`.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SpiffeId {
    trust_domain: TrustDomain,
    path: String,
}

/// The authority component of a [`SpiffeId`].
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrustDomain {
    name: String,
}

/// An error that can arise parsing or building an identity.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum IdentityError {
    /// Empty input.
    #[error("identity cannot be empty")]
    Empty,

    /// The trust domain component is missing.
    #[error("trust domain is missing")]
    MissingTrustDomain,

    /// The input does not start with `spiffe://`.
    #[error("scheme is missing or invalid")]
    WrongScheme,

    /// The trust domain contains a character outside its allowed set.
    #[error(
        "trust domain characters are limited to lowercase letters, numbers, dots, dashes, and \
         underscores"
    )]
    BadTrustDomainChar,

    /// A path segment contains a character outside its allowed set.
    #[error(
        "path segment characters are limited to letters, numbers, dots, dashes, and underscores"
    )]
    BadPathSegmentChar,

    /// Path contains `//` or an empty segment.
    #[error("path cannot contain empty segments")]
    EmptySegment,

    /// Path contains `.` or `..`.
    #[error("path cannot contain dot segments")]
    DotSegment,

    /// Path ends with `/`.
    #[error("path cannot have a trailing slash")]
    TrailingSlash,
}

impl SpiffeId {
    /// Parses a SPIFFE ID.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] describing the first violation found.
    ///
    /// # Examples
    ///
    /// ```
    /// use identity_agent::identity::SpiffeId;
    ///
    /// let id = SpiffeId::new("spiffe://cluster.local/ns/default/sa/default").unwrap();
    /// assert_eq!("cluster.local", id.trust_domain().to_string());
    /// assert_eq!("/ns/default/sa/default", id.path());
    /// ```
    pub fn new(id: &str) -> Result<Self, IdentityError> {
        if id.is_empty() {
            return Err(IdentityError::Empty);
        }
        let rest = id
            .strip_prefix(SCHEME_PREFIX)
            .ok_or(IdentityError::WrongScheme)?;

        let split = rest.find('/').unwrap_or(rest.len());
        if split == 0 {
            return Err(IdentityError::MissingTrustDomain);
        }

        let trust_domain = TrustDomain::new(&rest[..split])?;
        let path = &rest[split..];
        if !path.is_empty() {
            validate_path(path)?;
        }

        Ok(Self {
            trust_domain,
            path: path.to_owned(),
        })
    }

    /// Builds the identity the CA issues for a Kubernetes-style workload.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] if the namespace or service account is not a
    /// valid path segment.
    ///
    /// # Examples
    ///
    /// ```
    /// use identity_agent::identity::{SpiffeId, TrustDomain};
    ///
    /// let td = TrustDomain::new("cluster.local").unwrap();
    /// let id = SpiffeId::for_workload(&td, "bookinfo", "reviews").unwrap();
    /// assert_eq!(id.to_string(), "spiffe://cluster.local/ns/bookinfo/sa/reviews");
    /// ```
    pub fn for_workload(
        trust_domain: &TrustDomain,
        namespace: &str,
        service_account: &str,
    ) -> Result<Self, IdentityError> {
        Self::from_segments(trust_domain.clone(), &["ns", namespace, "sa", service_account])
    }

    /// Joins validated path segments under `trust_domain`.
    ///
    /// # Errors
    ///
    /// Returns an [`IdentityError`] if a segment is empty, a dot segment, or
    /// contains a disallowed character (including `/`).
    pub fn from_segments(
        trust_domain: TrustDomain,
        segments: &[&str],
    ) -> Result<Self, IdentityError> {
        let mut path = String::new();
        for segment in segments {
            validate_segment(segment)?;
            path.push('/');
            path.push_str(segment);
        }
        Ok(Self { trust_domain, path })
    }

    /// Returns the trust domain.
    pub fn trust_domain(&self) -> &TrustDomain {
        &self.trust_domain
    }

    /// Returns the path, including its leading `/` (empty for a bare trust domain ID).
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}{}", self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = IdentityError;

    fn from_str(id: &str) -> Result<Self, Self::Err> {
        Self::new(id)
    }
}

impl TryFrom<&str> for SpiffeId {
    type Error = IdentityError;

    fn try_from(id: &str) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl TrustDomain {
    /// Validates a trust domain name such as `cluster.local`.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::MissingTrustDomain`] for an empty name and
    /// [`IdentityError::BadTrustDomainChar`] for disallowed characters.
    pub fn new(name: &str) -> Result<Self, IdentityError> {
        if name.is_empty() {
            return Err(IdentityError::MissingTrustDomain);
        }
        if !name.chars().all(|c| VALID_TRUST_DOMAIN_CHARS.contains(c)) {
            return Err(IdentityError::BadTrustDomainChar);
        }
        Ok(Self {
            name: name.to_owned(),
        })
    }
}

impl fmt::Display for TrustDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for TrustDomain {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl FromStr for TrustDomain {
    type Err = IdentityError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::new(name)
    }
}

fn validate_path(path: &str) -> Result<(), IdentityError> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(IdentityError::EmptySegment);
    };
    if rest.is_empty() || rest.ends_with('/') {
        return Err(IdentityError::TrailingSlash);
    }
    rest.split('/').try_for_each(validate_segment)
}

fn validate_segment(segment: &str) -> Result<(), IdentityError> {
    match segment {
        "" => Err(IdentityError::EmptySegment),
        "." | ".." => Err(IdentityError::DotSegment),
        s if !s.chars().all(|c| VALID_SEGMENT_CHARS.contains(c)) => {
            Err(IdentityError::BadPathSegmentChar)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_workload_identity() {
        let id = SpiffeId::new("spiffe://cluster.local/ns/default/sa/default").unwrap();
        assert_eq!(id.trust_domain().as_ref(), "cluster.local");
        assert_eq!(id.path(), "/ns/default/sa/default");
        assert_eq!(id.to_string(), "spiffe://cluster.local/ns/default/sa/default");
    }

    #[test]
    fn parses_bare_trust_domain() {
        let id = SpiffeId::new("spiffe://example.org").unwrap();
        assert_eq!(id.path(), "");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert_eq!(SpiffeId::new(""), Err(IdentityError::Empty));
        assert_eq!(
            SpiffeId::new("https://example.org/a"),
            Err(IdentityError::WrongScheme)
        );
        assert_eq!(
            SpiffeId::new("spiffe:///path"),
            Err(IdentityError::MissingTrustDomain)
        );
        assert_eq!(
            SpiffeId::new("spiffe://Example.org/a"),
            Err(IdentityError::BadTrustDomainChar)
        );
        assert_eq!(
            SpiffeId::new("spiffe://example.org/a//b"),
            Err(IdentityError::EmptySegment)
        );
        assert_eq!(
            SpiffeId::new("spiffe://example.org/a/../b"),
            Err(IdentityError::DotSegment)
        );
        assert_eq!(
            SpiffeId::new("spiffe://example.org/a/"),
            Err(IdentityError::TrailingSlash)
        );
        assert_eq!(
            SpiffeId::new("spiffe://example.org/a b"),
            Err(IdentityError::BadPathSegmentChar)
        );
    }

    #[test]
    fn workload_identity_rejects_separator_in_segment() {
        let td = TrustDomain::new("cluster.local").unwrap();
        assert_eq!(
            SpiffeId::for_workload(&td, "a/b", "sa"),
            Err(IdentityError::BadPathSegmentChar)
        );
        assert_eq!(
            SpiffeId::for_workload(&td, "", "sa"),
            Err(IdentityError::EmptySegment)
        );
    }

    #[test]
    fn workload_identity_round_trips_through_parse() {
        let td = TrustDomain::new("cluster.local").unwrap();
        let built = SpiffeId::for_workload(&td, "bookinfo", "reviews").unwrap();
        let parsed: SpiffeId = built.to_string().parse().unwrap();
        assert_eq!(built, parsed);
    }
}
