//! Bearer tokens presented to the CA.
//!
//! A token is derived fresh for every CSR attempt: the platform token comes
//! from an injected [`CredentialFetcher`] or the JWT file, and is optionally
//! exchanged through an injected [`TokenExchanger`]. Nothing is cached.

use crate::error::ErrorKind;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Future returned by token collaborators.
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<String, TokenError>> + Send + 'a>>;

/// Fetches a platform identity token (e.g. a cloud metadata credential).
///
/// # Example
///
/// ```
/// use identity_agent::token::{CredentialFetcher, TokenFuture};
///
/// struct Metadata;
///
/// impl CredentialFetcher for Metadata {
///     fn fetch_token(&self) -> TokenFuture<'_> {
///         Box::pin(async { Ok("platform-token".to_owned()) })
///     }
/// }
/// ```
pub trait CredentialFetcher: Send + Sync + 'static {
    /// Returns the current platform token.
    fn fetch_token(&self) -> TokenFuture<'_>;
}

/// Exchanges a platform token for a token the CA accepts.
pub trait TokenExchanger: Send + Sync + 'static {
    /// Exchanges `subject_token`.
    fn exchange<'a>(&'a self, subject_token: &'a str) -> TokenFuture<'a>;
}

/// How an [`AuthToken`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Raw platform token (JWT file or credential fetcher).
    Jwt,
    /// Output of a [`TokenExchanger`].
    Exchanged,
    /// No token source is configured.
    None,
}

/// A bearer token. The value is zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    value: Zeroizing<String>,
    kind: TokenKind,
}

impl AuthToken {
    /// Wraps a token value.
    pub fn new(value: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            kind,
        }
    }

    /// The empty token used when no source is configured.
    pub fn none() -> Self {
        Self::new(String::new(), TokenKind::None)
    }

    /// The raw token.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// How the token was obtained.
    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    /// `true` if there is nothing to present.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("kind", &self.kind)
            .field("len", &self.value.len())
            .finish()
    }
}

/// Failure to produce a token.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The JWT file could not be read.
    #[error("failed to read token file {path}: {source}")]
    Read {
        /// Token file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The JWT file exists but is empty.
    #[error("token file {0} is empty")]
    Empty(PathBuf),

    /// The credential fetcher failed.
    #[error("credential fetch failed: {message}")]
    Fetch {
        /// Collaborator message.
        message: String,
        /// Whether a later attempt may succeed.
        retryable: bool,
    },

    /// The token exchanger failed.
    #[error("token exchange failed: {message}")]
    Exchange {
        /// Collaborator message.
        message: String,
        /// Whether a later attempt may succeed.
        retryable: bool,
    },
}

impl TokenError {
    /// Convenience constructor for a retryable fetch failure.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            retryable: true,
        }
    }

    /// Convenience constructor for a retryable exchange failure.
    pub fn exchange(message: impl Into<String>) -> Self {
        Self::Exchange {
            message: message.into(),
            retryable: true,
        }
    }

    /// `false` when the collaborator reported a permanent failure.
    ///
    /// File errors are retryable: the projected token may appear later.
    pub fn is_retryable(&self) -> bool {
        match self {
            TokenError::Read { .. } | TokenError::Empty(_) => true,
            TokenError::Fetch { retryable, .. } | TokenError::Exchange { retryable, .. } => {
                *retryable
            }
        }
    }

    /// Token failures are authentication failures from the CA's point of view.
    pub fn kind(&self) -> ErrorKind {
        if self.is_retryable() {
            ErrorKind::Unauthenticated
        } else {
            ErrorKind::Invalid
        }
    }
}

/// Produces the bearer token for the next CA attempt.
#[derive(Clone, Default)]
pub struct TokenProvider {
    jwt_path: Option<PathBuf>,
    fetcher: Option<Arc<dyn CredentialFetcher>>,
    exchanger: Option<Arc<dyn TokenExchanger>>,
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenProvider")
            .field("jwt_path", &self.jwt_path)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "<CredentialFetcher>"))
            .field(
                "exchanger",
                &self.exchanger.as_ref().map(|_| "<TokenExchanger>"),
            )
            .finish()
    }
}

impl TokenProvider {
    /// A provider that reads `jwt_path`, if set.
    pub fn new(jwt_path: Option<PathBuf>) -> Self {
        Self {
            jwt_path,
            fetcher: None,
            exchanger: None,
        }
    }

    /// Uses `fetcher` instead of the JWT file as the platform token source.
    #[must_use]
    pub fn with_fetcher(mut self, fetcher: Arc<dyn CredentialFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Exchanges the platform token through `exchanger` before use.
    #[must_use]
    pub fn with_exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = Some(exchanger);
        self
    }

    /// Derives a fresh token.
    ///
    /// Returns [`AuthToken::none`] when neither a fetcher nor a JWT path is configured.
    ///
    /// # Errors
    ///
    /// Returns a [`TokenError`] if reading, fetching or exchanging fails.
    pub async fn token(&self) -> Result<AuthToken, TokenError> {
        let subject = if let Some(fetcher) = &self.fetcher {
            Zeroizing::new(fetcher.fetch_token().await?)
        } else if let Some(path) = &self.jwt_path {
            read_token_file(path).await?
        } else {
            return Ok(AuthToken::none());
        };

        match &self.exchanger {
            Some(exchanger) => {
                let exchanged = exchanger.exchange(&subject).await?;
                Ok(AuthToken::new(exchanged, TokenKind::Exchanged))
            }
            None => Ok(AuthToken {
                value: subject,
                kind: TokenKind::Jwt,
            }),
        }
    }
}

async fn read_token_file(path: &Path) -> Result<Zeroizing<String>, TokenError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TokenError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let raw = Zeroizing::new(raw);
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TokenError::Empty(path.to_path_buf()));
    }
    Ok(Zeroizing::new(trimmed.to_owned()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFetcher {
        calls: AtomicU32,
    }

    impl CredentialFetcher for CountingFetcher {
        fn fetch_token(&self) -> TokenFuture<'_> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("platform-cred-{n}"))
            })
        }
    }

    struct PrefixExchanger;

    impl TokenExchanger for PrefixExchanger {
        fn exchange<'a>(&'a self, subject_token: &'a str) -> TokenFuture<'a> {
            Box::pin(async move { Ok(format!("exchanged:{subject_token}")) })
        }
    }

    struct FailingExchanger;

    impl TokenExchanger for FailingExchanger {
        fn exchange<'a>(&'a self, _subject_token: &'a str) -> TokenFuture<'a> {
            Box::pin(async {
                Err(TokenError::Exchange {
                    message: "audience not allowed".into(),
                    retryable: false,
                })
            })
        }
    }

    #[tokio::test]
    async fn no_source_yields_empty_token() {
        let token = TokenProvider::default().token().await.unwrap();
        assert_eq!(token.kind(), TokenKind::None);
        assert!(token.is_empty());
    }

    #[tokio::test]
    async fn jwt_file_is_reread_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "first\n").unwrap();

        let provider = TokenProvider::new(Some(path.clone()));
        let token = provider.token().await.unwrap();
        assert_eq!(token.value(), "first");
        assert_eq!(token.kind(), TokenKind::Jwt);

        std::fs::write(&path, "second").unwrap();
        assert_eq!(provider.token().await.unwrap().value(), "second");
    }

    #[tokio::test]
    async fn missing_or_empty_file_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        let err = TokenProvider::new(Some(path.clone())).token().await.unwrap_err();
        assert!(matches!(err, TokenError::Read { .. }));
        assert!(err.is_retryable());

        std::fs::write(&path, "  \n").unwrap();
        let err = TokenProvider::new(Some(path)).token().await.unwrap_err();
        assert!(matches!(err, TokenError::Empty(_)));
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn fetcher_takes_precedence_and_is_called_per_token() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
        });
        let provider = TokenProvider::new(Some("/does/not/exist".into())).with_fetcher(fetcher.clone());

        assert_eq!(provider.token().await.unwrap().value(), "platform-cred-0");
        assert_eq!(provider.token().await.unwrap().value(), "platform-cred-1");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exchanger_wraps_platform_token() {
        let provider = TokenProvider::default()
            .with_fetcher(Arc::new(CountingFetcher {
                calls: AtomicU32::new(0),
            }))
            .with_exchanger(Arc::new(PrefixExchanger));

        let token = provider.token().await.unwrap();
        assert_eq!(token.value(), "exchanged:platform-cred-0");
        assert_eq!(token.kind(), TokenKind::Exchanged);
    }

    #[tokio::test]
    async fn permanent_exchange_failure_is_not_retryable() {
        let provider = TokenProvider::default()
            .with_fetcher(Arc::new(CountingFetcher {
                calls: AtomicU32::new(0),
            }))
            .with_exchanger(Arc::new(FailingExchanger));

        let err = provider.token().await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn debug_hides_token_value() {
        let token = AuthToken::new("super-secret", TokenKind::Jwt);
        assert!(!format!("{token:?}").contains("super-secret"));
    }
}
