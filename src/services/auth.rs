use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error};

pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

const ENV_SESSION_TOKEN: &str = "PALGATE_SESSION_TOKEN";
const ENV_USER_ID: &str = "PALGATE_USER_ID";
const ENV_TOKEN_TYPE: &str = "PALGATE_TOKEN_TYPE";

/// Kind of session the shared secret belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "TokenKindRepr")]
pub enum TokenKind {
    Sms,
    Primary,
    Secondary,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenKindRepr {
    Code(i64),
    Name(String),
}

impl TryFrom<TokenKindRepr> for TokenKind {
    type Error = String;

    fn try_from(repr: TokenKindRepr) -> Result<Self, Self::Error> {
        match repr {
            TokenKindRepr::Code(0) => Ok(TokenKind::Sms),
            TokenKindRepr::Code(1) => Ok(TokenKind::Primary),
            TokenKindRepr::Code(2) => Ok(TokenKind::Secondary),
            TokenKindRepr::Code(other) => Err(format!("unknown token type code: {other}")),
            TokenKindRepr::Name(name) => match name.trim().to_lowercase().as_str() {
                "0" | "sms" => Ok(TokenKind::Sms),
                "1" | "primary" => Ok(TokenKind::Primary),
                "2" | "secondary" => Ok(TokenKind::Secondary),
                _ => Err(format!("unknown token type: {name}")),
            },
        }
    }
}

impl TokenKind {
    pub fn code(self) -> u8 {
        match self {
            TokenKind::Sms => 0,
            TokenKind::Primary => 1,
            TokenKind::Secondary => 2,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The vendor token primitive: shared secret + account id + kind -> bearer token.
#[async_trait]
pub trait TokenGenerator: Send + Sync {
    async fn generate(&self, secret: &[u8], user_id: u64, kind: TokenKind) -> Result<String>;
}

/// Delegates token generation to an external program.
///
/// The inputs are passed as `PALGATE_SESSION_TOKEN` (hex), `PALGATE_USER_ID`
/// and `PALGATE_TOKEN_TYPE` environment variables rather than arguments so the
/// secret does not show up in process listings. The trimmed stdout is the token.
pub struct CommandTokenGenerator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandTokenGenerator {
    pub fn new(command_line: &str, timeout: Duration) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("Token command is empty"))?;

        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }
}

#[async_trait]
impl TokenGenerator for CommandTokenGenerator {
    async fn generate(&self, secret: &[u8], user_id: u64, kind: TokenKind) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(ENV_SESSION_TOKEN, hex::encode(secret))
            .env(ENV_USER_ID, user_id.to_string())
            .env(ENV_TOKEN_TYPE, kind.to_string())
            .kill_on_drop(true);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Token command timed out after {} seconds",
                    self.timeout.as_secs()
                )
            })?
            .with_context(|| format!("Failed to execute token command `{}`", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Token command failed with status {}: {}",
                output.status,
                stderr.trim()
            );
        }

        let token = String::from_utf8(output.stdout)
            .context("Token command output is not valid UTF-8")?
            .trim()
            .to_string();
        if token.is_empty() {
            anyhow::bail!("Token command returned an empty token");
        }

        Ok(token)
    }
}

/// Mints a fresh bearer token for every poll. Tokens are short-lived and
/// never cached.
#[derive(Clone)]
pub struct AuthTokenProvider {
    generator: Arc<dyn TokenGenerator>,
    secret: Vec<u8>,
    user_id: u64,
    kind: TokenKind,
}

impl AuthTokenProvider {
    pub fn new(
        generator: Arc<dyn TokenGenerator>,
        secret: Vec<u8>,
        user_id: u64,
        kind: TokenKind,
    ) -> Self {
        Self {
            generator,
            secret,
            user_id,
            kind,
        }
    }

    /// Generation failures are logged and yield an empty token, so they
    /// surface as an authentication error from the feed.
    pub async fn token(&self) -> String {
        match self
            .generator
            .generate(&self.secret, self.user_id, self.kind)
            .await
        {
            Ok(token) => {
                debug!(fingerprint = %fingerprint(&token), "Minted feed token");
                token
            }
            Err(e) => {
                error!(error = %e, "Token generation failed");
                String::new()
            }
        }
    }
}

/// Short SHA-256 digest of a token, safe to log.
pub fn fingerprint(token: &str) -> String {
    let hash = Sha256::digest(token.as_bytes());
    hex::encode(&hash[..8])
}
