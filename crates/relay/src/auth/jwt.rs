use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const IDENTITY_TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdentityClaims {
    sub: String,
    name: String,
    iat: i64,
    exp: i64,
}

/// Identity asserted by a verified token. Carries no room membership;
/// that is resolved per room by the authorization gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
}

#[derive(Clone)]
pub struct JwtIdentityService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_identity_token(
        &self,
        user_id: Uuid,
        display_name: &str,
    ) -> anyhow::Result<String> {
        self.issue_identity_token_at(user_id, display_name, current_unix_timestamp()?)
    }

    fn issue_identity_token_at(
        &self,
        user_id: Uuid,
        display_name: &str,
        issued_at: i64,
    ) -> anyhow::Result<String> {
        let claims = IdentityClaims {
            sub: user_id.to_string(),
            name: display_name.to_string(),
            iat: issued_at,
            exp: issued_at + IDENTITY_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode identity token")
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<Identity> {
        let claims = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode identity token")?
            .claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .with_context(|| format!("identity token subject '{}' is not a UUID", claims.sub))?;

        let display_name = claims.name.trim();
        if display_name.is_empty() {
            bail!("identity token carries an empty display name");
        }

        Ok(Identity { user_id, display_name: display_name.to_string() })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
