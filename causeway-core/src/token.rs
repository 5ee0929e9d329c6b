//! Bearer credential acquisition for the tunnel upgrade.
//!
//! A configured id token is used verbatim; otherwise an identity token is
//! minted for a service account through the IAM credentials API, calling it
//! with ambient cloud credentials discovered from the environment.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const IAM_CREDENTIALS_ENDPOINT: &str = "https://iamcredentials.googleapis.com/v1";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Where the upgrade bearer token comes from.
///
/// The token is acquired once per process start and never cached, refreshed
/// or retried; a tunnel performs exactly one upgrade.
#[derive(Debug, Clone, Default)]
pub struct TokenSource {
    /// Literal identity token, presented unchanged.
    pub id_token: Option<String>,
    /// Service account to mint an identity token for.
    pub service_account: Option<String>,
    /// Explicit token audience; the remote URL is used when absent.
    pub client_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateIdTokenRequest<'a> {
    audience: &'a str,
    include_email: bool,
}

#[derive(Deserialize)]
struct GenerateIdTokenResponse {
    token: String,
}

impl TokenSource {
    /// Resolve the bearer token for one upgrade attempt.
    ///
    /// A literal id token wins outright and involves no network activity.
    /// With neither source configured this fails before any socket work.
    pub async fn bearer(&self, remote: &str) -> Result<String> {
        if let Some(token) = &self.id_token {
            return Ok(token.clone());
        }

        let Some(service_account) = &self.service_account else {
            return Err(Error::MissingCredential);
        };

        mint_id_token(service_account, self.audience(remote)).await
    }

    /// The audience claim for a minted token: the explicit client id when
    /// configured, else the remote URL string verbatim.
    fn audience<'a>(&'a self, remote: &'a str) -> &'a str {
        match &self.client_id {
            Some(client_id) if !client_id.is_empty() => client_id,
            _ => remote,
        }
    }
}

/// One `generateIdToken` RPC against the IAM credentials service.
async fn mint_id_token(service_account: &str, audience: &str) -> Result<String> {
    let provider = gcp_auth::provider()
        .await
        .map_err(|e| Error::Token(format!("ambient credentials unavailable: {e}")))?;
    let access = provider
        .token(&[CLOUD_PLATFORM_SCOPE])
        .await
        .map_err(|e| Error::Token(format!("access token refresh failed: {e}")))?;

    let name = format!("projects/-/serviceAccounts/{service_account}");
    debug!(%name, %audience, "minting identity token");

    let response = reqwest::Client::new()
        .post(format!("{IAM_CREDENTIALS_ENDPOINT}/{name}:generateIdToken"))
        .bearer_auth(access.as_str())
        .json(&GenerateIdTokenRequest {
            audience,
            include_email: true,
        })
        .send()
        .await
        .map_err(|e| Error::Token(format!("iam request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::Token(format!(
            "iam returned {} for {}",
            response.status(),
            name
        )));
    }

    let body: GenerateIdTokenResponse = response
        .json()
        .await
        .map_err(|e| Error::Token(format!("malformed iam response: {e}")))?;
    Ok(body.token)
}
