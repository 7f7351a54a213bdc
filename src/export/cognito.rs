//! AWS Cognito identity-pool authentication for S3 export.
//!
//! Username/password against the user pool yields an id token, which the
//! identity pool exchanges for temporary S3 credentials. Credentials are
//! cached and refreshed when they are within five minutes of expiry.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::AwsCognitoConfig;
use crate::error::{Error, Result};

/// Refresh margin before expiry, in seconds.
const REFRESH_MARGIN_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct CognitoCredentials {
    pub access_key_id: String,
    pub secret_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl CognitoCredentials {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        (self.expiration - now).num_seconds() < REFRESH_MARGIN_SECS
    }
}

pub struct CognitoAuthenticator {
    config: AwsCognitoConfig,
    http: reqwest::Client,
    cached: Mutex<Option<CognitoCredentials>>,
}

impl CognitoAuthenticator {
    pub fn new(config: AwsCognitoConfig) -> CognitoAuthenticator {
        CognitoAuthenticator {
            config,
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    /// Current credentials, authenticating or refreshing as needed.
    pub async fn credentials(&self) -> Result<CognitoCredentials> {
        let mut cached = self.cached.lock().await;
        if let Some(creds) = cached.as_ref() {
            if !creds.needs_refresh(Utc::now()) {
                return Ok(creds.clone());
            }
            debug!("AWS credentials close to expiry, refreshing");
        }
        let fresh = self.authenticate().await?;
        info!("obtained AWS credentials, valid until {}", fresh.expiration);
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    async fn cognito_call(
        &self,
        service: &str,
        target: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("https://{service}.{}.amazonaws.com/", self.config.region);
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/x-amz-json-1.1")
            .header("X-Amz-Target", target)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::CredentialsExpired {
                detail: format!("{target}: {e}"),
            })?;
        let status = response.status();
        let payload: serde_json::Value =
            response.json().await.map_err(|e| Error::CredentialsExpired {
                detail: format!("{target}: invalid response: {e}"),
            })?;
        if !status.is_success() {
            return Err(Error::CredentialsExpired {
                detail: format!(
                    "{target}: {} ({})",
                    payload["message"].as_str().unwrap_or("request failed"),
                    status
                ),
            });
        }
        Ok(payload)
    }

    async fn authenticate(&self) -> Result<CognitoCredentials> {
        let auth = self
            .cognito_call(
                "cognito-idp",
                "AWSCognitoIdentityProviderService.InitiateAuth",
                json!({
                    "AuthFlow": "USER_PASSWORD_AUTH",
                    "ClientId": self.config.app_client_id,
                    "AuthParameters": {
                        "USERNAME": self.config.username,
                        "PASSWORD": self.config.password,
                    },
                }),
            )
            .await?;
        let id_token = auth["AuthenticationResult"]["IdToken"]
            .as_str()
            .ok_or_else(|| Error::CredentialsExpired {
                detail: "InitiateAuth response carries no IdToken".to_string(),
            })?;

        let provider = format!(
            "cognito-idp.{}.amazonaws.com/{}",
            self.config.region, self.config.user_pool_id
        );
        let logins = json!({ provider.clone(): id_token });

        let identity = self
            .cognito_call(
                "cognito-identity",
                "AWSCognitoIdentityService.GetId",
                json!({
                    "AccountId": self.config.account_id,
                    "IdentityPoolId": self.config.identity_pool_id,
                    "Logins": logins,
                }),
            )
            .await?;
        let identity_id = identity["IdentityId"].as_str().ok_or_else(|| {
            Error::CredentialsExpired {
                detail: "GetId response carries no IdentityId".to_string(),
            }
        })?;

        let creds = self
            .cognito_call(
                "cognito-identity",
                "AWSCognitoIdentityService.GetCredentialsForIdentity",
                json!({
                    "IdentityId": identity_id,
                    "Logins": logins,
                }),
            )
            .await?;
        let c = &creds["Credentials"];
        let expiration_epoch = c["Expiration"].as_f64().unwrap_or(0.0);
        let expiration = Utc
            .timestamp_opt(expiration_epoch as i64, 0)
            .single()
            .unwrap_or_else(Utc::now);
        match (
            c["AccessKeyId"].as_str(),
            c["SecretKey"].as_str(),
            c["SessionToken"].as_str(),
        ) {
            (Some(access_key_id), Some(secret_key), Some(session_token)) => {
                Ok(CognitoCredentials {
                    access_key_id: access_key_id.to_string(),
                    secret_key: secret_key.to_string(),
                    session_token: session_token.to_string(),
                    expiration,
                })
            }
            _ => Err(Error::CredentialsExpired {
                detail: "GetCredentialsForIdentity response is incomplete".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn creds(expires_in_secs: i64) -> CognitoCredentials {
        CognitoCredentials {
            access_key_id: "AKIA".into(),
            secret_key: "secret".into(),
            session_token: "token".into(),
            expiration: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    #[test]
    fn refresh_window_is_five_minutes() {
        let now = Utc::now();
        assert!(creds(10).needs_refresh(now));
        assert!(creds(299).needs_refresh(now));
        assert!(!creds(301).needs_refresh(now));
        assert!(!creds(3600).needs_refresh(now));
    }
}
