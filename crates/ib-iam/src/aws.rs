//! AWS IAM provider and STS key-pair verifier
//!
//! Both authenticate with a static key pair rather than the default provider
//! chain: the listing client uses the bridge's configured pair, the verifier
//! signs one `GetCallerIdentity` request with the pair submitted at bind time.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_iam::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_iam::Client as IamClient;
use aws_sdk_sts::Client as StsClient;
use ib_common::{AccessKeyMetadata, AccessKeyStatus, IamGroup, IamRole, IamUser, Page};
use tracing::{debug, info};

use crate::{is_rejection_code, IamError, IdentityProvider, KeyPairVerifier, Result, StaticCredentials};

const CREDENTIALS_SOURCE: &str = "iam-bridge-static";

async fn load_sdk_config(region: String) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region))
        .load()
        .await
}

/// Map an SDK failure onto the adapter's error kinds.
fn map_sdk_error<E, R>(err: SdkError<E, R>) -> IamError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            IamError::Unavailable(message)
        }
        _ => classify_code(err.code(), message),
    }
}

fn classify_code(code: Option<&str>, message: String) -> IamError {
    match code {
        Some(code) if is_rejection_code(code) => IamError::InvalidCredentials(message),
        Some("Throttling") | Some("ServiceUnavailable") | Some("RequestTimeout") => {
            IamError::Unavailable(message)
        }
        _ => IamError::Service(message),
    }
}

/// IAM listing client
pub struct AwsIdentityProvider {
    client: IamClient,
}

impl AwsIdentityProvider {
    /// Create a provider authenticating with the given static pair.
    pub async fn new(credentials: &StaticCredentials, region: String) -> Self {
        let sdk_config = load_sdk_config(region.clone()).await;
        let config = aws_sdk_iam::config::Builder::from(&sdk_config)
            .credentials_provider(aws_sdk_iam::config::Credentials::new(
                credentials.access_key(),
                credentials.secret_key(),
                None,
                None,
                CREDENTIALS_SOURCE,
            ))
            .build();

        info!(region = %region, access_key = %credentials.access_key(), "Initialized AWS IAM provider");
        Self { client: IamClient::from_conf(config) }
    }
}

#[async_trait]
impl IdentityProvider for AwsIdentityProvider {
    async fn list_groups(&self, marker: Option<String>) -> Result<Page<IamGroup>> {
        let out = self
            .client
            .list_groups()
            .set_marker(marker)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let items = out
            .groups()
            .iter()
            .map(|g| IamGroup {
                group_name: g.group_name().to_string(),
                group_id: g.group_id().to_string(),
                arn: g.arn().to_string(),
                path: g.path().to_string(),
            })
            .collect();
        debug!(truncated = out.is_truncated(), "Listed IAM groups page");
        Ok(to_page(items, out.is_truncated(), out.marker()))
    }

    async fn list_users(&self, marker: Option<String>) -> Result<Page<IamUser>> {
        let out = self
            .client
            .list_users()
            .set_marker(marker)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let items = out
            .users()
            .iter()
            .map(|u| IamUser {
                user_name: u.user_name().to_string(),
                user_id: u.user_id().to_string(),
                arn: u.arn().to_string(),
                path: u.path().to_string(),
            })
            .collect();
        debug!(truncated = out.is_truncated(), "Listed IAM users page");
        Ok(to_page(items, out.is_truncated(), out.marker()))
    }

    async fn list_roles(&self, marker: Option<String>) -> Result<Page<IamRole>> {
        let out = self
            .client
            .list_roles()
            .set_marker(marker)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let items = out
            .roles()
            .iter()
            .map(|r| IamRole {
                role_name: r.role_name().to_string(),
                role_id: r.role_id().to_string(),
                arn: r.arn().to_string(),
                path: r.path().to_string(),
            })
            .collect();
        Ok(to_page(items, out.is_truncated(), out.marker()))
    }

    async fn list_groups_for_user(&self, user_name: &str) -> Result<Vec<IamGroup>> {
        let out = self
            .client
            .list_groups_for_user()
            .user_name(user_name)
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(out
            .groups()
            .iter()
            .map(|g| IamGroup {
                group_name: g.group_name().to_string(),
                group_id: g.group_id().to_string(),
                arn: g.arn().to_string(),
                path: g.path().to_string(),
            })
            .collect())
    }

    async fn list_access_keys(&self, user_name: &str) -> Result<Vec<AccessKeyMetadata>> {
        let out = self
            .client
            .list_access_keys()
            .user_name(user_name)
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(out
            .access_key_metadata()
            .iter()
            .filter_map(|k| {
                let id = k.access_key_id()?;
                let status = k
                    .status()
                    .map(|s| AccessKeyStatus::from(s.as_str()))
                    .unwrap_or(AccessKeyStatus::Inactive);
                Some(AccessKeyMetadata { access_key_id: id.to_string(), status })
            })
            .collect())
    }
}

fn to_page<T>(items: Vec<T>, truncated: bool, marker: Option<&str>) -> Page<T> {
    match (truncated, marker) {
        (true, Some(marker)) => Page::continued(items, marker),
        _ => Page::last(items),
    }
}

/// Verifies a submitted key pair by signing an STS `GetCallerIdentity` call.
pub struct StsKeyPairVerifier {
    sdk_config: SdkConfig,
}

impl StsKeyPairVerifier {
    pub async fn new(region: String) -> Self {
        let sdk_config = load_sdk_config(region.clone()).await;
        info!(region = %region, "Initialized STS key pair verifier");
        Self { sdk_config }
    }
}

#[async_trait]
impl KeyPairVerifier for StsKeyPairVerifier {
    async fn verify(&self, access_key: &str, secret_key: &str) -> Result<bool> {
        let config = aws_sdk_sts::config::Builder::from(&self.sdk_config)
            .credentials_provider(aws_sdk_sts::config::Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                CREDENTIALS_SOURCE,
            ))
            .build();
        let client = StsClient::from_conf(config);

        match client.get_caller_identity().send().await {
            Ok(identity) => {
                debug!(access_key = %access_key, arn = ?identity.arn(), "Key pair accepted");
                Ok(true)
            }
            Err(err) => match map_sdk_error(err) {
                IamError::InvalidCredentials(message) => {
                    debug!(access_key = %access_key, error = %message, "Key pair rejected");
                    Ok(false)
                }
                IamError::Service(message) => Err(IamError::Unavailable(message)),
                other => Err(other),
            },
        }
    }
}
