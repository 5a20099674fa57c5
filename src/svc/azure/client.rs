//! # Client module
//!
//! This module provide a [`DatabaseClient`] over the azure resource manager
//! rest api for `Microsoft.DBforMySQL/servers` resources.
//!
//! See following links for more details:
//! - <https://learn.microsoft.com/en-us/rest/api/mysql/singleserver/servers>
//! - <https://learn.microsoft.com/en-us/azure/active-directory/develop/v2-oauth2-client-creds-grant-flow>

use std::{
    fmt::{self, Debug, Formatter},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, trace};

use crate::svc::{
    azure::{
        Connector, DatabaseClient, Error, ObservedServer, ServerConfig, ServerRef, ServerState,
    },
    cfg,
    crd::mysql::PricingTier,
};

// -----------------------------------------------------------------------------
// Constants

pub const ACTIVE_DIRECTORY_ENDPOINT: &str = "https://login.microsoftonline.com/";
pub const RESOURCE_MANAGER_ENDPOINT: &str = "https://management.azure.com/";
pub const RESOURCE_PROVIDER: &str = "Microsoft.DBforMySQL/servers";

// -----------------------------------------------------------------------------
// AuthFile structure

/// service principal as written by `az ad sp create-for-rbac --sdk-auth`
#[derive(Deserialize, Clone)]
pub struct AuthFile {
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(
        rename = "activeDirectoryEndpointUrl",
        default = "AuthFile::default_active_directory_endpoint"
    )]
    pub active_directory_endpoint: String,
    #[serde(
        rename = "resourceManagerEndpointUrl",
        default = "AuthFile::default_resource_manager_endpoint"
    )]
    pub resource_manager_endpoint: String,
}

impl Debug for AuthFile {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("AuthFile")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("active_directory_endpoint", &self.active_directory_endpoint)
            .field("resource_manager_endpoint", &self.resource_manager_endpoint)
            .finish()
    }
}

impl AuthFile {
    fn default_active_directory_endpoint() -> String {
        ACTIVE_DIRECTORY_ENDPOINT.to_string()
    }

    fn default_resource_manager_endpoint() -> String {
        RESOURCE_MANAGER_ENDPOINT.to_string()
    }

    /// parses credential bytes, malformed credentials will not fix themselves
    /// so the error is fatal until the secret changes
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(buf)
            .map_err(|err| Error::Fatal(format!("failed to parse credentials, {err}")))
    }
}

// -----------------------------------------------------------------------------
// Wire structures

#[derive(Deserialize, Debug)]
struct Token {
    #[serde(rename = "access_token")]
    access_token: String,
}

#[derive(Deserialize, Debug)]
struct CloudErrorBody {
    #[serde(rename = "error")]
    error: CloudErrorDetail,
}

#[derive(Deserialize, Debug)]
struct CloudErrorDetail {
    #[serde(rename = "code", default)]
    code: String,
    #[serde(rename = "message", default)]
    message: String,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
struct Sku {
    #[serde(rename = "name", default)]
    name: String,
    #[serde(rename = "tier", default)]
    tier: String,
    #[serde(rename = "capacity", default)]
    capacity: i32,
    #[serde(rename = "family", default)]
    family: String,
}

impl From<&PricingTier> for Sku {
    fn from(tier: &PricingTier) -> Self {
        Self {
            name: sku_name(tier),
            tier: tier.tier.to_owned(),
            capacity: tier.vcores,
            family: tier.family.to_owned(),
        }
    }
}

#[derive(Serialize, Debug)]
struct StorageProfile {
    #[serde(rename = "storageMB")]
    storage_mb: i32,
    #[serde(rename = "backupRetentionDays")]
    backup_retention_days: i32,
    #[serde(rename = "geoRedundantBackup")]
    geo_redundant_backup: &'static str,
}

#[derive(Serialize, Debug)]
struct CreateProperties<'a> {
    #[serde(rename = "createMode")]
    create_mode: &'static str,
    #[serde(rename = "administratorLogin")]
    administrator_login: &'a str,
    #[serde(rename = "administratorLoginPassword")]
    administrator_login_password: &'a str,
    #[serde(rename = "version")]
    version: &'a str,
    #[serde(rename = "sslEnforcement")]
    ssl_enforcement: &'static str,
    #[serde(rename = "storageProfile")]
    storage_profile: StorageProfile,
}

#[derive(Serialize, Debug)]
struct CreatePayload<'a> {
    #[serde(rename = "location")]
    location: &'a str,
    #[serde(rename = "sku")]
    sku: Sku,
    #[serde(rename = "properties")]
    properties: CreateProperties<'a>,
}

#[derive(Serialize, Debug)]
struct UpdatePayload {
    #[serde(rename = "sku")]
    sku: Sku,
}

#[derive(Deserialize, Default, Debug)]
struct ServerProperties {
    #[serde(rename = "userVisibleState", default)]
    user_visible_state: Option<String>,
    #[serde(rename = "fullyQualifiedDomainName", default)]
    fully_qualified_domain_name: Option<String>,
}

#[derive(Deserialize, Debug)]
struct Server {
    #[serde(rename = "id", default)]
    id: Option<String>,
    #[serde(rename = "etag", default)]
    etag: Option<String>,
    #[serde(rename = "sku", default)]
    sku: Option<Sku>,
    #[serde(rename = "properties", default)]
    properties: ServerProperties,
}

impl Server {
    fn observe(self, fallback_id: String) -> ObservedServer {
        let state = match self.properties.user_visible_state.as_deref() {
            Some("Ready") => ServerState::Ready,
            Some(state @ ("Disabled" | "Inaccessible")) => ServerState::Failed(state.to_string()),
            Some(state) => ServerState::Provisioning(state.to_string()),
            None => ServerState::Provisioning("Unknown".to_string()),
        };

        let sku = self.sku.unwrap_or(Sku {
            name: String::new(),
            tier: String::new(),
            capacity: 0,
            family: String::new(),
        });

        ObservedServer {
            id: self.id.unwrap_or(fallback_id),
            state,
            fqdn: self.properties.fully_qualified_domain_name,
            version: self.etag,
            pricing_tier: PricingTier {
                tier: sku.tier,
                vcores: sku.capacity,
                family: sku.family,
            },
        }
    }
}

// -----------------------------------------------------------------------------
// Helpers

/// returns the sku name azure expects, e.g. `B_Gen5_1` or `GP_Gen5_4`
pub fn sku_name(tier: &PricingTier) -> String {
    let prefix = match tier.tier.to_lowercase().as_str() {
        "basic" => "B".to_string(),
        "generalpurpose" => "GP".to_string(),
        "memoryoptimized" => "MO".to_string(),
        _ => tier
            .tier
            .chars()
            .filter(char::is_ascii_uppercase)
            .collect::<String>(),
    };

    format!("{}_{}_{}", prefix, tier.family, tier.vcores)
}

/// maps an unsuccessful http status to the error taxonomy
pub fn classify(status: StatusCode, message: String) -> Error {
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            Error::Retryable(format!("{status}, {message}"))
        }
        status if status.is_server_error() => Error::Retryable(format!("{status}, {message}")),
        status if status.is_client_error() => Error::Fatal(format!("{status}, {message}")),
        status => Error::Retryable(format!("unexpected status {status}, {message}")),
    }
}

fn transport(err: reqwest::Error) -> Error {
    Error::Retryable(format!("failed to execute request, {err}"))
}

async fn failure(res: Response) -> Error {
    let status = res.status();
    let message = match res.text().await {
        Ok(body) => match serde_json::from_str::<CloudErrorBody>(&body) {
            Ok(CloudErrorBody { error }) => format!("{}: {}", error.code, error.message),
            Err(_) => body,
        },
        Err(err) => err.to_string(),
    };

    classify(status, message)
}

async fn decode<T>(res: Response) -> Result<T, Error>
where
    T: DeserializeOwned,
{
    if !res.status().is_success() {
        return Err(failure(res).await);
    }

    res.json::<T>()
        .await
        .map_err(|err| Error::Retryable(format!("failed to decode response, {err}")))
}

// -----------------------------------------------------------------------------
// AzureConnector structure

#[derive(Clone, Debug)]
pub struct AzureConnector {
    http: reqwest::Client,
    api_version: String,
}

impl AzureConnector {
    pub fn try_new(config: &cfg::Azure) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;

        Ok(Self {
            http,
            api_version: config.api_version.to_owned(),
        })
    }
}

#[async_trait]
impl Connector for AzureConnector {
    type Client = AzureClient;

    async fn connect(&self, credentials: &[u8]) -> Result<Self::Client, Error> {
        let auth = AuthFile::parse(credentials)?;
        let url = format!(
            "{}/{}/oauth2/token",
            auth.active_directory_endpoint.trim_end_matches('/'),
            auth.tenant_id
        );

        trace!(
            tenant = &auth.tenant_id,
            client = &auth.client_id,
            "Request access token for service principal",
        );

        let res = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", auth.client_id.as_str()),
                ("client_secret", auth.client_secret.as_str()),
                ("resource", auth.resource_manager_endpoint.as_str()),
            ])
            .send()
            .await
            .map_err(transport)?;

        let token: Token = decode(res).await?;

        Ok(AzureClient {
            http: self.http.to_owned(),
            token: token.access_token,
            subscription: auth.subscription_id,
            endpoint: auth.resource_manager_endpoint.trim_end_matches('/').to_string(),
            api_version: self.api_version.to_owned(),
        })
    }
}

// -----------------------------------------------------------------------------
// AzureClient structure

#[derive(Clone)]
pub struct AzureClient {
    http: reqwest::Client,
    token: String,
    subscription: String,
    endpoint: String,
    api_version: String,
}

impl Debug for AzureClient {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("AzureClient")
            .field("subscription", &self.subscription)
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl AzureClient {
    pub fn resource_id(&self, server: &ServerRef) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/{}/{}",
            self.subscription, server.resource_group, RESOURCE_PROVIDER, server.name
        )
    }

    fn request(&self, method: Method, server: &ServerRef) -> RequestBuilder {
        let url = format!(
            "{}{}?api-version={}",
            self.endpoint,
            self.resource_id(server),
            self.api_version
        );

        self.http.request(method, url).bearer_auth(&self.token)
    }
}

#[async_trait]
impl DatabaseClient for AzureClient {
    async fn create(&self, config: &ServerConfig) -> Result<String, Error> {
        match self.get(&config.server).await {
            Ok(observed) => {
                debug!(server = config.server.to_string(), "Server already exists");
                return Ok(observed.id);
            }
            Err(Error::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        let password = config.admin_password.as_deref().ok_or_else(|| {
            Error::Fatal(format!(
                "missing administrator password to create server '{}'",
                config.server
            ))
        })?;

        let payload = CreatePayload {
            location: &config.location,
            sku: Sku::from(&config.pricing_tier),
            properties: CreateProperties {
                create_mode: "Default",
                administrator_login: &config.admin_login,
                administrator_login_password: password,
                version: &config.version,
                ssl_enforcement: if config.ssl_enforced {
                    "Enabled"
                } else {
                    "Disabled"
                },
                storage_profile: StorageProfile {
                    storage_mb: config.storage.storage_mb,
                    backup_retention_days: config.storage.backup_retention_days,
                    geo_redundant_backup: if config.storage.geo_redundant_backup {
                        "Enabled"
                    } else {
                        "Disabled"
                    },
                },
            },
        };

        debug!(server = config.server.to_string(), "Create server");
        let res = self
            .request(Method::PUT, &config.server)
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;

        if !res.status().is_success() {
            return Err(failure(res).await);
        }

        Ok(self.resource_id(&config.server))
    }

    async fn get(&self, server: &ServerRef) -> Result<ObservedServer, Error> {
        let res = self
            .request(Method::GET, server)
            .send()
            .await
            .map_err(transport)?;

        let observed: Server = decode(res).await?;
        Ok(observed.observe(self.resource_id(server)))
    }

    async fn update(&self, server: &ServerRef, config: &ServerConfig) -> Result<(), Error> {
        let payload = UpdatePayload {
            sku: Sku::from(&config.pricing_tier),
        };

        debug!(
            server = server.to_string(),
            sku = &payload.sku.name,
            "Update server pricing tier",
        );

        let res = self
            .request(Method::PATCH, server)
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;

        if !res.status().is_success() {
            return Err(failure(res).await);
        }

        Ok(())
    }

    async fn delete(&self, server: &ServerRef) -> Result<(), Error> {
        debug!(server = server.to_string(), "Delete server");
        let res = self
            .request(Method::DELETE, server)
            .send()
            .await
            .map_err(transport)?;

        match res.status() {
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            _ => Err(failure(res).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(tier: &str, family: &str, vcores: i32) -> PricingTier {
        PricingTier {
            tier: tier.to_string(),
            vcores,
            family: family.to_string(),
        }
    }

    #[test]
    fn sku_names_follow_azure_convention() {
        assert_eq!(sku_name(&tier("Basic", "Gen4", 1)), "B_Gen4_1");
        assert_eq!(sku_name(&tier("GeneralPurpose", "Gen5", 4)), "GP_Gen5_4");
        assert_eq!(sku_name(&tier("MemoryOptimized", "Gen5", 8)), "MO_Gen5_8");
        assert_eq!(sku_name(&tier("Standard", "Gen4", 2)), "S_Gen4_2");
    }

    #[test]
    fn status_codes_map_to_error_taxonomy() {
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, String::new()),
            Error::NotFound(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, String::new()),
            Error::Retryable(_)
        ));
        assert!(matches!(
            classify(StatusCode::CONFLICT, String::new()),
            Error::Retryable(_)
        ));
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            Error::Retryable(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, String::new()),
            Error::Fatal(_)
        ));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, String::new()),
            Error::Fatal(_)
        ));
    }

    #[test]
    fn server_payload_is_observed() {
        let server: Server = serde_json::from_value(serde_json::json!({
            "id": "/subscriptions/sub/resourceGroups/group/providers/Microsoft.DBforMySQL/servers/mysql-1",
            "sku": { "name": "B_Gen4_1", "tier": "Basic", "capacity": 1, "family": "Gen4" },
            "properties": {
                "userVisibleState": "Ready",
                "fullyQualifiedDomainName": "mysql-1.mysql.database.azure.com"
            }
        }))
        .unwrap();

        let observed = server.observe("fallback".to_string());
        assert_eq!(observed.state, ServerState::Ready);
        assert_eq!(
            observed.fqdn.as_deref(),
            Some("mysql-1.mysql.database.azure.com")
        );
        assert_eq!(observed.pricing_tier, tier("Basic", "Gen4", 1));
        assert!(observed.id.ends_with("/servers/mysql-1"));
    }

    #[test]
    fn unknown_states_are_provisioning() {
        for (state, expected) in [
            ("Dropping", ServerState::Provisioning("Dropping".to_string())),
            ("Disabled", ServerState::Failed("Disabled".to_string())),
            ("Inaccessible", ServerState::Failed("Inaccessible".to_string())),
        ] {
            let server: Server = serde_json::from_value(serde_json::json!({
                "properties": { "userVisibleState": state }
            }))
            .unwrap();

            let observed = server.observe("fallback".to_string());
            assert_eq!(observed.state, expected);
            assert_eq!(observed.id, "fallback");
        }
    }

    #[test]
    fn auth_file_defaults_endpoints() {
        let auth = AuthFile::parse(
            br#"{"clientId":"id","clientSecret":"s3cr3t","subscriptionId":"sub","tenantId":"tenant"}"#,
        )
        .unwrap();

        assert_eq!(auth.active_directory_endpoint, ACTIVE_DIRECTORY_ENDPOINT);
        assert_eq!(auth.resource_manager_endpoint, RESOURCE_MANAGER_ENDPOINT);
        assert!(!format!("{auth:?}").contains("s3cr3t"));
    }

    #[test]
    fn malformed_credentials_are_fatal() {
        assert!(matches!(
            AuthFile::parse(b"not json"),
            Err(Error::Fatal(_))
        ));
    }
}
