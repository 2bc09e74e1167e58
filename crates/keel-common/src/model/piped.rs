use serde::{Deserialize, Serialize};

use crate::cache::CryptoHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipedConnectionStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecretManagementType {
    None,
    KeyPair,
    GcpKms,
    AwsKms,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipedPlatformProvider {
    pub name: String,
    pub r#type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipedRepository {
    pub id: String,
    pub remote: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipedSecretEncryption {
    pub r#type: SecretManagementType,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub encrypt_service_account: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Piped {
    pub id: String,
    pub name: String,
    pub project_id: String,
    /// Hex sha256 of the piped key; the plain key is never stored.
    pub key_hash: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub desired_version: String,
    #[serde(default)]
    pub status: PipedConnectionStatus,
    #[serde(default)]
    pub platform_providers: Vec<PipedPlatformProvider>,
    #[serde(default)]
    pub repositories: Vec<PipedRepository>,
    #[serde(default)]
    pub secret_encryption: Option<PipedSecretEncryption>,
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl Piped {
    pub fn hash_key(key: &str) -> String {
        key.crypto_hash()
    }

    pub fn check_key(&self, key: &str) -> bool {
        !self.key_hash.is_empty() && Self::hash_key(key) == self.key_hash
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: String,
    pub name: String,
    pub project_id: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipedStat {
    pub piped_id: String,
    /// Prometheus text exposition of the agent's metrics.
    #[serde(default)]
    pub metrics: String,
    pub timestamp: i64,
}
