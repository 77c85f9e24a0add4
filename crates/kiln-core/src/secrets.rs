//! Secret decryption boundary.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Turns stored secret values back into plaintext.
#[async_trait]
pub trait SecretCipher: Send + Sync {
    async fn decrypt(&self, value: &str) -> Result<String>;

    async fn decrypt_all(
        &self,
        secrets: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for (key, value) in secrets {
            out.insert(key.clone(), self.decrypt(value).await?);
        }
        Ok(out)
    }
}

/// Cipher for stores that keep secrets in plaintext.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextCipher;

#[async_trait]
impl SecretCipher for PlaintextCipher {
    async fn decrypt(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}

/// Render secrets as a sourceable env file.
pub fn render_env_file(secrets: &BTreeMap<String, String>) -> String {
    secrets
        .iter()
        .map(|(key, value)| format!("export {key}=\"{}\"", value.replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join("\n")
}
