//! Reading credentials and key material from Secrets

use certwarden_common::store::{ObjectKey, ResourceStore};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;

use crate::error::IssuerError;

/// Value of `key` in Secret `namespace/name`, decoded as UTF-8
///
/// A missing Secret is transient (it may not have been synced yet); a
/// Secret without the key is a configuration error.
pub fn secret_value(
    secrets: &dyn ResourceStore<Secret>,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<String, IssuerError> {
    let obj_key = ObjectKey::namespaced(namespace, name);
    let secret = secrets
        .get(&obj_key)
        .ok_or_else(|| IssuerError::transient(format!("secret {} not found", obj_key)))?;
    value_of(&secret, key)
        .ok_or_else(|| IssuerError::validation(format!("secret {} has no key '{}'", obj_key, key)))
}

/// Value of `key` in an already loaded Secret
pub fn value_of(secret: &Secret, key: &str) -> Option<String> {
    if let Some(ByteString(bytes)) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.clone()).ok();
    }
    secret.string_data.as_ref().and_then(|d| d.get(key)).cloned()
}
