use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rand::Rng;

use crate::crd::PatroniPostgres;
use crate::resources::common::{child_meta, credentials_secret_name};

/// Key of the superuser password in the credentials Secret
pub const SUPERUSER_PASSWORD_KEY: &str = "superuser-password";

/// Key of the replication user password in the credentials Secret
pub const REPLICATION_PASSWORD_KEY: &str = "replication-password";

/// Generate a secure random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(CHARSET[rng.random_range(0..CHARSET.len())]))
        .collect()
}

/// Generate the credentials Secret
///
/// Passwords are random, so this is only applied when the Secret is absent.
pub fn generate_credentials_secret(cluster: &PatroniPostgres) -> Secret {
    let string_data = BTreeMap::from([
        (SUPERUSER_PASSWORD_KEY.to_string(), generate_password(32)),
        (REPLICATION_PASSWORD_KEY.to_string(), generate_password(32)),
    ]);

    Secret {
        metadata: child_meta(cluster, credentials_secret_name(&cluster.name_any())),
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}
