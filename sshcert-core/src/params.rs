//! Request parameters as supplied by the caller, and their validation.
//!
//! [`RequestParams`] mirrors the user-facing option names one to one
//! (including the deprecated `principal` alias).  [`RequestParams::validate`]
//! is the only way to obtain a [`ValidatedRequest`]; nothing past this
//! boundary looks at the raw options again.

use serde::Deserialize;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::ValidationError;
use crate::{PublicKeyMethod, SigningRequest};

#[derive(Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestParams {
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub key_passphrase: Option<Zeroizing<String>>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub force_command: Option<String>,
    #[serde(default)]
    pub key_size: Option<i64>,
    /// Keep CRLF line endings in a service-generated private key.
    #[serde(default)]
    pub windows: bool,
    #[serde(default)]
    pub valid_hours: Option<u32>,
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub public_key_method: PublicKeyMethod,
    /// Deprecated alias of `principals`.
    #[serde(default)]
    pub principal: Option<Vec<String>>,
    #[serde(default)]
    pub principals: Option<Vec<String>>,
    #[serde(default)]
    pub source_address: Option<Vec<String>>,
    #[serde(default)]
    pub destination_address: Option<Vec<String>>,
    #[serde(default)]
    pub extension: Option<Vec<String>>,
}

impl std::fmt::Debug for RequestParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestParams")
            .field("key_id", &self.key_id)
            .field("template", &self.template)
            .field(
                "key_passphrase",
                &self.key_passphrase.as_ref().map(|_| "[redacted]"),
            )
            .field("folder", &self.folder)
            .field("key_size", &self.key_size)
            .field("windows", &self.windows)
            .field("public_key_method", &self.public_key_method)
            .field("principals", &self.principals)
            .finish_non_exhaustive()
    }
}

/// A request that passed validation.  Immutable from here on.
#[derive(Clone)]
pub struct ValidatedRequest {
    request: SigningRequest,
    method: PublicKeyMethod,
    passphrase: Option<Zeroizing<String>>,
    windows: bool,
}

impl std::fmt::Debug for ValidatedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedRequest")
            .field("request", &self.request)
            .field("method", &self.method)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[redacted]"))
            .field("windows", &self.windows)
            .finish()
    }
}

impl ValidatedRequest {
    /// The signing request.  `public_key` is filled for the file method only;
    /// the workflow fills it for locally generated keys.
    pub fn request(&self) -> &SigningRequest {
        &self.request
    }

    pub fn method(&self) -> PublicKeyMethod {
        self.method
    }

    /// Key passphrase, `None` when absent or empty.
    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref().map(String::as_str)
    }

    pub fn windows(&self) -> bool {
        self.windows
    }
}

impl RequestParams {
    /// Check cross-field constraints and build the typed request.
    pub fn validate(&self) -> Result<ValidatedRequest, ValidationError> {
        if self.key_id.trim().is_empty() {
            return Err(ValidationError::MissingField("key_id"));
        }
        if self.template.trim().is_empty() {
            return Err(ValidationError::MissingField("template"));
        }

        let principals = match (non_empty(&self.principal), non_empty(&self.principals)) {
            (Some(_), Some(_)) => return Err(ValidationError::ConflictingPrincipals),
            (Some(legacy), None) => {
                warn!("`principal` is deprecated and will be removed; use `principals`");
                legacy.to_vec()
            }
            (None, Some(current)) => current.to_vec(),
            (None, None) => Vec::new(),
        };

        let public_key = match self.public_key_method {
            PublicKeyMethod::File => {
                let key = self.public_key.as_deref().unwrap_or_default();
                if key.trim().is_empty() {
                    return Err(ValidationError::EmptyPublicKey);
                }
                key.to_string()
            }
            PublicKeyMethod::Local | PublicKeyMethod::Service => String::new(),
        };

        let passphrase = self
            .key_passphrase
            .as_ref()
            .filter(|p| !p.is_empty())
            .cloned();

        Ok(ValidatedRequest {
            request: SigningRequest {
                key_id: self.key_id.clone(),
                template: self.template.clone(),
                folder: self.folder.clone().filter(|s| !s.is_empty()),
                force_command: self.force_command.clone().filter(|s| !s.is_empty()),
                key_size: self.key_size,
                valid_hours: self.valid_hours,
                object_name: self.object_name.clone().filter(|s| !s.is_empty()),
                public_key,
                principals,
                source_addresses: self.source_address.clone().unwrap_or_default(),
                destination_addresses: self.destination_address.clone().unwrap_or_default(),
                extensions: self.extension.clone().unwrap_or_default(),
            },
            method: self.public_key_method,
            passphrase,
            windows: self.windows,
        })
    }
}

fn non_empty(list: &Option<Vec<String>>) -> Option<&[String]> {
    list.as_deref().filter(|l| !l.is_empty())
}
