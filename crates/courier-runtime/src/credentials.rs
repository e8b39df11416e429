//! Session token bootstrap.
//!
//! An operator-supplied session token is tried against an ordered list of
//! interpretations. Structured records are persisted and used as-is; anything
//! else is treated as an opaque pairing token, kept verbatim for audit, and
//! paired with a freshly generated placeholder identity. Persistence failures
//! never abort startup: resolution falls back to whatever the store already
//! holds, or to a fresh pairing.

use std::sync::Arc;

use base64::{
    Engine as _, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use courier_core::{CourierError, CourierErrorCategory, Credential};
use courier_platform::{CredentialStore, CredentialStoreError};
use rand::{Rng, RngCore};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Where the credential for the first connect attempt came from.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialSource {
    /// Structured record decoded from the session token.
    Supplied(Credential),
    /// Opaque token; `credential` is a generated placeholder identity.
    Pairing { credential: Credential },
    /// Record already present in the store.
    Persisted(Credential),
    /// Nothing usable; the transport bootstraps a new identity.
    Fresh,
}

impl CredentialSource {
    pub fn credential(&self) -> Option<&Credential> {
        match self {
            Self::Supplied(credential)
            | Self::Pairing { credential }
            | Self::Persisted(credential) => Some(credential),
            Self::Fresh => None,
        }
    }

    /// The transport must issue a pairing code for this source.
    pub fn pairing_mode(&self) -> bool {
        matches!(self, Self::Pairing { .. } | Self::Fresh)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supplied(_) => "supplied",
            Self::Pairing { .. } => "pairing",
            Self::Persisted(_) => "persisted",
            Self::Fresh => "fresh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenStrategy {
    VerbatimRecord,
    Base64Record,
    PairingToken,
}

const TOKEN_STRATEGIES: [TokenStrategy; 3] = [
    TokenStrategy::VerbatimRecord,
    TokenStrategy::Base64Record,
    TokenStrategy::PairingToken,
];

enum TokenMatch {
    Record(Credential),
    Pairing,
    NoMatch,
}

impl TokenStrategy {
    fn as_str(self) -> &'static str {
        match self {
            Self::VerbatimRecord => "verbatim_record",
            Self::Base64Record => "base64_record",
            Self::PairingToken => "pairing_token",
        }
    }

    fn attempt(self, token: &str) -> TokenMatch {
        match self {
            Self::VerbatimRecord => {
                Credential::from_json(token).map_or(TokenMatch::NoMatch, TokenMatch::Record)
            }
            Self::Base64Record => LENIENT_BASE64
                .decode(token)
                .ok()
                .and_then(|bytes| Credential::from_json_bytes(&bytes))
                .map_or(TokenMatch::NoMatch, TokenMatch::Record),
            Self::PairingToken => TokenMatch::Pairing,
        }
    }
}

pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    token: Option<String>,
}

impl CredentialResolver {
    /// Blank tokens count as absent.
    pub fn new(store: Arc<dyn CredentialStore>, token: Option<String>) -> Self {
        let token = token
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        Self { store, token }
    }

    /// Pick the credential for the first connect attempt. Never fails.
    pub fn resolve(&self) -> CredentialSource {
        if let Some(token) = self.token.as_deref() {
            match self.resolve_token(token) {
                Ok(source) => return source,
                Err(err) => warn!(
                    error = %err,
                    "failed applying session token; falling back to stored session"
                ),
            }
        }
        self.resolve_persisted()
    }

    fn resolve_token(&self, token: &str) -> Result<CredentialSource, CourierError> {
        for strategy in TOKEN_STRATEGIES {
            match strategy.attempt(token) {
                TokenMatch::NoMatch => {
                    debug!(strategy = strategy.as_str(), "session token strategy did not match");
                }
                TokenMatch::Record(credential) => {
                    self.store.save(&credential).map_err(storage_error)?;
                    info!(
                        strategy = strategy.as_str(),
                        "session credential written from token"
                    );
                    return Ok(CredentialSource::Supplied(credential));
                }
                TokenMatch::Pairing => {
                    warn!("session token is not a credential record; using it for pairing");
                    self.store
                        .save_pairing_token(token)
                        .map_err(storage_error)?;
                    return Ok(CredentialSource::Pairing {
                        credential: placeholder_credential(token),
                    });
                }
            }
        }

        Err(CourierError::new(
            CourierErrorCategory::Internal,
            "token_unmatched",
            "no session token strategy accepted the token",
        ))
    }

    fn resolve_persisted(&self) -> CredentialSource {
        match self.store.load() {
            Ok(Some(credential)) => {
                info!("existing session credential found");
                CredentialSource::Persisted(credential)
            }
            Ok(None) => {
                info!("no stored session; a pairing code will be issued");
                CredentialSource::Fresh
            }
            Err(err) => {
                warn!(error = %err, "failed loading stored session; starting a fresh pairing");
                CredentialSource::Fresh
            }
        }
    }
}

pub(crate) fn storage_error(err: CredentialStoreError) -> CourierError {
    let code = match &err {
        CredentialStoreError::Unavailable(_) => "store_unavailable",
        CredentialStoreError::Corrupt(_) => "store_corrupt",
        CredentialStoreError::Backend(_) => "store_backend",
    };
    CourierError::new(CourierErrorCategory::Storage, code, err.to_string())
}

/// Fresh key material bound to the pairing token.
fn placeholder_credential(token: &str) -> Credential {
    let mut rng = rand::rng();
    let signature = random_key(&mut rng, 64);
    let registration_id: u32 = rng.random_range(1..16_380);
    let record = json!({
        "noiseKey": key_pair(&mut rng),
        "signedIdentityKey": key_pair(&mut rng),
        "signedPreKey": {
            "keyPair": key_pair(&mut rng),
            "signature": signature,
            "keyId": 1,
        },
        "registrationId": registration_id,
        "advSecretKey": token,
        "account": { "details": token },
    });

    match record {
        Value::Object(fields) => Credential::from_map(fields),
        _ => Credential::default(),
    }
}

fn key_pair(rng: &mut impl RngCore) -> Value {
    json!({
        "private": random_key(rng, 32),
        "public": random_key(rng, 32),
    })
}

fn random_key(rng: &mut impl RngCore, len: usize) -> String {
    let mut bytes = vec![0_u8; len];
    rng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
