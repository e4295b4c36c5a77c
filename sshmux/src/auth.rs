// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use std::future::Future;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use ssh_encoding::Encode;
use ssh_key::{Algorithm, PrivateKey, PublicKey};

use crate::keys::{self, Verifier};
use crate::message::Prompt;
use crate::msg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    None,
    Password,
    PublicKey,
    HostBased,
    KeyboardInteractive,
}

impl From<&MethodKind> for &'static str {
    fn from(value: &MethodKind) -> Self {
        match value {
            MethodKind::None => "none",
            MethodKind::Password => "password",
            MethodKind::PublicKey => "publickey",
            MethodKind::HostBased => "hostbased",
            MethodKind::KeyboardInteractive => "keyboard-interactive",
        }
    }
}

impl FromStr for MethodKind {
    fn from_str(b: &str) -> Result<MethodKind, Self::Err> {
        match b {
            "none" => Ok(MethodKind::None),
            "password" => Ok(MethodKind::Password),
            "publickey" => Ok(MethodKind::PublicKey),
            "hostbased" => Ok(MethodKind::HostBased),
            "keyboard-interactive" => Ok(MethodKind::KeyboardInteractive),
            _ => Err(()),
        }
    }

    type Err = ();
}

impl From<&MethodKind> for String {
    fn from(value: &MethodKind) -> Self {
        <&str>::from(value).to_string()
    }
}

/// An ordered set of authentication methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSet(Vec<MethodKind>);

impl Deref for MethodSet {
    type Target = [MethodKind];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&[MethodKind]> for MethodSet {
    fn from(value: &[MethodKind]) -> Self {
        let mut this = Self::empty();
        for method in value {
            this.push(*method);
        }
        this
    }
}

impl MethodSet {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn all() -> Self {
        Self(vec![
            MethodKind::None,
            MethodKind::Password,
            MethodKind::PublicKey,
            MethodKind::HostBased,
            MethodKind::KeyboardInteractive,
        ])
    }

    pub fn remove(&mut self, method: MethodKind) {
        self.0.retain(|x| *x != method);
    }

    /// Push a method to the end of the list.
    /// If the method is already in the list, it is moved to the end.
    pub fn push(&mut self, method: MethodKind) {
        self.remove(method);
        self.0.push(method);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    Failure {
        /// The server suggests to proceed with these auth methods
        remaining_methods: MethodSet,
        /// The server says that though auth method has been accepted,
        /// further authentication is required
        partial_success: bool,
    },
}

impl AuthResult {
    pub fn success(&self) -> bool {
        matches!(self, AuthResult::Success)
    }
}

/// Produces signatures for public key authentication on behalf of a
/// key whose private half is held elsewhere (an agent, a token).
#[cfg_attr(feature = "async-trait", async_trait::async_trait)]
pub trait Signer: Sized {
    type Error: From<crate::SendError>;

    /// Returns the encoded SSH signature of `to_sign`.
    fn auth_publickey_sign(
        &mut self,
        key: &PublicKey,
        to_sign: Bytes,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send;
}

/// Any private key can sign directly.
#[cfg_attr(feature = "async-trait", async_trait::async_trait)]
impl Signer for Arc<PrivateKey> {
    type Error = crate::Error;

    #[allow(clippy::manual_async_fn)]
    fn auth_publickey_sign(
        &mut self,
        _key: &PublicKey,
        to_sign: Bytes,
    ) -> impl Future<Output = Result<Bytes, Self::Error>> + Send {
        let signature = keys::sign(self, &to_sign);
        async move { signature }
    }
}

/// Credentials offered by a client.
#[derive(Debug, Clone)]
pub enum Method {
    None,
    Password {
        password: String,
    },
    PublicKey {
        key: Arc<PrivateKey>,
    },
    /// Public key whose signature is produced by a [`Signer`].
    FuturePublicKey {
        key: PublicKey,
    },
    HostBased {
        key: Arc<PrivateKey>,
        local_hostname: String,
        local_username: String,
    },
    KeyboardInteractive {
        submethods: String,
    },
}

impl Method {
    pub fn kind(&self) -> MethodKind {
        match self {
            Method::None => MethodKind::None,
            Method::Password { .. } => MethodKind::Password,
            Method::PublicKey { .. } | Method::FuturePublicKey { .. } => MethodKind::PublicKey,
            Method::HostBased { .. } => MethodKind::HostBased,
            Method::KeyboardInteractive { .. } => MethodKind::KeyboardInteractive,
        }
    }
}

/// Name of the signature algorithm used with `key`. RSA keys are
/// always used with SHA-512.
pub(crate) fn signing_algorithm(key: &PublicKey) -> String {
    match key.algorithm() {
        Algorithm::Rsa { .. } => "rsa-sha2-512".to_string(),
        a => a.as_str().to_string(),
    }
}

/// The data signed by a client for the `publickey` method
/// (<https://tools.ietf.org/html/rfc4252#section-7>).
pub fn publickey_signed_data(
    session_id: &[u8],
    user: &str,
    service: &str,
    algorithm: &str,
    key: &[u8],
) -> Result<Vec<u8>, crate::Error> {
    let mut buf = Vec::new();
    session_id.encode(&mut buf)?;
    msg::USERAUTH_REQUEST.encode(&mut buf)?;
    user.encode(&mut buf)?;
    service.encode(&mut buf)?;
    "publickey".encode(&mut buf)?;
    1u8.encode(&mut buf)?;
    algorithm.encode(&mut buf)?;
    key.encode(&mut buf)?;
    Ok(buf)
}

/// The data signed by a client host for the `hostbased` method
/// (<https://tools.ietf.org/html/rfc4252#section-9>).
#[allow(clippy::too_many_arguments)]
pub fn hostbased_signed_data(
    session_id: &[u8],
    user: &str,
    service: &str,
    algorithm: &str,
    key: &[u8],
    client_host: &str,
    client_user: &str,
) -> Result<Vec<u8>, crate::Error> {
    let mut buf = Vec::new();
    session_id.encode(&mut buf)?;
    msg::USERAUTH_REQUEST.encode(&mut buf)?;
    user.encode(&mut buf)?;
    service.encode(&mut buf)?;
    "hostbased".encode(&mut buf)?;
    algorithm.encode(&mut buf)?;
    key.encode(&mut buf)?;
    client_host.encode(&mut buf)?;
    client_user.encode(&mut buf)?;
    Ok(buf)
}

/// A signature together with the exact bytes it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlob {
    pub blob: Vec<u8>,
    pub signature: Bytes,
}

/// Method-specific part of an [`AuthAttempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Password {
        password: String,
    },
    PublicKey {
        algorithm: String,
        key: Bytes,
        /// `None` when the client only asks whether the key is acceptable.
        signature: Option<SignedBlob>,
    },
    HostBased {
        algorithm: String,
        key: Bytes,
        local_hostname: String,
        local_username: String,
        signature: SignedBlob,
    },
    KeyboardInteractive {
        submethods: String,
    },
    /// Answers to a previous [`Decision::InfoRequest`].
    KeyboardInteractiveResponse {
        responses: Vec<String>,
    },
}

/// One authentication request, as presented to `server::Handler::auth_attempt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    pub user: String,
    pub service: String,
    pub credentials: Credentials,
}

impl AuthAttempt {
    pub fn method(&self) -> MethodKind {
        match self.credentials {
            Credentials::None => MethodKind::None,
            Credentials::Password { .. } => MethodKind::Password,
            Credentials::PublicKey { .. } => MethodKind::PublicKey,
            Credentials::HostBased { .. } => MethodKind::HostBased,
            Credentials::KeyboardInteractive { .. }
            | Credentials::KeyboardInteractiveResponse { .. } => MethodKind::KeyboardInteractive,
        }
    }

    /// A public key query: accepting it does not authenticate the user.
    pub fn is_query(&self) -> bool {
        matches!(
            self.credentials,
            Credentials::PublicKey {
                signature: None,
                ..
            }
        )
    }

    /// The key offered by a `publickey` or `hostbased` attempt.
    pub fn public_key(&self) -> Option<PublicKey> {
        match &self.credentials {
            Credentials::PublicKey { key, .. } | Credentials::HostBased { key, .. } => {
                keys::parse_public_key(key).ok()
            }
            _ => None,
        }
    }

    /// Checks the signature of a signed attempt. Queries and methods
    /// without signatures never verify.
    pub fn verify_signature(&self, verifier: &dyn Verifier) -> bool {
        match &self.credentials {
            Credentials::PublicKey {
                key,
                signature: Some(signed),
                ..
            }
            | Credentials::HostBased {
                key,
                signature: signed,
                ..
            } => verifier.verify(key, &signed.blob, &signed.signature),
            _ => false,
        }
    }
}

/// Outcome of an [`AuthAttempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject {
        proceed_with_methods: Option<MethodSet>,
    },
    /// The credential was valid but more authentication is needed.
    PartialSuccess {
        remaining_methods: MethodSet,
    },
    /// Keyboard-interactive: ask the client some questions.
    InfoRequest {
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    },
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::*;
    use crate::keys::SshKeyVerifier;

    #[test]
    fn method_set_push_moves_to_end() {
        let mut set = MethodSet::from(&[MethodKind::Password, MethodKind::PublicKey][..]);
        set.push(MethodKind::Password);
        assert_eq!(&set[..], &[MethodKind::PublicKey, MethodKind::Password]);
        set.remove(MethodKind::PublicKey);
        assert_eq!(&set[..], &[MethodKind::Password]);
    }

    #[test]
    fn publickey_blob_layout() {
        let blob = publickey_signed_data(b"sid", "u", "ssh-connection", "ssh-ed25519", b"K").unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&[0, 0, 0, 3]);
        expected.extend_from_slice(b"sid");
        expected.push(50);
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(b"u");
        expected.extend_from_slice(&[0, 0, 0, 14]);
        expected.extend_from_slice(b"ssh-connection");
        expected.extend_from_slice(&[0, 0, 0, 9]);
        expected.extend_from_slice(b"publickey");
        expected.push(1);
        expected.extend_from_slice(&[0, 0, 0, 11]);
        expected.extend_from_slice(b"ssh-ed25519");
        expected.extend_from_slice(&[0, 0, 0, 1]);
        expected.extend_from_slice(b"K");
        assert_eq!(blob, expected);
    }

    #[test]
    fn attempt_signature_checks() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let key_blob = keys::public_key_blob(key.public_key()).unwrap();
        let blob = hostbased_signed_data(
            b"session",
            "alice",
            "ssh-connection",
            "ssh-ed25519",
            &key_blob,
            "client.example",
            "alice-local",
        )
        .unwrap();
        let signature = keys::sign(&key, &blob).unwrap();
        let mut attempt = AuthAttempt {
            user: "alice".into(),
            service: "ssh-connection".into(),
            credentials: Credentials::HostBased {
                algorithm: "ssh-ed25519".into(),
                key: key_blob.clone(),
                local_hostname: "client.example".into(),
                local_username: "alice-local".into(),
                signature: SignedBlob {
                    blob: blob.clone(),
                    signature: signature.clone(),
                },
            },
        };
        assert_eq!(attempt.method(), MethodKind::HostBased);
        assert!(!attempt.is_query());
        assert!(attempt.verify_signature(&SshKeyVerifier));

        let mut tampered = blob;
        tampered.push(0);
        if let Credentials::HostBased { signature, .. } = &mut attempt.credentials {
            signature.blob = tampered;
        }
        assert!(!attempt.verify_signature(&SshKeyVerifier));

        let query = AuthAttempt {
            user: "alice".into(),
            service: "ssh-connection".into(),
            credentials: Credentials::PublicKey {
                algorithm: "ssh-ed25519".into(),
                key: key_blob,
                signature: None,
            },
        };
        assert!(query.is_query());
        assert!(!query.verify_signature(&SshKeyVerifier));
        assert!(query.public_key().is_some());
    }
}
