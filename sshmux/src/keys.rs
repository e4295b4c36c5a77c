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
//! Key handling at the boundary of the engine: signature checks,
//! signing, public key blobs and host key fingerprints.

use bytes::Bytes;
use data_encoding::HEXLOWER;
use log::debug;
use sha2::Digest;
use ssh_encoding::{Decode, Encode};
pub use ssh_key;
use ssh_key::{PrivateKey, PublicKey, Signature};

use crate::Error;

#[doc(hidden)]
pub trait EncodedExt {
    fn encoded(&self) -> ssh_key::Result<Vec<u8>>;
}

impl<E: Encode> EncodedExt for E {
    fn encoded(&self) -> ssh_key::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// Checks signatures made by the other side of the connection.
pub trait Verifier: Send + Sync + std::fmt::Debug {
    /// `public_key` is the key blob as sent on the wire, `signature` is
    /// an encoded SSH signature (algorithm name and signature blob).
    fn verify(&self, public_key: &[u8], signed_blob: &[u8], signature: &[u8]) -> bool;
}

/// [`Verifier`] backed by the `ssh-key` crate, for every algorithm it
/// was built with.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshKeyVerifier;

impl Verifier for SshKeyVerifier {
    fn verify(&self, public_key: &[u8], signed_blob: &[u8], signature: &[u8]) -> bool {
        let key = match parse_public_key(public_key) {
            Ok(key) => key,
            Err(e) => {
                debug!("could not parse public key: {e:?}");
                return false;
            }
        };
        let mut reader = signature;
        let signature = match Signature::decode(&mut reader) {
            Ok(signature) => signature,
            Err(e) => {
                debug!("could not parse signature: {e:?}");
                return false;
            }
        };
        signature::Verifier::verify(&key, signed_blob, &signature).is_ok()
    }
}

/// Sign `data` with `key`, returning the encoded SSH signature.
pub fn sign(key: &PrivateKey, data: &[u8]) -> Result<Bytes, Error> {
    let signature: Signature = signature::Signer::try_sign(key.key_data(), data)?;
    Ok(signature.encoded()?.into())
}

/// Parse a public key from its wire blob.
pub fn parse_public_key(mut p: &[u8]) -> Result<PublicKey, Error> {
    Ok(ssh_key::public::KeyData::decode(&mut p)?.into())
}

/// The wire blob of a public key.
pub fn public_key_blob(key: &PublicKey) -> Result<Bytes, Error> {
    Ok(key.key_data().encoded()?.into())
}

/// Hash used for host key fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintHash {
    Md5,
    Sha1,
    #[default]
    Sha256,
}

/// Lowercase hex digest of a host key blob.
pub fn fingerprint(key_blob: &[u8], hash: FingerprintHash) -> String {
    match hash {
        FingerprintHash::Md5 => HEXLOWER.encode(&md5::compute(key_blob).0),
        FingerprintHash::Sha1 => HEXLOWER.encode(&sha1::Sha1::digest(key_blob)),
        FingerprintHash::Sha256 => HEXLOWER.encode(&sha2::Sha256::digest(key_blob)),
    }
}

/// Fingerprint of a host key, as passed to `client::Handler::check_server_key`.
pub fn host_key_fingerprint(key: &PublicKey, hash: FingerprintHash) -> Result<String, Error> {
    Ok(fingerprint(&public_key_blob(key)?, hash))
}
