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
use std::borrow::Cow;

use ssh_key::{Algorithm, EcdsaCurve, HashAlg, PublicKey};

use crate::{AlgorithmKind, Error};

/// Algorithms in use on a connection, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Names {
    pub kex: String,
    pub key: Algorithm,
    pub cipher: String,
    pub mac: String,
    pub compression: String,
}

/// Lists of preferred algorithms. This is normally hard-coded into implementations.
#[derive(Debug, Clone)]
pub struct Preferred {
    /// Preferred host & public key algorithms.
    pub key: Cow<'static, [Algorithm]>,
}

const ED25519: Algorithm = Algorithm::Ed25519;
const ECDSA_SHA2_NISTP256: Algorithm = Algorithm::Ecdsa {
    curve: EcdsaCurve::NistP256,
};
const ECDSA_SHA2_NISTP384: Algorithm = Algorithm::Ecdsa {
    curve: EcdsaCurve::NistP384,
};
const ECDSA_SHA2_NISTP521: Algorithm = Algorithm::Ecdsa {
    curve: EcdsaCurve::NistP521,
};
const RSA_SHA2_512: Algorithm = Algorithm::Rsa {
    hash: Some(HashAlg::Sha512),
};
const RSA_SHA2_256: Algorithm = Algorithm::Rsa {
    hash: Some(HashAlg::Sha256),
};
const SSH_RSA: Algorithm = Algorithm::Rsa { hash: None };

const SAFE_KEY_ALGORITHMS: &[Algorithm] = &[
    ED25519,
    ECDSA_SHA2_NISTP256,
    ECDSA_SHA2_NISTP384,
    ECDSA_SHA2_NISTP521,
    RSA_SHA2_512,
    RSA_SHA2_256,
    SSH_RSA,
];

impl Preferred {
    pub const DEFAULT: Preferred = Preferred {
        key: Cow::Borrowed(SAFE_KEY_ALGORITHMS),
    };
}

impl Default for Preferred {
    fn default() -> Preferred {
        Preferred::DEFAULT
    }
}

pub(crate) fn is_key_compatible_with_algo(key: &PublicKey, algo: &Algorithm) -> bool {
    match algo {
        // All RSA keys are compatible with all RSA based algos.
        Algorithm::Rsa { .. } => key.algorithm().is_rsa(),
        // Other keys have to match exactly
        a => key.algorithm() == *a,
    }
}

/// Picks the server host key to use: the client's order of preference
/// wins, among the keys the server actually has.
pub(crate) fn select_host_key(
    client_list: &[Algorithm],
    server_keys: &[PublicKey],
) -> Result<(Algorithm, PublicKey), Error> {
    for algo in client_list {
        for key in server_keys {
            if is_key_compatible_with_algo(key, algo) {
                return Ok((algo.clone(), key.clone()));
            }
        }
    }
    Err(Error::NoCommonAlgo {
        kind: AlgorithmKind::Key,
        ours: client_list.iter().map(|x| x.as_str().to_owned()).collect(),
        theirs: server_keys
            .iter()
            .map(|x| x.algorithm().as_str().to_owned())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use ssh_key::PrivateKey;

    use super::*;

    #[test]
    fn client_preference_wins() {
        let ed = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let ec = PrivateKey::random(&mut OsRng, ECDSA_SHA2_NISTP256).unwrap();
        let server_keys = vec![ed.public_key().clone(), ec.public_key().clone()];

        let (algo, key) = select_host_key(&[ECDSA_SHA2_NISTP256, ED25519], &server_keys).unwrap();
        assert_eq!(algo, ECDSA_SHA2_NISTP256);
        assert_eq!(&key, ec.public_key());

        let (algo, _) = select_host_key(&Preferred::DEFAULT.key, &server_keys).unwrap();
        assert_eq!(algo, ED25519);
    }

    #[test]
    fn no_common_host_key() {
        let ed = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let err = select_host_key(&[RSA_SHA2_256], &[ed.public_key().clone()]).unwrap_err();
        assert!(matches!(err, Error::NoCommonAlgo { .. }));
    }
}
