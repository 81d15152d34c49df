//! Password hashing for vault owners.
//!
//! New hashes are Argon2id PHC strings (`$argon2id$v=19$m=..,t=..,p=..$salt$digest`),
//! so algorithm, parameters and salt travel with the digest. Bare 128-char hex
//! values are unsalted SHA-512 digests imported from the previous password
//! manager; they still verify, and are flagged for rehashing.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, SaltString, rand_core::OsRng},
};
use sha2::{Digest, Sha512};
use subtle::{Choice, ConstantTimeEq};

use crate::config::HashingConfig;
use crate::error::VaultError;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

const LEGACY_SHA512_HEX_LEN: usize = 128;

/// Result of checking a password against a stored hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verification {
    pub matched: bool,
    /// The stored hash should be rewritten with the current scheme/params.
    pub needs_rehash: bool,
}

pub struct Hasher {
    params: Params,
    /// Hash of a throwaway password. Verified whenever the stored value gives
    /// no Argon2 work of its own, so every lookup costs one evaluation.
    decoy: String,
    #[cfg(test)]
    evaluations: AtomicUsize,
}

impl Hasher {
    pub fn new(cfg: &HashingConfig) -> Result<Self, VaultError> {
        let params = Params::new(cfg.m_cost, cfg.t_cost, cfg.p_cost, None)
            .map_err(|e| VaultError::PasswordHash(format!("invalid argon2 params: {e}")))?;
        let mut hasher = Self {
            params,
            decoy: String::new(),
            #[cfg(test)]
            evaluations: AtomicUsize::new(0),
        };
        let decoy_salt = SaltString::generate(&mut OsRng);
        hasher.decoy = hasher.hash_with_salt(decoy_salt.as_str().as_bytes(), &decoy_salt)?;
        Ok(hasher)
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash a password with a fresh random salt.
    pub fn hash(&self, password: &str) -> Result<String, VaultError> {
        let salt = SaltString::generate(&mut OsRng);
        self.hash_with_salt(password.as_bytes(), &salt)
    }

    fn hash_with_salt(&self, password: &[u8], salt: &SaltString) -> Result<String, VaultError> {
        Ok(self.argon2().hash_password(password, salt)?.to_string())
    }

    /// Check `password` against `stored`. `None` means the owner does not
    /// exist: the decoy is verified instead and the result is always a miss.
    ///
    /// Exactly one Argon2 evaluation runs on every path. Legacy digests are
    /// checked alongside a decoy evaluation, and an unreadable PHC string is
    /// reported only after the decoy has been verified.
    pub fn verify(&self, password: &str, stored: Option<&str>) -> Result<Verification, VaultError> {
        let (target, present) = match stored {
            Some(h) => (h, Choice::from(1)),
            None => (self.decoy.as_str(), Choice::from(0)),
        };

        let digest_ok = if is_legacy(target) {
            let _ = self.phc_matches(password, &self.decoy)?;
            legacy_matches(password, target)
        } else {
            match self.phc_matches(password, target) {
                Ok(ok) => ok,
                Err(e) => {
                    let _ = self.phc_matches(password, &self.decoy)?;
                    return Err(e);
                }
            }
        };

        let matched: bool = (digest_ok & present).into();
        Ok(Verification {
            matched,
            needs_rehash: matched && self.needs_rehash(target),
        })
    }

    /// Recompute the digest with the salt and parameters recorded in the
    /// PHC string, then compare in constant time.
    fn phc_matches(&self, password: &str, stored: &str) -> Result<Choice, VaultError> {
        let parsed = PasswordHash::new(stored)?;
        let params = Params::try_from(&parsed)?;
        let expected = parsed
            .hash
            .ok_or_else(|| VaultError::PasswordHash("stored hash has no digest".to_string()))?;
        let salt = parsed
            .salt
            .ok_or_else(|| VaultError::PasswordHash("stored hash has no salt".to_string()))?;

        #[cfg(test)]
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let computed = Argon2::default().hash_password_customized(
            password.as_bytes(),
            Some(parsed.algorithm),
            parsed.version,
            params,
            salt,
        )?;
        let computed = computed
            .hash
            .ok_or_else(|| VaultError::PasswordHash("argon2 produced no digest".to_string()))?;

        Ok(expected.as_bytes().ct_eq(computed.as_bytes()))
    }

    /// True when `stored` is a legacy digest, a non-Argon2id hash, or uses
    /// parameters other than the configured ones.
    pub fn needs_rehash(&self, stored: &str) -> bool {
        if is_legacy(stored) {
            return true;
        }
        let Ok(parsed) = PasswordHash::new(stored) else {
            return true;
        };
        if parsed.algorithm != Algorithm::Argon2id.ident() {
            return true;
        }
        match Params::try_from(&parsed) {
            Ok(p) => {
                p.m_cost() != self.params.m_cost()
                    || p.t_cost() != self.params.t_cost()
                    || p.p_cost() != self.params.p_cost()
            }
            Err(_) => true,
        }
    }
}

fn is_legacy(stored: &str) -> bool {
    stored.len() == LEGACY_SHA512_HEX_LEN && stored.bytes().all(|b| b.is_ascii_hexdigit())
}

fn legacy_matches(password: &str, stored: &str) -> Choice {
    let digest = format!("{:x}", Sha512::digest(password.as_bytes()));
    digest.as_bytes().ct_eq(stored.to_ascii_lowercase().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> HashingConfig {
        HashingConfig {
            m_cost: 1024,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[test]
    fn hash_is_salted_argon2id_phc() {
        let hasher = Hasher::new(&cheap()).unwrap();
        let a = hasher.hash("hunter2").unwrap();
        let b = hasher.hash("hunter2").unwrap();
        assert!(a.starts_with("$argon2id$v=19$m=1024,t=1,p=1$"));
        assert_ne!(a, b);
        assert!(!a.contains("hunter2"));
    }

    #[test]
    fn verify_right_and_wrong_password() {
        let hasher = Hasher::new(&cheap()).unwrap();
        let stored = hasher.hash("p1").unwrap();

        let ok = hasher.verify("p1", Some(&stored)).unwrap();
        assert!(ok.matched);
        assert!(!ok.needs_rehash);

        let bad = hasher.verify("p2", Some(&stored)).unwrap();
        assert!(!bad.matched);
        assert!(!bad.needs_rehash);
    }

    #[test]
    fn missing_owner_never_matches() {
        let hasher = Hasher::new(&cheap()).unwrap();
        let v = hasher.verify("anything", None).unwrap();
        assert_eq!(
            v,
            Verification {
                matched: false,
                needs_rehash: false
            }
        );
    }

    #[test]
    fn legacy_sha512_verifies_and_asks_for_rehash() {
        let hasher = Hasher::new(&cheap()).unwrap();
        let legacy = format!("{:x}", Sha512::digest(b"password123"));
        assert_eq!(legacy.len(), 128);

        let ok = hasher.verify("password123", Some(&legacy)).unwrap();
        assert!(ok.matched);
        assert!(ok.needs_rehash);

        assert!(!hasher.verify("password124", Some(&legacy)).unwrap().matched);
    }

    #[test]
    fn changed_params_trigger_rehash() {
        let old = Hasher::new(&cheap()).unwrap();
        let stored = old.hash("pw").unwrap();

        let new = Hasher::new(&HashingConfig {
            m_cost: 2048,
            ..cheap()
        })
        .unwrap();
        let v = new.verify("pw", Some(&stored)).unwrap();
        assert!(v.matched);
        assert!(v.needs_rehash);
    }

    #[test]
    fn malformed_hash_is_an_error() {
        let hasher = Hasher::new(&cheap()).unwrap();
        assert!(matches!(
            hasher.verify("pw", Some("$argon2id$garbage")),
            Err(VaultError::PasswordHash(_))
        ));
    }

    #[test]
    fn every_lookup_costs_one_argon2_evaluation() {
        let hasher = Hasher::new(&cheap()).unwrap();
        let phc = hasher.hash("pw").unwrap();
        let legacy = format!("{:x}", Sha512::digest(b"pw"));

        let cases: [(&str, Option<&str>); 7] = [
            ("wrong", None),
            ("", None),
            ("wrong", Some(&phc)),
            ("pw", Some(&phc)),
            ("wrong", Some(&legacy)),
            ("pw", Some(&legacy)),
            ("pw", Some("$argon2id$garbage")),
        ];
        for (password, stored) in cases {
            let before = hasher.evaluations.load(Ordering::Relaxed);
            let _ = hasher.verify(password, stored);
            let after = hasher.evaluations.load(Ordering::Relaxed);
            assert_eq!(after - before, 1, "password {password:?} against {stored:?}");
        }
    }

    #[test]
    fn invalid_params_rejected() {
        let err = Hasher::new(&HashingConfig {
            m_cost: 1,
            t_cost: 1,
            p_cost: 1,
        });
        assert!(matches!(err, Err(VaultError::PasswordHash(_))));
    }
}
